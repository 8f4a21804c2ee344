//! Reasoning model abstraction driving the agent loop.
//!
//! A [`ReasoningModel`] sees the goal, the run's tool directory and the full
//! scratch-pad, and answers with exactly one [`ModelAction`].

#[cfg(feature = "openai")]
pub mod openai;
pub mod usage;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent_loop::ScratchpadEntry;
use crate::error::Result;
use crate::tools::ToolSchema;

#[cfg(feature = "openai")]
pub use openai::OpenAiChatModel;
pub use usage::{Pricing, Usage};

/// Everything the model is shown for one planning step.
#[derive(Debug, Clone, Serialize)]
pub struct PlanningRequest {
    pub goal: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolSchema>,
    pub scratchpad: Vec<ScratchpadEntry>,
    /// Steps already consumed.
    pub step: usize,
    pub max_steps: usize,
}

impl PlanningRequest {
    pub fn remaining_steps(&self) -> usize {
        self.max_steps.saturating_sub(self.step)
    }

    pub fn tool(&self, name: &str) -> Option<&ToolSchema> {
        self.tools.iter().find(|t| t.name == name)
    }
}

/// The model's request to invoke one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDecision {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl ToolDecision {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            reasoning: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// One planning outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ModelAction {
    Final { text: String },
    CallTool(ToolDecision),
}

impl ModelAction {
    pub fn final_text(text: impl Into<String>) -> Self {
        Self::Final { text: text.into() }
    }

    pub fn call(name: impl Into<String>, arguments: Value) -> Self {
        Self::CallTool(ToolDecision::new(name, arguments))
    }
}

/// A planning answer plus the tokens it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanOutcome {
    pub action: ModelAction,
    pub usage: Usage,
}

impl PlanOutcome {
    pub fn new(action: ModelAction) -> Self {
        Self {
            action,
            usage: Usage::default(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

impl From<ModelAction> for PlanOutcome {
    fn from(action: ModelAction) -> Self {
        Self::new(action)
    }
}

/// Decides the next action of an agent run.
///
/// Implementations report their own failures as
/// [`TetherError::ModelCapability`](crate::error::TetherError::ModelCapability);
/// the runner maps anything else to that variant too.
#[async_trait]
pub trait ReasoningModel: Send + Sync {
    fn model_id(&self) -> &str;

    async fn plan(&self, request: &PlanningRequest) -> Result<PlanOutcome>;
}

#[async_trait]
impl<T: ReasoningModel + ?Sized> ReasoningModel for Arc<T> {
    fn model_id(&self) -> &str {
        (**self).model_id()
    }

    async fn plan(&self, request: &PlanningRequest) -> Result<PlanOutcome> {
        (**self).plan(request).await
    }
}
