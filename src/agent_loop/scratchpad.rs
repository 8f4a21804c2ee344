//! Append-only record of one run's decisions and observations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TetherError;
use crate::model::ToolDecision;

/// Outcome of one tool decision, as shown back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Observation {
    Success { payload: Value },
    Failure { kind: String, message: String },
}

impl Observation {
    pub fn success(payload: Value) -> Self {
        Self::Success { payload }
    }

    pub fn failure(error: &TetherError) -> Self {
        Self::Failure {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Failure kind, e.g. `tool_disallowed`.
    pub fn failure_kind(&self) -> Option<&str> {
        match self {
            Self::Failure { kind, .. } => Some(kind),
            Self::Success { .. } => None,
        }
    }

    /// Plain-text rendering used in model prompts.
    pub fn to_model_text(&self) -> String {
        match self {
            Self::Success {
                payload: Value::String(text),
            } => text.clone(),
            Self::Success { payload } => payload.to_string(),
            Self::Failure { kind, message } => format!("error ({kind}): {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScratchpadEntry {
    /// 1-based.
    pub step: usize,
    pub decision: ToolDecision,
    pub observation: Observation,
    pub recorded_at: DateTime<Utc>,
}

/// Entries are strictly ordered by step and never edited once recorded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scratchpad {
    entries: Vec<ScratchpadEntry>,
}

impl Scratchpad {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next entry and return it.
    pub fn record(&mut self, decision: ToolDecision, observation: Observation) -> &ScratchpadEntry {
        let step = self.entries.len() + 1;
        self.entries.push(ScratchpadEntry {
            step,
            decision,
            observation,
            recorded_at: Utc::now(),
        });
        &self.entries[step - 1]
    }

    pub fn entries(&self) -> &[ScratchpadEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&ScratchpadEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScratchpadEntry> {
        self.entries.iter()
    }

    pub fn into_entries(self) -> Vec<ScratchpadEntry> {
        self.entries
    }
}
