//! Core run types for the agent loop.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::TetherError;
use crate::model::Usage;

use super::scratchpad::Scratchpad;

/// Unique run identifier.
pub type RunId = Uuid;

/// Phase of the agent state machine. `Done` and `Failed` are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentPhase {
    Planning,
    Invoking,
    Observing,
    Done,
    Failed,
}

impl AgentPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Canceled,
}

/// Structured failure of a run.
#[derive(Debug, Error)]
#[error("run {run_id} failed after {steps} step(s): {error}")]
pub struct RunFailure {
    pub run_id: RunId,
    /// Steps consumed before the failure.
    pub steps: usize,
    #[source]
    pub error: TetherError,
}

impl RunFailure {
    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }

    pub fn is_budget_exhausted(&self) -> bool {
        matches!(self.error, TetherError::StepBudgetExceeded { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, TetherError::Cancelled)
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed { text: String },
    Failed(RunFailure),
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: RunId,
    pub goal: String,
    pub max_steps: usize,
    pub outcome: RunOutcome,
    pub scratchpad: Scratchpad,
    /// Every phase entered, in order, ending with `Done` or `Failed`.
    pub trace: Vec<AgentPhase>,
    /// Tokens spent across every planning call.
    pub usage: Usage,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        match &self.outcome {
            RunOutcome::Completed { .. } => RunStatus::Completed,
            RunOutcome::Failed(f) if f.is_cancelled() => RunStatus::Canceled,
            RunOutcome::Failed(_) => RunStatus::Failed,
        }
    }

    pub fn final_text(&self) -> Option<&str> {
        match &self.outcome {
            RunOutcome::Completed { text } => Some(text),
            RunOutcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&TetherError> {
        match &self.outcome {
            RunOutcome::Failed(f) => Some(&f.error),
            RunOutcome::Completed { .. } => None,
        }
    }

    pub fn steps(&self) -> usize {
        self.scratchpad.len()
    }

    pub fn elapsed(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    pub fn into_result(self) -> Result<String, RunFailure> {
        match self.outcome {
            RunOutcome::Completed { text } => Ok(text),
            RunOutcome::Failed(failure) => Err(failure),
        }
    }
}
