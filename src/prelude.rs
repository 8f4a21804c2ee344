//! Convenience re-exports for common use.

pub use crate::agent_loop::{
    AgentPhase, AgentRunner, Observation, RunFailure, RunReport, RunRequest, ScratchpadEntry,
};
pub use crate::config::{ServerConfig, ServersFile, TetherConfig};
pub use crate::error::{Result, TetherError};
pub use crate::manager::{CollisionPolicy, ManagerOptions, SessionManager, ToolDirectory};
pub use crate::model::{
    ModelAction, PlanOutcome, PlanningRequest, ReasoningModel, ToolDecision, Usage,
};
#[cfg(feature = "openai")]
pub use crate::model::OpenAiChatModel;
pub use crate::session::{Session, SessionState};
pub use crate::tools::ToolSchema;
