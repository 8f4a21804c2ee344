//! Error types for tether.

pub mod category;

pub use category::{ErrorCategory, RecoverySuggestion};

use thiserror::Error;

use crate::protocol::RpcError;

/// Primary error type for all tether operations.
#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    RequestTimeout { method: String, timeout_ms: u64 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON-RPC error from '{method}': {error}")]
    Rpc { method: String, error: RpcError },

    #[error("Handshake with '{server}' failed: {message}")]
    HandshakeFailure { server: String, message: String },

    #[error("Tool discovery on '{server}' failed: {message}")]
    DiscoveryFailure { server: String, message: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool disallowed: {0}")]
    ToolDisallowed(String),

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution {
        tool_name: String,
        message: String,
        code: Option<i64>,
    },

    #[error("Invalid arguments for tool '{tool_name}': {message}")]
    InvalidToolArguments { tool_name: String, message: String },

    #[error("Session '{server}' unavailable: {reason}")]
    SessionUnavailable { server: String, reason: String },

    #[error("Step budget of {max_steps} exhausted")]
    StepBudgetExceeded { max_steps: usize },

    #[error("Model capability error: {0}")]
    ModelCapability(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run task panicked: {0}")]
    TaskPanicked(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl TetherError {
    /// Create a tool execution error without a JSON-RPC code.
    pub fn tool_execution(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
            code: None,
        }
    }

    pub fn session_unavailable(server: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SessionUnavailable {
            server: server.into(),
            reason: reason.into(),
        }
    }

    pub fn transport(message: impl std::fmt::Display) -> Self {
        Self::Transport(message.to_string())
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport(_) | Self::ChannelClosed(_) | Self::Io(_) | Self::Network(_) => {
                ErrorCategory::Transport
            }
            Self::RequestTimeout { .. } => ErrorCategory::Timeout,
            Self::Protocol(_) | Self::Rpc { .. } => ErrorCategory::Protocol,
            Self::HandshakeFailure { .. } | Self::DiscoveryFailure { .. } => {
                ErrorCategory::Handshake
            }
            Self::ToolNotFound(_)
            | Self::ToolDisallowed(_)
            | Self::ToolExecution { .. }
            | Self::InvalidToolArguments { .. } => ErrorCategory::Tool,
            Self::SessionUnavailable { .. } => ErrorCategory::Session,
            Self::StepBudgetExceeded { .. } => ErrorCategory::Budget,
            Self::ModelCapability(_) => ErrorCategory::Model,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::TaskPanicked(_) => ErrorCategory::Internal,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Serialization(_) => ErrorCategory::Serialization,
        }
    }

    /// Whether a session start attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transport | ErrorCategory::Timeout | ErrorCategory::Handshake
        )
    }

    /// Tool-level failures the agent loop turns into scratch-pad observations.
    pub fn is_tool_recoverable(&self) -> bool {
        self.category() == ErrorCategory::Tool
    }

    /// Failures that end an agent run.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            Self::StepBudgetExceeded { .. }
                | Self::ModelCapability(_)
                | Self::SessionUnavailable { .. }
                | Self::Cancelled
                | Self::TaskPanicked(_)
        )
    }

    /// Suggest recovery actions.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self.category() {
            ErrorCategory::Transport | ErrorCategory::Handshake => {
                RecoverySuggestion::RetryWithBackoff
            }
            ErrorCategory::Timeout => RecoverySuggestion::IncreaseTimeout,
            ErrorCategory::Tool => RecoverySuggestion::ObserveAndReplan,
            ErrorCategory::Configuration | ErrorCategory::Session => {
                RecoverySuggestion::CheckServerConfiguration
            }
            ErrorCategory::Budget => RecoverySuggestion::RaiseStepBudget,
            _ => RecoverySuggestion::Abort,
        }
    }

    /// Stable snake_case kind used in scratch-pad observations and run events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport_error",
            Self::ChannelClosed(_) => "channel_closed",
            Self::RequestTimeout { .. } => "request_timeout",
            Self::Protocol(_) => "protocol_error",
            Self::Rpc { .. } => "rpc_error",
            Self::HandshakeFailure { .. } => "handshake_failure",
            Self::DiscoveryFailure { .. } => "discovery_failure",
            Self::ToolNotFound(_) => "tool_not_found",
            Self::ToolDisallowed(_) => "tool_disallowed",
            Self::ToolExecution { .. } => "tool_execution_error",
            Self::InvalidToolArguments { .. } => "invalid_tool_arguments",
            Self::SessionUnavailable { .. } => "session_unavailable",
            Self::StepBudgetExceeded { .. } => "step_budget_exceeded",
            Self::ModelCapability(_) => "model_capability_error",
            Self::Cancelled => "cancelled",
            Self::TaskPanicked(_) => "task_panicked",
            Self::Configuration(_) => "configuration_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
            Self::Network(_) => "network_error",
        }
    }
}

#[cfg(feature = "websocket")]
impl From<tokio_tungstenite::tungstenite::Error> for TetherError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(format!("websocket: {error}"))
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, TetherError>;
