//! Error classification used by the manager and the agent loop.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    /// Channel-level I/O, closed channels, HTTP/WebSocket failures.
    Transport,
    Timeout,
    /// Malformed frames or JSON-RPC errors outside a tool call.
    Protocol,
    /// Session never reached Ready.
    Handshake,
    /// Unknown, disallowed or invalidly-called tools, and server-side tool errors.
    Tool,
    Session,
    Budget,
    Model,
    Cancelled,
    Configuration,
    Serialization,
    /// A bug inside tether, such as a panicked task.
    Internal,
}

/// Suggested follow-up for a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySuggestion {
    RetryWithBackoff,
    IncreaseTimeout,
    /// The agent loop records the failure and lets the model try something else.
    ObserveAndReplan,
    CheckServerConfiguration,
    RaiseStepBudget,
    Abort,
}
