//! Agent loop: the Planning / Invoking / Observing state machine, its
//! scratch-pad and run events.

pub mod events;
pub mod runner;
pub mod scratchpad;
pub mod types;

pub use events::{RunEvent, RunEventPayload, RunEventSink, RunEventStream, RunLifecycle};
pub use runner::{compose_system_prompt, AgentRunner, RunHandle, RunRequest};
pub use scratchpad::{Observation, Scratchpad, ScratchpadEntry};
pub use types::{AgentPhase, RunFailure, RunId, RunOutcome, RunReport, RunStatus};
