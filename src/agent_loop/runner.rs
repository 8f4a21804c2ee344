//! The agent loop driver.
//!
//! One run is a single task walking the [`AgentPhase`] machine: each model
//! call and each tool call is one suspension point, raced against the run's
//! cancellation token. The tool directory is snapshotted once per run.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DEFAULT_MAX_STEPS;
use crate::error::{Result, TetherError};
use crate::manager::{SessionManager, ToolDirectory};
use crate::model::{ModelAction, PlanningRequest, ReasoningModel, ToolDecision, Usage};

use super::events::{RunEventEmitter, RunEventPayload, RunEventSink, RunEventStream, RunLifecycle};
use super::scratchpad::{Observation, Scratchpad};
use super::types::{AgentPhase, RunFailure, RunId, RunOutcome, RunReport};

/// Request payload to start a run.
#[derive(Clone)]
pub struct RunRequest {
    pub run_id: RunId,
    pub goal: String,
    /// Falls back to the runner default.
    pub max_steps: Option<usize>,
    pub disallowed_tools: BTreeSet<String>,
    /// Overrides the runner's system prompt.
    pub system_prompt: Option<String>,
    pub event_sink: Option<RunEventSink>,
}

impl std::fmt::Debug for RunRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRequest")
            .field("run_id", &self.run_id)
            .field("goal", &self.goal)
            .field("max_steps", &self.max_steps)
            .field("disallowed_tools", &self.disallowed_tools)
            .field("system_prompt", &self.system_prompt)
            .field("event_sink", &self.event_sink.is_some())
            .finish()
    }
}

impl RunRequest {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            goal: goal.into(),
            max_steps: None,
            disallowed_tools: BTreeSet::new(),
            system_prompt: None,
            event_sink: None,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    pub fn with_disallowed_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disallowed_tools.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_event_sink(mut self, sink: RunEventSink) -> Self {
        self.event_sink = Some(sink);
        self
    }
}

/// Handle for a run spawned with [`AgentRunner::start`].
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    goal: String,
    max_steps: usize,
    cancel: CancellationToken,
    join: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Request cancellation; the run ends as `Failed(Cancelled)`.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run. A panicked run task is reported as
    /// `TaskPanicked`, an aborted one as `Cancelled`.
    pub async fn wait(self) -> RunReport {
        let started_at = Utc::now();
        match self.join.await {
            Ok(report) => report,
            Err(e) => {
                let error = if e.is_panic() {
                    TetherError::TaskPanicked(panic_message(e.into_panic()))
                } else {
                    TetherError::Cancelled
                };
                warn!(run_id = %self.run_id, error = %error, "run task ended abnormally");
                RunReport {
                    run_id: self.run_id,
                    goal: self.goal,
                    max_steps: self.max_steps,
                    outcome: RunOutcome::Failed(RunFailure {
                        run_id: self.run_id,
                        steps: 0,
                        error,
                    }),
                    scratchpad: Scratchpad::new(),
                    trace: vec![AgentPhase::Failed],
                    usage: Usage::default(),
                    started_at,
                    finished_at: Utc::now(),
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "run task panicked".to_string()
    }
}

/// Drives runs against a [`SessionManager`] with a [`ReasoningModel`].
///
/// Cheap to clone; clones share the manager and the model.
#[derive(Clone)]
pub struct AgentRunner {
    manager: SessionManager,
    model: Arc<dyn ReasoningModel>,
    default_max_steps: usize,
    system_prompt: Option<String>,
}

impl AgentRunner {
    pub fn new(manager: SessionManager, model: Arc<dyn ReasoningModel>) -> Self {
        Self {
            manager,
            model,
            default_max_steps: DEFAULT_MAX_STEPS,
            system_prompt: None,
        }
    }

    pub fn with_default_max_steps(mut self, max_steps: usize) -> Self {
        self.default_max_steps = max_steps;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Run `goal` to completion and return the model's final text.
    pub async fn run<I, S>(
        &self,
        goal: &str,
        max_steps: usize,
        disallowed_tools: I,
    ) -> std::result::Result<String, RunFailure>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = RunRequest::new(goal)
            .with_max_steps(max_steps)
            .with_disallowed_tools(disallowed_tools);
        self.execute(request).await.into_result()
    }

    pub async fn execute(&self, request: RunRequest) -> RunReport {
        self.execute_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Spawn the run on the runtime.
    pub fn start(&self, request: RunRequest) -> RunHandle {
        let cancel = CancellationToken::new();
        let runner = self.clone();
        let run_id = request.run_id;
        let goal = request.goal.clone();
        let max_steps = request.max_steps.unwrap_or(self.default_max_steps);
        let token = cancel.clone();
        let join = tokio::spawn(async move { runner.execute_with_cancel(request, token).await });
        RunHandle {
            run_id,
            goal,
            max_steps,
            cancel,
            join,
        }
    }

    pub async fn execute_with_cancel(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> RunReport {
        let RunRequest {
            run_id,
            goal,
            max_steps,
            disallowed_tools,
            system_prompt,
            event_sink,
        } = request;
        let max_steps = max_steps.unwrap_or(self.default_max_steps);
        let emitter = RunEventEmitter::new(run_id, event_sink);
        let directory = Arc::new(self.manager.directory().restricted(&disallowed_tools));
        let tools = directory.schemas();
        let system_prompt = compose_system_prompt(
            system_prompt.as_deref().or(self.system_prompt.as_deref()),
            &self.manager.server_instructions(),
        );
        let started_at = Utc::now();

        info!(
            run_id = %run_id,
            model = self.model.model_id(),
            max_steps,
            tools = tools.len(),
            "agent run started"
        );
        emitter.lifecycle(RunLifecycle::Started);

        let mut scratchpad = Scratchpad::new();
        let mut trace = Vec::new();
        let mut usage = Usage::default();
        let mut step = 0usize;
        let mut phase = Phase::Planning;

        let outcome = loop {
            trace.push(phase.label());
            emitter.emit(
                RunEventStream::Plan,
                RunEventPayload::PhaseChanged {
                    phase: phase.label(),
                    step,
                },
            );

            phase = match phase {
                Phase::Planning => {
                    if step >= max_steps {
                        Phase::Failed(TetherError::StepBudgetExceeded { max_steps })
                    } else {
                        let planning = PlanningRequest {
                            goal: goal.clone(),
                            system_prompt: system_prompt.clone(),
                            tools: tools.clone(),
                            scratchpad: scratchpad.entries().to_vec(),
                            step,
                            max_steps,
                        };
                        let planned = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => Err(TetherError::Cancelled),
                            planned = self.model.plan(&planning) => planned.map_err(model_error),
                        };
                        match planned {
                            Ok(planned) => {
                                usage.merge(&planned.usage);
                                match planned.action {
                                    ModelAction::Final { text } => Phase::Done(text),
                                    ModelAction::CallTool(decision) => Phase::Invoking(decision),
                                }
                            }
                            Err(e) => Phase::Failed(e),
                        }
                    }
                }
                Phase::Invoking(decision) => {
                    debug!(run_id = %run_id, step = step + 1, tool = %decision.name, "invoking tool");
                    emitter.emit(
                        RunEventStream::Tool,
                        RunEventPayload::ToolCallStarted {
                            step: step + 1,
                            decision: decision.clone(),
                        },
                    );
                    match self.invoke(&directory, &decision, &cancel).await {
                        Ok(observation) => Phase::Observing(decision, observation),
                        Err(e) => Phase::Failed(e),
                    }
                }
                Phase::Observing(decision, observation) => {
                    step += 1;
                    let entry = scratchpad.record(decision, observation);
                    emitter.emit(
                        RunEventStream::Tool,
                        RunEventPayload::Observation {
                            entry: entry.clone(),
                        },
                    );
                    Phase::Planning
                }
                Phase::Done(text) => {
                    emitter.emit(
                        RunEventStream::Plan,
                        RunEventPayload::FinalAnswer { text: text.clone() },
                    );
                    emitter.lifecycle(RunLifecycle::Completed);
                    info!(
                        run_id = %run_id,
                        steps = step,
                        total_tokens = usage.total_tokens,
                        "agent run completed"
                    );
                    break RunOutcome::Completed { text };
                }
                Phase::Failed(error) => {
                    if matches!(error, TetherError::Cancelled) {
                        emitter.lifecycle(RunLifecycle::Canceled);
                        info!(run_id = %run_id, steps = step, "agent run cancelled");
                    } else {
                        emitter.lifecycle(RunLifecycle::Failed {
                            error: error.to_string(),
                        });
                        warn!(run_id = %run_id, steps = step, error = %error, "agent run failed");
                    }
                    break RunOutcome::Failed(RunFailure {
                        run_id,
                        steps: step,
                        error,
                    });
                }
            };
        };

        RunReport {
            run_id,
            goal,
            max_steps,
            outcome,
            scratchpad,
            trace,
            usage,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Turn one decision into an observation, or a run-fatal error.
    ///
    /// Disallowed and unknown names are answered from the snapshot and never
    /// reach a transport.
    async fn invoke(
        &self,
        directory: &ToolDirectory,
        decision: &ToolDecision,
        cancel: &CancellationToken,
    ) -> Result<Observation> {
        if let Err(e) = directory.route(&decision.name) {
            warn!(tool = %decision.name, kind = e.kind(), "rejected tool decision");
            return Ok(Observation::failure(&e));
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TetherError::Cancelled),
            result = self.manager.call_in(directory, &decision.name, decision.arguments.clone()) => result,
        };

        match result {
            Ok(result) => Ok(Observation::success(result.into_payload())),
            Err(e) if e.is_tool_recoverable() => Ok(Observation::failure(&e)),
            Err(e @ TetherError::SessionUnavailable { .. }) => {
                if self.manager.has_ready_sessions() {
                    warn!(tool = %decision.name, error = %e, "session lost; other sessions remain");
                    Ok(Observation::failure(&e))
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }
}

/// Internal machine state; carries the data each phase needs.
enum Phase {
    Planning,
    Invoking(ToolDecision),
    Observing(ToolDecision, Observation),
    Done(String),
    Failed(TetherError),
}

impl Phase {
    fn label(&self) -> AgentPhase {
        match self {
            Self::Planning => AgentPhase::Planning,
            Self::Invoking(_) => AgentPhase::Invoking,
            Self::Observing(..) => AgentPhase::Observing,
            Self::Done(_) => AgentPhase::Done,
            Self::Failed(_) => AgentPhase::Failed,
        }
    }
}

fn model_error(error: TetherError) -> TetherError {
    match error {
        TetherError::ModelCapability(_) | TetherError::Cancelled => error,
        other => TetherError::ModelCapability(other.to_string()),
    }
}

/// Base prompt followed by each server's `instructions`.
pub fn compose_system_prompt(
    base: Option<&str>,
    server_instructions: &[(String, String)],
) -> Option<String> {
    let mut sections: Vec<String> = base
        .filter(|b| !b.trim().is_empty())
        .map(|b| b.to_string())
        .into_iter()
        .collect();
    for (server, text) in server_instructions {
        if text.trim().is_empty() {
            continue;
        }
        sections.push(format!("Instructions from server '{server}':\n{}", text.trim()));
    }
    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_appends_server_instructions() {
        let prompt = compose_system_prompt(
            Some("You are helpful."),
            &[
                ("calc".to_string(), "Use integers.\n".to_string()),
                ("empty".to_string(), "  ".to_string()),
            ],
        )
        .unwrap();
        assert_eq!(
            prompt,
            "You are helpful.\n\nInstructions from server 'calc':\nUse integers."
        );
        assert_eq!(compose_system_prompt(None, &[]), None);
        assert_eq!(compose_system_prompt(Some(""), &[]), None);
    }

    #[test]
    fn model_errors_are_normalized() {
        let mapped = model_error(TetherError::Protocol("bad".into()));
        assert!(matches!(mapped, TetherError::ModelCapability(_)));
        assert!(matches!(model_error(TetherError::Cancelled), TetherError::Cancelled));
    }

    #[test]
    fn request_builder_accumulates_disallowed_names() {
        let request = RunRequest::new("goal")
            .with_max_steps(2)
            .with_disallowed_tools(["a", "b"])
            .with_disallowed_tools(vec!["b".to_string()]);
        assert_eq!(request.max_steps, Some(2));
        assert_eq!(request.disallowed_tools.len(), 2);
        assert!(format!("{request:?}").contains("event_sink: false"));
    }
}
