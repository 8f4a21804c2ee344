//! Agent loop behaviour end to end: scripted model, fake servers.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::{
    fast_options, start_fake_manager, FakeServer, PanickingModel, ScriptedModel, ToolBehaviour,
};
use tether::agent_loop::{
    AgentPhase, AgentRunner, Observation, RunEvent, RunEventPayload, RunLifecycle, RunRequest,
    RunStatus,
};
use tether::error::TetherError;
use tether::model::{ModelAction, Usage};
use tether::session::SessionState;

use AgentPhase::{Done, Failed, Invoking, Observing, Planning};

fn sum_call(a: i64, b: i64) -> ModelAction {
    ModelAction::call("calculate_sum", json!({"a": a, "b": b}))
}

#[tokio::test]
async fn computes_a_sum_through_the_tool() {
    let (manager, connector) =
        start_fake_manager(vec![FakeServer::calculator("calc")], fast_options()).await;
    let model = Arc::new(ScriptedModel::new(vec![
        sum_call(5, 7),
        ModelAction::final_text("12"),
    ]));
    let runner = AgentRunner::new(manager.clone(), model.clone());

    let report = runner
        .execute(RunRequest::new("compute 5+7 using calculate_sum").with_max_steps(5))
        .await;

    assert_eq!(report.trace, vec![Planning, Invoking, Observing, Planning, Done]);
    assert_eq!(report.final_text(), Some("12"));
    assert_eq!(report.status(), RunStatus::Completed);

    let entries = report.scratchpad.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].step, 1);
    assert_eq!(entries[0].decision.name, "calculate_sum");
    assert_eq!(entries[0].decision.arguments, json!({"a": 5, "b": 7}));
    assert_eq!(entries[0].observation, Observation::success(json!("12")));
    assert_eq!(connector.stats("calc").tool_calls(), 1);

    let requests = model.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tools[0].name, "calculate_sum");
    assert!(requests[0].scratchpad.is_empty());
    assert_eq!(requests[1].scratchpad.len(), 1);
    assert_eq!(requests[1].step, 1);
}

#[tokio::test]
async fn budget_of_one_fails_after_one_cycle() {
    let (manager, connector) =
        start_fake_manager(vec![FakeServer::calculator("calc")], fast_options()).await;
    let model = Arc::new(ScriptedModel::repeating(sum_call(1, 1)));
    let runner = AgentRunner::new(manager, model.clone());

    let report = runner.execute(RunRequest::new("loop forever").with_max_steps(1)).await;

    assert_eq!(report.trace, vec![Planning, Invoking, Observing, Planning, Failed]);
    assert!(matches!(
        report.error(),
        Some(TetherError::StepBudgetExceeded { max_steps: 1 })
    ));
    assert_eq!(model.calls(), 1);
    assert_eq!(connector.stats("calc").tool_calls(), 1);
}

#[tokio::test]
async fn step_counter_never_exceeds_the_budget() {
    let (manager, _) = start_fake_manager(vec![FakeServer::calculator("calc")], fast_options()).await;
    let model = Arc::new(ScriptedModel::repeating(sum_call(2, 2)));
    let runner = AgentRunner::new(manager, model.clone());

    let failure = runner.run("never stops", 3, Vec::<String>::new()).await.unwrap_err();

    assert!(failure.is_budget_exhausted());
    assert_eq!(failure.steps, 3);
    assert_eq!(model.calls(), 3);
}

#[tokio::test]
async fn zero_budget_never_calls_the_model() {
    let (manager, _) = start_fake_manager(vec![FakeServer::calculator("calc")], fast_options()).await;
    let model = Arc::new(ScriptedModel::new(vec![ModelAction::final_text("early")]));
    let runner = AgentRunner::new(manager, model.clone());

    let report = runner.execute(RunRequest::new("nothing").with_max_steps(0)).await;

    assert_eq!(report.trace, vec![Planning, Failed]);
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn disallowed_tool_never_reaches_the_server() {
    let (manager, connector) =
        start_fake_manager(vec![FakeServer::calculator("calc")], fast_options()).await;
    let model = Arc::new(ScriptedModel::new(vec![
        sum_call(5, 7),
        ModelAction::final_text("I am not allowed to add."),
    ]));
    let runner = AgentRunner::new(manager, model.clone());

    let report = runner
        .execute(
            RunRequest::new("compute 5+7")
                .with_max_steps(5)
                .with_disallowed_tools(["calculate_sum"]),
        )
        .await;

    assert_eq!(report.final_text(), Some("I am not allowed to add."));
    let entry = &report.scratchpad.entries()[0];
    assert_eq!(entry.observation.failure_kind(), Some("tool_disallowed"));
    assert_eq!(connector.total_tool_calls(), 0);
    // The model never sees the disallowed tool.
    assert!(model.requests()[0].tools.is_empty());
}

#[tokio::test]
async fn unknown_tool_becomes_a_failure_observation() {
    let (manager, connector) =
        start_fake_manager(vec![FakeServer::calculator("calc")], fast_options()).await;
    let model = Arc::new(ScriptedModel::new(vec![
        ModelAction::call("multiply", json!({"a": 2, "b": 3})),
        sum_call(2, 3),
        ModelAction::final_text("5"),
    ]));
    let runner = AgentRunner::new(manager, model);

    let report = runner.execute(RunRequest::new("try things").with_max_steps(5)).await;

    assert_eq!(report.final_text(), Some("5"));
    let kinds: Vec<Option<&str>> = report
        .scratchpad
        .iter()
        .map(|e| e.observation.failure_kind())
        .collect();
    assert_eq!(kinds, vec![Some("tool_not_found"), None]);
    assert_eq!(connector.total_tool_calls(), 1);
    assert_eq!(
        report.trace,
        vec![Planning, Invoking, Observing, Planning, Invoking, Observing, Planning, Done]
    );
}

#[tokio::test]
async fn tool_level_errors_are_observed_not_fatal() {
    let server = FakeServer::calculator("calc")
        .with_tool("explode", ToolBehaviour::Fail("disk full".into()));
    let (manager, connector) = start_fake_manager(vec![server], fast_options()).await;
    let model = Arc::new(ScriptedModel::new(vec![
        ModelAction::call("explode", json!({})),
        ModelAction::call("calculate_sum", json!({"a": "five"})),
        ModelAction::final_text("gave up"),
    ]));
    let runner = AgentRunner::new(manager, model);

    let report = runner.execute(RunRequest::new("g").with_max_steps(5)).await;

    assert_eq!(report.status(), RunStatus::Completed);
    let entries = report.scratchpad.entries();
    assert_eq!(entries[0].observation.failure_kind(), Some("tool_execution_error"));
    assert!(entries[0].observation.to_model_text().contains("disk full"));
    assert_eq!(entries[1].observation.failure_kind(), Some("invalid_tool_arguments"));
    // Only the first call was dispatched; the second failed validation.
    assert_eq!(connector.stats("calc").tool_calls(), 1);
}

#[tokio::test]
async fn model_failure_ends_the_run() {
    let (manager, _) = start_fake_manager(vec![FakeServer::calculator("calc")], fast_options()).await;
    let runner = AgentRunner::new(manager, Arc::new(ScriptedModel::failing("quota exhausted")));

    let failure = runner.run("g", 5, ["x"]).await.unwrap_err();

    assert_eq!(failure.kind(), "model_capability_error");
    assert_eq!(failure.steps, 0);
    assert!(failure.to_string().contains("quota exhausted"));
}

#[tokio::test]
async fn usage_is_summed_over_planning_calls() {
    let (manager, _) = start_fake_manager(vec![FakeServer::calculator("calc")], fast_options()).await;
    let model = ScriptedModel::new(vec![
        sum_call(1, 2),
        sum_call(3, 4),
        ModelAction::final_text("done"),
    ])
    .with_usage_per_call(Usage::new(100, 10));
    let runner = AgentRunner::new(manager, Arc::new(model));

    let report = runner.execute(RunRequest::new("add twice").with_max_steps(5)).await;

    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(report.usage, Usage::new(300, 30));
    assert_eq!(report.usage.total_tokens, 330);
}

#[tokio::test]
async fn panicking_run_is_not_reported_as_cancelled() {
    let (manager, _) = start_fake_manager(vec![FakeServer::calculator("calc")], fast_options()).await;
    let runner = AgentRunner::new(manager.clone(), Arc::new(PanickingModel));

    let report = runner.start(RunRequest::new("explode")).wait().await;

    assert_eq!(report.status(), RunStatus::Failed);
    let error = report.error().expect("run should fail");
    assert!(matches!(error, TetherError::TaskPanicked(m) if m == "planner exploded"));
    assert_eq!(error.kind(), "task_panicked");
    assert_eq!(manager.session("calc").unwrap().state(), SessionState::Ready);
}

#[tokio::test]
async fn cancelling_mid_invoke_keeps_the_session_ready() {
    let server = FakeServer::calculator("calc").with_tool("wait", ToolBehaviour::Hang);
    let (manager, connector) = start_fake_manager(vec![server], fast_options()).await;
    let stats = connector.stats("calc");

    let hanging = AgentRunner::new(
        manager.clone(),
        Arc::new(ScriptedModel::repeating(ModelAction::call("wait", json!({})))),
    );
    let handle = hanging.start(RunRequest::new("wait forever").with_max_steps(5));
    tokio::time::timeout(Duration::from_secs(2), stats.hung.notified())
        .await
        .expect("tool call should be in flight");
    handle.abort();
    let report = handle.wait().await;

    assert_eq!(report.status(), RunStatus::Canceled);
    assert_eq!(report.trace, vec![Planning, Invoking, Failed]);
    assert!(report.scratchpad.is_empty());
    assert_eq!(manager.session("calc").unwrap().state(), SessionState::Ready);

    let next = AgentRunner::new(
        manager.clone(),
        Arc::new(ScriptedModel::new(vec![sum_call(5, 7), ModelAction::final_text("12")])),
    );
    let answer = next.run("compute 5+7", 5, Vec::<String>::new()).await.unwrap();
    assert_eq!(answer, "12");
}

#[tokio::test]
async fn losing_the_only_session_is_fatal() {
    let server = FakeServer::new("fragile").with_tool("crash", ToolBehaviour::Crash);
    let (manager, _) = start_fake_manager(vec![server], fast_options()).await;
    let runner = AgentRunner::new(
        manager,
        Arc::new(ScriptedModel::repeating(ModelAction::call("crash", json!({})))),
    );

    let failure = runner.run("g", 5, Vec::<String>::new()).await.unwrap_err();

    assert_eq!(failure.kind(), "session_unavailable");
    assert_eq!(failure.steps, 0);
}

#[tokio::test]
async fn losing_one_of_several_sessions_is_observed() {
    let (manager, _) = start_fake_manager(
        vec![
            FakeServer::new("fragile").with_tool("crash", ToolBehaviour::Crash),
            FakeServer::calculator("calc"),
        ],
        fast_options(),
    )
    .await;
    let runner = AgentRunner::new(
        manager,
        Arc::new(ScriptedModel::new(vec![
            ModelAction::call("crash", json!({})),
            sum_call(1, 2),
            ModelAction::final_text("3"),
        ])),
    );

    let report = runner.execute(RunRequest::new("g").with_max_steps(5)).await;

    assert_eq!(report.final_text(), Some("3"));
    let entries = report.scratchpad.entries();
    assert_eq!(entries[0].observation.failure_kind(), Some("session_unavailable"));
    assert!(entries[1].observation.is_success());
}

#[tokio::test]
async fn events_are_sequenced_and_bracketed_by_lifecycle() {
    let (manager, _) = start_fake_manager(vec![FakeServer::calculator("calc")], fast_options()).await;
    let runner = AgentRunner::new(
        manager,
        Arc::new(ScriptedModel::new(vec![sum_call(5, 7), ModelAction::final_text("12")])),
    );
    let events: Arc<Mutex<Vec<RunEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);

    let request = RunRequest::new("g")
        .with_max_steps(5)
        .with_event_sink(Arc::new(move |event: RunEvent| sink_events.lock().unwrap().push(event)));
    let run_id = request.run_id;
    runner.execute(request).await;

    let events = events.lock().unwrap();
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=events.len() as u64).collect::<Vec<_>>());
    assert!(events.iter().all(|e| e.run_id == run_id));
    assert!(matches!(
        events.first().map(|e| &e.payload),
        Some(RunEventPayload::Lifecycle { state: RunLifecycle::Started })
    ));
    assert!(matches!(
        events.last().map(|e| &e.payload),
        Some(RunEventPayload::Lifecycle { state: RunLifecycle::Completed })
    ));
    assert!(events
        .iter()
        .any(|e| matches!(&e.payload, RunEventPayload::ToolCallStarted { step: 1, decision } if decision.name == "calculate_sum")));
    assert!(events
        .iter()
        .any(|e| matches!(&e.payload, RunEventPayload::Observation { entry } if entry.step == 1)));
}

#[tokio::test]
async fn system_prompt_carries_server_instructions() {
    let (manager, _) = start_fake_manager(
        vec![FakeServer::calculator("calc").with_instructions("Integers only.")],
        fast_options(),
    )
    .await;
    let model = Arc::new(ScriptedModel::new(vec![ModelAction::final_text("ok")]));
    let runner = AgentRunner::new(manager, model.clone()).with_system_prompt("Be brief.");

    runner.run("g", 2, Vec::<String>::new()).await.unwrap();

    let prompt = model.requests()[0].system_prompt.clone().unwrap();
    assert_eq!(prompt, "Be brief.\n\nInstructions from server 'calc':\nIntegers only.");
}

#[tokio::test]
async fn concurrent_runs_share_one_session() {
    let (manager, connector) =
        start_fake_manager(vec![FakeServer::calculator("calc")], fast_options()).await;
    let first = AgentRunner::new(
        manager.clone(),
        Arc::new(ScriptedModel::new(vec![sum_call(1, 2), ModelAction::final_text("3")])),
    );
    let second = AgentRunner::new(
        manager.clone(),
        Arc::new(ScriptedModel::new(vec![sum_call(10, 20), ModelAction::final_text("30")])),
    );

    let (a, b) = tokio::join!(
        first.run("1+2", 3, Vec::<String>::new()),
        second.run("10+20", 3, Vec::<String>::new())
    );

    assert_eq!(a.unwrap(), "3");
    assert_eq!(b.unwrap(), "30");
    assert_eq!(connector.stats("calc").tool_calls(), 2);
}
