//! CLI command handlers for `run` and `tools`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::agent_loop::{AgentRunner, RunEvent, RunEventPayload, RunLifecycle, RunRequest};
use crate::config::{ServersFile, TetherConfig};
use crate::error::TetherError;
use crate::manager::{CollisionPolicy, ManagerOptions, SessionManager, StartReport};
use crate::model::{OpenAiChatModel, Pricing, Usage};

use super::{RunArgs, ServerArgs, ToolsArgs};

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Handle `tether run <goal>`.
pub async fn handle_run(args: RunArgs) -> CliResult {
    let mut config = TetherConfig::from_env()?;
    if let Some(model) = args.model.clone() {
        config = config.with_model(model);
    }
    if let Some(max_steps) = args.max_steps {
        config = config.with_max_steps(max_steps);
    }

    let mut model = OpenAiChatModel::from_config(&config)?;
    if let Some(temperature) = args.temperature {
        model = model.with_temperature(temperature);
    }

    let manager = start_manager(&args.servers, &config).await?;
    let runner = AgentRunner::new(manager.clone(), Arc::new(model))
        .with_default_max_steps(config.max_steps);

    let mut request = RunRequest::new(args.goal).with_event_sink(Arc::new(print_event));
    if let Some(system) = args.system {
        request = request.with_system_prompt(system);
    }

    let started = Instant::now();
    let handle = runner.start(request);
    let token = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    let report = handle.wait().await;
    manager.shutdown().await;

    let summary = run_summary(&report.usage, config.pricing.as_ref(), started.elapsed());
    match report.into_result() {
        Ok(text) => {
            println!("{text}");
            eprintln!("{summary}");
            Ok(())
        }
        Err(failure) => {
            eprintln!("{summary}");
            Err(failure.into())
        }
    }
}

/// `tokens: 1,234 | cost: $0.0123 | elapsed: 4.2s`; cost only when priced.
fn run_summary(usage: &Usage, pricing: Option<&Pricing>, elapsed: Duration) -> String {
    let mut parts = vec![format!("tokens: {}", group_thousands(usage.total_tokens))];
    if let Some(pricing) = pricing {
        parts.push(format!("cost: ${:.4}", usage.cost(pricing)));
    }
    parts.push(format!("elapsed: {:.1}s", elapsed.as_secs_f64()));
    parts.join(" | ")
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Handle `tether tools`.
pub async fn handle_tools(args: ToolsArgs) -> CliResult {
    let config = TetherConfig::from_env()?;
    let manager = start_manager(&args.servers, &config).await?;

    let directory = manager.directory();
    if directory.is_empty() {
        println!("no tools available");
    }
    for entry in directory.entries() {
        let description = entry.schema.description.as_deref().unwrap_or("");
        println!("{:<32} [{}] {}", entry.exposed_name, entry.server, description);
    }
    manager.shutdown().await;
    Ok(())
}

async fn start_manager(
    servers: &ServerArgs,
    config: &TetherConfig,
) -> Result<SessionManager, Box<dyn std::error::Error>> {
    let path = config_path(servers)?;
    let file = ServersFile::load(&path)?;
    if file.servers.is_empty() {
        return Err(TetherError::Configuration(format!(
            "no enabled servers in {}",
            path.display()
        ))
        .into());
    }

    let manager = SessionManager::new(manager_options(servers, config));
    let report = manager.start(file.into_configs()).await?;
    print_start_report(&report);
    Ok(manager)
}

fn config_path(servers: &ServerArgs) -> Result<PathBuf, TetherError> {
    servers
        .config
        .clone()
        .or_else(ServersFile::default_path)
        .ok_or_else(|| {
            TetherError::Configuration("no --config given and no default config path".to_string())
        })
}

pub fn manager_options(servers: &ServerArgs, config: &TetherConfig) -> ManagerOptions {
    let collision_policy = if servers.prefix_tools {
        CollisionPolicy::PrefixServerName
    } else {
        CollisionPolicy::FirstRegisteredWins
    };
    ManagerOptions::builder()
        .collision_policy(collision_policy)
        .disallowed_tools(servers.disallow.clone())
        .session(config.session_options())
        .startup_timeout(config.startup_timeout)
        .build()
}

fn print_start_report(report: &StartReport) {
    for name in &report.ready {
        eprintln!("✅ {name}");
    }
    for (name, reason) in &report.failed {
        eprintln!("❌ {name}: {reason}");
    }
}

fn print_event(event: RunEvent) {
    match &event.payload {
        RunEventPayload::ToolCallStarted { step, decision } => {
            eprintln!("⚡ [{step}] {} {}", decision.name, decision.arguments);
        }
        RunEventPayload::Observation { entry } => {
            let text = truncate(&entry.observation.to_model_text(), 200);
            if entry.observation.is_success() {
                eprintln!("  ✅ {text}");
            } else {
                eprintln!("  ❌ {text}");
            }
        }
        RunEventPayload::Lifecycle {
            state: RunLifecycle::Failed { error },
        } => {
            eprintln!("❌ {error}");
        }
        _ => {}
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
