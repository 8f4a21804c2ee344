//! tether: an MCP session client with a bounded, tool-using agent loop.
//!
//! A [`SessionManager`](manager::SessionManager) starts one
//! [`Session`](session::Session) per configured server, negotiates the
//! protocol, discovers tools and merges them into a
//! [`ToolDirectory`](manager::ToolDirectory). An
//! [`AgentRunner`](agent_loop::AgentRunner) then plans with a
//! [`ReasoningModel`](model::ReasoningModel), invokes tools through the
//! manager and records every observation in a scratch-pad until the model
//! answers or the step budget runs out.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether::prelude::*;
//!
//! # async fn example() -> tether::error::Result<()> {
//! let config = TetherConfig::from_env()?;
//! let servers = ServersFile::load("servers.json")?;
//! let manager = SessionManager::new(ManagerOptions::default());
//! manager.start(servers.into_configs()).await?;
//!
//! let model = OpenAiChatModel::from_config(&config)?;
//! let runner = AgentRunner::new(manager.clone(), Arc::new(model));
//! match runner.run("compute 5+7 using calculate_sum", 5, ["delete_file"]).await {
//!     Ok(answer) => println!("{answer}"),
//!     Err(failure) => eprintln!("{failure}"),
//! }
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod config;
pub mod correlator;
pub mod error;
pub mod manager;
pub mod model;
pub mod prelude;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transport;
pub mod util;

#[cfg(feature = "cli")]
pub mod cli;
