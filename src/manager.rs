//! Multi-server session management with deterministic tool routing.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{ServerConfig, DEFAULT_STARTUP_TIMEOUT};
use crate::error::{Result, TetherError};
use crate::protocol::CallToolResult;
use crate::session::{Session, SessionOptions, SessionState};
use crate::tools::ToolSchema;
use crate::transport::{Connector, DefaultConnector};
use crate::util::{with_timeout, RetryPolicy};

/// Separator between server and tool under [`CollisionPolicy::PrefixServerName`].
pub const NAMESPACE_SEPARATOR: &str = "__";

/// How tool names from different servers are merged.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CollisionPolicy {
    /// Tools keep their own names. On a clash the server listed first in the
    /// configuration wins and later definitions are unreachable.
    #[default]
    FirstRegisteredWins,
    /// Every tool is exposed as `<server>__<tool>`.
    PrefixServerName,
}

impl CollisionPolicy {
    pub fn exposed_name(self, server: &str, tool: &str) -> String {
        match self {
            Self::FirstRegisteredWins => tool.to_string(),
            Self::PrefixServerName => format!("{server}{NAMESPACE_SEPARATOR}{tool}"),
        }
    }
}

/// Manager behaviour controls.
#[derive(Debug, Clone, bon::Builder)]
pub struct ManagerOptions {
    #[builder(default)]
    pub collision_policy: CollisionPolicy,
    /// Tool names never exposed by this manager.
    #[builder(default)]
    pub disallowed_tools: Vec<String>,
    #[builder(default)]
    pub session: SessionOptions,
    /// Bound on one server's start, retries included.
    #[builder(default = DEFAULT_STARTUP_TIMEOUT)]
    pub startup_timeout: Duration,
    #[builder(default)]
    pub retry: RetryPolicy,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One routable tool.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    /// Name the model uses.
    pub exposed_name: String,
    pub server: String,
    /// Name the owning server knows the tool by.
    pub upstream_name: String,
    /// Schema published under `exposed_name`.
    pub schema: ToolSchema,
    pub session: Arc<Session>,
}

/// Immutable snapshot of the tools reachable through Ready sessions.
#[derive(Debug, Default)]
pub struct ToolDirectory {
    entries: Vec<DirectoryEntry>,
    index: HashMap<String, usize>,
    disallowed: BTreeSet<String>,
    policy: CollisionPolicy,
}

impl ToolDirectory {
    /// Merge the catalogs of the Ready sessions in `sessions` (configuration
    /// order), skipping disallowed names.
    pub fn build(
        sessions: &[Arc<Session>],
        policy: CollisionPolicy,
        disallowed: &BTreeSet<String>,
    ) -> Self {
        let mut directory = Self {
            disallowed: disallowed.clone(),
            policy,
            ..Self::default()
        };

        for session in sessions.iter().filter(|s| s.state().is_ready()) {
            let catalog = session.tools();
            for tool in catalog.iter() {
                let exposed_name = policy.exposed_name(session.name(), &tool.name);
                if directory.is_disallowed(&exposed_name) {
                    tracing::trace!(server = %session.name(), tool = %exposed_name, "tool disallowed");
                    continue;
                }
                if let Some(&existing) = directory.index.get(&exposed_name) {
                    tracing::warn!(
                        tool = %exposed_name,
                        kept = %directory.entries[existing].server,
                        dropped = %session.name(),
                        "tool name collision; first registered wins"
                    );
                    continue;
                }
                directory
                    .index
                    .insert(exposed_name.clone(), directory.entries.len());
                directory.entries.push(DirectoryEntry {
                    schema: tool.renamed(exposed_name.clone()),
                    exposed_name,
                    server: session.name().to_string(),
                    upstream_name: tool.name.clone(),
                    session: Arc::clone(session),
                });
            }
        }
        directory
    }

    /// Copy with `extra` names removed as well.
    pub fn restricted(&self, extra: &BTreeSet<String>) -> Self {
        let mut disallowed = self.disallowed.clone();
        disallowed.extend(extra.iter().cloned());
        let mut directory = Self {
            disallowed,
            policy: self.policy,
            ..Self::default()
        };
        for entry in &self.entries {
            if directory.is_disallowed(&entry.exposed_name) {
                continue;
            }
            directory
                .index
                .insert(entry.exposed_name.clone(), directory.entries.len());
            directory.entries.push(entry.clone());
        }
        directory
    }

    pub fn get(&self, name: &str) -> Option<&DirectoryEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Whether `name` is blocked. Under prefixing, the bare tool name also
    /// blocks every `<server>__<tool>`.
    pub fn is_disallowed(&self, name: &str) -> bool {
        if self.disallowed.contains(name) {
            return true;
        }
        self.policy == CollisionPolicy::PrefixServerName
            && name
                .split_once(NAMESPACE_SEPARATOR)
                .is_some_and(|(_, tool)| self.disallowed.contains(tool))
    }

    pub fn disallowed(&self) -> &BTreeSet<String> {
        &self.disallowed
    }

    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.exposed_name.as_str()).collect()
    }

    /// Schemas under their exposed names, for the reasoning model.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.entries.iter().map(|e| e.schema.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Route `name`: disallowed first, then unknown.
    pub fn route(&self, name: &str) -> Result<&DirectoryEntry> {
        if self.is_disallowed(name) {
            return Err(TetherError::ToolDisallowed(name.to_string()));
        }
        self.get(name)
            .ok_or_else(|| TetherError::ToolNotFound(name.to_string()))
    }
}

/// Outcome of [`SessionManager::start`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartReport {
    pub ready: Vec<String>,
    /// Server name and failure reason.
    pub failed: Vec<(String, String)>,
}

impl StartReport {
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }
}

struct ManagerInner {
    options: ManagerOptions,
    disallowed: BTreeSet<String>,
    connector: Arc<dyn Connector>,
    sessions: StdRwLock<Vec<Arc<Session>>>,
    directory: watch::Sender<Arc<ToolDirectory>>,
    watchers: StdMutex<Vec<JoinHandle<()>>>,
}

impl ManagerInner {
    fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .map(|sessions| sessions.clone())
            .unwrap_or_default()
    }

    fn rebuild_directory(&self) {
        let directory = ToolDirectory::build(
            &self.sessions(),
            self.options.collision_policy,
            &self.disallowed,
        );
        tracing::debug!(tools = directory.len(), "tool directory rebuilt");
        self.directory.send_replace(Arc::new(directory));
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Ok(mut watchers) = self.watchers.lock() {
            for watcher in watchers.drain(..) {
                watcher.abort();
            }
        }
    }
}

/// Owns every session of a run and the merged tool directory.
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.inner.sessions())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl SessionManager {
    pub fn new(options: ManagerOptions) -> Self {
        Self::with_connector(options, Arc::new(DefaultConnector::new()))
    }

    pub fn with_connector(options: ManagerOptions, connector: Arc<dyn Connector>) -> Self {
        let disallowed = options
            .disallowed_tools
            .iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        let (directory, _) = watch::channel(Arc::new(ToolDirectory::default()));
        Self {
            inner: Arc::new(ManagerInner {
                options,
                disallowed,
                connector,
                sessions: StdRwLock::new(Vec::new()),
                directory,
                watchers: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    pub fn disallowed(&self) -> &BTreeSet<String> {
        &self.inner.disallowed
    }

    /// Start one session per config, concurrently. On return every session
    /// is Ready or Failed; individual failures are reported, not raised.
    pub async fn start(&self, configs: Vec<ServerConfig>) -> Result<StartReport> {
        let mut seen = BTreeSet::new();
        for config in &configs {
            if config.name.trim().is_empty() {
                return Err(TetherError::Configuration(
                    "server names must not be empty".into(),
                ));
            }
            if !seen.insert(config.name.clone()) {
                return Err(TetherError::Configuration(format!(
                    "duplicate server name '{}'",
                    config.name
                )));
            }
        }

        let new_sessions: Vec<Arc<Session>> = {
            let mut sessions = self
                .inner
                .sessions
                .write()
                .map_err(|_| TetherError::Configuration("session table poisoned".into()))?;
            if let Some(clash) = sessions.iter().find(|s| seen.contains(s.name())) {
                return Err(TetherError::Configuration(format!(
                    "server '{}' is already managed",
                    clash.name()
                )));
            }
            let created: Vec<Arc<Session>> = configs
                .into_iter()
                .map(|config| {
                    Session::new(
                        Arc::new(config),
                        Arc::clone(&self.inner.connector),
                        self.inner.options.session.clone(),
                    )
                })
                .collect();
            sessions.extend(created.iter().cloned());
            created
        };

        for session in &new_sessions {
            self.watch_session(session);
        }

        tracing::info!(servers = new_sessions.len(), "starting sessions");
        let outcomes = join_all(new_sessions.iter().map(|session| self.start_session(session))).await;

        let mut report = StartReport::default();
        for (session, outcome) in new_sessions.iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.ready.push(session.name().to_string()),
                Err(e) => report.failed.push((session.name().to_string(), e.to_string())),
            }
        }
        self.inner.rebuild_directory();
        tracing::info!(
            ready = report.ready.len(),
            failed = report.failed.len(),
            tools = self.directory().len(),
            "sessions started"
        );
        Ok(report)
    }

    /// Restart a Failed or Closed session.
    pub async fn restart(&self, name: &str) -> Result<()> {
        let session = self
            .session(name)
            .ok_or_else(|| TetherError::session_unavailable(name, "no such server"))?;
        let outcome = self.start_session(&session).await;
        self.inner.rebuild_directory();
        outcome
    }

    async fn start_session(&self, session: &Arc<Session>) -> Result<()> {
        let options = &self.inner.options;
        let attempts = options.retry.execute(session.name(), || {
            let session = Arc::clone(session);
            async move { session.start().await }
        });
        let outcome = with_timeout(options.startup_timeout, "startup", attempts).await;
        if let Err(e) = &outcome {
            tracing::warn!(server = %session.name(), error = %e, state = %session.state(), "server unavailable");
        }
        outcome
    }

    fn watch_session(&self, session: &Arc<Session>) {
        let inner: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let mut states = session.subscribe();
        let watcher = tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                // Intermediate start states do not change what is routable.
                if matches!(
                    state,
                    SessionState::Ready | SessionState::Failed | SessionState::Closed
                ) {
                    inner.rebuild_directory();
                }
            }
        });
        if let Ok(mut watchers) = self.inner.watchers.lock() {
            watchers.push(watcher);
        }
    }

    /// Current directory snapshot.
    pub fn directory(&self) -> Arc<ToolDirectory> {
        Arc::clone(&self.inner.directory.borrow())
    }

    pub fn subscribe_directory(&self) -> watch::Receiver<Arc<ToolDirectory>> {
        self.inner.directory.subscribe()
    }

    pub fn route(&self, name: &str) -> Result<DirectoryEntry> {
        self.directory().route(name).cloned()
    }

    /// Route `name` through the current directory and invoke it.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        let directory = self.directory();
        self.call_in(&directory, name, arguments).await
    }

    /// Invoke through a caller-held snapshot, so a run sees one consistent
    /// tool set even while sessions come and go.
    ///
    /// Transport failures surface as `SessionUnavailable`; timeouts and
    /// malformed results as `ToolExecution`.
    pub async fn call_in(
        &self,
        directory: &ToolDirectory,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult> {
        let entry = directory.route(name)?;
        tracing::debug!(tool = name, server = %entry.server, "routing tool call");
        entry
            .session
            .call_tool(&entry.upstream_name, arguments)
            .await
            .map_err(|e| translate_call_error(entry, e))
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.sessions()
    }

    pub fn session(&self, name: &str) -> Option<Arc<Session>> {
        self.inner.sessions().into_iter().find(|s| s.name() == name)
    }

    pub fn has_ready_sessions(&self) -> bool {
        self.inner.sessions().iter().any(|s| s.state().is_ready())
    }

    /// `(server, instructions)` for every Ready session that sent some,
    /// in configuration order.
    pub fn server_instructions(&self) -> Vec<(String, String)> {
        self.inner
            .sessions()
            .iter()
            .filter(|s| s.state().is_ready())
            .filter_map(|s| s.instructions().map(|text| (s.name().to_string(), text)))
            .collect()
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        let sessions = self.inner.sessions();
        let outcomes = join_all(sessions.iter().map(|s| s.shutdown())).await;
        for (session, outcome) in sessions.iter().zip(outcomes) {
            if let Err(e) = outcome {
                tracing::warn!(server = %session.name(), error = %e, "shutdown failed");
            }
        }
        self.inner.rebuild_directory();
        tracing::info!(servers = sessions.len(), "all sessions closed");
    }
}

fn translate_call_error(entry: &DirectoryEntry, error: TetherError) -> TetherError {
    let tool_name = entry.exposed_name.clone();
    match error {
        TetherError::ToolNotFound(_) => TetherError::ToolNotFound(tool_name),
        TetherError::ToolExecution { message, code, .. } => TetherError::ToolExecution {
            tool_name,
            message,
            code,
        },
        TetherError::InvalidToolArguments { message, .. } => {
            TetherError::InvalidToolArguments { tool_name, message }
        }
        e @ (TetherError::ToolDisallowed(_)
        | TetherError::SessionUnavailable { .. }
        | TetherError::Cancelled) => e,
        TetherError::RequestTimeout { timeout_ms, .. } => TetherError::ToolExecution {
            tool_name,
            message: format!("no response within {timeout_ms}ms"),
            code: None,
        },
        e @ (TetherError::Protocol(_) | TetherError::Rpc { .. } | TetherError::Serialization(_)) => {
            TetherError::ToolExecution {
                tool_name,
                message: e.to_string(),
                code: None,
            }
        }
        other => TetherError::session_unavailable(&entry.server, other.to_string()),
    }
}
