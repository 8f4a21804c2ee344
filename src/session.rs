//! One negotiated, stateful relationship with a single server.
//!
//! ```text
//! Disconnected → Connecting → Handshaking → Ready → Closing → Closed
//!        └──────────┴─────────────┴───────────┴──→ Failed
//! ```
//!
//! Lifecycle transitions are serialized by a per-session mutex. Tool calls
//! only read the current catalog and correlator, so they run concurrently.

use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{ServerConfig, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use crate::correlator::Correlator;
use crate::error::{Result, TetherError};
use crate::protocol::jsonrpc::codes;
use crate::protocol::{
    methods, CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    ListToolsParams, ListToolsResult, ServerCapabilities,
};
use crate::tools::{validate_arguments, ToolCatalog, ToolSchema};
use crate::transport::Connector;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }

    /// States from which `start` may (re)establish the session.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

/// Timeouts and limits for one session.
#[derive(Debug, Clone, bon::Builder)]
pub struct SessionOptions {
    /// Per-request timeout for `tools/list` pages and `tools/call`.
    #[builder(default = DEFAULT_REQUEST_TIMEOUT)]
    pub request_timeout: Duration,
    /// Bound on connect-to-Ready, discovery included.
    #[builder(default = DEFAULT_HANDSHAKE_TIMEOUT)]
    pub handshake_timeout: Duration,
    /// Guard against servers that hand out cursors forever.
    #[builder(default = 100)]
    pub max_discovery_pages: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// What the server told us in `initialize`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerHandshake {
    pub protocol_version: String,
    pub server_info: Implementation,
    pub capabilities: ServerCapabilities,
    pub instructions: Option<String>,
}

struct Live {
    correlator: Arc<Correlator>,
    handshake: ServerHandshake,
    catalog: Arc<ToolCatalog>,
    monitor: Option<JoinHandle<()>>,
}

impl Drop for Live {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

pub struct Session {
    config: Arc<ServerConfig>,
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    state: watch::Sender<SessionState>,
    lifecycle: Mutex<()>,
    live: StdRwLock<Option<Live>>,
    last_error: StdMutex<Option<String>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub fn new(
        config: Arc<ServerConfig>,
        connector: Arc<dyn Connector>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Arc::new(Self {
            config,
            connector,
            options,
            state,
            lifecycle: Mutex::new(()),
            live: StdRwLock::new(None),
            last_error: StdMutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state changes. A catalog refresh re-publishes `Ready`.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Tools learned at discovery; empty unless Ready.
    pub fn tools(&self) -> Arc<ToolCatalog> {
        if !self.state().is_ready() {
            return Arc::default();
        }
        self.read_live(|live| Arc::clone(&live.catalog))
            .unwrap_or_default()
    }

    pub fn handshake(&self) -> Option<ServerHandshake> {
        self.read_live(|live| live.handshake.clone())
    }

    pub fn instructions(&self) -> Option<String> {
        self.read_live(|live| live.handshake.instructions.clone())
            .flatten()
    }

    /// Reason for the most recent failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    /// Frames the correlator could not match or parse.
    pub fn protocol_errors(&self) -> u64 {
        self.read_live(|live| live.correlator.protocol_errors())
            .unwrap_or(0)
    }

    /// Connect, handshake and discover tools. A no-op when already Ready.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let current = self.state();
        if current.is_ready() {
            return Ok(());
        }
        if !current.can_start() {
            return Err(TetherError::session_unavailable(
                self.name(),
                format!("cannot start while {current}"),
            ));
        }

        if let Some(previous) = self.take_live() {
            previous.correlator.close().await;
        }
        if let Ok(mut last_error) = self.last_error.lock() {
            *last_error = None;
        }

        let abandoned = AbandonGuard::new(self);
        let established = self.establish().await;
        abandoned.disarm();

        match established {
            Ok(live) => {
                let tools = live.catalog.len();
                let server_version = live.handshake.server_info.version.clone();
                if let Ok(mut slot) = self.live.write() {
                    *slot = Some(live);
                }
                self.set_state(SessionState::Ready);
                tracing::info!(server = %self.name(), tools, %server_version, "session ready");
                // The monitor ignores closes before Ready; catch one that raced us.
                if let Some(Some(reason)) = self.read_live(|live| live.correlator.close_reason()) {
                    self.channel_lost(reason);
                }
                Ok(())
            }
            Err(e) => {
                self.record_failure(&e.to_string());
                self.set_state(SessionState::Failed);
                tracing::warn!(server = %self.name(), error = %e, "session failed to start");
                Err(e)
            }
        }
    }

    /// Invoke a tool on this server.
    ///
    /// `isError` results and JSON-RPC errors become `ToolExecution`.
    /// Transport failures and timeouts are returned as-is.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        let state = self.state();
        if !state.is_ready() {
            return Err(TetherError::session_unavailable(
                self.name(),
                format!("session is {state}"),
            ));
        }
        let (correlator, catalog) = self
            .read_live(|live| (Arc::clone(&live.correlator), Arc::clone(&live.catalog)))
            .ok_or_else(|| TetherError::session_unavailable(self.name(), "no live channel"))?;

        let schema = catalog
            .get(name)
            .ok_or_else(|| TetherError::ToolNotFound(name.to_string()))?;
        validate_arguments(&arguments, &schema.input_schema).map_err(|message| {
            TetherError::InvalidToolArguments {
                tool_name: name.to_string(),
                message,
            }
        })?;

        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })?;
        tracing::debug!(server = %self.name(), tool = name, "calling tool");

        let raw = match correlator
            .request(methods::TOOLS_CALL, Some(params), self.options.request_timeout)
            .await
        {
            Ok(raw) => raw,
            Err(TetherError::Rpc { error, .. }) => {
                return Err(TetherError::ToolExecution {
                    tool_name: name.to_string(),
                    message: error.message,
                    code: Some(error.code),
                });
            }
            Err(TetherError::ChannelClosed(reason)) => {
                self.channel_lost(reason.clone());
                return Err(TetherError::ChannelClosed(reason));
            }
            Err(e) => return Err(e),
        };

        let result: CallToolResult = serde_json::from_value(raw).map_err(|e| {
            TetherError::Protocol(format!("malformed tools/call result for '{name}': {e}"))
        })?;
        if result.is_error {
            return Err(TetherError::tool_execution(name, result.error_message()));
        }
        Ok(result)
    }

    /// Re-run discovery on a Ready session. On failure the previous catalog
    /// stays in place.
    pub async fn refresh_tools(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let state = self.state();
        if !state.is_ready() {
            return Err(TetherError::session_unavailable(
                self.name(),
                format!("cannot refresh tools while {state}"),
            ));
        }
        let (correlator, capabilities) = self
            .read_live(|live| (Arc::clone(&live.correlator), live.handshake.capabilities.clone()))
            .ok_or_else(|| TetherError::session_unavailable(self.name(), "no live channel"))?;

        let catalog = self.discover(&correlator, &capabilities).await?;
        let tools = catalog.len();
        if let Ok(mut slot) = self.live.write() {
            if let Some(live) = slot.as_mut() {
                live.catalog = Arc::new(catalog);
            }
        }
        // Re-publish Ready so watchers rebuild their view of the catalog.
        self.state.send_replace(SessionState::Ready);
        tracing::info!(server = %self.name(), tools, "tool catalog refreshed");
        Ok(())
    }

    /// Close the channel. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        match self.state() {
            SessionState::Closed => return Ok(()),
            SessionState::Disconnected => {
                self.set_state(SessionState::Closed);
                return Ok(());
            }
            _ => {}
        }

        self.set_state(SessionState::Closing);
        if let Some(mut live) = self.take_live() {
            if let Some(monitor) = live.monitor.take() {
                monitor.abort();
            }
            live.correlator.close().await;
        }
        self.set_state(SessionState::Closed);
        tracing::debug!(server = %self.name(), "session closed");
        Ok(())
    }

    async fn establish(self: &Arc<Self>) -> Result<Live> {
        let limit = self.options.handshake_timeout;
        let (correlator, handshake, catalog) = tokio::time::timeout(limit, self.negotiate())
            .await
            .unwrap_or_else(|_| {
                Err(TetherError::HandshakeFailure {
                    server: self.name().to_string(),
                    message: format!("not ready within {}ms", limit.as_millis()),
                })
            })?;

        let monitor = tokio::spawn(monitor(Arc::downgrade(self), Arc::clone(&correlator)));
        Ok(Live {
            correlator,
            handshake,
            catalog: Arc::new(catalog),
            monitor: Some(monitor),
        })
    }

    async fn negotiate(&self) -> Result<(Arc<Correlator>, ServerHandshake, ToolCatalog)> {
        self.set_state(SessionState::Connecting);
        let transport = self.connector.connect(&self.config).await?;
        let correlator = Arc::new(Correlator::spawn(self.name(), transport));

        self.set_state(SessionState::Handshaking);
        let negotiated = async {
            let handshake = self.initialize(&correlator).await?;
            let catalog = self.discover(&correlator, &handshake.capabilities).await?;
            Ok::<_, TetherError>((handshake, catalog))
        }
        .await;

        match negotiated {
            Ok((handshake, catalog)) => Ok((correlator, handshake, catalog)),
            Err(e) => {
                correlator.close().await;
                Err(e)
            }
        }
    }

    async fn initialize(&self, correlator: &Correlator) -> Result<ServerHandshake> {
        let failure = |message: String| TetherError::HandshakeFailure {
            server: self.name().to_string(),
            message,
        };

        let params = serde_json::to_value(InitializeParams::default())?;
        let raw = correlator
            .request(methods::INITIALIZE, Some(params), self.options.request_timeout)
            .await
            .map_err(|e| failure(e.to_string()))?;
        let init: InitializeResult = serde_json::from_value(raw)
            .map_err(|e| failure(format!("malformed initialize result: {e}")))?;

        if init.protocol_version != crate::protocol::PROTOCOL_VERSION {
            tracing::debug!(
                server = %self.name(),
                offered = crate::protocol::PROTOCOL_VERSION,
                negotiated = %init.protocol_version,
                "server negotiated a different protocol revision"
            );
        }

        correlator
            .notify(methods::INITIALIZED, None)
            .map_err(|e| failure(e.to_string()))?;

        Ok(ServerHandshake {
            protocol_version: init.protocol_version,
            server_info: init.server_info,
            capabilities: init.capabilities,
            instructions: init.instructions.filter(|text| !text.trim().is_empty()),
        })
    }

    async fn discover(
        &self,
        correlator: &Correlator,
        capabilities: &ServerCapabilities,
    ) -> Result<ToolCatalog> {
        let failure = |message: String| TetherError::DiscoveryFailure {
            server: self.name().to_string(),
            message,
        };

        let mut schemas: Vec<ToolSchema> = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..self.options.max_discovery_pages {
            let params = serde_json::to_value(ListToolsParams {
                cursor: cursor.take(),
            })?;
            let raw = match correlator
                .request(methods::TOOLS_LIST, Some(params), self.options.request_timeout)
                .await
            {
                Ok(raw) => raw,
                // A server without the tools capability may not implement tools/list.
                Err(TetherError::Rpc { error, .. })
                    if error.code == codes::METHOD_NOT_FOUND && !capabilities.supports_tools() =>
                {
                    return Ok(ToolCatalog::default());
                }
                Err(e) => return Err(failure(e.to_string())),
            };
            let page: ListToolsResult = serde_json::from_value(raw)
                .map_err(|e| failure(format!("malformed tools/list result: {e}")))?;

            schemas.extend(page.tools.into_iter().filter(|tool| {
                let named = !tool.name.trim().is_empty();
                if !named {
                    tracing::warn!(server = %self.name(), "ignoring tool without a name");
                }
                named
            }));

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => {
                    let (catalog, duplicates) = ToolCatalog::from_schemas(schemas);
                    for name in duplicates {
                        tracing::warn!(server = %self.name(), tool = %name, "server listed tool twice; keeping the first");
                    }
                    return Ok(catalog);
                }
            }
        }

        Err(failure(format!(
            "tools/list did not finish within {} pages",
            self.options.max_discovery_pages
        )))
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(server = %self.name(), from = %previous, to = %next, "session state");
        }
    }

    fn record_failure(&self, reason: &str) {
        if let Ok(mut last_error) = self.last_error.lock() {
            *last_error = Some(reason.to_string());
        }
    }

    /// The channel went away underneath a Ready session.
    fn channel_lost(&self, reason: String) {
        let failed = self.state.send_if_modified(|state| {
            if state.is_ready() {
                *state = SessionState::Failed;
                true
            } else {
                false
            }
        });
        if failed {
            tracing::warn!(server = %self.name(), %reason, "session lost its channel");
            self.record_failure(&reason);
        }
    }

    fn read_live<T>(&self, f: impl FnOnce(&Live) -> T) -> Option<T> {
        self.live.read().ok().and_then(|live| live.as_ref().map(f))
    }

    fn take_live(&self) -> Option<Live> {
        self.live.write().ok().and_then(|mut live| live.take())
    }
}

/// Marks the session Failed if a `start` future is dropped part-way.
struct AbandonGuard<'a> {
    session: Option<&'a Session>,
}

impl<'a> AbandonGuard<'a> {
    fn new(session: &'a Session) -> Self {
        Self {
            session: Some(session),
        }
    }

    fn disarm(mut self) {
        self.session = None;
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::warn!(server = %session.name(), "session start abandoned");
            session.record_failure("start abandoned before the session was ready");
            session.set_state(SessionState::Failed);
        }
    }
}

async fn monitor(session: Weak<Session>, correlator: Arc<Correlator>) {
    let mut notifications = correlator.subscribe();
    loop {
        tokio::select! {
            _ = correlator.closed() => {
                if let Some(session) = session.upgrade() {
                    let reason = correlator
                        .close_reason()
                        .unwrap_or_else(|| "channel closed".to_string());
                    session.channel_lost(reason);
                }
                return;
            }
            note = notifications.recv() => {
                let refresh = match note {
                    Ok(note) => note.method == methods::TOOLS_LIST_CHANGED,
                    // Missed notifications may have included a list change.
                    Err(RecvError::Lagged(_)) => true,
                    Err(RecvError::Closed) => return,
                };
                if !refresh {
                    continue;
                }
                let Some(session) = session.upgrade() else {
                    return;
                };
                if let Err(e) = session.refresh_tools().await {
                    tracing::warn!(server = %session.name(), error = %e, "tool refresh failed");
                }
            }
        }
    }
}
