//! Transport channels: ordered, framed delivery of JSON-RPC messages.

mod http;
mod line;
mod stdio;
#[cfg(feature = "websocket")]
mod websocket;

pub use http::{HttpTransport, SseDecoder};
pub use line::LineTransport;
pub use stdio::StdioTransport;
#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;

use async_trait::async_trait;

use crate::config::{Launch, ServerConfig};
use crate::error::{Result, TetherError};

/// Bidirectional message channel to one server.
///
/// Implementations deliver exactly one complete message per `receive` and
/// keep per-channel ordering. No retries happen at this layer.
#[async_trait]
pub trait Transport: Send {
    /// Send one JSON-RPC message.
    async fn send(&mut self, message: serde_json::Value) -> Result<()>;

    /// Receive the next JSON-RPC message. `ChannelClosed` at end of stream.
    ///
    /// Must be cancel-safe: dropping the future before it completes loses
    /// no message.
    async fn receive(&mut self) -> Result<serde_json::Value>;

    /// Release the underlying resource. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Opens a transport for a configured server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ServerConfig) -> Result<Box<dyn Transport>>;
}

/// Dispatches on the launch descriptor.
#[derive(Debug, Clone, Default)]
pub struct DefaultConnector {
    http_client: Option<reqwest::Client>,
}

impl DefaultConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share one HTTP client (and its connection pool) across HTTP sessions.
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, config: &ServerConfig) -> Result<Box<dyn Transport>> {
        match &config.launch {
            Launch::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let transport = StdioTransport::spawn(&config.name, command, args, env, cwd.as_deref())?;
                Ok(Box::new(transport))
            }
            Launch::Http { url, headers } => {
                let client = self.http_client.clone().unwrap_or_default();
                Ok(Box::new(HttpTransport::new(client, url, headers.clone())?))
            }
            #[cfg(feature = "websocket")]
            Launch::WebSocket { url } => Ok(Box::new(WebSocketTransport::connect(url).await?)),
            #[cfg(not(feature = "websocket"))]
            Launch::WebSocket { .. } => Err(TetherError::Configuration(format!(
                "server '{}' uses a websocket url but the 'websocket' feature is disabled",
                config.name
            ))),
        }
    }
}

pub(crate) fn closed(what: &str) -> TetherError {
    TetherError::ChannelClosed(what.to_string())
}
