//! WebSocket transport: one text frame per message.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::{closed, Transport};
use crate::error::{Result, TetherError};

type McpWebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketTransport {
    socket: Option<McpWebSocket>,
}

impl WebSocketTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TetherError::Configuration(format!("invalid websocket url '{url}': {e}")))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mcp"));

        let (socket, _response) = connect_async(request).await?;
        tracing::debug!(url, "websocket connected");
        Ok(Self {
            socket: Some(socket),
        })
    }

    fn socket(&mut self) -> Result<&mut McpWebSocket> {
        self.socket.as_mut().ok_or_else(|| closed("transport closed"))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: serde_json::Value) -> Result<()> {
        let payload = serde_json::to_string(&message)?;
        self.socket()?.send(Message::Text(payload.into())).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<serde_json::Value> {
        loop {
            let frame = match self.socket()?.next().await {
                Some(frame) => frame?,
                None => return Err(closed("websocket closed by peer")),
            };
            match frame {
                Message::Text(text) => {
                    return Ok(serde_json::from_str(&text)
                        .unwrap_or_else(|_| serde_json::Value::String(text.to_string())));
                }
                Message::Binary(bytes) => {
                    return Ok(serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                        serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())
                    }));
                }
                Message::Close(_) => {
                    self.socket = None;
                    return Err(closed("websocket closed by peer"));
                }
                // tungstenite answers pings itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
        Ok(())
    }
}
