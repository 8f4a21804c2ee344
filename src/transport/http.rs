//! Streamable HTTP transport.
//!
//! Every outgoing message is its own POST. The reply body is either a JSON
//! document (one inbound message, or a batch) or a `text/event-stream` whose
//! `data:` events are inbound messages.
//!
//! POSTs leave through a single writer task in the order they were sent; the
//! writer waits for each response's headers before issuing the next one. Body
//! reading then moves to its own task so a long event stream does not hold up
//! other traffic on the channel.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{closed, Transport};
use crate::error::{Result, TetherError};
use crate::protocol::jsonrpc::{codes, JSONRPC_VERSION};

pub const SESSION_ID_HEADER: &str = "mcp-session-id";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type Inbound = Result<Value>;

/// What the writer task needs to issue POSTs and deliver their replies.
#[derive(Clone)]
struct Endpoint {
    client: reqwest::Client,
    url: reqwest::Url,
    headers: HeaderMap,
    session_id: Arc<StdMutex<Option<String>>>,
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl Endpoint {
    fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|id| id.clone())
    }

    fn post(&self, message: &Value) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(id) = self.session_id() {
            request = request.header(SESSION_ID_HEADER, id);
        }
        request
    }

    fn remember_session(&self, response: &reqwest::Response) {
        if let Some(id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut slot) = self.session_id.lock() {
                *slot = Some(id.to_string());
            }
        }
    }

    fn deliver(&self, message: Inbound) -> bool {
        self.inbound.send(message).is_ok()
    }
}

pub struct HttpTransport {
    endpoint: Endpoint,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    outbound: Option<mpsc::UnboundedSender<Value>>,
    exchanges: CancellationToken,
    closed: bool,
}

impl HttpTransport {
    pub fn new(
        client: reqwest::Client,
        url: &str,
        headers: BTreeMap<String, String>,
    ) -> Result<Self> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| TetherError::Configuration(format!("invalid server url '{url}': {e}")))?;

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TetherError::Configuration(format!("invalid header name '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(&value).map_err(|e| {
                TetherError::Configuration(format!("invalid value for header '{name}': {e}"))
            })?;
            header_map.insert(name, value);
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Ok(Self {
            endpoint: Endpoint {
                client,
                url,
                headers: header_map,
                session_id: Arc::new(StdMutex::new(None)),
                inbound: inbound_tx,
            },
            inbound_rx,
            outbound: None,
            exchanges: CancellationToken::new(),
            closed: false,
        })
    }

    /// Session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.endpoint.session_id()
    }

    /// The writer starts on first send so construction needs no runtime.
    fn outbound(&mut self) -> &mpsc::UnboundedSender<Value> {
        self.outbound.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(write_in_order(
                self.endpoint.clone(),
                rx,
                self.exchanges.clone(),
            ));
            tx
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&mut self, message: Value) -> Result<()> {
        if self.closed {
            return Err(closed("transport closed"));
        }
        self.outbound()
            .send(message)
            .map_err(|_| closed("http writer stopped"))
    }

    async fn receive(&mut self) -> Result<Value> {
        if self.closed {
            return Err(closed("transport closed"));
        }
        match self.inbound_rx.recv().await {
            Some(message) => message,
            None => Err(closed("transport closed")),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.outbound = None;
        self.exchanges.cancel();

        if let Some(id) = self.session_id() {
            let request = self
                .endpoint
                .client
                .delete(self.endpoint.url.clone())
                .headers(self.endpoint.headers.clone())
                .header(SESSION_ID_HEADER, id);
            // Servers may not support explicit termination; the outcome is irrelevant.
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, request.send()).await;
        }
        Ok(())
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.exchanges.cancel();
    }
}

/// Issue queued POSTs one at a time, in queue order.
async fn write_in_order(
    endpoint: Endpoint,
    mut outbound: mpsc::UnboundedReceiver<Value>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let request_id = request_id(&message);

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = endpoint.post(&message).send() => sent,
        };
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                if !endpoint.deliver(Err(TetherError::transport(format!(
                    "HTTP request failed: {e}"
                )))) {
                    break;
                }
                continue;
            }
        };
        endpoint.remember_session(&response);

        let endpoint = endpoint.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = read_reply(&endpoint, response, request_id) => {}
            }
        });
    }
}

/// The id of a request, or `None` for notifications and responses.
fn request_id(message: &Value) -> Option<Value> {
    message.get("method")?;
    message.get("id").filter(|id| !id.is_null()).cloned()
}

async fn read_reply(endpoint: &Endpoint, response: reqwest::Response, request_id: Option<Value>) {
    let status = response.status();
    if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
        return;
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let body = body.trim();
        match request_id {
            Some(id) => {
                endpoint.deliver(Ok(http_error_response(id, status, body)));
            }
            None => {
                tracing::warn!(status = status.as_u16(), body, "HTTP server rejected a notification");
            }
        }
        return;
    }

    let is_event_stream = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false);

    if is_event_stream {
        let events = sse_messages(response);
        futures::pin_mut!(events);
        while let Some(message) = events.next().await {
            if !endpoint.deliver(message) {
                break;
            }
        }
        return;
    }

    match response.bytes().await {
        Ok(body) if body.iter().all(u8::is_ascii_whitespace) => {}
        Ok(body) => match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Array(batch)) => {
                for message in batch {
                    endpoint.deliver(Ok(message));
                }
            }
            Ok(message) => {
                endpoint.deliver(Ok(message));
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&body).into_owned();
                endpoint.deliver(Ok(Value::String(text)));
            }
        },
        Err(e) => {
            endpoint.deliver(Err(TetherError::transport(format!(
                "HTTP body read failed: {e}"
            ))));
        }
    }
}

/// JSON-RPC error answering `id` on the server's behalf after an HTTP failure.
fn http_error_response(id: Value, status: StatusCode, body: &str) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": codes::INTERNAL_ERROR,
            "message": format!("HTTP {}: {}", status.as_u16(), body),
            "data": { "status": status.as_u16(), "body": body },
        },
    })
}

fn sse_messages(response: reqwest::Response) -> impl Stream<Item = Inbound> {
    let byte_stream = response.bytes_stream();

    async_stream::stream! {
        let mut decoder = SseDecoder::default();
        futures::pin_mut!(byte_stream);

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    yield Err(TetherError::transport(format!("event stream failed: {e}")));
                    break;
                }
            };
            for data in decoder.push(&chunk) {
                yield Ok(parse_event(data));
            }
        }
        if let Some(data) = decoder.finish() {
            yield Ok(parse_event(data));
        }
    }
}

fn parse_event(data: String) -> Value {
    serde_json::from_str(&data).unwrap_or(Value::String(data))
}

/// Incremental `text/event-stream` decoder yielding the `data` of each event.
///
/// Multi-line `data:` fields are joined with `\n`. `event:`, `id:`, `retry:`
/// and comment lines are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    pending_data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]);
            let line = line.trim_end_matches('\r');

            if line.is_empty() {
                if !self.pending_data.is_empty() {
                    events.push(self.pending_data.join("\n"));
                    self.pending_data.clear();
                }
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                self.pending_data
                    .push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
        }
        events
    }

    /// Flush an event left unterminated at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        let mut events = self.push(b"\n\n");
        events.pop()
    }
}
