//! Request correlation over a single transport.
//!
//! One driver task owns the transport and multiplexes outbound frames with
//! inbound messages. Callers hold [`PendingRequest`] handles; dropping a
//! handle evicts its entry, so abandoned calls never leak.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{Result, TetherError};
use crate::protocol::jsonrpc::numeric_id;
use crate::protocol::{
    methods, InboundMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
    RpcError,
};
use crate::transport::Transport;

const NOTIFICATION_CAPACITY: usize = 64;

type Outcome = std::result::Result<Value, RpcError>;

/// Notification pushed by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerNotification {
    pub method: String,
    pub params: Option<Value>,
}

enum Outbound {
    Frame(Value),
    Close(oneshot::Sender<()>),
}

struct PendingSlot {
    method: String,
    created_at: Instant,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<RequestId, PendingSlot>,
    /// Set once the channel is gone; no new entries are accepted after that.
    closed: Option<String>,
}

struct Shared {
    server: String,
    next_id: AtomicU64,
    table: StdMutex<PendingTable>,
    protocol_errors: AtomicU64,
    closed_tx: watch::Sender<bool>,
    notifications: broadcast::Sender<ServerNotification>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        // A poisoned table only means a panic elsewhere; the data is still usable.
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn evict(&self, id: RequestId) {
        if let Some(slot) = self.lock().entries.remove(&id) {
            tracing::debug!(
                server = %self.server,
                request_id = id,
                method = %slot.method,
                "evicted pending request"
            );
        }
    }

    fn close_reason(&self) -> String {
        self.lock()
            .closed
            .clone()
            .unwrap_or_else(|| "channel closed".to_string())
    }

    fn record_protocol_error(&self, detail: &str) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(server = %self.server, "{detail}");
    }

    /// Fail every outstanding request and refuse new ones.
    fn shutdown(&self, reason: &str) {
        let drained = {
            let mut table = self.lock();
            if table.closed.is_some() {
                return;
            }
            table.closed = Some(reason.to_string());
            std::mem::take(&mut table.entries)
        };
        if !drained.is_empty() {
            tracing::debug!(
                server = %self.server,
                outstanding = drained.len(),
                reason,
                "failing outstanding requests"
            );
        }
        // Dropping the senders wakes every waiter with ChannelClosed.
        drop(drained);
        self.closed_tx.send_replace(true);
    }

    fn on_message(&self, raw: Value) -> Option<Value> {
        let message = match InboundMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                self.record_protocol_error(&format!("dropping malformed frame: {e}"));
                return None;
            }
        };

        match message {
            InboundMessage::Response { id, outcome } => {
                let slot = numeric_id(&id).and_then(|n| self.lock().entries.remove(&n));
                match slot {
                    Some(slot) => {
                        tracing::trace!(
                            server = %self.server,
                            request_id = %id,
                            method = %slot.method,
                            elapsed_ms = slot.created_at.elapsed().as_millis() as u64,
                            "response matched"
                        );
                        // The waiter may have given up already; nothing to do then.
                        let _ = slot.tx.send(outcome);
                    }
                    None => {
                        self.record_protocol_error(&format!("response for unknown request id {id}"));
                    }
                }
                None
            }
            InboundMessage::Request { id, method, .. } => {
                let reply = if method == methods::PING {
                    JsonRpcResponse::success(id, Value::Object(Default::default()))
                } else {
                    tracing::debug!(server = %self.server, %method, "rejecting server request");
                    JsonRpcResponse::failure(id, RpcError::method_not_found(&method))
                };
                serde_json::to_value(reply).ok()
            }
            InboundMessage::Notification { method, params } => {
                tracing::trace!(server = %self.server, %method, "server notification");
                // No subscribers is fine.
                let _ = self.notifications.send(ServerNotification { method, params });
                None
            }
        }
    }
}

/// Handle to one outstanding request.
///
/// Resolved through [`Correlator::await_response`]. Dropping it evicts the
/// entry; a late response is then reported as unmatched.
pub struct PendingRequest {
    id: RequestId,
    method: String,
    created_at: Instant,
    rx: oneshot::Receiver<Outcome>,
    shared: Arc<Shared>,
}

impl PendingRequest {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("method", &self.method)
            .finish()
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.shared.evict(self.id);
    }
}

/// Matches responses to requests by id over one transport.
pub struct Correlator {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Outbound>,
    driver: JoinHandle<()>,
}

impl Correlator {
    /// Take ownership of `transport` and start the driver task.
    pub fn spawn(server: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let shared = Arc::new(Shared {
            server: server.into(),
            next_id: AtomicU64::new(1),
            table: StdMutex::new(PendingTable::default()),
            protocol_errors: AtomicU64::new(0),
            closed_tx,
            notifications,
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(Arc::clone(&shared), transport, outbound_rx));
        Self {
            shared,
            outbound,
            driver,
        }
    }

    pub fn server(&self) -> &str {
        &self.shared.server
    }

    /// Register a request and queue it for sending.
    pub fn submit(&self, method: &str, params: Option<Value>) -> Result<PendingRequest> {
        let (tx, rx) = oneshot::channel();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let created_at = Instant::now();
        {
            let mut table = self.shared.lock();
            if let Some(reason) = &table.closed {
                return Err(TetherError::ChannelClosed(reason.clone()));
            }
            table.entries.insert(
                id,
                PendingSlot {
                    method: method.to_string(),
                    created_at,
                    tx,
                },
            );
        }
        // Built after registration so a fast reply always finds its entry.
        let handle = PendingRequest {
            id,
            method: method.to_string(),
            created_at,
            rx,
            shared: Arc::clone(&self.shared),
        };

        let frame = serde_json::to_value(JsonRpcRequest::new(id, method, params))?;
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| TetherError::ChannelClosed(self.shared.close_reason()))?;
        tracing::trace!(server = %self.shared.server, request_id = id, method, "request submitted");
        Ok(handle)
    }

    /// Wait for the response to `handle`. On timeout the entry is evicted.
    pub async fn await_response(&self, handle: PendingRequest, timeout: Duration) -> Result<Value> {
        let mut handle = handle;
        match tokio::time::timeout(timeout, &mut handle.rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(TetherError::Rpc {
                method: handle.method.clone(),
                error,
            }),
            Ok(Err(_)) => Err(TetherError::ChannelClosed(self.shared.close_reason())),
            Err(_) => {
                tracing::warn!(
                    server = %self.shared.server,
                    request_id = handle.id,
                    method = %handle.method,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(TetherError::RequestTimeout {
                    method: handle.method.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// `submit` followed by `await_response`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let handle = self.submit(method, params)?;
        self.await_response(handle, timeout).await
    }

    /// Send a fire-and-forget notification.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if let Some(reason) = self.shared.lock().closed.clone() {
            return Err(TetherError::ChannelClosed(reason));
        }
        let frame = serde_json::to_value(JsonRpcNotification::new(method, params))?;
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| TetherError::ChannelClosed(self.shared.close_reason()))
    }

    /// Feed one inbound frame. Returns the reply to send for server requests.
    ///
    /// The driver calls this for every received frame; exposed so tests can
    /// inject frames directly.
    pub fn on_message(&self, raw: Value) -> Option<Value> {
        self.shared.on_message(raw)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerNotification> {
        self.shared.notifications.subscribe()
    }

    /// Resolves once the channel is closed, for any reason.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed_tx.borrow()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.shared.lock().closed.clone()
    }

    /// Frames that could not be matched or parsed.
    pub fn protocol_errors(&self) -> u64 {
        self.shared.protocol_errors.load(Ordering::Relaxed)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().entries.len()
    }

    /// Close the transport and fail outstanding requests. Idempotent.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.outbound.send(Outbound::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        self.shared.shutdown("closed by client");
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.shared.shutdown("correlator dropped");
        self.driver.abort();
    }
}

async fn drive(
    shared: Arc<Shared>,
    mut transport: Box<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let reason = loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = transport.send(frame).await {
                        break format!("send failed: {e}");
                    }
                }
                Some(Outbound::Close(ack)) => {
                    let _ = transport.close().await;
                    shared.shutdown("closed by client");
                    let _ = ack.send(());
                    return;
                }
                None => break "correlator dropped".to_string(),
            },
            inbound = transport.receive() => match inbound {
                Ok(raw) => {
                    if let Some(reply) = shared.on_message(raw) {
                        if let Err(e) = transport.send(reply).await {
                            break format!("send failed: {e}");
                        }
                    }
                }
                Err(e) => break e.to_string(),
            },
        }
    };

    tracing::debug!(server = %shared.server, %reason, "channel closed");
    let _ = transport.close().await;
    shared.shutdown(&reason);
}
