//! Shared test helpers: an in-process fake MCP server and a scripted model.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::{mpsc, Notify};

use tether::config::ServerConfig;
use tether::error::{Result, TetherError};
use tether::manager::{ManagerOptions, SessionManager};
use tether::model::{ModelAction, PlanOutcome, PlanningRequest, ReasoningModel, Usage};
use tether::session::SessionOptions;
use tether::tools::SchemaBuilder;
use tether::transport::{Connector, LineTransport, Transport};
use tether::util::RetryPolicy;

/// What a fake tool does when called.
#[derive(Debug, Clone)]
pub enum ToolBehaviour {
    /// Adds integer arguments `a` and `b` and answers with the sum as text.
    Sum,
    /// Answers with the arguments as structured content.
    Echo,
    /// Answers with `isError: true` and this text.
    Fail(String),
    /// Answers with a JSON-RPC error.
    RpcError(i64, String),
    /// Never answers.
    Hang,
    /// Drops the connection.
    Crash,
}

#[derive(Debug, Clone)]
pub struct FakeTool {
    pub name: String,
    pub description: String,
    pub schema: Value,
    pub behaviour: ToolBehaviour,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeBehaviour {
    Accept,
    Reject,
    Silent,
}

/// Description of one fake server.
#[derive(Debug, Clone)]
pub struct FakeServer {
    pub name: String,
    pub tools: Vec<FakeTool>,
    pub instructions: Option<String>,
    pub handshake: HandshakeBehaviour,
    /// Serve `tools/list` one tool per page.
    pub paginate: bool,
    /// Advertise the `tools` capability.
    pub tools_capability: bool,
    /// Refuse this many connection attempts before accepting.
    pub refuse_connects: usize,
}

impl FakeServer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tools: Vec::new(),
            instructions: None,
            handshake: HandshakeBehaviour::Accept,
            paginate: false,
            tools_capability: true,
            refuse_connects: 0,
        }
    }

    /// A server exposing `calculate_sum(a, b)`.
    pub fn calculator(name: &str) -> Self {
        Self::new(name).with_tool("calculate_sum", ToolBehaviour::Sum)
    }

    pub fn with_tool(mut self, name: &str, behaviour: ToolBehaviour) -> Self {
        let schema = match behaviour {
            ToolBehaviour::Sum => SchemaBuilder::new()
                .property("a", json!({"type": "integer", "description": "first addend"}), true)
                .property("b", json!({"type": "integer", "description": "second addend"}), true)
                .build(),
            _ => json!({"type": "object"}),
        };
        self.tools.push(FakeTool {
            name: name.to_string(),
            description: format!("{name} tool"),
            schema,
            behaviour,
        });
        self
    }

    pub fn with_instructions(mut self, text: &str) -> Self {
        self.instructions = Some(text.to_string());
        self
    }

    pub fn with_handshake(mut self, handshake: HandshakeBehaviour) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn paginated(mut self) -> Self {
        self.paginate = true;
        self
    }

    pub fn without_tools_capability(mut self) -> Self {
        self.tools_capability = false;
        self
    }

    pub fn refusing_connects(mut self, times: usize) -> Self {
        self.refuse_connects = times;
        self
    }

    pub fn config(&self) -> ServerConfig {
        ServerConfig::stdio(self.name.clone(), "fake-server", Vec::new())
    }
}

/// Observations about one fake server, shared with the test.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connects: AtomicUsize,
    pub initialized: AtomicUsize,
    pub tool_calls: AtomicUsize,
    pub last_arguments: Mutex<Option<Value>>,
    /// Signalled when a `Hang` tool receives a call.
    pub hung: Notify,
    /// Tools added after start via [`FakeConnector::publish_tool`].
    pub added_tools: Mutex<Vec<FakeTool>>,
    /// Outbound channel of the live connection, for server-initiated messages.
    pub push: Mutex<Option<mpsc::UnboundedSender<Value>>>,
}

impl ServerStats {
    pub fn tool_calls(&self) -> usize {
        self.tool_calls.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

/// Connects each configured name to its fake server over an in-memory pipe.
pub struct FakeConnector {
    servers: HashMap<String, FakeServer>,
    stats: HashMap<String, Arc<ServerStats>>,
}

impl FakeConnector {
    pub fn new(servers: Vec<FakeServer>) -> Self {
        let stats = servers
            .iter()
            .map(|s| (s.name.clone(), Arc::new(ServerStats::default())))
            .collect();
        let servers = servers.into_iter().map(|s| (s.name.clone(), s)).collect();
        Self { servers, stats }
    }

    pub fn stats(&self, name: &str) -> Arc<ServerStats> {
        Arc::clone(&self.stats[name])
    }

    /// Add a tool to a running server and announce it with
    /// `notifications/tools/list_changed`.
    pub fn publish_tool(&self, server: &str, name: &str, behaviour: ToolBehaviour) {
        let tool = FakeServer::new(server)
            .with_tool(name, behaviour)
            .tools
            .remove(0);
        let stats = self.stats(server);
        stats.added_tools.lock().unwrap().push(tool);
        let guard = stats.push.lock().unwrap();
        if let Some(push) = guard.as_ref() {
            let _ = push.send(json!({
                "jsonrpc": "2.0",
                "method": "notifications/tools/list_changed",
            }));
        }
    }

    /// Tool calls received across every server.
    pub fn total_tool_calls(&self) -> usize {
        self.stats.values().map(|s| s.tool_calls()).sum()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, config: &ServerConfig) -> Result<Box<dyn Transport>> {
        let server = self
            .servers
            .get(&config.name)
            .cloned()
            .ok_or_else(|| TetherError::transport(format!("no fake server '{}'", config.name)))?;
        let stats = self.stats(&config.name);
        let attempt = stats.connects.fetch_add(1, Ordering::SeqCst);
        if attempt < server.refuse_connects {
            return Err(TetherError::transport("connection refused"));
        }

        let (client, remote) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(server, remote, stats));
        let (reader, writer) = tokio::io::split(client);
        Ok(Box::new(LineTransport::new(reader, writer)))
    }
}

async fn serve(server: FakeServer, stream: DuplexStream, stats: Arc<ServerStats>) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel();
    *stats.push.lock().unwrap() = Some(push_tx);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => return,
            },
            Some(pushed) = push_rx.recv() => {
                if write_line(&mut writer, &pushed).await.is_err() {
                    return;
                }
                continue;
            }
        };
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let id = message.get("id").cloned();
        let method = message["method"].as_str().unwrap_or_default().to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let tools: Vec<FakeTool> = server
            .tools
            .iter()
            .cloned()
            .chain(stats.added_tools.lock().unwrap().iter().cloned())
            .collect();

        let reply = match method.as_str() {
            "initialize" => match server.handshake {
                HandshakeBehaviour::Accept => Some(Ok(initialize_result(&server))),
                HandshakeBehaviour::Reject => Some(Err((-32603, "unsupported client".to_string()))),
                HandshakeBehaviour::Silent => None,
            },
            "notifications/initialized" => {
                stats.initialized.fetch_add(1, Ordering::SeqCst);
                None
            }
            "tools/list" => Some(Ok(list_tools(&server, &tools, &params))),
            "tools/call" => {
                stats.tool_calls.fetch_add(1, Ordering::SeqCst);
                let name = params["name"].as_str().unwrap_or_default();
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                *stats.last_arguments.lock().unwrap() = Some(arguments.clone());
                match tools.iter().find(|t| t.name == name) {
                    None => Some(Err((-32602, format!("unknown tool {name}")))),
                    Some(tool) => match &tool.behaviour {
                        ToolBehaviour::Sum => {
                            let sum = arguments["a"].as_i64().unwrap_or(0)
                                + arguments["b"].as_i64().unwrap_or(0);
                            Some(Ok(json!({
                                "content": [{"type": "text", "text": sum.to_string()}]
                            })))
                        }
                        ToolBehaviour::Echo => Some(Ok(json!({
                            "content": [{"type": "text", "text": arguments.to_string()}],
                            "structuredContent": arguments,
                        }))),
                        ToolBehaviour::Fail(text) => Some(Ok(json!({
                            "content": [{"type": "text", "text": text}],
                            "isError": true,
                        }))),
                        ToolBehaviour::RpcError(code, text) => Some(Err((*code, text.clone()))),
                        ToolBehaviour::Hang => {
                            stats.hung.notify_one();
                            None
                        }
                        ToolBehaviour::Crash => return,
                    },
                }
            }
            "ping" => Some(Ok(json!({}))),
            _ if id.is_some() => Some(Err((-32601, format!("method not found: {method}")))),
            _ => None,
        };

        let (Some(id), Some(reply)) = (id, reply) else {
            continue;
        };
        let response = match reply {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message},
            }),
        };
        if write_line(&mut writer, &response).await.is_err() {
            return;
        }
    }
}

async fn write_line(writer: &mut WriteHalf<DuplexStream>, message: &Value) -> std::io::Result<()> {
    let mut line = message.to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

fn initialize_result(server: &FakeServer) -> Value {
    let capabilities = if server.tools_capability {
        json!({"tools": {"listChanged": true}})
    } else {
        json!({})
    };
    let mut result = json!({
        "protocolVersion": "2025-03-26",
        "capabilities": capabilities,
        "serverInfo": {"name": server.name, "version": "0.0.1"},
    });
    if let Some(instructions) = &server.instructions {
        result["instructions"] = json!(instructions);
    }
    result
}

fn list_tools(server: &FakeServer, tools: &[FakeTool], params: &Value) -> Value {
    let described: Vec<Value> = tools
        .iter()
        .map(|t| json!({"name": t.name, "description": t.description, "inputSchema": t.schema}))
        .collect();
    if !server.paginate {
        return json!({ "tools": described });
    }
    let index: usize = params["cursor"]
        .as_str()
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    let page: Vec<Value> = described.get(index).cloned().into_iter().collect();
    let mut result = json!({ "tools": page });
    if index + 1 < described.len() {
        result["nextCursor"] = json!((index + 1).to_string());
    }
    result
}

/// Short timeouts and no retries.
pub fn fast_options() -> ManagerOptions {
    ManagerOptions::builder()
        .session(
            SessionOptions::builder()
                .request_timeout(Duration::from_secs(2))
                .handshake_timeout(Duration::from_millis(500))
                .build(),
        )
        .startup_timeout(Duration::from_secs(2))
        .retry(RetryPolicy::none())
        .build()
}

/// Start a manager over fake servers and return it with the connector.
pub async fn start_fake_manager(
    servers: Vec<FakeServer>,
    options: ManagerOptions,
) -> (SessionManager, Arc<FakeConnector>) {
    let configs = servers.iter().map(FakeServer::config).collect();
    let connector = Arc::new(FakeConnector::new(servers));
    let manager = SessionManager::with_connector(options, connector.clone());
    manager.start(configs).await.expect("manager start");
    (manager, connector)
}

/// A model that replays a fixed list of actions.
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<ModelAction>>>,
    fallback: Option<ModelAction>,
    usage_per_call: Usage,
    requests: Mutex<Vec<PlanningRequest>>,
}

impl ScriptedModel {
    pub fn new(actions: Vec<ModelAction>) -> Self {
        Self {
            script: Mutex::new(actions.into_iter().map(Ok).collect()),
            fallback: None,
            usage_per_call: Usage::default(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Report `usage` for every successful planning call.
    pub fn with_usage_per_call(mut self, usage: Usage) -> Self {
        self.usage_per_call = usage;
        self
    }

    /// Answers every planning step with `action`.
    pub fn repeating(action: ModelAction) -> Self {
        Self {
            fallback: Some(action),
            ..Self::new(Vec::new())
        }
    }

    pub fn failing(message: &str) -> Self {
        let model = Self::new(Vec::new());
        model
            .script
            .lock()
            .unwrap()
            .push_back(Err(TetherError::ModelCapability(message.to_string())));
        model
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<PlanningRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReasoningModel for ScriptedModel {
    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn plan(&self, request: &PlanningRequest) -> Result<PlanOutcome> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.script.lock().unwrap().pop_front();
        let action = match next {
            Some(next) => next?,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| TetherError::ModelCapability("script exhausted".to_string()))?,
        };
        Ok(PlanOutcome::new(action).with_usage(self.usage_per_call))
    }
}

/// A model whose planning call panics.
pub struct PanickingModel;

#[async_trait]
impl ReasoningModel for PanickingModel {
    fn model_id(&self) -> &str {
        "panicking"
    }

    async fn plan(&self, _request: &PlanningRequest) -> Result<PlanOutcome> {
        panic!("planner exploded");
    }
}
