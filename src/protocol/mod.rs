//! Wire protocol: JSON-RPC 2.0 envelopes and the MCP method payloads tether speaks.

pub mod jsonrpc;
pub mod mcp;

pub use jsonrpc::{
    InboundMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId, RpcError,
    JSONRPC_VERSION,
};
pub use mcp::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    ListToolsParams, ListToolsResult, ServerCapabilities, PROTOCOL_VERSION,
};

/// MCP method names.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const PING: &str = "ping";
}
