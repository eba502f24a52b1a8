//! MCP protocol types and JSON-RPC primitives
//!
//! Messages travel through the transports as raw [`serde_json::Value`]
//! envelopes; typed domain mappers are a consumer concern. This module holds
//! the small typed surface the core itself needs: method-name constants,
//! envelope builders, the JSON-RPC error object, the client identity record,
//! and the [`Capabilities`] snapshot parsed from the initialize response.

use serde_json::Value;

/// JSON-RPC version string carried on every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision this client negotiates.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_PING: &str = "ping";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_RESOURCES_LIST: &str = "resources/list";
pub const METHOD_RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
pub const METHOD_RESOURCES_READ: &str = "resources/read";
pub const METHOD_PROMPTS_LIST: &str = "prompts/list";
pub const METHOD_PROMPTS_GET: &str = "prompts/get";
pub const METHOD_COMPLETION_COMPLETE: &str = "completion/complete";

/// Build a request envelope. The transport assigns the `id` at send time so
/// that ids stay unique per connection.
pub fn request_envelope(method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    })
}

/// Build a notification envelope (no `id`; the server must not reply).
pub fn notification_envelope(method: &str) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
    })
}

/// A JSON-RPC error object, as found in a response's `error` member or a
/// 4xx response body.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JsonRpcError {
    /// JSON-RPC error code
    pub code: i64,
    /// Human-readable error message
    pub message: String,
    /// Optional structured error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Name and version reported to the server in the `initialize` handshake.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "mcplink".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Immutable snapshot of the server's advertised feature flags.
///
/// Parsed once from the `initialize` response and held by the
/// [`crate::coordinator::Coordinator`] for the life of the connection.
///
/// # Examples
///
/// ```
/// use mcplink::types::Capabilities;
///
/// let caps = Capabilities::new(serde_json::json!({
///     "tools": { "listChanged": true },
///     "resources": { "subscribe": true },
/// }));
/// assert!(caps.tools_list_changed());
/// assert!(caps.resource_subscribe());
/// assert!(!caps.completion());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    raw: Value,
}

impl Capabilities {
    /// Wrap the `capabilities` member of an initialize result.
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    /// The raw capability object as sent by the server.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Whether the server emits `notifications/tools/list_changed`.
    pub fn tools_list_changed(&self) -> bool {
        self.flag(&["tools", "listChanged"])
    }

    /// Whether the server emits `notifications/resources/list_changed`.
    pub fn resources_list_changed(&self) -> bool {
        self.flag(&["resources", "listChanged"])
    }

    /// Whether the server supports resource subscriptions.
    pub fn resource_subscribe(&self) -> bool {
        self.flag(&["resources", "subscribe"])
    }

    /// Whether the server emits `notifications/prompts/list_changed`.
    pub fn prompts_list_changed(&self) -> bool {
        self.flag(&["prompts", "listChanged"])
    }

    /// Whether the server supports `completion/complete`.
    pub fn completion(&self) -> bool {
        matches!(self.raw.get("completion"), Some(v) if !v.is_null())
    }

    fn flag(&self, path: &[&str]) -> bool {
        let mut current = &self.raw;
        for segment in path {
            match current.get(segment) {
                Some(v) => current = v,
                None => return false,
            }
        }
        current.as_bool().unwrap_or(false)
    }
}
