//! Connection lifecycle and request building
//!
//! The [`Coordinator`] owns at most one live transport and is the only
//! place that constructs one. It drives the MCP handshake (`initialize`
//! request, capability snapshot, `notifications/initialized`), exposes thin
//! request builders for every protocol operation, and can tear the
//! connection down and bring up a fresh transport/correlator pair on
//! restart.
//!
//! Builders return the raw JSON-RPC `result` member as a
//! [`serde_json::Value`]; mapping results into typed domain objects is a
//! consumer concern.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::config::TransportConfig;
use crate::error::{McplinkError, Result};
use crate::transport::{self, SendOptions, Transport};
use crate::types::{
    notification_envelope, request_envelope, Capabilities, ClientInfo, METHOD_COMPLETION_COMPLETE,
    METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_PING, METHOD_PROMPTS_GET, METHOD_PROMPTS_LIST,
    METHOD_RESOURCES_LIST, METHOD_RESOURCES_READ, METHOD_RESOURCES_TEMPLATES_LIST,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, PROTOCOL_VERSION,
};

/// Owns the transport for one MCP server connection.
///
/// # Examples
///
/// ```no_run
/// use mcplink::{Coordinator, TransportConfig};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let config = TransportConfig::streamable("https://mcp.example.com/mcp");
/// let mut coordinator = Coordinator::new(config);
/// coordinator.start().await?;
///
/// let tools = coordinator.tool_list().await?;
/// println!("{tools}");
///
/// coordinator.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Coordinator {
    config: TransportConfig,
    client_info: ClientInfo,
    transport: Option<Arc<dyn Transport>>,
    capabilities: Option<Capabilities>,
    /// The full `initialize` result, kept for `serverInfo` and version
    /// introspection.
    initialize_result: Option<Value>,
}

impl Coordinator {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            client_info: ClientInfo::default(),
            transport: None,
            capabilities: None,
            initialize_result: None,
        }
    }

    /// Override the identity reported during the handshake.
    pub fn with_client_info(mut self, client_info: ClientInfo) -> Self {
        self.client_info = client_info;
        self
    }

    /// Whether a transport is up and considers itself live.
    pub fn alive(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.alive())
    }

    /// Capability snapshot from the handshake; `None` before `start`.
    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }

    /// The server's `serverInfo` record from the handshake, if provided.
    pub fn server_info(&self) -> Option<&Value> {
        self.initialize_result.as_ref()?.get("serverInfo")
    }

    /// Construct the transport and run the MCP handshake.
    ///
    /// Idempotent while the connection is alive. Any handshake failure
    /// tears the half-open transport back down before the error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns construction errors from the transport factory, or
    /// [`McplinkError::Protocol`] when the server rejects `initialize`.
    pub async fn start(&mut self) -> Result<()> {
        if self.alive() {
            return Ok(());
        }

        let transport = transport::build(&self.config).await?;
        self.transport = Some(Arc::clone(&transport));

        match self.handshake(&transport).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.stop().await;
                Err(e)
            }
        }
    }

    /// Close the transport and forget the handshake state.
    pub async fn stop(&mut self) {
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!("error closing transport: {e}");
            }
        }
        self.capabilities = None;
        self.initialize_result = None;
    }

    /// Tear down and bring up a fresh transport/correlator pair.
    pub async fn restart(&mut self) -> Result<()> {
        self.stop().await;
        self.start().await
    }

    async fn handshake(&mut self, transport: &Arc<dyn Transport>) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": &self.client_info,
        });
        let response = transport
            .send(request_envelope(METHOD_INITIALIZE, params), SendOptions::default())
            .await?
            .ok_or_else(|| {
                McplinkError::Transport("initialize produced no response".to_string())
            })?;
        let result = unwrap_result(response)?;

        self.capabilities = Some(Capabilities::new(
            result.get("capabilities").cloned().unwrap_or(Value::Null),
        ));
        tracing::debug!(
            "initialized against {} (protocol {})",
            result
                .pointer("/serverInfo/name")
                .and_then(|n| n.as_str())
                .unwrap_or("unknown server"),
            result
                .get("protocolVersion")
                .and_then(|v| v.as_str())
                .unwrap_or(PROTOCOL_VERSION),
        );
        self.initialize_result = Some(result);

        // Fire-and-forget by protocol; the server must not reply.
        transport
            .send(
                notification_envelope(METHOD_INITIALIZED),
                SendOptions::notification(),
            )
            .await?;
        Ok(())
    }

    /// Send a pre-built envelope on the live transport.
    ///
    /// Starts the connection first when nothing is up yet. This is the
    /// escape hatch for methods without a dedicated builder.
    pub async fn send(&mut self, message: Value, options: SendOptions) -> Result<Option<Value>> {
        if !self.alive() {
            self.start().await?;
        }
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| McplinkError::Transport("no transport available".to_string()))?;
        transport.send(message, options).await
    }

    /// Send one request and unwrap its `result`.
    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        let response = self
            .send(request_envelope(method, params), SendOptions::default())
            .await?
            .ok_or_else(|| {
                McplinkError::Transport(format!("request `{method}` produced no response"))
            })?;
        unwrap_result(response)
    }

    /// `tools/list`
    pub async fn tool_list(&mut self) -> Result<Value> {
        self.request(METHOD_TOOLS_LIST, json!({})).await
    }

    /// `tools/call`
    pub async fn execute_tool(&mut self, name: &str, arguments: Value) -> Result<Value> {
        self.request(
            METHOD_TOOLS_CALL,
            json!({ "name": name, "arguments": arguments }),
        )
        .await
    }

    /// `resources/list`
    pub async fn resource_list(&mut self) -> Result<Value> {
        self.request(METHOD_RESOURCES_LIST, json!({})).await
    }

    /// `resources/templates/list`
    pub async fn resource_template_list(&mut self) -> Result<Value> {
        self.request(METHOD_RESOURCES_TEMPLATES_LIST, json!({})).await
    }

    /// `resources/read`
    pub async fn resource_read(&mut self, uri: &str) -> Result<Value> {
        self.request(METHOD_RESOURCES_READ, json!({ "uri": uri })).await
    }

    /// `prompts/list`
    pub async fn prompt_list(&mut self) -> Result<Value> {
        self.request(METHOD_PROMPTS_LIST, json!({})).await
    }

    /// `prompts/get`
    pub async fn execute_prompt(&mut self, name: &str, arguments: Value) -> Result<Value> {
        self.request(
            METHOD_PROMPTS_GET,
            json!({ "name": name, "arguments": arguments }),
        )
        .await
    }

    /// `completion/complete` against a prompt argument.
    pub async fn completion_prompt(
        &mut self,
        name: &str,
        argument: &str,
        value: &str,
    ) -> Result<Value> {
        self.completion("ref/prompt", name, argument, value).await
    }

    /// `completion/complete` against a resource template argument.
    pub async fn completion_resource(
        &mut self,
        name: &str,
        argument: &str,
        value: &str,
    ) -> Result<Value> {
        self.completion("ref/resource", name, argument, value).await
    }

    async fn completion(
        &mut self,
        ref_type: &str,
        name: &str,
        argument: &str,
        value: &str,
    ) -> Result<Value> {
        self.request(
            METHOD_COMPLETION_COMPLETE,
            json!({
                "ref": { "type": ref_type, "name": name },
                "argument": { "name": argument, "value": value },
            }),
        )
        .await
    }

    /// `ping`. A healthy server answers with an empty result.
    pub async fn ping(&mut self) -> Result<Value> {
        self.request(METHOD_PING, json!({})).await
    }
}

/// Split a JSON-RPC response into its `result`, surfacing an `error` member
/// as a protocol error.
fn unwrap_result(response: Value) -> Result<Value> {
    if let Some(error) = response.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown server error")
            .to_string();
        return Err(McplinkError::Protocol {
            message,
            session_id: None,
        }
        .into());
    }
    Ok(response.get("result").cloned().unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_result_returns_result_member() {
        let response = json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}});
        let result = unwrap_result(response).unwrap();
        assert_eq!(result, json!({"tools": []}));
    }

    #[test]
    fn test_unwrap_result_surfaces_error_member() {
        let response = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "Method not found"},
        });
        let err = unwrap_result(response).unwrap_err();
        let downcast = err.downcast_ref::<McplinkError>().expect("McplinkError");
        match downcast {
            McplinkError::Protocol { message, .. } => assert_eq!(message, "Method not found"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_new_coordinator_is_not_alive() {
        let coordinator = Coordinator::new(TransportConfig::streamable("http://127.0.0.1:1/mcp"));
        assert!(!coordinator.alive());
        assert!(coordinator.capabilities().is_none());
        assert!(coordinator.server_info().is_none());
    }

    #[tokio::test]
    async fn test_start_with_unreachable_process_command_fails_clean() {
        let mut coordinator =
            Coordinator::new(TransportConfig::process("/nonexistent/mcp/server", vec![]));
        assert!(coordinator.start().await.is_err());
        assert!(!coordinator.alive());
        assert!(coordinator.capabilities().is_none());
    }
}
