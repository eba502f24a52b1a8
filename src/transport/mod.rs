//! MCP transport abstraction and implementations
//!
//! This module defines the [`Transport`] trait that all MCP transport
//! implementations must satisfy. Concrete implementations live in
//! submodules:
//!
//! - [`process::ProcessTransport`] -- spawns a child process and
//!   communicates over its stdin/stdout pipes (newline-delimited JSON).
//! - [`eventstream::EventStreamTransport`] -- persistent SSE GET stream
//!   paired with a discovered POST endpoint.
//! - [`streamable::StreamableTransport`] -- single streamable HTTP endpoint
//!   with session negotiation.
//!
//! # Design
//!
//! Callers hand `send` a complete JSON-RPC envelope as a
//! [`serde_json::Value`]. The transport assigns the request id, registers it
//! with its [`crate::correlator::Correlator`], transmits the frame, and
//! blocks the caller until the matching response arrives or the configured
//! timeout elapses. Framing, session management, and reconnection are the
//! responsibility of each concrete implementation.
//!
//! Each transport exclusively owns its correlator and background listener
//! loops; [`build`] is the single factory switch, exercised once by the
//! [`crate::coordinator::Coordinator`] at start time.

use std::sync::Arc;

use serde_json::Value;
use url::Url;

use crate::config::{TransportConfig, TransportKind};
use crate::error::{McplinkError, Result};

pub mod eventstream;
pub mod process;
pub mod sse;
pub mod streamable;

/// Per-call options controlling id assignment and response waiting.
///
/// The default is a normal request: assign an id and block for the matching
/// response. [`SendOptions::notification`] is the fire-and-forget shape used
/// for `notifications/*` methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Assign the next monotonic id to the outgoing message.
    pub add_id: bool,
    /// Block until the matching response arrives (bounded by the request
    /// timeout).
    pub wait_for_response: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            add_id: true,
            wait_for_response: true,
        }
    }
}

impl SendOptions {
    /// Options for a notification: no id, no response expected.
    pub fn notification() -> Self {
        Self {
            add_id: false,
            wait_for_response: false,
        }
    }
}

/// Abstraction over MCP transport implementations.
///
/// Implementations exist for child-process stdio, SSE event streams, and
/// streamable HTTP. All are driven through `Arc<dyn Transport>` held by the
/// [`crate::coordinator::Coordinator`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Send a JSON-RPC envelope and, unless the caller opts out, block for
    /// the matching response.
    ///
    /// Returns `Ok(Some(response))` when a response was awaited and arrived,
    /// `Ok(None)` for fire-and-forget sends.
    ///
    /// # Errors
    ///
    /// Returns [`McplinkError::Timeout`] when no matching response arrives
    /// within the configured window, [`McplinkError::ProcessIo`] /
    /// [`McplinkError::Transport`] on I/O failures, and transport-specific
    /// protocol errors (see each implementation).
    async fn send(&self, message: Value, options: SendOptions) -> Result<Option<Value>>;

    /// Whether the transport considers itself live (not yet closed).
    fn alive(&self) -> bool;

    /// Tear the transport down: stop background loops with a bounded join,
    /// release the connection or child process, and fail all pending calls.
    async fn close(&self) -> Result<()>;
}

/// Construct the transport described by `config`.
///
/// This is the single factory switch over [`TransportKind`]; construction
/// failure (missing fields, unreachable command, unreachable endpoint) is
/// fatal and surfaces synchronously.
///
/// # Errors
///
/// Returns [`McplinkError::Config`] when a required field for the selected
/// kind is missing, or the underlying construction error.
pub async fn build(config: &TransportConfig) -> Result<Arc<dyn Transport>> {
    let timeout = config.request_timeout();
    match config.kind {
        TransportKind::Process => {
            let command = config.command.clone().ok_or_else(|| {
                McplinkError::Config("process transport requires a command".to_string())
            })?;
            let transport = process::ProcessTransport::spawn(
                command,
                config.args.clone(),
                config.env.clone(),
                timeout,
            )?;
            Ok(Arc::new(transport))
        }
        TransportKind::EventStream => {
            let url = parse_url(config, "eventstream")?;
            let transport =
                eventstream::EventStreamTransport::connect(url, config.headers.clone(), timeout)
                    .await?;
            Ok(Arc::new(transport))
        }
        TransportKind::Streamable => {
            let url = parse_url(config, "streamable")?;
            let transport =
                streamable::StreamableTransport::new(url, config.headers.clone(), timeout);
            Ok(Arc::new(transport))
        }
    }
}

fn parse_url(config: &TransportConfig, kind: &str) -> Result<Url> {
    let raw = config
        .url
        .as_ref()
        .ok_or_else(|| McplinkError::Config(format!("{kind} transport requires a url")))?;
    Ok(Url::parse(raw).map_err(McplinkError::Url)?)
}

/// The `method` of an outgoing message, for timeout diagnostics.
pub(crate) fn method_name(message: &Value) -> String {
    message
        .get("method")
        .and_then(|m| m.as_str())
        .unwrap_or("(unknown)")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    #[tokio::test]
    async fn test_build_process_without_command_is_config_error() {
        let mut config = TransportConfig::process("cat", vec![]);
        config.command = None;

        let err = build(&config).await.unwrap_err();
        let downcast = err.downcast_ref::<McplinkError>().expect("McplinkError");
        assert!(matches!(downcast, McplinkError::Config(_)));
    }

    #[tokio::test]
    async fn test_build_eventstream_without_url_is_config_error() {
        let mut config = TransportConfig::event_stream("http://localhost/sse");
        config.url = None;

        let err = build(&config).await.unwrap_err();
        let downcast = err.downcast_ref::<McplinkError>().expect("McplinkError");
        assert!(matches!(downcast, McplinkError::Config(_)));
    }

    #[tokio::test]
    async fn test_build_streamable_with_invalid_url_fails() {
        let config = TransportConfig::streamable("not a url");
        let result = build(&config).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_build_process_with_missing_executable_fails() {
        let config = TransportConfig::process("/nonexistent/mcp/server/binary", vec![]);
        let result = build(&config).await;
        assert!(result.is_err(), "unreachable command must fail start");
    }

    #[test]
    fn test_send_options_default_is_request_shaped() {
        let opts = SendOptions::default();
        assert!(opts.add_id);
        assert!(opts.wait_for_response);

        let notif = SendOptions::notification();
        assert!(!notif.add_id);
        assert!(!notif.wait_for_response);
    }

    #[test]
    fn test_method_name_falls_back_for_anonymous_messages() {
        assert_eq!(
            method_name(&serde_json::json!({"method": "ping"})),
            "ping"
        );
        assert_eq!(method_name(&serde_json::json!({})), "(unknown)");
    }
}
