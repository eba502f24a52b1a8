//! Transport configuration types
//!
//! This module defines [`TransportConfig`], the read-only record that the
//! [`crate::coordinator::Coordinator`] consumes when constructing a
//! transport, and [`TransportKind`], the closed set of supported transport
//! strategies.

use std::collections::HashMap;
use std::time::Duration;

/// Default per-request timeout in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 8000;

/// The closed set of supported transport strategies.
///
/// Unsupported kinds are unrepresentable: configuration sources that carry a
/// free-form kind string fail at deserialization time rather than at
/// transport construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process over stdin/stdout pipes (newline-delimited JSON).
    Process,
    /// Persistent SSE GET stream paired with a discovered POST endpoint.
    EventStream,
    /// Single streamable HTTP endpoint with session negotiation.
    Streamable,
}

/// Read-only configuration for one transport instance.
///
/// `command`/`args`/`env` apply to the process transport; `url`/`headers`
/// apply to the event-stream and streamable transports. The request timeout
/// is shared by all three.
///
/// # Examples
///
/// ```
/// use mcplink::config::TransportConfig;
///
/// let cfg = TransportConfig::process("npx", vec!["-y".into(), "some-mcp-server".into()]);
/// assert_eq!(cfg.request_timeout(), std::time::Duration::from_millis(8000));
/// ```
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TransportConfig {
    /// Which transport strategy to construct.
    pub kind: TransportKind,
    /// Per-request timeout in milliseconds; bounds every blocking wait.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Server executable (process transport only).
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments passed to the server executable (process transport only).
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables merged into the child's environment
    /// (process transport only).
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Server URL (event-stream and streamable transports only).
    #[serde(default)]
    pub url: Option<String>,
    /// Extra headers added to every HTTP request, e.g. auth tokens
    /// (event-stream and streamable transports only).
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

impl TransportConfig {
    /// Convenience constructor for a process transport configuration.
    pub fn process(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind: TransportKind::Process,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
        }
    }

    /// Convenience constructor for an event-stream (SSE) transport
    /// configuration.
    pub fn event_stream(url: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::EventStream,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
            headers: HashMap::new(),
        }
    }

    /// Convenience constructor for a streamable HTTP transport configuration.
    pub fn streamable(url: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::Streamable,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
            headers: HashMap::new(),
        }
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// The per-request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_deserializes_from_lowercase_strings() {
        let kinds: Vec<TransportKind> =
            serde_json::from_str(r#"["process", "eventstream", "streamable"]"#).unwrap();
        assert_eq!(
            kinds,
            vec![
                TransportKind::Process,
                TransportKind::EventStream,
                TransportKind::Streamable
            ]
        );
    }

    #[test]
    fn test_unknown_kind_fails_to_deserialize() {
        let result: std::result::Result<TransportKind, _> = serde_json::from_str(r#""websocket""#);
        assert!(result.is_err(), "unknown transport kinds must be rejected");
    }

    #[test]
    fn test_timeout_defaults_when_omitted() {
        let cfg: TransportConfig =
            serde_json::from_str(r#"{"kind": "streamable", "url": "http://localhost/mcp"}"#)
                .unwrap();
        assert_eq!(cfg.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
        assert_eq!(cfg.request_timeout(), Duration::from_millis(8000));
    }

    #[test]
    fn test_process_constructor_sets_kind_and_command() {
        let cfg = TransportConfig::process("cat", vec![]);
        assert_eq!(cfg.kind, TransportKind::Process);
        assert_eq!(cfg.command.as_deref(), Some("cat"));
        assert!(cfg.url.is_none());
    }

    #[test]
    fn test_with_request_timeout_overrides_default() {
        let cfg = TransportConfig::streamable("http://localhost/mcp")
            .with_request_timeout(Duration::from_secs(2));
        assert_eq!(cfg.request_timeout(), Duration::from_secs(2));
    }
}
