//! Error types for mcplink
//!
//! This module defines all error types used throughout the crate, using
//! `thiserror` for ergonomic error handling.
//!
//! Framing failures (a malformed line or SSE event) are deliberately *not*
//! represented here: reader loops log and drop the offending frame so that
//! one bad message can never kill a connection.

use std::time::Duration;

use thiserror::Error;

/// Main error type for mcplink operations
///
/// This enum encompasses all possible errors that can occur during
/// transport construction, request dispatch, and connection lifecycle
/// management.
#[derive(Error, Debug)]
pub enum McplinkError {
    /// No matching response arrived within the configured window.
    ///
    /// Never retried automatically; the pending entry has already been
    /// removed when this error is returned.
    #[error("request `{method}` timed out after {timeout:?}")]
    Timeout {
        /// The JSON-RPC method of the request that timed out
        method: String,
        /// The configured request timeout
        timeout: Duration,
    },

    /// The streamable transport received a 404 for an active session.
    ///
    /// The stored session id has been cleared; the caller must re-initialize
    /// before retrying.
    #[error("mcp session expired, re-initialization required")]
    SessionExpired,

    /// Transport construction failed due to invalid or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The server returned an error status or a JSON-RPC error object
    #[error("server error: {message}")]
    Protocol {
        /// The server's error message, or a synthesized one if unparseable
        message: String,
        /// The session id active when the error occurred, for diagnosis
        session_id: Option<String>,
    },

    /// Writing to a dead or broken child process
    ///
    /// The transport restarts the process automatically; this surfaces only
    /// when the in-flight call could not be salvaged.
    #[error("process I/O error: {0}")]
    ProcessIo(String),

    /// Generic transport-level failures (closed connections, dead channels)
    #[error("transport error: {0}")]
    Transport(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

/// Result type alias for mcplink operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_includes_method_and_window() {
        let err = McplinkError::Timeout {
            method: "tools/call".to_string(),
            timeout: Duration::from_secs(8),
        };
        let msg = err.to_string();
        assert!(msg.contains("tools/call"), "unexpected message: {msg}");
        assert!(msg.contains("8s"), "unexpected message: {msg}");
    }

    #[test]
    fn test_protocol_display_carries_server_message() {
        let err = McplinkError::Protocol {
            message: "tool not found".to_string(),
            session_id: Some("sess-1".to_string()),
        };
        assert!(err.to_string().contains("tool not found"));
    }

    #[test]
    fn test_session_expired_display() {
        let msg = McplinkError::SessionExpired.to_string();
        assert!(msg.contains("re-initialization"), "unexpected message: {msg}");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: McplinkError = io.into();
        assert!(matches!(err, McplinkError::Io(_)));
    }
}
