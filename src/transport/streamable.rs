//! Streamable HTTP transport
//!
//! A single endpoint URL serves the whole conversation. Every request is an
//! HTTP POST; the server chooses per response whether to answer with a
//! plain JSON body, an SSE body carrying one or more frames, or a bare
//! `202 Accepted` for notifications. Construction performs no I/O, so
//! failures only surface on first use.
//!
//! # Sessions
//!
//! The server may issue an `Mcp-Session-Id` response header at any time
//! (typically on `initialize`). Once captured, the id is attached to every
//! subsequent request except `initialize` itself, and newer values overwrite
//! older ones. A `404` on a session-bearing request means the server expired
//! the session; the transport clears it and surfaces
//! [`McplinkError::SessionExpired`] so the owner can re-handshake.
//!
//! SSE `id:` fields are tracked as `Last-Event-ID` for resumption of the
//! optional server-push GET stream; they are unrelated to JSON-RPC ids.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::correlator::{response_key, Correlator};
use crate::error::{McplinkError, Result};
use crate::transport::sse::SseEventBuffer;
use crate::transport::{method_name, SendOptions, Transport};
use crate::types::METHOD_INITIALIZE;

const SESSION_HEADER: &str = "Mcp-Session-Id";
const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// MCP transport over a single streamable HTTP endpoint.
#[derive(Debug)]
pub struct StreamableTransport {
    inner: Arc<StreamableInner>,
    /// Live SSE reader tasks, aborted on close.
    readers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

#[derive(Debug)]
struct StreamableInner {
    client: reqwest::Client,
    url: Url,
    headers: HashMap<String, String>,
    request_timeout: Duration,
    correlator: Correlator,
    running: AtomicBool,
    /// Stable per-transport client identity, sent as `X-CLIENT-ID`.
    client_id: String,
    session_id: Mutex<Option<String>>,
    last_event_id: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl StreamableTransport {
    /// Create the transport. No connection is made until the first `send`.
    pub fn new(url: Url, headers: HashMap<String, String>, request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(StreamableInner {
                client: reqwest::Client::new(),
                url,
                headers,
                request_timeout,
                correlator: Correlator::new(),
                running: AtomicBool::new(true),
                client_id: uuid::Uuid::new_v4().to_string(),
                session_id: Mutex::new(None),
                last_event_id: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
            readers: Mutex::new(Vec::new()),
        }
    }

    /// The session id currently attached to requests, if the server has
    /// issued one.
    pub async fn session_id(&self) -> Option<String> {
        self.inner.session_id.lock().await.clone()
    }

    /// Open the optional server-push GET stream.
    ///
    /// Resumes from the last seen SSE event id when one is known. Servers
    /// that do not offer a push stream answer `405`, which is surfaced as a
    /// protocol error rather than retried.
    pub async fn open_listening_stream(&self) -> Result<()> {
        let mut headers = self.inner.base_headers()?;
        headers.insert("Accept", HeaderValue::from_static("text/event-stream"));
        if let Some(session) = self.inner.session_id.lock().await.as_deref() {
            headers.insert(SESSION_HEADER, header_value(session)?);
        }
        if let Some(last) = self.inner.last_event_id.lock().await.as_deref() {
            headers.insert(LAST_EVENT_ID_HEADER, header_value(last)?);
        }

        let response = self
            .inner
            .client
            .get(self.inner.url.clone())
            .headers(headers)
            .send()
            .await
            .map_err(McplinkError::Http)?;

        let status = response.status();
        if status == StatusCode::METHOD_NOT_ALLOWED {
            return Err(McplinkError::Protocol {
                message: "server does not support SSE streams via GET".to_string(),
                session_id: self.inner.session_id.lock().await.clone(),
            }
            .into());
        }
        if !status.is_success() {
            return Err(
                McplinkError::Transport(format!("listening stream rejected with HTTP {status}"))
                    .into(),
            );
        }

        let handle = tokio::spawn(read_sse_body(Arc::clone(&self.inner), response));
        self.track_reader(handle).await;
        Ok(())
    }

    /// Record a reader task, reaping handles whose stream already ended so
    /// the list stays bounded by the number of live streams.
    async fn track_reader(&self, handle: tokio::task::JoinHandle<()>) {
        let mut readers = self.readers.lock().await;
        readers.retain(|reader| !reader.is_finished());
        readers.push(handle);
    }
}

#[async_trait::async_trait]
impl Transport for StreamableTransport {
    /// POST one message and interpret the server's chosen response mode.
    ///
    /// # Errors
    ///
    /// Returns [`McplinkError::SessionExpired`] on `404`,
    /// [`McplinkError::Protocol`] for other client errors, and
    /// [`McplinkError::Timeout`] when an SSE-mode response never delivers
    /// the awaited frame.
    async fn send(&self, mut message: Value, options: SendOptions) -> Result<Option<Value>> {
        if !self.alive() {
            return Err(
                McplinkError::Transport("streamable transport is closed".to_string()).into(),
            );
        }

        let method = method_name(&message);
        let mut key = None;
        if options.add_id {
            let id = self.inner.correlator.next_id();
            message["id"] = Value::from(id);
            key = Some(id.to_string());
        }
        let rx = match (&key, options.wait_for_response) {
            (Some(k), true) => Some(self.inner.correlator.register(k.clone()).await),
            _ => None,
        };

        let result = self.post(&message, &method).await;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                if let Some(k) = &key {
                    self.inner.correlator.cancel(k).await;
                }
                return Err(e);
            }
        };

        self.inner.capture_session(response.headers()).await;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            // The server expired our session; clear it so the owner can
            // re-initialize from scratch.
            self.inner.session_id.lock().await.take();
            if let Some(k) = &key {
                self.inner.correlator.cancel(k).await;
            }
            return Err(McplinkError::SessionExpired.into());
        }

        if status == StatusCode::ACCEPTED {
            if let Some(k) = &key {
                self.inner.correlator.cancel(k).await;
            }
            return Ok(None);
        }

        if !status.is_success() {
            if let Some(k) = &key {
                self.inner.correlator.cancel(k).await;
            }
            let session_id = self.inner.session_id.lock().await.clone();
            let body = response.text().await.unwrap_or_default();
            return Err(McplinkError::Protocol {
                message: error_message(&body, status),
                session_id,
            }
            .into());
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.starts_with("text/event-stream") {
            // The response frame arrives inside the SSE body; a reader task
            // feeds the correlator while the caller waits.
            let handle = tokio::spawn(read_sse_body(Arc::clone(&self.inner), response));
            self.track_reader(handle).await;

            if let (Some(key), Some(rx)) = (key, rx) {
                let response = self
                    .inner
                    .correlator
                    .wait(&key, rx, self.inner.request_timeout, &method)
                    .await?;
                return Ok(Some(response));
            }
            return Ok(None);
        }

        // Plain JSON mode: the body is the complete response; no frame will
        // ever arrive for the pending entry.
        if let Some(k) = &key {
            self.inner.correlator.cancel(k).await;
        }
        let body: Value = response.json().await.map_err(McplinkError::Http)?;
        if key.is_some() && options.wait_for_response {
            return Ok(Some(body));
        }
        Ok(None)
    }

    fn alive(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Abort reader tasks, tell the server to discard the session, and fail
    /// all pending calls. Session termination is best-effort; servers that
    /// do not support `DELETE` are ignored.
    async fn close(&self) -> Result<()> {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.cancel.cancel();

        for handle in self.readers.lock().await.drain(..) {
            handle.abort();
            let _ = handle.await;
        }

        if let Err(e) = self.terminate_session().await {
            tracing::debug!("session termination failed (ignored): {e}");
        }

        self.inner.correlator.drain_all().await;
        Ok(())
    }
}

impl StreamableTransport {
    async fn post(&self, message: &Value, method: &str) -> Result<reqwest::Response> {
        let mut headers = self.inner.base_headers()?;
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        headers.insert(
            "Accept",
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        // The handshake must not carry a stale session from a previous
        // conversation.
        if method != METHOD_INITIALIZE {
            if let Some(session) = self.inner.session_id.lock().await.as_deref() {
                headers.insert(SESSION_HEADER, header_value(session)?);
            }
        }

        self.inner
            .client
            .post(self.inner.url.clone())
            .headers(headers)
            .json(message)
            .send()
            .await
            .map_err(|e| McplinkError::Http(e).into())
    }

    async fn terminate_session(&self) -> Result<()> {
        let Some(session) = self.inner.session_id.lock().await.take() else {
            return Ok(());
        };
        let mut headers = self.inner.base_headers()?;
        headers.insert(SESSION_HEADER, header_value(&session)?);
        self.inner
            .client
            .delete(self.inner.url.clone())
            .headers(headers)
            .send()
            .await
            .map_err(McplinkError::Http)?;
        Ok(())
    }
}

impl StreamableInner {
    /// Caller-supplied headers plus the identity and keep-alive headers
    /// common to every request this transport makes.
    fn base_headers(&self) -> Result<HeaderMap> {
        let mut map = header_map(&self.headers)?;
        map.insert("Connection", HeaderValue::from_static("keep-alive"));
        map.insert("X-CLIENT-ID", header_value(&self.client_id)?);
        Ok(map)
    }

    /// Adopt any session id the server issued on this response.
    async fn capture_session(&self, headers: &HeaderMap) {
        if let Some(session) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            let mut guard = self.session_id.lock().await;
            if guard.as_deref() != Some(session) {
                tracing::debug!("adopted mcp session id {session}");
                *guard = Some(session.to_string());
            }
        }
    }
}

/// Consume one SSE response body, resolving correlator entries for each
/// JSON-RPC frame and tracking SSE event ids for resumption.
async fn read_sse_body(inner: Arc<StreamableInner>, response: reqwest::Response) {
    let mut buffer = SseEventBuffer::default();
    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for event in buffer.push(&bytes) {
                    dispatch_event(&inner, event.data.as_deref(), event.id).await;
                }
            }
            Some(Err(e)) => {
                tracing::warn!("sse response body error: {e}");
                return;
            }
            None => {
                if let Some(event) = buffer.flush() {
                    dispatch_event(&inner, event.data.as_deref(), event.id).await;
                }
                return;
            }
        }
    }
}

async fn dispatch_event(inner: &Arc<StreamableInner>, data: Option<&str>, sse_id: Option<String>) {
    if let Some(sse_id) = sse_id {
        *inner.last_event_id.lock().await = Some(sse_id);
    }
    let Some(data) = data else { return };

    let message: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("dropping unparseable sse frame: {e}");
            return;
        }
    };
    match response_key(&message) {
        Some(key) => {
            if !inner.correlator.resolve(&key, message).await {
                tracing::debug!("response for unknown id {key}; ignoring");
            }
        }
        None => tracing::debug!("server notification received; ignoring"),
    }
}

/// Best-effort extraction of a human-readable message from an error body.
/// Falls back to the raw body, then to the status line.
fn error_message(body: &str, status: StatusCode) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        if let Some(message) = parsed
            .pointer("/error/message")
            .or_else(|| parsed.pointer("/message"))
            .and_then(|m| m.as_str())
        {
            return message.to_string();
        }
    }
    if body.trim().is_empty() {
        format!("server rejected request with HTTP {status}")
    } else {
        body.trim().to_string()
    }
}

fn header_map(extra: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in extra {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| McplinkError::Transport(format!("invalid header name `{name}`: {e}")))?;
        map.insert(name, header_value(value)?);
    }
    Ok(map)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    Ok(HeaderValue::from_str(value)
        .map_err(|e| McplinkError::Transport(format!("invalid header value: {e}")))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_prefers_json_rpc_error_member() {
        let body = r#"{"jsonrpc":"2.0","error":{"code":-32600,"message":"Invalid Request"}}"#;
        assert_eq!(
            error_message(body, StatusCode::BAD_REQUEST),
            "Invalid Request"
        );
    }

    #[test]
    fn test_error_message_falls_back_to_body_then_status() {
        assert_eq!(
            error_message("plain failure", StatusCode::BAD_REQUEST),
            "plain failure"
        );
        assert_eq!(
            error_message("", StatusCode::BAD_REQUEST),
            "server rejected request with HTTP 400 Bad Request"
        );
    }

    #[tokio::test]
    async fn test_new_performs_no_io() {
        // A transport pointed at an unroutable address constructs fine.
        let url = Url::parse("http://127.0.0.1:1/mcp").unwrap();
        let transport = StreamableTransport::new(url, HashMap::new(), Duration::from_secs(1));
        assert!(transport.alive());
        assert!(transport.session_id().await.is_none());
    }

    /// Reader handles for ended SSE bodies are reaped as new streams are
    /// tracked; the list must not grow by one entry per call forever.
    #[tokio::test]
    async fn test_finished_sse_readers_are_reaped() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n",
                "text/event-stream",
            ))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/mcp", server.uri())).unwrap();
        let transport = StreamableTransport::new(url, HashMap::new(), Duration::from_secs(2));

        for _ in 0..12 {
            transport
                .send(
                    serde_json::json!({"jsonrpc": "2.0", "method": "notifications/progress"}),
                    SendOptions::notification(),
                )
                .await
                .unwrap();
        }
        // Let the short bodies run out so their readers finish.
        tokio::time::sleep(Duration::from_millis(200)).await;

        transport
            .send(
                serde_json::json!({"jsonrpc": "2.0", "method": "notifications/progress"}),
                SendOptions::notification(),
            )
            .await
            .unwrap();

        let retained = transport.readers.lock().await.len();
        assert!(retained <= 2, "{retained} reader handles retained");

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_after_close_fails_fast() {
        let url = Url::parse("http://127.0.0.1:1/mcp").unwrap();
        let transport = StreamableTransport::new(url, HashMap::new(), Duration::from_secs(1));
        transport.close().await.unwrap();

        let result = transport
            .send(
                serde_json::json!({"jsonrpc": "2.0", "method": "ping"}),
                SendOptions::default(),
            )
            .await;
        assert!(result.is_err());
    }
}
