//! SSE event-stream transport
//!
//! This transport holds a persistent GET connection to the server's SSE
//! endpoint and receives every server-to-client message over it. Requests
//! travel the other direction as HTTP POSTs to a per-client message
//! endpoint the server announces as the first event on the stream
//! (`event: endpoint`, with the endpoint URL in the data field).
//!
//! Endpoint discovery rides on the correlator under the reserved
//! [`ENDPOINT_KEY`] pseudo-id, so [`EventStreamTransport::connect`] blocks
//! with the same timeout machinery as any ordinary request. The stream is
//! resumed after 3 seconds whenever it drops while the transport is still
//! running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::correlator::{response_key, Correlator, ENDPOINT_KEY};
use crate::error::{McplinkError, Result};
use crate::transport::sse::SseEventBuffer;
use crate::transport::{method_name, SendOptions, Transport};

/// Delay before re-opening the SSE stream after it drops.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

/// Bound on joining the listener loop during `close`.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(1);

/// MCP transport over a persistent SSE stream plus a POST back-channel.
#[derive(Debug)]
pub struct EventStreamTransport {
    inner: Arc<EventStreamInner>,
    /// Handle to the listener loop; joined with a bounded wait on close.
    listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Debug)]
struct EventStreamInner {
    client: reqwest::Client,
    /// URL of the persistent GET stream.
    event_url: Url,
    /// POST target announced by the server; `None` until discovery
    /// completes, refreshed on every reconnect.
    message_url: Mutex<Option<Url>>,
    /// Stable per-connection client identity, sent as `X-CLIENT-ID` on both
    /// the stream GET and every POST.
    client_id: String,
    headers: HashMap<String, String>,
    request_timeout: Duration,
    correlator: Correlator,
    running: AtomicBool,
    cancel: CancellationToken,
}

impl EventStreamTransport {
    /// Open the SSE stream and block until the server announces the message
    /// endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`McplinkError::Timeout`] when no `endpoint` event arrives
    /// within the request timeout, or [`McplinkError::Transport`] when the
    /// announced endpoint cannot be resolved to a URL.
    pub async fn connect(
        event_url: Url,
        headers: HashMap<String, String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let inner = Arc::new(EventStreamInner {
            client: reqwest::Client::new(),
            event_url,
            message_url: Mutex::new(None),
            client_id: uuid::Uuid::new_v4().to_string(),
            headers,
            request_timeout,
            correlator: Correlator::new(),
            running: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        });

        // Register before the listener starts so the endpoint announcement
        // cannot race past us.
        let rx = inner.correlator.register(ENDPOINT_KEY).await;
        let listener = tokio::spawn(listen(Arc::clone(&inner)));

        let announced = inner
            .correlator
            .wait(ENDPOINT_KEY, rx, request_timeout, "endpoint discovery")
            .await
            .map_err(|e| {
                inner.shutdown();
                e
            })?;
        let raw = announced.as_str().unwrap_or_default().to_string();
        let url = resolve_endpoint(&inner.event_url, &raw).map_err(|e| {
            inner.shutdown();
            e
        })?;
        tracing::debug!("event-stream message endpoint: {url}");
        *inner.message_url.lock().await = Some(url);

        Ok(Self {
            inner,
            listener: Mutex::new(Some(listener)),
        })
    }
}

#[async_trait::async_trait]
impl Transport for EventStreamTransport {
    /// POST one request to the discovered message endpoint. The HTTP reply
    /// only acknowledges receipt; the JSON-RPC response arrives over the SSE
    /// stream and is awaited through the correlator.
    async fn send(&self, mut message: Value, options: SendOptions) -> Result<Option<Value>> {
        if !self.alive() {
            return Err(
                McplinkError::Transport("event-stream transport is closed".to_string()).into(),
            );
        }

        let target = self
            .inner
            .message_url
            .lock()
            .await
            .clone()
            .ok_or_else(|| McplinkError::Transport("message endpoint not discovered".to_string()))?;

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

        let response = self
            .inner
            .client
            .post(target)
            .headers(self.inner.request_headers()?)
            .json(&message)
            .send()
            .await;

        let status = match response {
            Ok(response) => response.status(),
            Err(e) => {
                if let Some(k) = &key {
                    self.inner.correlator.cancel(k).await;
                }
                return Err(McplinkError::Http(e).into());
            }
        };
        if !status.is_success() {
            if let Some(k) = &key {
                self.inner.correlator.cancel(k).await;
            }
            return Err(McplinkError::Transport(format!(
                "message endpoint rejected request with HTTP {status}"
            ))
            .into());
        }

        if let (Some(key), Some(rx)) = (key, rx) {
            let response = self
                .inner
                .correlator
                .wait(&key, rx, self.inner.request_timeout, &method)
                .await?;
            return Ok(Some(response));
        }
        Ok(None)
    }

    fn alive(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.inner.shutdown();
        if let Some(handle) = self.listener.lock().await.take() {
            let _ = tokio::time::timeout(SHUTDOWN_WAIT, handle).await;
        }
        self.inner.correlator.drain_all().await;
        Ok(())
    }
}

impl EventStreamInner {
    fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    /// Headers for POSTs to the message endpoint.
    fn request_headers(&self) -> Result<HeaderMap> {
        let mut map = header_map(&self.headers)?;
        map.insert("Content-Type", HeaderValue::from_static("application/json"));
        map.insert("Accept", HeaderValue::from_static("text/event-stream"));
        map.insert("Connection", HeaderValue::from_static("keep-alive"));
        map.insert(
            "X-CLIENT-ID",
            HeaderValue::from_str(&self.client_id)
                .map_err(|e| McplinkError::Transport(format!("invalid client id header: {e}")))?,
        );
        Ok(map)
    }

    /// Headers for the persistent GET stream.
    fn stream_headers(&self) -> Result<HeaderMap> {
        let mut map = header_map(&self.headers)?;
        map.insert("Accept", HeaderValue::from_static("text/event-stream"));
        map.insert("Cache-Control", HeaderValue::from_static("no-cache"));
        map.insert("Connection", HeaderValue::from_static("keep-alive"));
        map.insert(
            "X-CLIENT-ID",
            HeaderValue::from_str(&self.client_id)
                .map_err(|e| McplinkError::Transport(format!("invalid client id header: {e}")))?,
        );
        Ok(map)
    }
}

fn header_map(extra: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in extra {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| McplinkError::Transport(format!("invalid header name `{name}`: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| McplinkError::Transport(format!("invalid header value: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Resolve the announced endpoint against the stream URL. Servers send
/// either an absolute URL or a path relative to the stream origin.
fn resolve_endpoint(event_url: &Url, raw: &str) -> Result<Url> {
    if raw.is_empty() {
        return Err(
            McplinkError::Transport("server announced an empty message endpoint".to_string())
                .into(),
        );
    }
    match Url::parse(raw) {
        Ok(url) => Ok(url),
        Err(_) => Ok(event_url.join(raw).map_err(|e| {
            McplinkError::Transport(format!("cannot resolve message endpoint `{raw}`: {e}"))
        })?),
    }
}

/// Stream loop: hold the GET open, decode SSE events, and reconnect with a
/// fixed backoff whenever the stream drops while the transport is running.
async fn listen(inner: Arc<EventStreamInner>) {
    loop {
        match stream_once(&inner).await {
            Ok(()) => tracing::debug!("event stream ended"),
            Err(e) => tracing::warn!("event stream error: {e}"),
        }

        if !inner.running.load(Ordering::SeqCst) {
            return;
        }
        tracing::warn!("event stream dropped; reconnecting in {:?}", RECONNECT_BACKOFF);
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            () = tokio::time::sleep(RECONNECT_BACKOFF) => {}
        }
    }
}

/// One GET connection: runs until the stream ends, fails, or the transport
/// is cancelled.
async fn stream_once(inner: &Arc<EventStreamInner>) -> Result<()> {
    let response = inner
        .client
        .get(inner.event_url.clone())
        .headers(inner.stream_headers()?)
        .send()
        .await
        .map_err(McplinkError::Http)?;

    let status = response.status();
    if !status.is_success() {
        return Err(
            McplinkError::Transport(format!("event stream rejected with HTTP {status}")).into(),
        );
    }

    let mut buffer = SseEventBuffer::default();
    let mut stream = response.bytes_stream();
    loop {
        let chunk = tokio::select! {
            _ = inner.cancel.cancelled() => return Ok(()),
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                for event in buffer.push(&bytes) {
                    dispatch_event(inner, event.event.as_deref(), event.data.as_deref()).await;
                }
            }
            Some(Err(e)) => return Err(McplinkError::Http(e).into()),
            None => return Ok(()),
        }
    }
}

async fn dispatch_event(inner: &Arc<EventStreamInner>, event: Option<&str>, data: Option<&str>) {
    let Some(data) = data else { return };

    if event == Some("endpoint") {
        // First connection: a caller is blocked on the pseudo-id. After a
        // reconnect nobody is waiting, so refresh the stored endpoint
        // directly.
        let resolved = match resolve_endpoint(&inner.event_url, data) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("ignoring bad endpoint announcement: {e}");
                return;
            }
        };
        let delivered = inner
            .correlator
            .resolve(ENDPOINT_KEY, Value::String(resolved.to_string()))
            .await;
        if !delivered {
            tracing::debug!("refreshed message endpoint after reconnect: {resolved}");
            *inner.message_url.lock().await = Some(resolved);
        }
        return;
    }

    let message: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("dropping unparseable event payload: {e}");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_endpoint_accepts_absolute_urls() {
        let base = Url::parse("https://mcp.example.com/sse").unwrap();
        let url = resolve_endpoint(&base, "https://other.example.com/messages").unwrap();
        assert_eq!(url.as_str(), "https://other.example.com/messages");
    }

    #[test]
    fn test_resolve_endpoint_joins_relative_paths() {
        let base = Url::parse("https://mcp.example.com/sse").unwrap();
        let url = resolve_endpoint(&base, "/messages?session=abc").unwrap();
        assert_eq!(url.as_str(), "https://mcp.example.com/messages?session=abc");
    }

    #[test]
    fn test_resolve_endpoint_rejects_empty_announcement() {
        let base = Url::parse("https://mcp.example.com/sse").unwrap();
        assert!(resolve_endpoint(&base, "").is_err());
    }

    #[test]
    fn test_header_map_rejects_invalid_names() {
        let mut extra = HashMap::new();
        extra.insert("bad header".to_string(), "x".to_string());
        assert!(header_map(&extra).is_err());
    }

    #[tokio::test]
    async fn test_connect_times_out_without_endpoint_event() {
        // Bind a listener that accepts but never speaks SSE.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                use tokio::io::AsyncWriteExt;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n")
                    .await;
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        let url = Url::parse(&format!("http://{addr}/sse")).unwrap();
        let result =
            EventStreamTransport::connect(url, HashMap::new(), Duration::from_millis(200)).await;
        let err = result.unwrap_err();
        let downcast = err.downcast_ref::<McplinkError>().expect("McplinkError");
        assert!(matches!(downcast, McplinkError::Timeout { .. }));
    }
}
