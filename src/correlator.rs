//! Request-id to waiting-caller correlation
//!
//! Every transport owns one [`Correlator`]. A caller issuing a request
//! registers the outgoing id and receives a [`oneshot::Receiver`]; the
//! transport's background reader resolves the matching entry when the
//! response arrives, whatever order responses come back in.
//!
//! Entries are removed exactly once: by a matching response, by timeout
//! expiry ([`Correlator::wait`] cancels on its way out), or by transport
//! teardown ([`Correlator::drain_all`] wakes every pending caller with a
//! failure instead of leaking blocked tasks). Resolving an unknown id is a
//! no-op so that late or duplicate deliveries are harmless.
//!
//! Keys are strings rather than integers so that the event-stream
//! transport's `"endpoint"` discovery handshake can ride on the same
//! wait-and-resolve primitive as ordinary responses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::error::{McplinkError, Result};

/// Reserved pseudo-id used by the event-stream transport to block on
/// discovery of the message endpoint.
pub const ENDPOINT_KEY: &str = "endpoint";

/// Maps outgoing request ids to single-slot channels that the eventual
/// matching response is pushed into.
///
/// Scoped per transport instance; a restart always produces a fresh
/// transport/correlator pair so stale pending entries can never cross a
/// restart boundary.
#[derive(Debug)]
pub struct Correlator {
    /// Monotonically increasing request id counter.
    next_id: AtomicU64,
    /// In-flight requests waiting for a response.
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next request id. Ids are strictly increasing for the
    /// lifetime of this correlator and never reused while pending.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Open a pending slot for `key` and return the receiver the response
    /// will be delivered on.
    ///
    /// Registering the same key twice replaces the earlier slot; the
    /// displaced receiver resolves with a closed-channel error.
    pub async fn register(&self, key: impl Into<String>) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().await;
        pending.insert(key.into(), tx);
        rx
    }

    /// Deliver `message` to the caller waiting on `key`.
    ///
    /// Returns `false` when no such entry exists (stale or duplicate
    /// delivery); this must be ignored by readers, never treated as fatal.
    pub async fn resolve(&self, key: &str, message: Value) -> bool {
        let tx = {
            let mut pending = self.pending.lock().await;
            pending.remove(key)
        };
        match tx {
            // The caller may have timed out between removal and send; a
            // failed send is equivalent to a stale delivery.
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Remove a pending entry without delivering anything.
    ///
    /// Used on timeout expiry and on send failures so that a late-arriving
    /// response is safely ignored.
    pub async fn cancel(&self, key: &str) {
        let mut pending = self.pending.lock().await;
        pending.remove(key);
    }

    /// Fail every pending caller. Used on transport teardown and on process
    /// death; dropping the senders wakes each waiting receiver with a
    /// closed-channel error.
    pub async fn drain_all(&self) {
        let mut pending = self.pending.lock().await;
        pending.clear();
    }

    /// Number of in-flight entries. Primarily useful in tests.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Block on `rx` until the response for `key` arrives, bounded by
    /// `timeout`.
    ///
    /// On expiry the pending entry is removed and a
    /// [`McplinkError::Timeout`] is returned; it is never silently retried.
    /// A dropped sender (transport teardown) surfaces as a transport error
    /// rather than a hang.
    pub async fn wait(
        &self,
        key: &str,
        rx: oneshot::Receiver<Value>,
        timeout: Duration,
        method: &str,
    ) -> Result<Value> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(McplinkError::Transport(
                "transport closed before a response arrived".to_string(),
            )
            .into()),
            Err(_) => {
                self.cancel(key).await;
                Err(McplinkError::Timeout {
                    method: method.to_string(),
                    timeout,
                }
                .into())
            }
        }
    }
}

/// Extract the correlation key from an inbound message's `id` member.
///
/// Numeric and string ids are both accepted; notifications (no id) yield
/// `None`.
pub fn response_key(message: &Value) -> Option<String> {
    match message.get("id") {
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}
