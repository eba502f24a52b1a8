//! End-to-end tests for the child-process transport against small /bin/sh
//! echo servers.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;

use mcplink::transport::process::ProcessTransport;
use mcplink::transport::{SendOptions, Transport};
use mcplink::McplinkError;

/// A shell server that answers every request with a result echoing its id.
/// Lines without an id (notifications) are ignored.
const ECHO_SERVER: &str = r#"
while read line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id"
done
"#;

/// Same as [`ECHO_SERVER`] but exits after the first response, simulating a
/// crashing server.
const ONE_SHOT_SERVER: &str = r#"
while read line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  printf '{"jsonrpc":"2.0","id":%s,"result":{"shot":1}}\n' "$id"
  exit 0
done
"#;

fn sh_transport(script: &str, timeout: Duration) -> ProcessTransport {
    ProcessTransport::spawn(
        "sh".to_string(),
        vec!["-c".to_string(), script.to_string()],
        HashMap::new(),
        timeout,
    )
    .expect("sh should be available")
}

#[tokio::test]
async fn test_request_receives_correlated_response() {
    let transport = sh_transport(ECHO_SERVER, Duration::from_secs(5));

    let response = transport
        .send(
            json!({"jsonrpc": "2.0", "method": "tools/list", "params": {}}),
            SendOptions::default(),
        )
        .await
        .unwrap()
        .expect("a response was awaited");

    assert_eq!(response["result"]["ok"], true);
    assert_eq!(response["id"], 1);

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_sequential_requests_get_increasing_ids() {
    let transport = sh_transport(ECHO_SERVER, Duration::from_secs(5));

    for expected_id in 1..=3 {
        let response = transport
            .send(
                json!({"jsonrpc": "2.0", "method": "ping", "params": {}}),
                SendOptions::default(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response["id"], expected_id);
    }

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_unresponsive_server_times_out() {
    // The server consumes input but never replies.
    let transport = sh_transport("cat > /dev/null", Duration::from_millis(300));

    let err = transport
        .send(
            json!({"jsonrpc": "2.0", "method": "tools/list", "params": {}}),
            SendOptions::default(),
        )
        .await
        .unwrap_err();

    let downcast = err.downcast_ref::<McplinkError>().expect("McplinkError");
    match downcast {
        McplinkError::Timeout { method, .. } => assert_eq!(method, "tools/list"),
        other => panic!("expected timeout, got {other:?}"),
    }

    transport.close().await.unwrap();
}

/// The supervisor restarts a dead server and later requests succeed on the
/// fresh process.
#[tokio::test]
async fn test_server_is_restarted_after_exit() {
    let transport = sh_transport(ONE_SHOT_SERVER, Duration::from_secs(5));

    let first = transport
        .send(
            json!({"jsonrpc": "2.0", "method": "ping", "params": {}}),
            SendOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first["result"]["shot"], 1);

    // Restart backoff is one second; leave margin for the respawn itself.
    tokio::time::sleep(Duration::from_millis(1800)).await;
    assert!(transport.alive(), "transport must survive a server crash");

    let second = transport
        .send(
            json!({"jsonrpc": "2.0", "method": "ping", "params": {}}),
            SendOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second["result"]["shot"], 1);

    transport.close().await.unwrap();
}

/// Stderr chatter and malformed stdout lines must not break correlation.
#[tokio::test]
async fn test_noise_on_stderr_and_stdout_is_tolerated() {
    let noisy = r#"
echo "starting up" >&2
echo "this is not json"
while read line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  echo "handling request $id" >&2
  printf '{"jsonrpc":"2.0","id":%s,"result":{"noisy":true}}\n' "$id"
done
"#;
    let transport = sh_transport(noisy, Duration::from_secs(5));

    let response = transport
        .send(
            json!({"jsonrpc": "2.0", "method": "tools/list", "params": {}}),
            SendOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response["result"]["noisy"], true);

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent_and_kills_liveness() {
    let transport = sh_transport(ECHO_SERVER, Duration::from_secs(5));
    assert!(transport.alive());

    transport.close().await.unwrap();
    assert!(!transport.alive());
    // A second close must not hang or error.
    transport.close().await.unwrap();
}
