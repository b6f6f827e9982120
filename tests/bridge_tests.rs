//! Integration tests for the host-integration facade: map payload shapes
//! over a real loopback session.

use netgauge::{Bridge, ProgressHandler};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;

type Payloads = Arc<Mutex<Vec<Map<String, Value>>>>;

fn capture_handler() -> (Payloads, Arc<dyn ProgressHandler>) {
    let seen: Payloads = Arc::new(Mutex::new(Vec::new()));
    let clone = seen.clone();
    let handler: Arc<dyn ProgressHandler> = Arc::new(move |progress: Map<String, Value>| {
        clone.lock().push(progress);
    });
    (seen, handler)
}

#[tokio::test]
async fn tcp_run_produces_the_result_map_contract() {
    let (seen, handler) = capture_handler();
    let bridge = Bridge::new(Some(handler));

    assert!(bridge.start_server(0, false).await);
    let port = bridge.engine().server_addr().unwrap().port();

    let result = bridge
        .run_client("127.0.0.1", port, 1, 1, false, false, 0)
        .await
        .unwrap();

    // Mandatory keys with the derived mbps identity.
    let bytes = result["bytesTransferred"].as_u64().unwrap();
    let bps = result["bitsPerSecond"].as_f64().unwrap();
    let mbps = result["mbps"].as_f64().unwrap();
    assert!(bytes > 0);
    assert_eq!(mbps, bps / 1_000_000.0);
    // TCP never reports the UDP metrics.
    assert!(!result.contains_key("jitter"));
    assert!(!result.contains_key("lostPackets"));

    // Per-interval payloads carry the same contract, 0-indexed.
    let seen = seen.lock();
    assert!(!seen.is_empty());
    let client_reports: Vec<&Map<String, Value>> = seen
        .iter()
        .filter(|p| !p.contains_key("jitter"))
        .collect();
    assert!(client_reports
        .iter()
        .any(|p| p["interval"].as_u64() == Some(0)));
    for payload in client_reports {
        let bps = payload["bitsPerSecond"].as_f64().unwrap();
        assert_eq!(payload["mbps"].as_f64().unwrap(), bps / 1_000_000.0);
    }
    drop(seen);

    assert!(bridge.stop_server());
    assert!(!bridge.stop_server());
}

#[tokio::test]
async fn udp_run_keys_jitter_and_loss_by_presence() {
    let bridge = Bridge::new(None);
    assert!(bridge.start_server(0, true).await);
    let port = bridge.engine().server_addr().unwrap().port();

    let result = bridge
        .run_client("127.0.0.1", port, 1, 1, false, true, 4_000_000)
        .await
        .unwrap();

    assert!(result.contains_key("jitter"));
    assert!(result.contains_key("lostPackets"));
    assert!(!result.contains_key("rtt"));
    bridge.stop_server();
}

#[tokio::test]
async fn bind_conflict_reports_false_and_keeps_the_original() {
    let first = Bridge::new(None);
    assert!(first.start_server(0, false).await);
    let port = first.engine().server_addr().unwrap().port();

    // A different bridge cannot take the same port.
    let second = Bridge::new(None);
    assert!(!second.start_server(port, false).await);

    // The original is untouched.
    assert_eq!(first.engine().server_addr().unwrap().port(), port);
    assert!(first.stop_server());
}

#[tokio::test]
async fn cancel_without_a_run_is_harmless() {
    let bridge = Bridge::new(None);
    bridge.cancel_client();
    bridge.cancel_client();
    assert!(bridge.version().starts_with("netgauge "));
}
