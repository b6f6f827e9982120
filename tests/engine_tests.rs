//! Loopback integration tests: real client and server sessions over
//! 127.0.0.1 with ephemeral ports.

use netgauge::{
    Engine, Error, IntervalReport, ProgressObserver, Protocol, SessionConfig, SessionOutcome,
    SessionState,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

type Captured = Arc<Mutex<Vec<IntervalReport>>>;

fn capture_observer() -> (Captured, Arc<dyn ProgressObserver>) {
    let seen: Captured = Arc::new(Mutex::new(Vec::new()));
    let clone = seen.clone();
    let observer: Arc<dyn ProgressObserver> =
        Arc::new(move |report: &IntervalReport| clone.lock().push(report.clone()));
    (seen, observer)
}

async fn start_local_server(engine: &Engine, protocol: Protocol) -> u16 {
    engine
        .start_server(0, protocol, None)
        .await
        .expect("server should bind an ephemeral port");
    engine.server_addr().expect("server is running").port()
}

#[tokio::test]
async fn tcp_session_emits_ordered_gap_free_intervals() {
    let server = Engine::new();
    let port = start_local_server(&server, Protocol::Tcp).await;

    let (seen, observer) = capture_observer();
    let client = Engine::new();
    let config = SessionConfig::new("127.0.0.1".to_string(), port)
        .with_duration(Duration::from_secs(1))
        .with_interval(Duration::from_millis(250));

    let result = client.run_client(config, Some(observer)).await.unwrap();

    assert_eq!(result.outcome, SessionOutcome::Completed);
    // ceil(1s / 250ms) intervals, indices 0..=3 with no gaps.
    assert_eq!(result.intervals.len(), 4);
    for (expected, report) in result.intervals.iter().enumerate() {
        assert_eq!(report.interval_index, expected as u64);
        assert!(report.jitter_ms.is_none());
        assert!(report.lost_packets.is_none());
    }
    assert!(result.bytes_transferred > 0);
    assert!(result.bits_per_second > 0.0);
    assert!(result.jitter_ms.is_none());

    // The observer saw exactly the emitted sequence, in order.
    let seen = seen.lock();
    assert_eq!(seen.len(), result.intervals.len());
    for (expected, report) in seen.iter().enumerate() {
        assert_eq!(report.interval_index, expected as u64);
    }

    #[cfg(target_os = "linux")]
    for report in result.intervals.iter() {
        assert!(report.rtt_us.is_some(), "TCP interval without RTT on Linux");
    }

    assert_eq!(client.client_state(), SessionState::Idle);
    assert!(server.stop_server());
}

#[tokio::test]
async fn parallel_streams_are_aggregated_into_one_sequence() {
    let server = Engine::new();
    let port = start_local_server(&server, Protocol::Tcp).await;

    let client = Engine::new();
    let config = SessionConfig::new("127.0.0.1".to_string(), port)
        .with_duration(Duration::from_secs(1))
        .with_interval(Duration::from_millis(250))
        .with_parallel(3);

    let result = client.run_client(config, None).await.unwrap();

    assert_eq!(result.outcome, SessionOutcome::Completed);
    assert_eq!(result.intervals.len(), 4);
    assert!(result.bytes_transferred > 0);
    server.stop_server();
}

#[tokio::test]
async fn reverse_tcp_moves_bytes_toward_the_client() {
    let server = Engine::new();
    let port = start_local_server(&server, Protocol::Tcp).await;

    let client = Engine::new();
    let config = SessionConfig::new("127.0.0.1".to_string(), port)
        .with_duration(Duration::from_secs(1))
        .with_interval(Duration::from_millis(250))
        .with_reverse(true);

    let result = client.run_client(config, None).await.unwrap();

    assert_eq!(result.outcome, SessionOutcome::Completed);
    assert!(result.bytes_transferred > 0, "client should have received data");
    server.stop_server();
}

#[tokio::test]
async fn udp_session_reports_jitter_and_loss_never_rtt() {
    let server = Engine::new();
    let port = start_local_server(&server, Protocol::Udp).await;

    let (seen, observer) = capture_observer();
    let client = Engine::new();
    let config = SessionConfig::new("127.0.0.1".to_string(), port)
        .with_protocol(Protocol::Udp)
        .with_duration(Duration::from_secs(1))
        .with_interval(Duration::from_millis(250))
        .with_bandwidth(4_000_000);

    let result = client.run_client(config, Some(observer)).await.unwrap();

    assert_eq!(result.outcome, SessionOutcome::Completed);
    assert!(result.rtt_us.is_none());
    assert!(result.jitter_ms.is_some());
    assert!(result.lost_packets.is_some());
    assert!(result.packets.unwrap_or(0) > 0);

    for report in seen.lock().iter() {
        assert!(report.rtt_us.is_none(), "UDP report carrying RTT");
        assert!(report.jitter_ms.is_some(), "UDP report without jitter");
        assert!(report.lost_packets.is_some());
    }
    server.stop_server();
}

#[tokio::test]
async fn reverse_udp_streams_data_from_server_to_client() {
    let server = Engine::new();
    let port = start_local_server(&server, Protocol::Udp).await;

    let client = Engine::new();
    let config = SessionConfig::new("127.0.0.1".to_string(), port)
        .with_protocol(Protocol::Udp)
        .with_duration(Duration::from_secs(1))
        .with_interval(Duration::from_millis(250))
        .with_reverse(true)
        .with_bandwidth(4_000_000);

    let result = client.run_client(config, None).await.unwrap();

    assert_eq!(result.outcome, SessionOutcome::Completed);
    assert!(result.bytes_transferred > 0, "client should have received datagrams");
    assert!(result.packets.unwrap_or(0) > 0);
    assert!(result.jitter_ms.is_some());
    assert!(result.rtt_us.is_none());
    server.stop_server();
}

#[tokio::test]
async fn server_reports_sessions_from_its_own_perspective() {
    let (seen, observer) = capture_observer();
    let server = Engine::new();
    server
        .start_server(0, Protocol::Udp, Some(observer))
        .await
        .unwrap();
    let port = server.server_addr().unwrap().port();

    let client = Engine::new();
    let config = SessionConfig::new("127.0.0.1".to_string(), port)
        .with_protocol(Protocol::Udp)
        .with_duration(Duration::from_millis(2500))
        .with_bandwidth(4_000_000);

    let result = client.run_client(config, None).await.unwrap();
    assert_eq!(result.outcome, SessionOutcome::Completed);

    // Server cadence is 1 s; a 2.5 s session yields at least two reports,
    // strictly ordered from 0, each with the UDP metric set.
    let seen = seen.lock();
    assert!(seen.len() >= 2, "expected server interval reports");
    for (expected, report) in seen.iter().enumerate() {
        assert_eq!(report.interval_index, expected as u64);
        assert!(report.jitter_ms.is_some());
        assert!(report.rtt_us.is_none());
    }
    assert!(seen.iter().any(|r| r.bytes_transferred > 0));
    server.stop_server();
}

#[tokio::test]
async fn cancel_ends_the_session_at_the_next_boundary() {
    let server = Engine::new();
    let port = start_local_server(&server, Protocol::Tcp).await;

    let (seen, observer) = capture_observer();
    let client = Arc::new(Engine::new());
    let config = SessionConfig::new("127.0.0.1".to_string(), port)
        .with_duration(Duration::from_secs(30))
        .with_interval(Duration::from_millis(500));

    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run_client(config, Some(observer)).await })
    };

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let cancelled_at = Instant::now();
    client.cancel_client();
    client.cancel_client(); // idempotent

    let result = runner.await.unwrap().unwrap();
    let return_latency = cancelled_at.elapsed();

    assert_eq!(result.outcome, SessionOutcome::Cancelled);
    assert!(
        return_latency < Duration::from_millis(1500),
        "cancel took {:?} to unwind",
        return_latency
    );
    // Far fewer than the 60 intervals a full run would emit.
    assert!(result.intervals.len() < 10);
    // Nothing was emitted after cancellation was observed.
    assert_eq!(seen.lock().len(), result.intervals.len());
    assert_eq!(client.client_state(), SessionState::Idle);
    server.stop_server();
}

#[tokio::test]
async fn second_concurrent_client_run_is_rejected_busy() {
    let server = Engine::new();
    let port = start_local_server(&server, Protocol::Tcp).await;

    let client = Arc::new(Engine::new());
    let long_config = SessionConfig::new("127.0.0.1".to_string(), port)
        .with_duration(Duration::from_secs(30))
        .with_interval(Duration::from_millis(500));

    let runner = {
        let client = client.clone();
        let config = long_config.clone();
        tokio::spawn(async move { client.run_client(config, None).await })
    };

    tokio::time::sleep(Duration::from_millis(400)).await;
    let err = client.run_client(long_config, None).await.unwrap_err();
    assert!(matches!(err, Error::Busy("client")));

    client.cancel_client();
    let result = runner.await.unwrap().unwrap();
    assert_eq!(result.outcome, SessionOutcome::Cancelled);
    server.stop_server();
}

#[tokio::test]
async fn second_server_start_is_busy_and_original_survives() {
    let server = Engine::new();
    let port = start_local_server(&server, Protocol::Tcp).await;

    let err = server.start_server(0, Protocol::Tcp, None).await.unwrap_err();
    assert!(matches!(err, Error::Busy("server")));

    // The original server is still bound and responsive.
    assert_eq!(server.server_addr().unwrap().port(), port);
    let client = Engine::new();
    let config = SessionConfig::new("127.0.0.1".to_string(), port)
        .with_duration(Duration::from_millis(500))
        .with_interval(Duration::from_millis(250));
    let result = client.run_client(config, None).await.unwrap();
    assert_eq!(result.outcome, SessionOutcome::Completed);

    assert!(server.stop_server());
    assert!(!server.stop_server());
}

#[tokio::test]
async fn engines_have_independent_session_registries() {
    let first = Engine::new();
    let second = Engine::new();

    first.start_server(0, Protocol::Tcp, None).await.unwrap();
    second.start_server(0, Protocol::Tcp, None).await.unwrap();

    assert_ne!(
        first.server_addr().unwrap().port(),
        second.server_addr().unwrap().port()
    );
    assert!(first.stop_server());
    assert!(second.stop_server());
}

#[tokio::test]
async fn protocol_mismatch_is_rejected_before_measuring() {
    let server = Engine::new();
    let port = start_local_server(&server, Protocol::Tcp).await;

    let client = Engine::new();
    let config = SessionConfig::new("127.0.0.1".to_string(), port)
        .with_protocol(Protocol::Udp)
        .with_duration(Duration::from_secs(1));

    let err = client.run_client(config, None).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    server.stop_server();
}

#[tokio::test]
async fn stopping_the_server_fails_the_inflight_client_session() {
    let server = Engine::new();
    let port = start_local_server(&server, Protocol::Tcp).await;

    let client = Arc::new(Engine::new());
    let config = SessionConfig::new("127.0.0.1".to_string(), port)
        .with_duration(Duration::from_secs(3))
        .with_interval(Duration::from_millis(250));

    let runner = {
        let client = client.clone();
        tokio::spawn(async move { client.run_client(config, None).await })
    };

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(server.stop_server());

    // The client either hits the broken pipe (Failed, partial result) or
    // was already in its final stretch; it must return promptly either way.
    let result = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("client did not unwind after server stop")
        .unwrap()
        .unwrap();
    if result.outcome == SessionOutcome::Failed {
        assert!(result.error.is_some());
    }
}
