//! Session controller: owns the client lifecycle, the per-engine session
//! registry, and server start/stop.
//!
//! An [`Engine`] holds at most one live client session and one live server
//! at a time; a second concurrent start of the same role fails with
//! [`Error::Busy`] instead of queueing. Engines are independent - state
//! lives on the instance, never in process globals - so several can
//! coexist in one process.

use crate::config::{Protocol, SessionConfig};
use crate::net;
use crate::protocol::{new_cookie, read_message, write_message, ControlMessage};
use crate::report::{IntervalReport, ProgressObserver, ReportSink, SessionOutcome, SessionResult};
use crate::sampler::{IntervalSampler, SessionMetrics};
use crate::server::{self, ServerContext};
use crate::tcp_info::{self, SocketHandle};
use crate::traffic;
use crate::{Error, Result};
use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant as TokioInstant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Bound on each handshake exchange.
pub(crate) const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a finishing client waits for the server's summary.
const SUMMARY_TIMEOUT: Duration = Duration::from_secs(2);

/// Observable lifecycle position of the client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Measuring,
    Completed,
    Cancelled,
    Failed,
}

struct ClientSlot {
    cancel: CancellationToken,
    state: Arc<Mutex<SessionState>>,
}

struct ServerSlot {
    stop: CancellationToken,
    addr: SocketAddr,
    task: JoinHandle<()>,
}

/// Measurement engine: one client slot, one server slot.
///
/// # Examples
///
/// ```no_run
/// use netgauge::{Engine, SessionConfig};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> netgauge::Result<()> {
/// let engine = Engine::new();
/// let config = SessionConfig::new("192.168.1.10".to_string(), 5201)
///     .with_duration(Duration::from_secs(10));
///
/// let result = engine.run_client(config, None).await?;
/// println!("average: {:.2} Mbps", result.mbps());
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct Engine {
    client: Mutex<Option<ClientSlot>>,
    server: Mutex<Option<ServerSlot>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Static identifying string for this engine build. Pure.
    pub fn version(&self) -> String {
        format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }

    /// Current position of the client session, `Idle` when none is live.
    pub fn client_state(&self) -> SessionState {
        self.client
            .lock()
            .as_ref()
            .map(|slot| *slot.state.lock())
            .unwrap_or(SessionState::Idle)
    }

    /// Requests cooperative termination of the in-flight client session at
    /// the next interval boundary. Idempotent; no effect when no client
    /// session is active.
    pub fn cancel_client(&self) {
        if let Some(slot) = self.client.lock().as_ref() {
            info!("client cancellation requested");
            slot.cancel.cancel();
        } else {
            debug!("cancel requested with no active client session");
        }
    }

    /// Runs one client session to completion, cancellation, or failure.
    ///
    /// Emits one [`IntervalReport`] per interval tick to `observer`,
    /// strictly ordered, and returns the aggregated [`SessionResult`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] before anything is attempted
    /// - [`Error::Busy`] while another client session is in flight
    /// - [`Error::Connection`] / [`Error::Protocol`] when setup fails
    ///
    /// A socket failure after measurement has begun is not an `Err`: the
    /// session ends with `outcome == Failed` and the partial aggregate.
    pub async fn run_client(
        &self,
        config: SessionConfig,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> Result<SessionResult> {
        config.validate()?;

        let (cancel, state) = {
            let mut slot = self.client.lock();
            if slot.is_some() {
                return Err(Error::Busy("client"));
            }
            let cancel = CancellationToken::new();
            let state = Arc::new(Mutex::new(SessionState::Connecting));
            *slot = Some(ClientSlot {
                cancel: cancel.clone(),
                state: state.clone(),
            });
            (cancel, state)
        };

        let result = run_client_session(&config, observer, &cancel, &state).await;
        *self.client.lock() = None;
        result
    }

    /// Starts the server listener for `protocol` on `port` (0 binds an
    /// ephemeral port, see [`Engine::server_addr`]). Binding happens
    /// before this returns, so bind conflicts surface here. Accepted
    /// sessions are served one at a time and report to `observer` with
    /// the same interval contract as the client side.
    ///
    /// # Errors
    ///
    /// - [`Error::Busy`] while this engine's server is already running
    /// - [`Error::Connection`] when the bind fails
    pub async fn start_server(
        &self,
        port: u16,
        protocol: Protocol,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> Result<()> {
        if self.server.lock().is_some() {
            return Err(Error::Busy("server"));
        }

        let listener = net::bind_listener(port).await?;
        let addr = listener.local_addr()?;
        let udp_socket = match protocol {
            Protocol::Udp => Some(Arc::new(net::bind_udp(addr.port()).await?)),
            Protocol::Tcp => None,
        };

        let stop = CancellationToken::new();
        let ctx = ServerContext {
            listener,
            udp_socket,
            protocol,
            observer,
            stop: stop.clone(),
            interval: Duration::from_secs(1),
        };
        let task = tokio::spawn(server::run_listener(ctx));

        let mut slot = self.server.lock();
        if slot.is_some() {
            // Lost a race with a concurrent start; roll this one back.
            stop.cancel();
            task.abort();
            return Err(Error::Busy("server"));
        }
        info!("{} server listening on {}", protocol.as_str(), addr);
        *slot = Some(ServerSlot { stop, addr, task });
        Ok(())
    }

    /// Stops the server, terminating any in-progress accepted session.
    /// Returns `true` if a server was running.
    pub fn stop_server(&self) -> bool {
        match self.server.lock().take() {
            Some(slot) => {
                info!("stopping server on {}", slot.addr);
                slot.stop.cancel();
                slot.task.abort();
                true
            }
            None => false,
        }
    }

    /// Bound address of the running server listener.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server.lock().as_ref().map(|slot| slot.addr)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(slot) = self.server.get_mut().take() {
            slot.stop.cancel();
            slot.task.abort();
        }
        if let Some(slot) = self.client.get_mut() {
            slot.cancel.cancel();
        }
    }
}

/// Data-path handles for one connected client session.
struct DataPlane {
    workers: Vec<JoinHandle<()>>,
    handles: Vec<SocketHandle>,
}

async fn run_client_session(
    config: &SessionConfig,
    observer: Option<Arc<dyn ProgressObserver>>,
    cancel: &CancellationToken,
    state: &Mutex<SessionState>,
) -> Result<SessionResult> {
    let started_at = Utc::now();
    let cookie = new_cookie();

    info!(
        "connecting to {}:{} ({}, {} stream(s), {} s{})",
        config.host,
        config.port,
        config.protocol.as_str(),
        config.parallel,
        config.duration.as_secs_f64(),
        if config.reverse { ", reverse" } else { "" }
    );

    let mut control = net::connect_tcp(&config.host, config.port).await?;
    let hello = ControlMessage::hello(
        cookie.clone(),
        config.protocol,
        config.parallel,
        config.reverse,
        config.duration.as_secs().max(1),
        config.bandwidth,
    );
    write_message(&mut control, &hello).await?;

    let reply = timeout(HANDSHAKE_TIMEOUT, read_message(&mut control))
        .await
        .map_err(|_| Error::Connection("handshake timed out".into()))??;
    match reply {
        ControlMessage::Accept { cookie: echoed } if echoed == cookie => {}
        ControlMessage::Reject { reason } => {
            return Err(Error::Protocol(format!("server rejected session: {}", reason)));
        }
        other => {
            return Err(Error::Protocol(format!(
                "unexpected handshake reply: {:?}",
                other
            )));
        }
    }

    let metrics = SessionMetrics::new();
    let work = CancellationToken::new();
    let plane = open_data_plane(config, &cookie, &metrics, &work).await?;

    if cancel.is_cancelled() {
        // Cancelled while still connecting: wind down without measuring.
        work.cancel();
        join_workers(plane.workers).await;
        *state.lock() = SessionState::Cancelled;
        return Ok(empty_result(SessionOutcome::Cancelled, config, started_at));
    }

    *state.lock() = SessionState::Measuring;

    let sink = ReportSink::new(observer);
    let mut sampler = IntervalSampler::new(metrics.clone(), config.protocol);
    let started = sampler.started();
    let mut ticker = interval_at(TokioInstant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let total_intervals = config.total_intervals();
    let mut intervals: Vec<IntervalReport> = Vec::with_capacity(total_intervals as usize);
    let mut outcome = SessionOutcome::Completed;

    while sampler.intervals_emitted() < total_intervals {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                outcome = SessionOutcome::Cancelled;
                break;
            }
            _ = work.cancelled() => {
                outcome = SessionOutcome::Failed;
                break;
            }
            _ = ticker.tick() => {
                let rtt = match config.protocol {
                    Protocol::Tcp => tcp_info::mean_rtt_us(&plane.handles),
                    Protocol::Udp => None,
                };
                let report = sampler.sample(rtt);
                sink.push(report.clone());
                intervals.push(report);
            }
        }
    }

    work.cancel();
    join_workers(plane.workers).await;

    // Close out the control exchange. The summary is best-effort: a
    // cancelled run does not wait for it.
    let summary = finish_control(&mut control, outcome != SessionOutcome::Cancelled).await;

    sink.finish().await;

    let duration = started.elapsed();
    let bytes = metrics.total_bytes();
    let secs = duration.as_secs_f64();
    let bits_per_second = if secs > 0.0 { bytes as f64 * 8.0 / secs } else { 0.0 };

    let (rtt_us, jitter_ms, lost_packets, packets) = match config.protocol {
        Protocol::Tcp => (intervals.last().and_then(|r| r.rtt_us), None, None, None),
        Protocol::Udp => {
            let (mut lost, _expected) = metrics.udp_loss();
            let mut jitter = metrics.jitter_ms();
            if !config.reverse {
                // The receiver holds the authoritative loss and jitter
                // figures for a sending client.
                if let Some(ControlMessage::Summary {
                    jitter_ms: summary_jitter,
                    lost_packets: summary_lost,
                    ..
                }) = &summary
                {
                    if let Some(j) = summary_jitter {
                        jitter = *j;
                    }
                    if let Some(l) = summary_lost {
                        lost = *l;
                    }
                }
            }
            (None, Some(jitter), Some(lost), Some(metrics.total_datagrams()))
        }
    };

    let error = match outcome {
        SessionOutcome::Failed => {
            let message = metrics
                .failure()
                .unwrap_or_else(|| "stream worker stopped unexpectedly".to_string());
            warn!("session failed: {}", message);
            Some(message)
        }
        _ => None,
    };

    *state.lock() = match outcome {
        SessionOutcome::Completed => SessionState::Completed,
        SessionOutcome::Cancelled => SessionState::Cancelled,
        SessionOutcome::Failed => SessionState::Failed,
    };

    info!(
        "session {:?}: {} bytes in {:.2} s ({:.2} Mbps)",
        outcome,
        bytes,
        secs,
        bits_per_second / 1_000_000.0
    );

    Ok(SessionResult {
        outcome,
        bytes_transferred: bytes,
        duration,
        bits_per_second,
        rtt_us,
        jitter_ms,
        lost_packets,
        packets,
        intervals,
        error,
        started_at,
    })
}

/// Opens the data connections and spawns one worker per stream. All
/// connects and preambles finish before any worker starts, so a setup
/// failure leaves nothing to unwind.
async fn open_data_plane(
    config: &SessionConfig,
    cookie: &str,
    metrics: &Arc<SessionMetrics>,
    work: &CancellationToken,
) -> Result<DataPlane> {
    let per_stream_bandwidth = config
        .bandwidth
        .map(|bits| (bits / config.parallel as u64).max(8));

    let mut workers = Vec::with_capacity(config.parallel);
    let mut handles = Vec::new();

    match config.protocol {
        Protocol::Tcp => {
            let mut streams =
                net::connect_tcp_streams(&config.host, config.port, config.parallel).await?;
            for (index, stream) in streams.iter_mut().enumerate() {
                write_message(
                    stream,
                    &ControlMessage::Stream {
                        cookie: cookie.to_string(),
                        index: index as u32,
                    },
                )
                .await?;
            }
            #[cfg(unix)]
            {
                use std::os::unix::io::AsRawFd;
                handles = streams.iter().map(|s| s.as_raw_fd()).collect();
            }
            for stream in streams {
                workers.push(spawn_tcp_worker(
                    stream,
                    config,
                    metrics.clone(),
                    work.clone(),
                    per_stream_bandwidth,
                ));
            }
        }
        Protocol::Udp => {
            let payload = traffic::udp_payload_size(config.buffer_size);
            let mut sockets = Vec::with_capacity(config.parallel);
            for index in 0..config.parallel {
                let socket = net::connect_udp(&config.host, config.port).await?;
                if config.reverse {
                    traffic::udp_announce(&socket, index as u32)
                        .await
                        .map_err(|e| Error::Connection(format!("announce failed: {}", e)))?;
                }
                sockets.push(socket);
            }
            for (index, socket) in sockets.into_iter().enumerate() {
                let worker = if config.reverse {
                    tokio::spawn(traffic::udp_receive_loop(
                        socket,
                        metrics.clone(),
                        work.clone(),
                    ))
                } else {
                    tokio::spawn(traffic::udp_send_loop(
                        socket,
                        index as u32,
                        metrics.clone(),
                        work.clone(),
                        payload,
                        per_stream_bandwidth,
                    ))
                };
                workers.push(worker);
            }
        }
    }

    Ok(DataPlane { workers, handles })
}

fn spawn_tcp_worker(
    stream: TcpStream,
    config: &SessionConfig,
    metrics: Arc<SessionMetrics>,
    work: CancellationToken,
    bandwidth: Option<u64>,
) -> JoinHandle<()> {
    if config.reverse {
        tokio::spawn(traffic::tcp_receive_loop(
            stream,
            metrics,
            work,
            config.buffer_size,
        ))
    } else {
        tokio::spawn(traffic::tcp_send_loop(
            stream,
            metrics,
            work,
            config.buffer_size,
            bandwidth,
        ))
    }
}

async fn join_workers(workers: Vec<JoinHandle<()>>) {
    for worker in workers {
        let _ = worker.await;
    }
}

/// Sends `Done` and, unless the run was cancelled, waits briefly for the
/// server's `Summary`. Both directions are best-effort: the peer may
/// already be gone.
async fn finish_control(
    control: &mut TcpStream,
    wait_for_summary: bool,
) -> Option<ControlMessage> {
    if let Err(e) = write_message(control, &ControlMessage::Done).await {
        debug!("could not send Done (peer closed?): {}", e);
        return None;
    }
    if !wait_for_summary {
        return None;
    }
    match timeout(SUMMARY_TIMEOUT, read_message(control)).await {
        Ok(Ok(message @ ControlMessage::Summary { .. })) => Some(message),
        Ok(Ok(other)) => {
            debug!("expected Summary, got {:?}", other);
            None
        }
        Ok(Err(e)) => {
            debug!("could not read summary: {}", e);
            None
        }
        Err(_) => {
            debug!("summary wait timed out");
            None
        }
    }
}

fn empty_result(
    outcome: SessionOutcome,
    config: &SessionConfig,
    started_at: chrono::DateTime<Utc>,
) -> SessionResult {
    SessionResult {
        outcome,
        bytes_transferred: 0,
        duration: Duration::ZERO,
        bits_per_second: 0.0,
        rtt_us: None,
        jitter_ms: match config.protocol {
            Protocol::Udp => Some(0.0),
            Protocol::Tcp => None,
        },
        lost_packets: match config.protocol {
            Protocol::Udp => Some(0),
            Protocol::Tcp => None,
        },
        packets: match config.protocol {
            Protocol::Udp => Some(0),
            Protocol::Tcp => None,
        },
        intervals: Vec::new(),
        error: None,
        started_at,
    }
}
