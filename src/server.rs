//! Server listener: accepts one measurement session at a time and serves
//! it end-to-end before returning to listening.
//!
//! The server mirrors session duration passively - an accepted session
//! runs until the client sends `Done`, the control connection closes, or
//! the operator stops the server. Each session re-enters the same
//! sampler/report path as the client side, reporting from the server's
//! perspective, and ends with a `Summary` sent back over the control
//! connection.

use crate::config::{Protocol, MAX_PARALLEL_STREAMS};
use crate::protocol::{read_message, write_message, ControlMessage};
use crate::report::{ProgressObserver, ReportSink};
use crate::sampler::{IntervalSampler, SessionMetrics};
use crate::session::HANDSHAKE_TIMEOUT;
use crate::tcp_info::{self, SocketHandle};
use crate::traffic;
use crate::{Error, Result};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant as TokioInstant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Server-side per-stream I/O buffer.
const SERVER_BUFFER_SIZE: usize = 128 * 1024;

/// Everything a listener worker needs, assembled by the engine at start.
pub(crate) struct ServerContext {
    pub listener: TcpListener,
    /// Data socket bound on the listener port; present for UDP servers
    pub udp_socket: Option<Arc<UdpSocket>>,
    pub protocol: Protocol,
    pub observer: Option<Arc<dyn ProgressObserver>>,
    pub stop: CancellationToken,
    pub interval: Duration,
}

/// Accept loop: serves sessions serially until stopped.
pub(crate) async fn run_listener(ctx: ServerContext) {
    loop {
        let accepted = tokio::select! {
            _ = ctx.stop.cancelled() => break,
            accepted = ctx.listener.accept() => accepted,
        };

        match accepted {
            Ok((control, peer)) => {
                info!("accepted session from {}", peer);
                match serve_session(&ctx, control).await {
                    Ok(()) => info!("session from {} finished", peer),
                    Err(e) => warn!("session from {} ended with error: {}", peer, e),
                }
            }
            Err(e) => {
                error!("accept failed: {}", e);
                // Transient accept errors (e.g. EMFILE) should not kill
                // the listener; stop still wins the next select.
            }
        }
    }
    debug!("listener stopped");
}

/// Parameters agreed during the handshake.
struct SessionPlan {
    cookie: String,
    streams: usize,
    reverse: bool,
    duration: Duration,
    bandwidth: Option<u64>,
}

async fn serve_session(ctx: &ServerContext, mut control: TcpStream) -> Result<()> {
    let plan = match negotiate(ctx, &mut control).await? {
        Some(plan) => plan,
        None => return Ok(()), // rejected, already answered
    };

    let metrics = SessionMetrics::new();
    // Child of the operator token: stopping the server stops the session,
    // and a worker failure trips only this session.
    let session = ctx.stop.child_token();

    let (workers, handles) = open_data_plane(ctx, &plan, &metrics, &session).await?;

    let sink = ReportSink::new(ctx.observer.clone());
    let mut sampler = IntervalSampler::new(metrics.clone(), ctx.protocol);
    let started = sampler.started();
    let mut ticker = interval_at(TokioInstant::now() + ctx.interval, ctx.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // A sending server is additionally bounded by the client's announced
    // duration; a receiving one mirrors the client entirely.
    let max_intervals: Option<u64> = plan.reverse.then(|| {
        let duration = plan.duration.as_nanos();
        let interval = ctx.interval.as_nanos().max(1);
        duration.div_ceil(interval) as u64
    });

    // The control connection moves to a watcher task so a half-read
    // message is never abandoned by the tick loop.
    let client_done = CancellationToken::new();
    let watcher = spawn_control_watcher(control, client_done.clone());

    loop {
        if let Some(max) = max_intervals {
            if sampler.intervals_emitted() >= max {
                break;
            }
        }
        tokio::select! {
            biased;
            _ = session.cancelled() => break,
            _ = client_done.cancelled() => break,
            _ = ticker.tick() => {
                let rtt = match ctx.protocol {
                    Protocol::Tcp => tcp_info::mean_rtt_us(&handles),
                    Protocol::Udp => None,
                };
                sink.push(sampler.sample(rtt));
            }
        }
    }

    session.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    sink.finish().await;

    // Hand the receive-side aggregate back to the client; it may already
    // be gone, so this is best-effort.
    if let Ok(mut control) = watcher.await {
        let summary = build_summary(ctx.protocol, &metrics, started.elapsed());
        if let Err(e) = write_message(&mut control, &summary).await {
            debug!("could not deliver summary: {}", e);
        }
    }

    Ok(())
}

/// Reads and answers the handshake. Returns `None` after sending a
/// rejection.
async fn negotiate(ctx: &ServerContext, control: &mut TcpStream) -> Result<Option<SessionPlan>> {
    let hello = timeout(HANDSHAKE_TIMEOUT, read_message(control))
        .await
        .map_err(|_| Error::Protocol("handshake timed out".into()))??;

    let ControlMessage::Hello {
        cookie,
        protocol,
        streams,
        reverse,
        duration_secs,
        bandwidth,
        ..
    } = hello
    else {
        write_message(
            control,
            &ControlMessage::Reject {
                reason: "expected Hello".into(),
            },
        )
        .await?;
        return Ok(None);
    };

    if protocol != ctx.protocol {
        write_message(
            control,
            &ControlMessage::Reject {
                reason: format!(
                    "server is running {}, client asked for {}",
                    ctx.protocol.as_str(),
                    protocol.as_str()
                ),
            },
        )
        .await?;
        return Ok(None);
    }

    if streams == 0 || streams > MAX_PARALLEL_STREAMS {
        write_message(
            control,
            &ControlMessage::Reject {
                reason: format!("stream count {} out of range", streams),
            },
        )
        .await?;
        return Ok(None);
    }

    write_message(
        control,
        &ControlMessage::Accept {
            cookie: cookie.clone(),
        },
    )
    .await?;

    Ok(Some(SessionPlan {
        cookie,
        streams,
        reverse,
        duration: Duration::from_secs(duration_secs.max(1)),
        bandwidth,
    }))
}

/// Sets up the data path for an accepted session and spawns its workers.
async fn open_data_plane(
    ctx: &ServerContext,
    plan: &SessionPlan,
    metrics: &Arc<SessionMetrics>,
    session: &CancellationToken,
) -> Result<(Vec<JoinHandle<()>>, Vec<SocketHandle>)> {
    let per_stream_bandwidth = plan
        .bandwidth
        .map(|bits| (bits / plan.streams as u64).max(8));

    let mut workers = Vec::with_capacity(plan.streams);
    let mut handles = Vec::new();

    match ctx.protocol {
        Protocol::Tcp => {
            let mut streams = Vec::with_capacity(plan.streams);
            for _ in 0..plan.streams {
                let (mut data, _) = timeout(HANDSHAKE_TIMEOUT, ctx.listener.accept())
                    .await
                    .map_err(|_| Error::Protocol("timed out waiting for data connections".into()))?
                    .map_err(Error::Io)?;

                let preamble = timeout(HANDSHAKE_TIMEOUT, read_message(&mut data))
                    .await
                    .map_err(|_| Error::Protocol("timed out reading stream preamble".into()))??;
                match preamble {
                    ControlMessage::Stream { cookie, index } if cookie == plan.cookie => {
                        debug!("data connection {} attached", index);
                    }
                    other => {
                        return Err(Error::Protocol(format!(
                            "expected stream preamble, got {:?}",
                            other
                        )));
                    }
                }
                streams.push(data);
            }

            #[cfg(unix)]
            {
                use std::os::unix::io::AsRawFd;
                handles = streams.iter().map(|s| s.as_raw_fd()).collect();
            }

            for stream in streams {
                let worker = if plan.reverse {
                    tokio::spawn(traffic::tcp_send_loop(
                        stream,
                        metrics.clone(),
                        session.clone(),
                        SERVER_BUFFER_SIZE,
                        per_stream_bandwidth,
                    ))
                } else {
                    tokio::spawn(traffic::tcp_receive_loop(
                        stream,
                        metrics.clone(),
                        session.clone(),
                        SERVER_BUFFER_SIZE,
                    ))
                };
                workers.push(worker);
            }
        }
        Protocol::Udp => {
            let Some(socket) = ctx.udp_socket.clone() else {
                return Err(Error::Protocol("UDP server has no data socket".into()));
            };

            if plan.reverse {
                let targets = collect_announcements(&socket, plan.streams, session).await?;
                let payload = traffic::udp_payload_size(SERVER_BUFFER_SIZE);
                for (stream_id, target) in targets {
                    workers.push(tokio::spawn(traffic::udp_send_to_loop(
                        socket.clone(),
                        target,
                        stream_id,
                        metrics.clone(),
                        session.clone(),
                        payload,
                        per_stream_bandwidth,
                    )));
                }
            } else {
                workers.push(tokio::spawn(traffic::udp_sink_loop(
                    socket,
                    metrics.clone(),
                    session.clone(),
                )));
            }
        }
    }

    Ok((workers, handles))
}

/// Waits for one announcement datagram per reverse-mode stream, learning
/// where to send.
async fn collect_announcements(
    socket: &UdpSocket,
    streams: usize,
    session: &CancellationToken,
) -> Result<HashMap<u32, SocketAddr>> {
    let mut targets: HashMap<u32, SocketAddr> = HashMap::new();
    let mut buffer = vec![0u8; traffic::MAX_DATAGRAM];

    while targets.len() < streams {
        let received = tokio::select! {
            _ = session.cancelled() => {
                return Err(Error::Protocol("session stopped during announcement".into()));
            }
            received = timeout(HANDSHAKE_TIMEOUT, socket.recv_from(&mut buffer)) => received,
        };
        match received {
            Ok(Ok((n, from))) => {
                if let Some((header, _)) = crate::packet::parse_datagram(&buffer[..n]) {
                    targets.entry(header.stream).or_insert(from);
                }
            }
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => {
                return Err(Error::Protocol(
                    "timed out waiting for stream announcements".into(),
                ));
            }
        }
    }
    Ok(targets)
}

fn spawn_control_watcher(
    mut control: TcpStream,
    client_done: CancellationToken,
) -> JoinHandle<TcpStream> {
    tokio::spawn(async move {
        loop {
            match read_message(&mut control).await {
                Ok(ControlMessage::Done) => {
                    debug!("client signalled Done");
                    client_done.cancel();
                    break;
                }
                Ok(other) => debug!("ignoring control message {:?}", other),
                Err(_) => {
                    // Closed or garbled control channel ends the session.
                    client_done.cancel();
                    break;
                }
            }
        }
        control
    })
}

fn build_summary(
    protocol: Protocol,
    metrics: &SessionMetrics,
    elapsed: Duration,
) -> ControlMessage {
    let bytes = metrics.total_bytes();
    let secs = elapsed.as_secs_f64();
    let bits_per_second = if secs > 0.0 { bytes as f64 * 8.0 / secs } else { 0.0 };

    match protocol {
        Protocol::Tcp => ControlMessage::Summary {
            bytes,
            bits_per_second,
            jitter_ms: None,
            lost_packets: None,
            packets: None,
        },
        Protocol::Udp => {
            let (lost, _expected) = metrics.udp_loss();
            ControlMessage::Summary {
                bytes,
                bits_per_second,
                jitter_ms: Some(metrics.jitter_ms()),
                lost_packets: Some(lost),
                packets: Some(metrics.total_datagrams()),
            }
        }
    }
}
