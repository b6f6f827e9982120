//! Per-stream traffic workers: senders that drive bytes at the configured
//! rate and sinks that drain and account them.
//!
//! Every loop observes the session stop token at least once per iteration;
//! receive paths use a 100 ms read timeout so neither duration handling
//! nor cancellation ever waits on a silent peer. A worker I/O error is
//! terminal for the session: it records the failure and trips the stop
//! token so the other workers and the sampler wind down.

use crate::pacing::TokenBucket;
use crate::packet::{build_datagram, parse_datagram, unix_micros, DatagramHeader};
use crate::sampler::SessionMetrics;
use log::debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Poll bound for receive calls, so stop and duration stay responsive.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Largest UDP datagram we accept.
pub(crate) const MAX_DATAGRAM: usize = 65536;

/// Largest datagram that fits an IPv4 UDP packet.
const MAX_UDP_PAYLOAD_TOTAL: usize = 65507;

/// MTU-friendly datagram size used when the configured buffer is
/// stream-oriented (too large for a single datagram).
const DEFAULT_UDP_DATAGRAM: usize = 1448;

/// Payload bytes per datagram for a session's configured buffer size.
pub(crate) fn udp_payload_size(buffer_size: usize) -> usize {
    let datagram = if buffer_size > MAX_UDP_PAYLOAD_TOTAL {
        DEFAULT_UDP_DATAGRAM
    } else {
        buffer_size
    };
    datagram.saturating_sub(DatagramHeader::SIZE).max(1)
}

fn stream_failed(metrics: &SessionMetrics, stop: &CancellationToken, err: std::io::Error) {
    metrics.fail(err.to_string());
    stop.cancel();
}

/// Writes zero-filled buffers into `stream` until stopped, pacing through
/// `bandwidth` (bits/sec for this stream) when set.
pub(crate) async fn tcp_send_loop(
    mut stream: TcpStream,
    metrics: Arc<SessionMetrics>,
    stop: CancellationToken,
    buffer_size: usize,
    bandwidth: Option<u64>,
) {
    let buffer = vec![0u8; buffer_size];
    let mut bucket = bandwidth.map(TokenBucket::from_bits_per_sec);

    loop {
        if let Some(bucket) = bucket.as_mut() {
            bucket.consume(buffer.len()).await;
        }
        tokio::select! {
            _ = stop.cancelled() => break,
            written = stream.write(&buffer) => match written {
                Ok(0) => break,
                Ok(n) => metrics.record_bytes(n as u64),
                Err(e) => {
                    stream_failed(&metrics, &stop, e);
                    break;
                }
            }
        }
    }
    let _ = stream.flush().await;
}

/// Drains `stream` until EOF or stop, accounting received bytes.
pub(crate) async fn tcp_receive_loop(
    mut stream: TcpStream,
    metrics: Arc<SessionMetrics>,
    stop: CancellationToken,
    buffer_size: usize,
) {
    let mut buffer = vec![0u8; buffer_size];

    loop {
        if stop.is_cancelled() {
            break;
        }
        match timeout(READ_TIMEOUT, stream.read(&mut buffer)).await {
            Ok(Ok(0)) => break, // sender finished
            Ok(Ok(n)) => metrics.record_bytes(n as u64),
            Ok(Err(e)) => {
                stream_failed(&metrics, &stop, e);
                break;
            }
            Err(_) => continue, // timeout: re-check stop
        }
    }
}

/// Sends sequence-tagged datagrams on a connected socket until stopped.
pub(crate) async fn udp_send_loop(
    socket: UdpSocket,
    stream_id: u32,
    metrics: Arc<SessionMetrics>,
    stop: CancellationToken,
    payload_size: usize,
    bandwidth: Option<u64>,
) {
    let mut bucket = bandwidth.map(TokenBucket::from_bits_per_sec);
    let mut sequence = 0u64;
    let datagram_len = DatagramHeader::SIZE + payload_size;

    loop {
        if let Some(bucket) = bucket.as_mut() {
            bucket.consume(datagram_len).await;
        }
        // Stamp after pacing so the send time is honest.
        let datagram = build_datagram(stream_id, sequence, payload_size);
        tokio::select! {
            _ = stop.cancelled() => break,
            sent = socket.send(&datagram) => match sent {
                Ok(n) => {
                    metrics.record_bytes(n as u64);
                    metrics.record_sent_datagram();
                    sequence += 1;
                }
                Err(e) => {
                    stream_failed(&metrics, &stop, e);
                    break;
                }
            }
        }
    }
}

/// Sends sequence-tagged datagrams to a fixed peer on a shared socket.
/// Reverse-mode server path.
pub(crate) async fn udp_send_to_loop(
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    stream_id: u32,
    metrics: Arc<SessionMetrics>,
    stop: CancellationToken,
    payload_size: usize,
    bandwidth: Option<u64>,
) {
    let mut bucket = bandwidth.map(TokenBucket::from_bits_per_sec);
    let mut sequence = 0u64;
    let datagram_len = DatagramHeader::SIZE + payload_size;

    loop {
        if let Some(bucket) = bucket.as_mut() {
            bucket.consume(datagram_len).await;
        }
        let datagram = build_datagram(stream_id, sequence, payload_size);
        tokio::select! {
            _ = stop.cancelled() => break,
            sent = socket.send_to(&datagram, target) => match sent {
                Ok(n) => {
                    metrics.record_bytes(n as u64);
                    metrics.record_sent_datagram();
                    sequence += 1;
                }
                Err(e) => {
                    stream_failed(&metrics, &stop, e);
                    break;
                }
            }
        }
    }
}

/// Receives tagged datagrams on a connected socket until stopped,
/// feeding sequence and timing data into the metrics. Client reverse-mode
/// path.
pub(crate) async fn udp_receive_loop(
    socket: UdpSocket,
    metrics: Arc<SessionMetrics>,
    stop: CancellationToken,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM];

    loop {
        if stop.is_cancelled() {
            break;
        }
        match timeout(READ_TIMEOUT, socket.recv(&mut buffer)).await {
            Ok(Ok(n)) => account_datagram(&metrics, &buffer[..n]),
            Ok(Err(e)) => {
                stream_failed(&metrics, &stop, e);
                break;
            }
            Err(_) => continue,
        }
    }
}

/// Receives tagged datagrams from any peer on a shared socket until
/// stopped. Server receive path.
pub(crate) async fn udp_sink_loop(
    socket: Arc<UdpSocket>,
    metrics: Arc<SessionMetrics>,
    stop: CancellationToken,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM];

    loop {
        if stop.is_cancelled() {
            break;
        }
        match timeout(READ_TIMEOUT, socket.recv_from(&mut buffer)).await {
            Ok(Ok((n, _from))) => account_datagram(&metrics, &buffer[..n]),
            Ok(Err(e)) => {
                stream_failed(&metrics, &stop, e);
                break;
            }
            Err(_) => continue,
        }
    }
}

fn account_datagram(metrics: &SessionMetrics, datagram: &[u8]) {
    metrics.record_bytes(datagram.len() as u64);
    if let Some((header, _payload)) = parse_datagram(datagram) {
        metrics.record_received_datagram(
            header.stream,
            header.sequence,
            header.timestamp_us,
            unix_micros(),
        );
    } else {
        debug!("ignoring foreign datagram of {} bytes", datagram.len());
    }
}

/// Sends the hole-punch datagram a reverse-mode client uses to announce
/// its address for `stream_id`. Not accounted as payload.
pub(crate) async fn udp_announce(socket: &UdpSocket, stream_id: u32) -> std::io::Result<()> {
    let header = DatagramHeader::with_current_time(stream_id, 0);
    socket.send(&header.to_bytes()).await?;
    Ok(())
}
