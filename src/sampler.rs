//! Shared session counters and the interval sampler that turns them into
//! periodic reports.
//!
//! Stream workers record into [`SessionMetrics`] from their hot loops:
//! plain atomic adds for bytes and datagrams, a mutex-guarded state for the
//! UDP receive path (per-stream sequence tracking, out-of-order detection,
//! RFC 3550 jitter smoothing). The [`IntervalSampler`] snapshots the
//! counters once per tick and emits the delta as an [`IntervalReport`];
//! loss is decided at the interval boundary as the growth of the
//! cumulative sequence-gap count.

use crate::config::Protocol;
use crate::report::IntervalReport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Default)]
struct StreamSeq {
    /// Highest sequence number observed on this stream
    highest: Option<u64>,
    /// Datagrams actually received on this stream
    received: u64,
    /// Transit time of the previous datagram, for jitter
    prev_transit_us: Option<i64>,
}

#[derive(Default)]
struct UdpReceiveState {
    streams: HashMap<u32, StreamSeq>,
    jitter_us: f64,
    out_of_order: u64,
}

/// Counters shared between stream workers and the sampler.
#[derive(Default)]
pub struct SessionMetrics {
    bytes: AtomicU64,
    datagrams: AtomicU64,
    udp: Mutex<UdpReceiveState>,
    failure: Mutex<Option<String>>,
}

impl SessionMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records payload bytes moved by any stream.
    pub fn record_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records one sent datagram.
    pub fn record_sent_datagram(&self) {
        self.datagrams.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one received datagram with its timing, updating sequence
    /// tracking, out-of-order count, and the jitter estimate.
    ///
    /// Jitter follows RFC 3550: with `D` the change in transit time
    /// between consecutive datagrams, `J += (|D| - J) / 16`.
    pub fn record_received_datagram(&self, stream: u32, sequence: u64, send_us: u64, recv_us: u64) {
        self.datagrams.fetch_add(1, Ordering::Relaxed);

        let mut state = self.udp.lock();
        let state = &mut *state;
        let entry = state.streams.entry(stream).or_default();

        match entry.highest {
            Some(highest) if sequence < highest => state.out_of_order += 1,
            Some(highest) if sequence > highest => entry.highest = Some(sequence),
            Some(_) => {} // duplicate of the current highest
            None => entry.highest = Some(sequence),
        }
        entry.received += 1;

        let transit = recv_us as i64 - send_us as i64;
        if let Some(prev) = entry.prev_transit_us {
            let d = (transit - prev).abs() as f64;
            state.jitter_us += (d - state.jitter_us) / 16.0;
        }
        entry.prev_transit_us = Some(transit);
    }

    /// Cumulative `(lost, expected)` datagram counts over all streams.
    ///
    /// A stream that has seen sequences up to `n` is expected to have
    /// received `n + 1` datagrams; the shortfall is presumed lost. A gap
    /// filled later by an out-of-order arrival stops counting as lost from
    /// the next boundary on.
    pub fn udp_loss(&self) -> (u64, u64) {
        let state = self.udp.lock();
        let mut lost = 0u64;
        let mut expected = 0u64;
        for seq in state.streams.values() {
            if let Some(highest) = seq.highest {
                let stream_expected = highest + 1;
                expected += stream_expected;
                lost += stream_expected.saturating_sub(seq.received);
            }
        }
        (lost, expected)
    }

    /// Current smoothed jitter in milliseconds.
    pub fn jitter_ms(&self) -> f64 {
        self.udp.lock().jitter_us / 1000.0
    }

    /// Datagrams that arrived behind a higher sequence number.
    pub fn out_of_order(&self) -> u64 {
        self.udp.lock().out_of_order
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn total_datagrams(&self) -> u64 {
        self.datagrams.load(Ordering::Relaxed)
    }

    /// Records the first terminal I/O failure; later calls keep the
    /// original message.
    pub fn fail(&self, message: String) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(message);
        }
    }

    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }
}

/// Turns successive [`SessionMetrics`] snapshots into interval reports.
pub struct IntervalSampler {
    metrics: Arc<SessionMetrics>,
    protocol: Protocol,
    started: Instant,
    last_sample: Instant,
    last_bytes: u64,
    last_datagrams: u64,
    last_lost: u64,
    next_index: u64,
}

impl IntervalSampler {
    pub fn new(metrics: Arc<SessionMetrics>, protocol: Protocol) -> Self {
        let now = Instant::now();
        Self {
            metrics,
            protocol,
            started: now,
            last_sample: now,
            last_bytes: 0,
            last_datagrams: 0,
            last_lost: 0,
            next_index: 0,
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Reports emitted so far.
    pub fn intervals_emitted(&self) -> u64 {
        self.next_index
    }

    /// Closes the current interval and returns its report.
    ///
    /// `rtt_us` is the transport RTT estimate sampled by the caller for
    /// TCP sessions; it is ignored for UDP, where the jitter/loss metrics
    /// come from the receive state instead.
    pub fn sample(&mut self, rtt_us: Option<f64>) -> IntervalReport {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample);
        let elapsed_secs = elapsed.as_secs_f64();

        let total_bytes = self.metrics.total_bytes();
        let interval_bytes = total_bytes.saturating_sub(self.last_bytes);
        let bits_per_second = if elapsed_secs > 0.0 {
            (interval_bytes as f64 * 8.0) / elapsed_secs
        } else {
            0.0
        };

        let report = match self.protocol {
            Protocol::Tcp => IntervalReport {
                interval_index: self.next_index,
                start: self.last_sample.duration_since(self.started),
                end: now.duration_since(self.started),
                bytes_transferred: interval_bytes,
                bits_per_second,
                rtt_us,
                jitter_ms: None,
                lost_packets: None,
                packets: None,
            },
            Protocol::Udp => {
                let total_datagrams = self.metrics.total_datagrams();
                let interval_datagrams = total_datagrams.saturating_sub(self.last_datagrams);
                let (lost_total, _expected) = self.metrics.udp_loss();
                let interval_lost = lost_total.saturating_sub(self.last_lost);
                self.last_datagrams = total_datagrams;
                self.last_lost = lost_total;

                IntervalReport {
                    interval_index: self.next_index,
                    start: self.last_sample.duration_since(self.started),
                    end: now.duration_since(self.started),
                    bytes_transferred: interval_bytes,
                    bits_per_second,
                    rtt_us: None,
                    jitter_ms: Some(self.metrics.jitter_ms()),
                    lost_packets: Some(interval_lost),
                    packets: Some(interval_datagrams),
                }
            }
        };

        self.last_sample = now;
        self.last_bytes = total_bytes;
        self.next_index += 1;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_gaps_count_as_lost() {
        let metrics = SessionMetrics::new();
        let base = 1_000_000u64;

        // Receive 0, 1, 3, 5 - sequences 2 and 4 never arrive.
        for seq in [0u64, 1, 3, 5] {
            metrics.record_received_datagram(0, seq, base + seq * 1000, base + seq * 1000 + 100);
        }

        let (lost, expected) = metrics.udp_loss();
        assert_eq!(expected, 6);
        assert_eq!(lost, 2);
        assert_eq!(metrics.out_of_order(), 0);
    }

    #[test]
    fn out_of_order_arrival_is_not_loss() {
        let metrics = SessionMetrics::new();
        let base = 1_000_000u64;

        metrics.record_received_datagram(0, 0, base, base + 100);
        metrics.record_received_datagram(0, 2, base + 2000, base + 2100);
        metrics.record_received_datagram(0, 1, base + 1000, base + 3100);

        assert_eq!(metrics.out_of_order(), 1);
        // All three arrived, so nothing is lost once 1 shows up.
        let (lost, expected) = metrics.udp_loss();
        assert_eq!(expected, 3);
        assert_eq!(lost, 0);
    }

    #[test]
    fn streams_keep_independent_sequence_spaces() {
        let metrics = SessionMetrics::new();
        let base = 1_000_000u64;

        for stream in 0u32..3 {
            for seq in 0u64..4 {
                metrics.record_received_datagram(stream, seq, base + seq * 1000, base + seq * 1000);
            }
        }
        // Drop one datagram from stream 2 only.
        metrics.record_received_datagram(2, 5, base + 5000, base + 5000);

        let (lost, expected) = metrics.udp_loss();
        assert_eq!(expected, 4 + 4 + 6);
        assert_eq!(lost, 1);
    }

    #[test]
    fn jitter_tracks_inter_arrival_variation() {
        let metrics = SessionMetrics::new();
        let base = 1_000_000u64;

        // Constant transit: zero jitter.
        metrics.record_received_datagram(0, 0, base, base + 500);
        metrics.record_received_datagram(0, 1, base + 10_000, base + 10_500);
        assert_eq!(metrics.jitter_ms(), 0.0);

        // A 1600 µs swing smoothed by 1/16 is 100 µs = 0.1 ms.
        metrics.record_received_datagram(0, 2, base + 20_000, base + 22_100);
        assert!((metrics.jitter_ms() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn tcp_samples_carry_rtt_only() {
        let metrics = SessionMetrics::new();
        let mut sampler = IntervalSampler::new(metrics.clone(), Protocol::Tcp);

        metrics.record_bytes(4096);
        let report = sampler.sample(Some(512.0));

        assert_eq!(report.interval_index, 0);
        assert_eq!(report.bytes_transferred, 4096);
        assert_eq!(report.rtt_us, Some(512.0));
        assert!(report.jitter_ms.is_none());
        assert!(report.lost_packets.is_none());
        assert!(report.packets.is_none());
    }

    #[test]
    fn udp_loss_is_decided_per_interval() {
        let metrics = SessionMetrics::new();
        let mut sampler = IntervalSampler::new(metrics.clone(), Protocol::Udp);
        let base = 1_000_000u64;

        // First interval: sequences 0-4 with 2 missing.
        for seq in [0u64, 1, 3, 4] {
            metrics.record_bytes(1024);
            metrics.record_received_datagram(0, seq, base + seq * 1000, base + seq * 1000);
        }
        let first = sampler.sample(None);
        assert_eq!(first.lost_packets, Some(1));
        assert_eq!(first.packets, Some(4));
        assert!(first.rtt_us.is_none());

        // Second interval: 5-7 all arrive; only new loss would count.
        for seq in [5u64, 6, 7] {
            metrics.record_bytes(1024);
            metrics.record_received_datagram(0, seq, base + seq * 1000, base + seq * 1000);
        }
        let second = sampler.sample(None);
        assert_eq!(second.interval_index, 1);
        assert_eq!(second.lost_packets, Some(0));
        assert_eq!(second.packets, Some(3));
    }

    #[test]
    fn indices_increase_without_gaps() {
        let metrics = SessionMetrics::new();
        let mut sampler = IntervalSampler::new(metrics, Protocol::Tcp);
        for expected in 0..10u64 {
            assert_eq!(sampler.sample(None).interval_index, expected);
        }
        assert_eq!(sampler.intervals_emitted(), 10);
    }

    #[test]
    fn first_failure_wins() {
        let metrics = SessionMetrics::new();
        assert!(metrics.failure().is_none());
        metrics.fail("connection reset by peer".into());
        metrics.fail("broken pipe".into());
        assert_eq!(metrics.failure().as_deref(), Some("connection reset by peer"));
    }
}
