//! Interval reports, session results, and observer delivery.
//!
//! Reports flow from the sampler into a bounded queue drained by a
//! dispatcher task, keeping a slow observer off the measurement path: when
//! the queue is full the newest report is dropped (logged at debug) rather
//! than blocking the next sample. Delivery order within a session is the
//! emission order, so `interval_index` reaches the observer strictly
//! increasing.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Reports queued between the sampler and the observer dispatcher.
const REPORT_QUEUE_DEPTH: usize = 64;

/// One periodic measurement snapshot from an active session.
///
/// Exactly one of `rtt_us` (TCP) and `jitter_ms` (UDP) is populated,
/// decided by the session protocol; absence is expressed with `None`,
/// never a zero sentinel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalReport {
    /// Zero-based index, strictly increasing with no gaps
    pub interval_index: u64,
    /// Offset of the interval start from the session start
    pub start: Duration,
    /// Offset of the interval end from the session start
    pub end: Duration,
    /// Payload bytes moved during this interval, summed over streams
    pub bytes_transferred: u64,
    /// Throughput over this interval
    pub bits_per_second: f64,
    /// Transport-level round-trip estimate in microseconds (TCP)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_us: Option<f64>,
    /// RFC 3550 smoothed inter-arrival jitter in milliseconds (UDP)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
    /// Packets presumed lost this interval (UDP)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_packets: Option<u64>,
    /// Datagrams handled this interval (UDP)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets: Option<u64>,
}

impl IntervalReport {
    /// Throughput in megabits per second, derived from
    /// [`bits_per_second`](Self::bits_per_second) - never stored
    /// separately.
    pub fn mbps(&self) -> f64 {
        self.bits_per_second / 1_000_000.0
    }

    /// Progress payload for host integration layers.
    ///
    /// Keys: `interval`, `bytesTransferred`, `bitsPerSecond`, `mbps`, and
    /// `rtt` or (`jitter`, `lostPackets`) depending on protocol. Metric
    /// applicability is key presence, not a zero value.
    pub fn to_progress_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("interval".into(), Value::from(self.interval_index));
        map.insert(
            "bytesTransferred".into(),
            Value::from(self.bytes_transferred),
        );
        map.insert("bitsPerSecond".into(), Value::from(self.bits_per_second));
        map.insert("mbps".into(), Value::from(self.mbps()));
        if let Some(rtt) = self.rtt_us {
            map.insert("rtt".into(), Value::from(rtt));
        }
        if let Some(jitter) = self.jitter_ms {
            map.insert("jitter".into(), Value::from(jitter));
            map.insert(
                "lostPackets".into(),
                Value::from(self.lost_packets.unwrap_or(0)),
            );
        }
        map
    }
}

/// Terminal state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOutcome {
    /// Ran for the full configured duration
    Completed,
    /// Ended early at an interval boundary after a cancel request
    Cancelled,
    /// Ended early on a mid-session I/O failure; aggregates are partial
    Failed,
}

/// Aggregated summary of one session, produced at termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    pub outcome: SessionOutcome,
    /// Total payload bytes moved over the whole session
    pub bytes_transferred: u64,
    /// Measured wall-clock length of the session
    pub duration: Duration,
    /// Average throughput over the whole session
    pub bits_per_second: f64,
    /// Final round-trip estimate in microseconds (TCP)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_us: Option<f64>,
    /// Final smoothed jitter in milliseconds (UDP)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
    /// Total packets lost (UDP)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_packets: Option<u64>,
    /// Total datagrams handled (UDP)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets: Option<u64>,
    /// The interval reports actually emitted
    pub intervals: Vec<IntervalReport>,
    /// Failure description when `outcome` is [`SessionOutcome::Failed`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock session start
    pub started_at: DateTime<Utc>,
}

impl SessionResult {
    pub fn mbps(&self) -> f64 {
        self.bits_per_second / 1_000_000.0
    }

    /// Result payload for host integration layers.
    ///
    /// Keys: `bytesTransferred`, `bitsPerSecond`, `mbps`, and `rtt` or
    /// (`jitter`, `lostPackets`).
    pub fn to_result_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(
            "bytesTransferred".into(),
            Value::from(self.bytes_transferred),
        );
        map.insert("bitsPerSecond".into(), Value::from(self.bits_per_second));
        map.insert("mbps".into(), Value::from(self.mbps()));
        if let Some(rtt) = self.rtt_us {
            map.insert("rtt".into(), Value::from(rtt));
        }
        if let Some(jitter) = self.jitter_ms {
            map.insert("jitter".into(), Value::from(jitter));
            map.insert(
                "lostPackets".into(),
                Value::from(self.lost_packets.unwrap_or(0)),
            );
        }
        map
    }
}

/// Receives interval reports from an active session.
///
/// Implemented automatically for closures:
///
/// ```
/// use netgauge::report::{IntervalReport, ProgressObserver};
///
/// let observer = |report: &IntervalReport| {
///     println!("[{}] {:.2} Mbps", report.interval_index, report.mbps());
/// };
/// fn takes_observer<O: ProgressObserver>(_o: O) {}
/// takes_observer(observer);
/// ```
pub trait ProgressObserver: Send + Sync {
    fn on_interval(&self, report: &IntervalReport);
}

impl<F> ProgressObserver for F
where
    F: Fn(&IntervalReport) + Send + Sync,
{
    fn on_interval(&self, report: &IntervalReport) {
        self(report)
    }
}

/// Bounded handoff between the sampler and the observer.
///
/// `push` never blocks; `finish` drains the queue through the dispatcher
/// task before returning, so every accepted report is delivered before the
/// session call returns.
pub(crate) struct ReportSink {
    tx: Option<mpsc::Sender<IntervalReport>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl ReportSink {
    pub(crate) fn new(observer: Option<Arc<dyn ProgressObserver>>) -> Self {
        let Some(observer) = observer else {
            return Self {
                tx: None,
                dispatcher: None,
            };
        };

        let (tx, mut rx) = mpsc::channel::<IntervalReport>(REPORT_QUEUE_DEPTH);
        let dispatcher = tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                observer.on_interval(&report);
            }
        });

        Self {
            tx: Some(tx),
            dispatcher: Some(dispatcher),
        }
    }

    pub(crate) fn push(&self, report: IntervalReport) {
        if let Some(tx) = &self.tx {
            if let Err(mpsc::error::TrySendError::Full(dropped)) = tx.try_send(report) {
                debug!(
                    "observer queue full, dropping interval report {}",
                    dropped.interval_index
                );
            }
        }
    }

    pub(crate) async fn finish(mut self) {
        self.tx.take();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.await;
        }
    }
}
