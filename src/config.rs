use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport protocol for a measurement session.
///
/// # Examples
///
/// ```
/// use netgauge::{Protocol, SessionConfig};
///
/// let tcp = SessionConfig::new("127.0.0.1".to_string(), 5201);
/// assert_eq!(tcp.protocol, Protocol::Tcp);
///
/// let udp = SessionConfig::new("127.0.0.1".to_string(), 5201)
///     .with_protocol(Protocol::Udp)
///     .with_bandwidth(10_000_000); // 10 Mbps
/// assert_eq!(udp.protocol, Protocol::Udp);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Transmission Control Protocol - reliable, ordered byte stream
    Tcp,
    /// User Datagram Protocol - best-effort datagrams
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// Upper bound on parallel data connections for one session.
pub const MAX_PARALLEL_STREAMS: usize = 128;

/// Configuration for one client measurement session.
///
/// Built with `new` plus the `with_*` builder methods, validated once by
/// [`SessionConfig::validate`] before any connection attempt, and immutable
/// for the lifetime of the session that uses it.
///
/// # Examples
///
/// ```
/// use netgauge::{Protocol, SessionConfig};
/// use std::time::Duration;
///
/// let config = SessionConfig::new("192.168.1.10".to_string(), 5201)
///     .with_duration(Duration::from_secs(30))
///     .with_parallel(4)
///     .with_reverse(true);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Peer host name or address
    pub host: String,

    /// Peer port
    pub port: u16,

    /// Protocol to measure over
    pub protocol: Protocol,

    /// How long the session runs
    pub duration: Duration,

    /// Number of parallel data streams
    pub parallel: usize,

    /// Reverse direction: the server sends, this client receives
    pub reverse: bool,

    /// Send-rate cap in bits per second (`None` = unlimited)
    pub bandwidth: Option<u64>,

    /// Cadence of interval reports
    pub interval: Duration,

    /// Per-stream I/O buffer size in bytes
    pub buffer_size: usize,
}

impl SessionConfig {
    /// Creates a client configuration with defaults matching the
    /// conventional 5201-port throughput test: TCP, 10 seconds, one
    /// stream, unlimited rate, 1-second reports.
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            protocol: Protocol::Tcp,
            duration: Duration::from_secs(10),
            parallel: 1,
            reverse: false,
            bandwidth: None,
            interval: Duration::from_secs(1),
            buffer_size: 128 * 1024,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Sets the send-rate cap in bits per second. Zero means unlimited.
    pub fn with_bandwidth(mut self, bits_per_sec: u64) -> Self {
        self.bandwidth = if bits_per_sec == 0 {
            None
        } else {
            Some(bits_per_sec)
        };
        self
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Checks every field range before a session is allowed to start.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the offending field. No
    /// connection is attempted for a config that fails here.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::InvalidConfig("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::InvalidConfig("port must be in 1-65535".into()));
        }
        if self.duration.is_zero() {
            return Err(Error::InvalidConfig("duration must be positive".into()));
        }
        if self.parallel == 0 {
            return Err(Error::InvalidConfig(
                "parallel streams must be positive".into(),
            ));
        }
        if self.parallel > MAX_PARALLEL_STREAMS {
            return Err(Error::InvalidConfig(format!(
                "parallel streams must be at most {}",
                MAX_PARALLEL_STREAMS
            )));
        }
        if self.interval.is_zero() {
            return Err(Error::InvalidConfig("interval must be positive".into()));
        }
        if self.buffer_size == 0 {
            return Err(Error::InvalidConfig("buffer size must be positive".into()));
        }
        Ok(())
    }

    /// Number of interval reports a full-length session produces:
    /// `ceil(duration / interval)`.
    pub fn total_intervals(&self) -> u64 {
        let duration = self.duration.as_nanos();
        let interval = self.interval.as_nanos().max(1);
        (duration.div_ceil(interval)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SessionConfig::new("10.0.0.1".to_string(), 5201);
        assert_eq!(config.protocol, Protocol::Tcp);
        assert_eq!(config.duration, Duration::from_secs(10));
        assert_eq!(config.parallel, 1);
        assert!(!config.reverse);
        assert_eq!(config.bandwidth, None);
        assert_eq!(config.interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_bandwidth_means_unlimited() {
        let config = SessionConfig::new("10.0.0.1".to_string(), 5201).with_bandwidth(0);
        assert_eq!(config.bandwidth, None);

        let capped = SessionConfig::new("10.0.0.1".to_string(), 5201).with_bandwidth(1_000_000);
        assert_eq!(capped.bandwidth, Some(1_000_000));
    }

    #[test]
    fn rejects_out_of_range_fields() {
        let base = SessionConfig::new("10.0.0.1".to_string(), 5201);

        assert!(matches!(
            base.clone().with_duration(Duration::ZERO).validate(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            base.clone().with_parallel(0).validate(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            base.clone()
                .with_parallel(MAX_PARALLEL_STREAMS + 1)
                .validate(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            base.clone().with_interval(Duration::ZERO).validate(),
            Err(Error::InvalidConfig(_))
        ));

        let mut no_port = base;
        no_port.port = 0;
        assert!(matches!(
            no_port.validate(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn interval_count_rounds_up() {
        let config = SessionConfig::new("h".to_string(), 5201)
            .with_duration(Duration::from_secs(5))
            .with_interval(Duration::from_secs(1));
        assert_eq!(config.total_intervals(), 5);

        let ragged = SessionConfig::new("h".to_string(), 5201)
            .with_duration(Duration::from_millis(2500))
            .with_interval(Duration::from_secs(1));
        assert_eq!(ragged.total_intervals(), 3);

        let sub_second = SessionConfig::new("h".to_string(), 5201)
            .with_duration(Duration::from_secs(1))
            .with_interval(Duration::from_millis(250));
        assert_eq!(sub_second.total_intervals(), 4);
    }
}
