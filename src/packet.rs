//! UDP datagram framing for loss and jitter measurement.
//!
//! Every measurement datagram starts with a fixed header:
//!
//! ```text
//! | Magic (4) | Stream (4) | Sequence (8) | Timestamp (8) | Payload ... |
//! ```
//!
//! - **Magic**: 0x4E475547 ("NGUG") - marks netgauge datagrams
//! - **Stream**: data-stream index, so parallel streams keep independent
//!   sequence spaces
//! - **Sequence**: monotonically increasing per stream (big-endian)
//! - **Timestamp**: send time in microseconds since UNIX epoch
//!
//! The receiver detects loss from gaps in per-stream sequence numbers and
//! feeds the send/receive timestamp pair into the jitter estimator.

use std::time::{SystemTime, UNIX_EPOCH};

const DATAGRAM_MAGIC: u32 = 0x4E47_5547; // "NGUG"

/// Header prepended to every measurement datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub stream: u32,
    pub sequence: u64,
    pub timestamp_us: u64,
}

impl DatagramHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 24;

    pub fn new(stream: u32, sequence: u64, timestamp_us: u64) -> Self {
        Self {
            stream,
            sequence,
            timestamp_us,
        }
    }

    /// Header stamped with the current wall clock.
    pub fn with_current_time(stream: u32, sequence: u64) -> Self {
        Self::new(stream, sequence, unix_micros())
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&DATAGRAM_MAGIC.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.stream.to_be_bytes());
        bytes[8..16].copy_from_slice(&self.sequence.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.timestamp_us.to_be_bytes());
        bytes
    }

    /// Parses a header, returning `None` for short buffers or foreign
    /// datagrams (magic mismatch).
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let magic = u32::from_be_bytes(bytes[0..4].try_into().ok()?);
        if magic != DATAGRAM_MAGIC {
            return None;
        }
        Some(Self {
            stream: u32::from_be_bytes(bytes[4..8].try_into().ok()?),
            sequence: u64::from_be_bytes(bytes[8..16].try_into().ok()?),
            timestamp_us: u64::from_be_bytes(bytes[16..24].try_into().ok()?),
        })
    }
}

/// Microseconds since the UNIX epoch.
pub fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Builds a complete datagram: current-time header plus a zero-filled
/// payload of `payload_size` bytes.
pub fn build_datagram(stream: u32, sequence: u64, payload_size: usize) -> Vec<u8> {
    let header = DatagramHeader::with_current_time(stream, sequence);
    let mut datagram = Vec::with_capacity(DatagramHeader::SIZE + payload_size);
    datagram.extend_from_slice(&header.to_bytes());
    datagram.resize(DatagramHeader::SIZE + payload_size, 0);
    datagram
}

/// Splits a received datagram into header and payload, `None` if it does
/// not carry the netgauge header.
pub fn parse_datagram(datagram: &[u8]) -> Option<(DatagramHeader, &[u8])> {
    let header = DatagramHeader::from_bytes(datagram)?;
    Some((header, &datagram[DatagramHeader::SIZE..]))
}
