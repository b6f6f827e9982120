//! Token-bucket send pacing for bandwidth-capped sessions.
//!
//! Tokens are bytes. They refill at the configured rate and are consumed
//! before every send; when the bucket runs dry the sender sleeps for the
//! precomputed shortfall. Integer arithmetic throughout keeps the hot path
//! free of float conversions. Burst is bounded to 100 ms of the configured
//! rate, so the cap holds over any 1-second window.

use std::time::{Duration, Instant};
use tokio::time;

/// Byte-granular token bucket.
///
/// # Examples
///
/// ```
/// use netgauge::pacing::TokenBucket;
///
/// # async fn example() {
/// // 100 Mbps = 12_500_000 bytes/sec
/// let mut bucket = TokenBucket::new(12_500_000);
/// bucket.consume(1500).await; // sleeps only if the cap is exceeded
/// # }
/// ```
pub struct TokenBucket {
    bytes_per_sec: u64,
    tokens: i64,
    capacity: i64,
    last_refill: Instant,
    nanos_per_byte: u64,
}

impl TokenBucket {
    /// Creates a bucket for `bytes_per_sec`. Capacity is 100 ms worth of
    /// tokens with an 8 KiB floor.
    pub fn new(bytes_per_sec: u64) -> Self {
        let capacity = (bytes_per_sec / 10).max(8192) as i64;
        let nanos_per_byte = if bytes_per_sec > 0 {
            1_000_000_000 / bytes_per_sec
        } else {
            0
        };

        Self {
            bytes_per_sec,
            tokens: capacity,
            capacity,
            last_refill: Instant::now(),
            nanos_per_byte,
        }
    }

    /// Creates a bucket for a bits-per-second cap, the unit session
    /// configs carry.
    pub fn from_bits_per_sec(bits_per_sec: u64) -> Self {
        Self::new(bits_per_sec / 8)
    }

    /// Takes `bytes` tokens, sleeping first if the bucket cannot cover
    /// them at the configured rate. Sub-10µs shortfalls are not slept on;
    /// the debt carries over into the next consume instead.
    pub async fn consume(&mut self, bytes: usize) {
        let bytes = bytes as i64;
        self.refill();

        if self.tokens < bytes {
            let shortfall = bytes - self.tokens;
            let sleep_nanos = shortfall as u64 * self.nanos_per_byte;
            if sleep_nanos > 10_000 {
                time::sleep(Duration::from_nanos(sleep_nanos)).await;
                self.refill();
            }
        }

        self.tokens -= bytes;
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed_micros = now.duration_since(self.last_refill).as_micros() as u64;
        let tokens_to_add = (elapsed_micros * self.bytes_per_sec) / 1_000_000;
        if tokens_to_add > 0 {
            self.tokens = (self.tokens + tokens_to_add as i64).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Tokens available without sleeping. Debugging aid.
    pub fn available_tokens(&self) -> i64 {
        self.tokens
    }
}
