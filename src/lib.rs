//! netgauge - an embeddable network throughput measurement engine
//!
//! This library runs iperf3-style throughput sessions: a client drives
//! TCP or UDP traffic against a peer server for a configured duration
//! while per-interval reports (throughput, RTT or jitter/loss) stream to
//! an observer, and a server serves accepted sessions one at a time with
//! the same reporting contract.
//!
//! # Features
//!
//! - TCP and UDP sessions with parallel streams
//! - Forward and reverse (server-sends) direction
//! - Token-bucket bandwidth capping
//! - Per-interval reports: throughput, socket-level RTT (TCP),
//!   RFC 3550 jitter and sequence-gap loss (UDP)
//! - Cooperative cancellation at interval boundaries
//! - One client and one server session per engine, enforced
//! - Map-shaped facade for host integration layers
//! - Asynchronous I/O using tokio

pub mod bridge;
pub mod config;
pub mod error;
pub mod net;
pub mod pacing;
pub mod packet;
pub mod protocol;
pub mod report;
pub mod sampler;
pub mod session;
pub mod tcp_info;

mod server;
mod traffic;

pub use bridge::{Bridge, ProgressHandler};
pub use config::{Protocol, SessionConfig};
pub use error::{Error, Result};
pub use report::{IntervalReport, ProgressObserver, SessionOutcome, SessionResult};
pub use session::{Engine, SessionState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
