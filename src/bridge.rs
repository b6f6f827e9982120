//! Host-integration facade over the engine.
//!
//! Integration layers (mobile bridges, RPC shims) want loosely-typed
//! payloads and boolean server controls rather than the typed API. The
//! [`Bridge`] owns one [`Engine`] and one registered progress handler and
//! exposes exactly that surface: map-shaped results keyed
//! `bytesTransferred` / `bitsPerSecond` / `mbps` plus `rtt` or
//! (`jitter`, `lostPackets`), with metric applicability expressed by key
//! presence.

use crate::config::{Protocol, SessionConfig};
use crate::report::{IntervalReport, ProgressObserver};
use crate::session::Engine;
use crate::Result;
use log::warn;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Receives per-interval progress payloads.
///
/// Implemented automatically for closures taking the payload map.
pub trait ProgressHandler: Send + Sync {
    fn on_progress(&self, progress: Map<String, Value>);
}

impl<F> ProgressHandler for F
where
    F: Fn(Map<String, Value>) + Send + Sync,
{
    fn on_progress(&self, progress: Map<String, Value>) {
        self(progress)
    }
}

/// Adapts typed interval reports to map payloads for one handler.
struct HandlerObserver {
    handler: Arc<dyn ProgressHandler>,
}

impl ProgressObserver for HandlerObserver {
    fn on_interval(&self, report: &IntervalReport) {
        self.handler.on_progress(report.to_progress_map());
    }
}

/// The boundary surface consumed by host integration layers.
///
/// # Examples
///
/// ```no_run
/// use netgauge::Bridge;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> netgauge::Result<()> {
/// let bridge = Bridge::new(Some(Arc::new(|progress: serde_json::Map<String, serde_json::Value>| {
///     println!("{:.2} Mbps", progress["mbps"].as_f64().unwrap_or(0.0));
/// })));
///
/// let result = bridge
///     .run_client("192.168.1.10", 5201, 10, 1, false, false, 0)
///     .await?;
/// println!("total: {} bytes", result["bytesTransferred"]);
/// # Ok(())
/// # }
/// ```
pub struct Bridge {
    engine: Engine,
    handler: Option<Arc<dyn ProgressHandler>>,
}

impl Bridge {
    pub fn new(handler: Option<Arc<dyn ProgressHandler>>) -> Self {
        Self {
            engine: Engine::new(),
            handler,
        }
    }

    fn observer(&self) -> Option<Arc<dyn ProgressObserver>> {
        self.handler.as_ref().map(|handler| {
            Arc::new(HandlerObserver {
                handler: handler.clone(),
            }) as Arc<dyn ProgressObserver>
        })
    }

    /// Runs a client session and returns the result payload.
    ///
    /// `bandwidth_bps` of 0 means unlimited. The registered handler is
    /// invoked once per interval with the progress payload.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_client(
        &self,
        host: &str,
        port: u16,
        duration_secs: u64,
        parallel_streams: usize,
        reverse: bool,
        use_udp: bool,
        bandwidth_bps: u64,
    ) -> Result<Map<String, Value>> {
        let config = SessionConfig::new(host.to_string(), port)
            .with_protocol(if use_udp { Protocol::Udp } else { Protocol::Tcp })
            .with_duration(Duration::from_secs(duration_secs))
            .with_parallel(parallel_streams)
            .with_reverse(reverse)
            .with_bandwidth(bandwidth_bps);

        let result = self.engine.run_client(config, self.observer()).await?;
        Ok(result.to_result_map())
    }

    /// Idempotent; no effect when no client session is active.
    pub fn cancel_client(&self) {
        self.engine.cancel_client();
    }

    /// Starts the server; `false` when the port cannot be bound or this
    /// bridge's server is already running.
    pub async fn start_server(&self, port: u16, use_udp: bool) -> bool {
        let protocol = if use_udp { Protocol::Udp } else { Protocol::Tcp };
        match self.engine.start_server(port, protocol, self.observer()).await {
            Ok(()) => true,
            Err(e) => {
                warn!("start_server failed: {}", e);
                false
            }
        }
    }

    /// Stops the server; `true` if one was running.
    pub fn stop_server(&self) -> bool {
        self.engine.stop_server()
    }

    pub fn version(&self) -> String {
        self.engine.version()
    }

    /// The underlying engine, for callers that outgrow the map surface.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}
