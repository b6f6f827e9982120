use clap::{Parser, Subcommand};
use netgauge::{Engine, IntervalReport, Protocol, SessionConfig, SessionOutcome};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "netgauge")]
#[command(about = "Network throughput measurement - client and server", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in server mode
    Server {
        /// Port to listen on
        #[arg(short, long, default_value = "5201")]
        port: u16,

        /// Use UDP instead of TCP
        #[arg(short, long)]
        udp: bool,
    },

    /// Run in client mode
    Client {
        /// Server address to connect to
        server: String,

        /// Port to connect to
        #[arg(short, long, default_value = "5201")]
        port: u16,

        /// Use UDP instead of TCP
        #[arg(short, long)]
        udp: bool,

        /// Test duration in seconds
        #[arg(short = 't', long, default_value = "10")]
        time: u64,

        /// Target bandwidth in Mbps (0 = unlimited)
        #[arg(short, long, default_value = "0")]
        bandwidth: u64,

        /// Number of parallel streams
        #[arg(short = 'P', long, default_value = "1")]
        parallel: usize,

        /// Run in reverse mode (server sends, client receives)
        #[arg(short = 'R', long)]
        reverse: bool,

        /// Interval for periodic reports in seconds
        #[arg(short, long, default_value = "1")]
        interval: u64,

        /// Output the final result as JSON
        #[arg(short = 'J', long)]
        json: bool,
    },
}

fn print_interval(report: &IntervalReport) {
    let metric = match (report.rtt_us, report.jitter_ms) {
        (Some(rtt), _) => format!("{:7.0} us rtt", rtt),
        (_, Some(jitter)) => format!(
            "{:6.3} ms jitter  {:4} lost",
            jitter,
            report.lost_packets.unwrap_or(0)
        ),
        _ => String::new(),
    };
    println!(
        "[{:3}]  {:5.2}-{:5.2} sec  {:8.2} MBytes  {:8.2} Mbits/sec  {}",
        report.interval_index,
        report.start.as_secs_f64(),
        report.end.as_secs_f64(),
        report.bytes_transferred as f64 / 1_000_000.0,
        report.mbps(),
        metric
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let engine = Engine::new();

    match cli.command {
        Commands::Server { port, udp } => {
            let protocol = if udp { Protocol::Udp } else { Protocol::Tcp };
            let observer: Arc<dyn netgauge::ProgressObserver> =
                Arc::new(|report: &IntervalReport| print_interval(report));
            engine
                .start_server(port, protocol, Some(observer))
                .await
                .map_err(|e| anyhow::anyhow!("could not start server: {}", e))?;
            println!(
                "{} server listening on {} ({})",
                engine.version(),
                engine
                    .server_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_default(),
                protocol.as_str()
            );

            tokio::signal::ctrl_c().await?;
            engine.stop_server();
            println!("server stopped");
        }

        Commands::Client {
            server,
            port,
            udp,
            time,
            bandwidth,
            parallel,
            reverse,
            interval,
            json,
        } => {
            let protocol = if udp { Protocol::Udp } else { Protocol::Tcp };
            let config = SessionConfig::new(server, port)
                .with_protocol(protocol)
                .with_duration(Duration::from_secs(time))
                .with_parallel(parallel)
                .with_reverse(reverse)
                .with_bandwidth(bandwidth * 1_000_000)
                .with_interval(Duration::from_secs(interval.max(1)));

            let observer = if json {
                None
            } else {
                println!("[ ID]  Interval         Transfer         Bitrate");
                Some(Arc::new(|report: &IntervalReport| print_interval(report))
                    as Arc<dyn netgauge::ProgressObserver>)
            };

            let result = engine.run_client(config, observer).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("- - - - - - - - - - - - - - - - - - - - - - - - -");
                println!(
                    "{:?}: {:.2} MBytes in {:.2} sec = {:.2} Mbits/sec",
                    result.outcome,
                    result.bytes_transferred as f64 / 1_000_000.0,
                    result.duration.as_secs_f64(),
                    result.mbps()
                );
                if let Some(rtt) = result.rtt_us {
                    println!("rtt: {:.0} us", rtt);
                }
                if let Some(jitter) = result.jitter_ms {
                    println!(
                        "jitter: {:.3} ms, lost: {}/{} datagrams",
                        jitter,
                        result.lost_packets.unwrap_or(0),
                        result.packets.unwrap_or(0)
                    );
                }
                if let Some(error) = &result.error {
                    eprintln!("session error: {}", error);
                }
            }

            if result.outcome == SessionOutcome::Failed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
