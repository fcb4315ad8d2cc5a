use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodwatch::capture::available_interfaces;
use floodwatch::{Config, Pipeline, Snapshot};

#[derive(Debug, Parser)]
#[command(name = "floodwatch", about = "Real-time packet flood visibility")]
struct Args {
    /// YAML config file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Capture interface(s); overrides the config file. Repeatable.
    #[arg(short, long)]
    interface: Vec<String>,

    /// Threshold multiple over the learned baseline rate.
    #[arg(long)]
    sensitivity: Option<f64>,

    /// Events/sec floor below which nothing ever alerts.
    #[arg(long)]
    floor: Option<f64>,

    /// Seconds before the same flow/metric may re-alert.
    #[arg(long)]
    cooldown: Option<u64>,

    /// Print capture devices and exit.
    #[arg(long)]
    list_interfaces: bool,

    /// Emit each snapshot as a JSON line instead of log summaries.
    #[arg(long)]
    json: bool,

    /// Seconds between status summaries.
    #[arg(long, default_value_t = 2)]
    refresh: u64,
}

fn build_config(args: &Args) -> Result<Config, floodwatch::ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if !args.interface.is_empty() {
        config.interfaces = args.interface.clone();
    }
    if let Some(sensitivity) = args.sensitivity {
        config.sensitivity_factor = sensitivity;
    }
    if let Some(floor) = args.floor {
        config.absolute_floor = floor;
    }
    if let Some(cooldown) = args.cooldown {
        config.cooldown_secs = cooldown;
    }
    config.validate()?;
    Ok(config)
}

fn summarize(snapshot: &Snapshot) {
    info!(
        frames = snapshot.totals.frames,
        bytes = snapshot.totals.bytes,
        malformed = snapshot.totals.malformed,
        overruns = snapshot.totals.overruns,
        flows = snapshot.flows.len(),
        alerts = snapshot.alerts.len(),
        "pipeline status"
    );

    let mut flows: Vec<_> = snapshot.flows.iter().collect();
    flows.sort_by(|a, b| {
        b.shortest()
            .counts
            .packets
            .cmp(&a.shortest().counts.packets)
    });
    for flow in flows.iter().take(5) {
        let stats = flow.shortest();
        if stats.counts.packets == 0 {
            continue;
        }
        info!(
            flow = %flow.key,
            packets = stats.counts.packets,
            rate_per_sec = stats.packet_rate,
            "top talker"
        );
    }

    for interface in &snapshot.interfaces {
        if interface.stale {
            warn!(
                interface = %interface.name,
                error = interface.last_error.as_deref().unwrap_or("unknown"),
                "interface is stale; its counters are no longer advancing"
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.list_interfaces {
        for name in available_interfaces()? {
            println!("{}", name);
        }
        return Ok(());
    }

    let config = build_config(&args)?;
    let mut pipeline = Pipeline::new(config)?;
    pipeline.start()?;
    let publisher = pipeline.publisher();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::Relaxed);
    })?;

    // The display side is a plain polling consumer: it reads published
    // snapshots on its own cadence and can never slow down ingestion.
    let mut ticker = tokio::time::interval(Duration::from_secs(args.refresh.max(1)));
    let mut seen_alerts = 0;
    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        let snapshot = publisher.current();
        if args.json {
            println!("{}", serde_json::to_string(&*snapshot)?);
        } else {
            summarize(&snapshot);
            for alert in snapshot.alerts.iter().skip(seen_alerts) {
                warn!(severity = ?alert.severity, "{}", alert.message());
            }
            seen_alerts = snapshot.alerts.len();
        }
    }

    pipeline.shutdown(Duration::from_secs(3));
    Ok(())
}
