//! Voltage Gateway
//!
//! Loads the installer configuration, builds the device fleet and polls it
//! until Ctrl-C. Decoded snapshots are logged as JSON once per interval.
//!
//! Usage: cargo run --bin gateway -- --config gateway.json

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use voltage_gateway::{logging, EnergyLedger, FleetRegistry, GatewayConfig, MapLibrary};

#[derive(Parser, Debug)]
#[command(author, version, about = "Modbus edge gateway")]
struct Args {
    /// Configuration file (JSON)
    #[arg(short, long, value_name = "FILE", env = "VGW_CONFIG")]
    config: Option<PathBuf>,

    /// Log level, overrides the configured one
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Log every frame in hex
    #[arg(long)]
    packet_logging: bool,

    /// Validate configuration and maps, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = GatewayConfig::load(args.config.as_deref()).context("loading configuration")?;
    if args.packet_logging {
        config.packet_logging = true;
    }
    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    logging::init(level).context("initialising logging")?;

    info!("{}", voltage_gateway::info());

    let measurements = MapLibrary::load(&config.mappings_path)
        .with_context(|| format!("register maps {}", config.mappings_path.display()))?;
    let controls = if config.control_path.exists() {
        MapLibrary::load(&config.control_path)
            .with_context(|| format!("control maps {}", config.control_path.display()))?
    } else {
        warn!(
            "control maps {} not found, devices are read-only",
            config.control_path.display()
        );
        MapLibrary::default()
    };

    let registry = FleetRegistry::from_config(&config, &measurements, &controls)
        .context("building device fleet")?;

    if args.check {
        for group in registry.groups() {
            info!("{}: {}", group.bus, group.device_ids.join(", "));
        }
        info!("configuration ok, {} polled devices", registry.len());
        return Ok(());
    }

    if registry.is_empty() {
        warn!("no polled devices configured");
    }

    let token = CancellationToken::new();
    let mut handles = registry.spawn_pollers(config.poll_interval(), token.clone());
    let mut ledger = EnergyLedger::load(&config.energy_log_path);

    let mut ticker = interval(config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("signal handler failed: {}", e);
                }
                info!("shutting down");
                break;
            }
            _ = ticker.tick() => {
                for snapshot in registry.report(&mut ledger).await {
                    match serde_json::to_string(&snapshot) {
                        Ok(json) => info!("{}", json),
                        Err(e) => warn!("{}: snapshot not serialised: {}", snapshot.device_id, e),
                    }
                }
            }
        }
    }

    token.cancel();
    for handle in handles.drain(..) {
        if let Err(e) = handle.await {
            warn!("poller ended abnormally: {}", e);
        }
    }
    ledger.save().context("saving energy log")?;
    Ok(())
}
