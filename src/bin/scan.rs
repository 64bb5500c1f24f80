//! Device fingerprint scan
//!
//! Probes serial ports for Modbus slaves and identifies them against the
//! catalogue. Results are printed as JSON, or written to `--output`.
//!
//! Usage: cargo run --bin scan -- /dev/ttyUSB0 /dev/ttyUSB1 --fast

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;
use voltage_gateway::scanner::{ScanOptions, SerialOpener};
use voltage_gateway::{logging, IdentificationCatalog, MapLibrary, Parity, Scanner};

#[derive(Parser, Debug)]
#[command(author, version, about = "Identify Modbus devices on serial ports")]
struct Args {
    /// Serial ports to scan
    #[arg(required = true)]
    ports: Vec<String>,

    /// Identification catalogue
    #[arg(long, value_name = "FILE", default_value = "auto_config_details.json")]
    catalog: PathBuf,

    /// Register maps keyed by part number
    #[arg(long, value_name = "FILE", default_value = "modbus_registers.json")]
    maps: PathBuf,

    /// Baud rates to try, in order
    #[arg(long = "baud", value_delimiter = ',')]
    bauds: Vec<u32>,

    /// Parities to try, in order (N, E, O)
    #[arg(long = "parity", value_delimiter = ',')]
    parities: Vec<Parity>,

    /// Highest slave id to probe
    #[arg(long, default_value_t = 60)]
    last_slave: u8,

    /// Ping every slave id at a short timeout before probing
    #[arg(long)]
    fast: bool,

    /// Stop a port after this many devices
    #[arg(long)]
    max_devices: Option<usize>,

    /// Write identities to this file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level).context("initialising logging")?;

    if !(1..=247).contains(&args.last_slave) {
        bail!("--last-slave must be within 1..=247");
    }

    let catalog = IdentificationCatalog::load(&args.catalog)
        .with_context(|| format!("catalogue {}", args.catalog.display()))?;
    let maps = MapLibrary::load(&args.maps)
        .with_context(|| format!("register maps {}", args.maps.display()))?;

    let mut options = ScanOptions {
        slaves: (1..=args.last_slave).collect(),
        fast_discovery: args.fast,
        max_devices: args.max_devices,
        ..ScanOptions::default()
    };
    if !args.bauds.is_empty() {
        options.bauds = args.bauds.clone();
    }
    if !args.parities.is_empty() {
        options.parities = args.parities.clone();
    }

    let mut scanner = Scanner::new(SerialOpener, catalog, &maps).with_options(options);
    let found = scanner.scan_ports(&args.ports).await;

    let stats = scanner.stats();
    info!(
        "scan finished: {} devices, {} pings, {} probes, {} verifications",
        found.len(),
        stats.pings,
        stats.probes,
        stats.verifications
    );

    let json = serde_json::to_string_pretty(&found)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            info!("identities written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
