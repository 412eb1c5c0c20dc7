//! metersrv entry point.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::time::sleep;
use tracing::{error, info};

use metersrv::backlog::BacklogStore;
use metersrv::config::Config;
use metersrv::logging;
use metersrv::probe;
use metersrv::reading::REGISTER_FIELDS;
use metersrv::service::MeterService;
use metersrv::transport::ModbusRtuSource;
use metersrv::uplink::CollectorClient;

#[derive(Parser, Debug)]
#[command(author, version, about = "metersrv - power-quality meter forwarder")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CONFIG_FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check configuration and environment without polling the device
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    let _log_guard = logging::init(&config.log)?;
    config.validate()?;

    match args.command {
        Some(Commands::Check) => check_config(config).await,
        None => run_service(config).await,
    }
}

async fn run_service(config: Config) -> anyhow::Result<()> {
    info!("starting metersrv v{}", env!("CARGO_PKG_VERSION"));

    // A missing device at startup takes the same grace-then-exit path as a
    // device lost mid-run, so a supervisor restart does not spin.
    let source = match ModbusRtuSource::open(&config.device, config.meter.id) {
        Ok(source) => source,
        Err(e) if e.is_fatal() => {
            error!("unrecoverable device fault at startup: {e}");
            sleep(config.service.fatal_grace()).await;
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };
    let sink = CollectorClient::new(&config.uplink)?;
    let service = MeterService::new(config, source, sink)?;

    service.run().await?;
    Ok(())
}

/// Report configuration, backlog state and collector reachability.
async fn check_config(config: Config) -> anyhow::Result<()> {
    println!("=== metersrv configuration check ===\n");

    println!("--- Meter ---");
    println!("unit id: {}", config.meter.id);

    println!("\n--- Device ---");
    println!("path: {}", config.device.path);
    println!(
        "line: {} baud, {} data bits, {} parity, {} stop bits",
        config.device.baud_rate, config.device.data_bits, config.device.parity, config.device.stop_bits
    );
    println!("response timeout: {} ms", config.device.response_timeout_ms);

    println!("\n--- Registers ---");
    println!("{} register-backed fields:", config.registers.len());
    for (address, field) in config.registers.iter().zip(REGISTER_FIELDS.iter()) {
        println!("  {address:>5}  {field}");
    }

    println!("\n--- Uplink ---");
    println!("collector: {}", config.uplink.base_url);
    let (host, port) = config.uplink.probe_target()?;
    print!("reachability probe ({host}:{port}): ");
    if probe::is_reachable(&host, port, config.uplink.probe_timeout()).await {
        println!("ok");
    } else {
        println!("UNREACHABLE (readings will queue to the backlog)");
    }

    println!("\n--- Backlog ---");
    let backlog = BacklogStore::new(&config.backlog.path);
    backlog.ensure_initialized()?;
    let pending = backlog.read_all()?;
    println!("path: {}", backlog.path().display());
    println!("pending readings: {}", pending.len());

    println!("\nall checks passed");
    Ok(())
}
