//! Fire-and-forget liveness ping: POSTs the current timestamp and meter id
//! to the collector's `/ping/` endpoint. Not retried, not persisted; meant
//! to run from cron or a systemd timer alongside the main service.

use std::path::PathBuf;

use clap::Parser;

use metersrv::config::Config;
use metersrv::uplink;

#[derive(Parser, Debug)]
#[command(author, version, about = "meterping - collector liveness signal")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CONFIG_FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    config.validate()?;

    uplink::send_ping(
        &config.uplink.base_url,
        config.meter.id,
        config.uplink.request_timeout(),
    )
    .await?;

    Ok(())
}
