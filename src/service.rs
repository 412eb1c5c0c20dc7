//! Outer polling scheduler.
//!
//! Owns retry and backoff policy, decoupled from decode and delivery logic.
//! Each cycle runs strictly sequentially: probe connectivity, acquire a
//! reading, route it. Recoverable faults end the cycle and the loop retries
//! after the inter-cycle delay; an unreachable device terminates the
//! process after a grace delay so a supervisor can restart it cleanly.

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::backlog::BacklogStore;
use crate::collector::ReadingCollector;
use crate::config::Config;
use crate::error::Result;
use crate::probe;
use crate::router::{ConnectivityState, DeliveryRouter, RouteOutcome};
use crate::transport::RegisterSource;
use crate::uplink::ReadingSink;

pub struct MeterService<Src: RegisterSource, Snk: ReadingSink> {
    config: Config,
    collector: ReadingCollector,
    source: Src,
    router: DeliveryRouter<Snk>,
    probe_host: String,
    probe_port: u16,
}

impl<Src: RegisterSource, Snk: ReadingSink> MeterService<Src, Snk> {
    /// Wire up the pipeline from validated configuration. Initializes the
    /// backlog store, creating it empty if absent.
    pub fn new(config: Config, source: Src, sink: Snk) -> Result<Self> {
        let backlog = BacklogStore::new(&config.backlog.path);
        backlog.ensure_initialized()?;

        let (probe_host, probe_port) = config.uplink.probe_target()?;
        let collector = ReadingCollector::new(&config);

        Ok(Self {
            config,
            collector,
            source,
            router: DeliveryRouter::new(backlog, sink),
            probe_host,
            probe_port,
        })
    }

    /// Run the polling loop until a fatal fault.
    pub async fn run(mut self) -> Result<()> {
        info!(
            meter_id = self.config.meter.id,
            device = %self.config.device.path,
            collector = %self.config.uplink.base_url,
            "meter service started"
        );

        loop {
            match self.run_cycle().await {
                Ok(RouteOutcome::Queued) => {
                    info!("reading queued to backlog (collector offline)");
                }
                Ok(RouteOutcome::Flushed { delivered }) => {
                    info!(delivered, "reading delivered");
                }
                Err(e) if e.is_fatal() => {
                    error!("unrecoverable device fault: {e}");
                    sleep(self.config.service.fatal_grace()).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!("cycle failed, retrying next cycle: {e}");
                }
            }

            sleep(self.config.service.cycle_delay()).await;
        }
    }

    /// One complete cycle: probe, collect, route.
    pub async fn run_cycle(&mut self) -> Result<RouteOutcome> {
        let online = probe::is_reachable(
            &self.probe_host,
            self.probe_port,
            self.config.uplink.probe_timeout(),
        )
        .await;
        let state = if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        };
        debug!(?state, "connectivity probed");

        let host_address = probe::local_ip();
        let reading = self.collector.collect(&mut self.source, &host_address).await?;

        self.router.route(reading, state).await
    }

    pub fn backlog(&self) -> &BacklogStore {
        self.router.backlog()
    }
}
