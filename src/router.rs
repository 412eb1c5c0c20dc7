//! Online/offline delivery state machine.
//!
//! The router owns the backlog's durability contract. The new reading is
//! always appended before any network I/O, so a crash between decode and
//! transmit can never lose it. An online cycle replays the entire backlog in
//! stored order and truncates it only after every entry is acknowledged; a
//! mid-replay failure leaves the backlog fully intact and the next cycle
//! retries from the start. Delivery is therefore at-least-once; the
//! collector deduplicates if it needs exactly-once.

use tracing::{debug, info, warn};

use crate::backlog::BacklogStore;
use crate::error::Result;
use crate::reading::Reading;
use crate::uplink::ReadingSink;

/// Reachability of the collector, recomputed every cycle. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Online,
    Offline,
}

/// What a routed cycle did with its reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Appended to the backlog; no network I/O attempted.
    Queued,
    /// Entire backlog, including the new reading, delivered and truncated.
    Flushed { delivered: usize },
}

pub struct DeliveryRouter<S: ReadingSink> {
    backlog: BacklogStore,
    sink: S,
}

impl<S: ReadingSink> DeliveryRouter<S> {
    pub fn new(backlog: BacklogStore, sink: S) -> Self {
        Self { backlog, sink }
    }

    pub fn backlog(&self) -> &BacklogStore {
        &self.backlog
    }

    /// Route one freshly collected reading.
    ///
    /// Exclusive ownership (`&mut self`) makes the append-replay-clear
    /// sequence atomic with respect to any other writer.
    pub async fn route(&mut self, reading: Reading, state: ConnectivityState) -> Result<RouteOutcome> {
        self.backlog.append(&reading)?;

        match state {
            ConnectivityState::Offline => {
                debug!(timestamp = %reading.timestamp, "collector offline, reading queued");
                Ok(RouteOutcome::Queued)
            }
            ConnectivityState::Online => {
                let pending = self.backlog.read_all()?;
                for (index, entry) in pending.iter().enumerate() {
                    if let Err(e) = self.sink.send(entry).await {
                        warn!(
                            sent = index,
                            pending = pending.len(),
                            "flush aborted, backlog retained: {e}"
                        );
                        return Err(e);
                    }
                }
                self.backlog.clear()?;
                if pending.len() > 1 {
                    info!(delivered = pending.len(), "backlog flushed");
                }
                Ok(RouteOutcome::Flushed {
                    delivered: pending.len(),
                })
            }
        }
    }
}
