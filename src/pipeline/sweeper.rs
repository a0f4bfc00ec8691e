//! Periodic departure sweep.
//!
//! Ingest only ages out tags in the facilities a batch touches. A facility
//! whose readers go quiet would otherwise keep its tags present forever, so
//! this task sweeps every active facility on a fixed interval.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Inventory;
use crate::facility::FacilityRegistry;
use crate::types::now_millis;

pub struct DepartureSweeper {
    inventory: Inventory,
    facilities: Arc<FacilityRegistry>,
    interval: Duration,
    cancel_token: CancellationToken,
}

impl DepartureSweeper {
    pub fn new(
        inventory: Inventory,
        facilities: Arc<FacilityRegistry>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            inventory,
            facilities,
            interval,
            cancel_token,
        }
    }

    /// One pass over every active facility at `now`.
    pub async fn sweep_once(&self, now: i64) -> usize {
        let ids = self.facilities.active_ids();
        match self.inventory.sweep(ids, now).await {
            Ok(summary) => {
                if !summary.failures.is_empty() {
                    warn!(failed = summary.failures.len(), "[DepartureSweeper] Some facilities were not swept");
                }
                summary.departed
            }
            Err(e) => {
                warn!("[DepartureSweeper] Sweep failed: {:#}", e);
                0
            }
        }
    }

    /// Sweep on every tick until cancelled. Returns the total departures.
    pub async fn run(self) -> usize {
        info!(interval_secs = self.interval.as_secs(), "[DepartureSweeper] Started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so startup is not a sweep
        ticker.tick().await;

        let mut total = 0;
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    let departed = self.sweep_once(now_millis()).await;
                    if departed > 0 {
                        info!(departed, "[DepartureSweeper] Tags aged out");
                    }
                    total += departed;
                }
            }
        }
        info!(total, "[DepartureSweeper] Stopped");
        total
    }
}
