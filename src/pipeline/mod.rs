//! Ingestion Pipeline
//!
//! ```text
//! BatchSource ──► ProcessingLoop ──► Inventory::ingest ──► TagEngine (blocking pool)
//!                                          │
//!                                          └──► ChangePublisher (non-blocking)
//! DepartureSweeper ──(interval)──► Inventory::sweep ──► same two steps
//! ```

pub mod processing_loop;
pub mod source;
pub mod sweeper;

pub use processing_loop::{Clock, LoopStats, ProcessingLoop};
pub use sweeper::DepartureSweeper;

use std::sync::Arc;
use tracing::{debug, warn};

use crate::engine::{EngineError, IngestOutcome, TagEngine};
use crate::publisher::{BatchMeta, ChangePublisher, PublishEvent};
use crate::types::ReadBatch;

/// Result of sweeping several facilities.
#[derive(Debug, Default)]
pub struct SweepSummary {
    pub departed: usize,
    /// Facilities whose sweep failed, with the error
    pub failures: Vec<(String, EngineError)>,
}

/// Engine plus publisher: every commit that changes tags is published.
#[derive(Clone)]
pub struct Inventory {
    engine: Arc<TagEngine>,
    publisher: ChangePublisher,
}

impl Inventory {
    pub fn new(engine: Arc<TagEngine>, publisher: ChangePublisher) -> Self {
        Self { engine, publisher }
    }

    pub fn engine(&self) -> &Arc<TagEngine> {
        &self.engine
    }

    pub fn publisher(&self) -> &ChangePublisher {
        &self.publisher
    }

    /// Ingest on the blocking pool, then enqueue the commit for fan-out.
    ///
    /// Returns whether the commit made it into the publish queue alongside
    /// the outcome.
    pub async fn ingest(&self, batch: ReadBatch, now: i64) -> anyhow::Result<(IngestOutcome, bool)> {
        let meta = BatchMeta::from(&batch);
        let engine = Arc::clone(&self.engine);
        let outcome = tokio::task::spawn_blocking(move || engine.ingest(batch, now)).await??;
        let published = self.publish(PublishEvent::from_ingest(&meta, &outcome));
        Ok((outcome, published))
    }

    /// Age out silent tags of each facility and publish the departures.
    ///
    /// Facilities are swept one at a time and each commit is published as
    /// soon as it lands. A facility that fails is logged and reported in the
    /// summary; the rest are still swept.
    pub async fn sweep(&self, facility_ids: Vec<String>, now: i64) -> anyhow::Result<SweepSummary> {
        let mut summary = SweepSummary::default();
        for facility_id in facility_ids {
            let engine = Arc::clone(&self.engine);
            let id = facility_id.clone();
            match tokio::task::spawn_blocking(move || engine.force_departure_sweep(&id, now)).await? {
                Ok(outcome) => {
                    summary.departed += outcome.departed.len();
                    self.publish(PublishEvent::from_sweep(&facility_id, &outcome));
                }
                Err(e) => {
                    warn!(facility = %facility_id, error = %e, "Departure sweep failed for facility");
                    summary.failures.push((facility_id, e));
                }
            }
        }
        Ok(summary)
    }

    /// Delete every tag and notify downstream consumers.
    pub async fn delete_all(&self) -> anyhow::Result<usize> {
        let engine = Arc::clone(&self.engine);
        let removed = tokio::task::spawn_blocking(move || engine.delete_all()).await??;
        self.publish(Some(PublishEvent::tags_deleted(removed)));
        Ok(removed)
    }

    fn publish(&self, event: Option<PublishEvent>) -> bool {
        let Some(event) = event else {
            return false;
        };
        let id = event.id().to_string();
        match self.publisher.publish(event) {
            Ok(()) => {
                debug!(%id, "Commit queued for publishing");
                true
            }
            Err(e) => {
                warn!(%id, error = %e, "Commit not published");
                false
            }
        }
    }
}
