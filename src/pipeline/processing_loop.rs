//! Batch processing loop shared by the stdin and replay input modes.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::source::{BatchEvent, BatchSource};
use super::Inventory;
use crate::types::{now_millis, ReadBatch};

/// Where the ingest `now` comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Clock {
    /// Wall-clock time
    #[default]
    Wall,
    /// Newest read timestamp seen so far, for replaying recorded traffic
    ReadTime,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct LoopStats {
    pub batches: u64,
    pub reads_received: u64,
    pub reads_admitted: u64,
    pub problems: u64,
    pub tags_updated: u64,
    pub state_changes: u64,
    pub aged_out: u64,
    pub handheld_sessions: u64,
    pub published: u64,
    /// Batches that failed as a whole (store errors)
    pub failed_batches: u64,
}

/// Owns the state needed to drain one source through the inventory.
pub struct ProcessingLoop {
    inventory: Inventory,
    cancel_token: CancellationToken,
    clock: Clock,
    replay_now: i64,
}

impl ProcessingLoop {
    pub fn new(inventory: Inventory, cancel_token: CancellationToken) -> Self {
        Self {
            inventory,
            cancel_token,
            clock: Clock::Wall,
            replay_now: 0,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now_for(&mut self, batch: &ReadBatch) -> i64 {
        match self.clock {
            Clock::Wall => now_millis(),
            Clock::ReadTime => {
                let newest = batch.reads.iter().map(|r| r.timestamp).max().unwrap_or(0);
                self.replay_now = self.replay_now.max(newest);
                self.replay_now
            }
        }
    }

    /// Run until the source is exhausted or cancellation.
    pub async fn run<S: BatchSource>(mut self, source: &mut S) -> LoopStats {
        let mut stats = LoopStats::default();
        info!(source = source.source_name(), "[BatchProcessor] Processing read batches");

        loop {
            let event = tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("[BatchProcessor] Shutdown signal received");
                    break;
                }
                result = source.next_batch() => {
                    match result {
                        Ok(ev) => ev,
                        Err(e) => {
                            warn!("[BatchProcessor] Source error: {}", e);
                            break;
                        }
                    }
                }
            };

            let batch = match event {
                BatchEvent::Batch(b) => b,
                BatchEvent::Eof => {
                    info!(batches = stats.batches, "[BatchProcessor] Source reached end");
                    break;
                }
            };

            stats.batches += 1;
            let now = self.now_for(&batch);
            match self.inventory.ingest(batch, now).await {
                Ok((outcome, published)) => {
                    let s = outcome.stats;
                    stats.reads_received += s.received as u64;
                    stats.reads_admitted += s.admitted as u64;
                    stats.problems += outcome.problems.len() as u64;
                    stats.tags_updated += s.updated as u64;
                    stats.state_changes += s.changed as u64;
                    stats.aged_out += s.aged_out as u64;
                    stats.handheld_sessions += outcome.handheld_events.len() as u64;
                    stats.published += u64::from(published);

                    for problem in &outcome.problems {
                        debug!(
                            index = problem.index,
                            epc = %problem.epc,
                            device = %problem.device_id,
                            reason = %problem.reason,
                            "Read rejected"
                        );
                    }
                    if !outcome.problems.is_empty() {
                        warn!(rejected = outcome.problems.len(), "Batch contained invalid reads");
                    }
                    for change in &outcome.changes {
                        info!(
                            epc = change.epc(),
                            from = %change.previous_state(),
                            to = %change.current_state(),
                            location = %change.current.location,
                            "Tag state changed"
                        );
                    }
                }
                Err(e) => {
                    stats.failed_batches += 1;
                    error!("[BatchProcessor] Batch aborted: {:#}", e);
                }
            }

            if stats.batches % 100 == 0 {
                info!(
                    batches = stats.batches,
                    reads = stats.reads_received,
                    changes = stats.state_changes,
                    "Progress"
                );
            }
        }

        info!(?stats, "[BatchProcessor] Final statistics");
        stats
    }
}
