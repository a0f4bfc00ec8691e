//! Change Publisher - asynchronous fan-out of committed tag changes
//!
//! ```text
//! engine commit ──► ChangePublisher::publish (try_send, never waits)
//!                        │ bounded mpsc
//!                        ▼
//!                  PublisherWorker ──► sink A ┐
//!                                  ──► sink B ├ concurrently, each under its own timeout
//!                                  ──► sink C ┘
//! ```
//!
//! A full queue drops the event and counts it. Sink failures and timeouts
//! are logged and counted; they never reach the ingest path.

mod timeseries;
mod webhook;

pub use timeseries::{ChangeRecord, TimeSeriesSink};
pub use webhook::WebhookSink;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults;
use crate::engine::{IngestOutcome, SweepOutcome};
use crate::types::{now_millis, ReadBatch, ReadSource, Tag, TagStateChange};

// ============================================================================
// Events
// ============================================================================

/// Tags touched by one commit, with the presence changes among them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeBatch {
    pub id: String,
    pub sent_on: i64,
    /// `None` for commits not driven by reads (departure sweeps)
    pub source: Option<ReadSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_id: Option<String>,
    #[serde(default)]
    pub facility_scope: Vec<String>,
    pub tags: Vec<Tag>,
    pub changes: Vec<TagStateChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PublishEvent {
    StateChanges(ChangeBatch),
    /// The whole tag collection was deleted
    TagsDeleted { id: String, sent_on: i64, removed: usize },
}

impl PublishEvent {
    /// Event for an ingest commit; `None` when the batch wrote nothing.
    pub fn from_ingest(batch: &BatchMeta, outcome: &IngestOutcome) -> Option<Self> {
        if outcome.updated.is_empty() {
            return None;
        }
        Some(Self::StateChanges(ChangeBatch {
            id: uuid::Uuid::new_v4().to_string(),
            sent_on: now_millis(),
            source: Some(batch.source),
            controller_id: batch.controller_id.clone(),
            facility_scope: batch.facility_scope.clone(),
            tags: outcome.updated.clone(),
            changes: outcome.changes.clone(),
        }))
    }

    /// Event for a departure sweep; `None` when nothing departed.
    pub fn from_sweep(facility_id: &str, outcome: &SweepOutcome) -> Option<Self> {
        if outcome.departed.is_empty() {
            return None;
        }
        Some(Self::StateChanges(ChangeBatch {
            id: uuid::Uuid::new_v4().to_string(),
            sent_on: now_millis(),
            source: None,
            controller_id: None,
            facility_scope: vec![facility_id.to_string()],
            tags: outcome.departed.clone(),
            changes: outcome.changes.clone(),
        }))
    }

    pub fn tags_deleted(removed: usize) -> Self {
        Self::TagsDeleted {
            id: uuid::Uuid::new_v4().to_string(),
            sent_on: now_millis(),
            removed,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::StateChanges(batch) => &batch.id,
            Self::TagsDeleted { id, .. } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateChanges(_) => "state_changes",
            Self::TagsDeleted { .. } => "tags_deleted",
        }
    }

    /// Presence changes carried by this event (empty for deletions).
    pub fn changes(&self) -> &[TagStateChange] {
        match self {
            Self::StateChanges(batch) => &batch.changes,
            Self::TagsDeleted { .. } => &[],
        }
    }
}

/// Batch attributes that travel with the published event. Captured before
/// the batch is handed to the engine, which consumes it.
#[derive(Debug, Clone, Default)]
pub struct BatchMeta {
    pub source: ReadSource,
    pub controller_id: Option<String>,
    pub facility_scope: Vec<String>,
}

impl From<&ReadBatch> for BatchMeta {
    fn from(batch: &ReadBatch) -> Self {
        Self {
            source: batch.source,
            controller_id: batch.controller_id.clone(),
            facility_scope: batch.facility_scope.clone(),
        }
    }
}

// ============================================================================
// Sinks
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("endpoint returned status {0}")]
    Status(u16),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Downstream consumer of published events.
#[async_trait]
pub trait PublishSink: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this sink wants the event at all.
    fn accepts(&self, _event: &PublishEvent) -> bool {
        true
    }

    async fn publish(&self, event: &PublishEvent) -> Result<(), SinkError>;
}

// ============================================================================
// Publisher Handle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("publish queue is full, event dropped")]
    QueueFull,
    #[error("publisher worker has stopped")]
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct PublisherSettings {
    pub queue_capacity: usize,
    pub sink_timeout: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::PUBLISH_QUEUE_CAPACITY,
            sink_timeout: Duration::from_secs(defaults::SINK_TIMEOUT_SECS),
        }
    }
}

impl From<&crate::config::PublisherConfig> for PublisherSettings {
    fn from(cfg: &crate::config::PublisherConfig) -> Self {
        Self {
            queue_capacity: cfg.queue_capacity,
            sink_timeout: Duration::from_secs(cfg.sink_timeout_secs),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of the publisher counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct PublisherStats {
    pub enqueued: u64,
    pub dropped: u64,
    /// Successful sink deliveries (one event to three sinks counts three)
    pub delivered: u64,
    pub failed: u64,
}

/// Cloneable handle used by the ingest path.
#[derive(Clone)]
pub struct ChangePublisher {
    tx: mpsc::Sender<PublishEvent>,
    counters: Arc<Counters>,
}

impl ChangePublisher {
    /// Enqueue without waiting. A full queue drops the event.
    pub fn publish(&self, event: PublishEvent) -> Result<(), PublishError> {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(id = event.id(), kind = event.kind(), "Publish queue full, dropping event");
                Err(PublishError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(id = event.id(), kind = event.kind(), "Publisher stopped, dropping event");
                Err(PublishError::Closed)
            }
        }
    }

    pub fn stats(&self) -> PublisherStats {
        self.counters.snapshot()
    }
}

impl Counters {
    fn snapshot(&self) -> PublisherStats {
        PublisherStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

pub struct PublisherWorker {
    rx: mpsc::Receiver<PublishEvent>,
    sinks: Vec<Arc<dyn PublishSink>>,
    sink_timeout: Duration,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

/// Create the publisher handle and the worker that drains it.
pub fn channel(
    sinks: Vec<Arc<dyn PublishSink>>,
    settings: PublisherSettings,
    cancel: CancellationToken,
) -> (ChangePublisher, PublisherWorker) {
    let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
    let counters = Arc::new(Counters::default());
    let handle = ChangePublisher {
        tx,
        counters: Arc::clone(&counters),
    };
    let worker = PublisherWorker {
        rx,
        sinks,
        sink_timeout: settings.sink_timeout,
        counters,
        cancel,
    };
    (handle, worker)
}

impl PublisherWorker {
    /// Dispatch events until every handle is dropped or the token is
    /// cancelled. On cancellation, events already queued are still delivered.
    pub async fn run(mut self) -> PublisherStats {
        let names: Vec<&str> = self.sinks.iter().map(|s| s.name()).collect();
        info!(sinks = ?names, "[Publisher] Worker started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.rx.close();
                    let mut drained = 0usize;
                    while let Some(event) = self.rx.recv().await {
                        self.dispatch(&event).await;
                        drained += 1;
                    }
                    info!(drained, "[Publisher] Shutdown requested, queue drained");
                    break;
                }
                next = self.rx.recv() => {
                    match next {
                        Some(event) => self.dispatch(&event).await,
                        None => {
                            info!("[Publisher] All handles dropped");
                            break;
                        }
                    }
                }
            }
        }

        let stats = self.counters.snapshot();
        info!(?stats, "[Publisher] Worker stopped");
        stats
    }

    async fn dispatch(&self, event: &PublishEvent) {
        let timeout = self.sink_timeout;
        let deliveries = self
            .sinks
            .iter()
            .filter(|sink| sink.accepts(event))
            .map(|sink| async move {
                match tokio::time::timeout(timeout, sink.publish(event)).await {
                    Ok(Ok(())) => {
                        debug!(sink = sink.name(), id = event.id(), "Event delivered");
                        true
                    }
                    Ok(Err(e)) => {
                        warn!(sink = sink.name(), id = event.id(), error = %e, "Sink rejected event");
                        false
                    }
                    Err(_) => {
                        warn!(
                            sink = sink.name(),
                            id = event.id(),
                            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                            "Sink timed out"
                        );
                        false
                    }
                }
            });

        for ok in join_all(deliveries).await {
            let counter = if ok {
                &self.counters.delivered
            } else {
                &self.counters.failed
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}
