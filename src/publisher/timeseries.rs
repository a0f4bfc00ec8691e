//! Time-series sink: one sled entry per presence change.
//!
//! Key layout is `recorded_at (i64 BE) ++ sled id (u64 BE)`, so a range scan
//! over timestamps returns changes in the order they were recorded.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use super::{PublishEvent, PublishSink, SinkError};
use crate::types::{TagEvent, TagState};

const CHANGES_TREE: &str = "state_changes";

/// One stored state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeRecord {
    pub recorded_at: i64,
    pub event_id: String,
    pub epc: String,
    pub facility_id: String,
    pub location: String,
    pub previous_state: TagState,
    pub current_state: TagState,
    pub event: TagEvent,
}

pub struct TimeSeriesSink {
    db: sled::Db,
    changes: sled::Tree,
}

fn storage(e: sled::Error) -> SinkError {
    SinkError::Storage(e.to_string())
}

fn key(recorded_at: i64, seq: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&recorded_at.to_be_bytes());
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

impl TimeSeriesSink {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(storage)?;
        let sink = Self::from_db(db)?;
        info!(path = %path.display(), entries = sink.changes.len(), "Time-series store opened");
        Ok(sink)
    }

    pub fn temporary() -> Result<Self, SinkError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(storage)?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, SinkError> {
        let changes = db.open_tree(CHANGES_TREE).map_err(storage)?;
        Ok(Self { db, changes })
    }

    /// Changes recorded in `[from, to)`, oldest first.
    pub fn range(&self, from: i64, to: i64) -> Result<Vec<ChangeRecord>, SinkError> {
        if from >= to {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in self.changes.range(key(from, 0)..key(to, 0)) {
            let (_, bytes) = entry.map_err(storage)?;
            records.push(serde_json::from_slice(&bytes)?);
        }
        Ok(records)
    }

    pub fn count(&self) -> usize {
        self.changes.len()
    }

    pub fn flush(&self) -> Result<(), SinkError> {
        self.db.flush().map_err(storage)?;
        Ok(())
    }
}

#[async_trait]
impl PublishSink for TimeSeriesSink {
    fn name(&self) -> &str {
        "time-series"
    }

    fn accepts(&self, event: &PublishEvent) -> bool {
        !event.changes().is_empty()
    }

    async fn publish(&self, event: &PublishEvent) -> Result<(), SinkError> {
        let PublishEvent::StateChanges(batch) = event else {
            return Ok(());
        };
        let mut writes = sled::Batch::default();
        for change in &batch.changes {
            let record = ChangeRecord {
                recorded_at: batch.sent_on,
                event_id: batch.id.clone(),
                epc: change.epc().to_string(),
                facility_id: change.current.facility_id.clone(),
                location: change.current.location.clone(),
                previous_state: change.previous_state(),
                current_state: change.current_state(),
                event: change.current.event,
            };
            let seq = self.db.generate_id().map_err(storage)?;
            writes.insert(key(batch.sent_on, seq).to_vec(), serde_json::to_vec(&record)?);
        }
        self.changes.apply_batch(writes).map_err(storage)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::ChangeBatch;
    use crate::types::{Tag, TagRead, TagStateChange};
    use tempfile::tempdir;

    fn event(sent_on: i64, epcs: &[&str]) -> PublishEvent {
        let changes = epcs
            .iter()
            .filter_map(|epc| {
                let mut tag = Tag::first_sighting(&TagRead::new(*epc, -50, sent_on, "floor-1", "F1"));
                tag.state = TagState::Present;
                TagStateChange::between(None, &tag)
            })
            .collect();
        PublishEvent::StateChanges(ChangeBatch {
            id: format!("evt-{sent_on}"),
            sent_on,
            source: None,
            controller_id: None,
            facility_scope: Vec::new(),
            tags: Vec::new(),
            changes,
        })
    }

    #[tokio::test]
    async fn test_records_and_ranges() {
        let sink = TimeSeriesSink::temporary().unwrap();
        sink.publish(&event(1_000, &["AA", "BB"])).await.unwrap();
        sink.publish(&event(2_000, &["CC"])).await.unwrap();
        sink.publish(&event(3_000, &["DD"])).await.unwrap();
        assert_eq!(sink.count(), 4);

        let window = sink.range(1_000, 3_000).unwrap();
        let epcs: Vec<&str> = window.iter().map(|r| r.epc.as_str()).collect();
        assert_eq!(epcs, vec!["AA", "BB", "CC"]);
        assert_eq!(window[0].previous_state, TagState::Unknown);
        assert_eq!(window[0].current_state, TagState::Present);
        assert!(sink.range(3_000, 3_000).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ignores_events_without_changes() {
        let sink = TimeSeriesSink::temporary().unwrap();
        assert!(!sink.accepts(&PublishEvent::tags_deleted(5)));
        assert!(!sink.accepts(&event(1_000, &[])));
        sink.publish(&PublishEvent::tags_deleted(5)).await.unwrap();
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("changes.db");
        {
            let sink = TimeSeriesSink::open(&path).unwrap();
            sink.publish(&event(5_000, &["AA"])).await.unwrap();
            sink.flush().unwrap();
        }
        let sink = TimeSeriesSink::open(&path).unwrap();
        assert_eq!(sink.range(0, i64::MAX).unwrap()[0].event_id, "evt-5000");
    }
}
