//! Sled-backed tag index
//!
//! Two trees:
//! - `tags`: EPC -> JSON-serialized `Tag`
//! - `tags_by_facility`: `facility_id \0 EPC` -> empty, for facility scans
//! - `handheld_events`: `timestamp (i64 BE) ++ sled id (u64 BE)` -> JSON `HandheldEvent`
//!
//! `replace` and `delete` run as one transaction over both trees.

use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use std::path::Path;
use tracing::info;

use super::{StoreError, TagStore};
use crate::types::{HandheldEvent, Tag};

const TAGS_TREE: &str = "tags";
const FACILITY_TREE: &str = "tags_by_facility";
const HANDHELD_TREE: &str = "handheld_events";

#[derive(Clone)]
pub struct SledTagStore {
    db: sled::Db,
    tags: sled::Tree,
    by_facility: sled::Tree,
    handheld: sled::Tree,
}

fn facility_key(facility_id: &str, epc: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(facility_id.len() + epc.len() + 1);
    key.extend_from_slice(facility_id.as_bytes());
    key.push(0);
    key.extend_from_slice(epc.as_bytes());
    key
}

fn facility_prefix(facility_id: &str) -> Vec<u8> {
    let mut prefix = facility_id.as_bytes().to_vec();
    prefix.push(0);
    prefix
}

fn event_key(timestamp: i64, seq: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&timestamp.to_be_bytes());
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

fn flatten(err: TransactionError<StoreError>) -> StoreError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StoreError::from(e),
    }
}

impl SledTagStore {
    /// Open or create the tag index at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        let store = Self::from_db(db)?;
        info!(path = %path.display(), tags = store.tags.len(), "Tag index opened");
        Ok(store)
    }

    /// Temporary store that is removed when dropped
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let tags = db.open_tree(TAGS_TREE)?;
        let by_facility = db.open_tree(FACILITY_TREE)?;
        let handheld = db.open_tree(HANDHELD_TREE)?;
        Ok(Self {
            db,
            tags,
            by_facility,
            handheld,
        })
    }
}

impl TagStore for SledTagStore {
    fn find_by_epc(&self, epc: &str) -> Result<Option<Tag>, StoreError> {
        match self.tags.get(epc.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn find_by_facility(&self, facility_id: &str) -> Result<Vec<Tag>, StoreError> {
        let prefix = facility_prefix(facility_id);
        let mut tags = Vec::new();
        for entry in self.by_facility.scan_prefix(&prefix) {
            let (key, _) = entry?;
            let epc = &key[prefix.len()..];
            // Index entries can outlive a concurrent delete_all; skip them
            if let Some(bytes) = self.tags.get(epc)? {
                tags.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(tags)
    }

    fn replace(&self, tags: &[Tag]) -> Result<(), StoreError> {
        let encoded = tags
            .iter()
            .map(|t| Ok((t, serde_json::to_vec(t)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;

        (&self.tags, &self.by_facility)
            .transaction(|(tag_tree, index_tree)| {
                for (tag, bytes) in &encoded {
                    if let Some(old) = tag_tree.get(tag.epc.as_bytes())? {
                        let previous: Tag = serde_json::from_slice(&old)
                            .map_err(|e| ConflictableTransactionError::Abort(StoreError::from(e)))?;
                        if previous.facility_id != tag.facility_id {
                            index_tree.remove(facility_key(&previous.facility_id, &tag.epc))?;
                        }
                    }
                    tag_tree.insert(tag.epc.as_bytes(), bytes.as_slice())?;
                    index_tree.insert(facility_key(&tag.facility_id, &tag.epc), Vec::<u8>::new())?;
                }
                Ok(())
            })
            .map_err(flatten)
    }

    fn delete(&self, epcs: &[String]) -> Result<usize, StoreError> {
        (&self.tags, &self.by_facility)
            .transaction(|(tag_tree, index_tree)| {
                let mut removed = 0;
                for epc in epcs {
                    if let Some(old) = tag_tree.remove(epc.as_bytes())? {
                        removed += 1;
                        if let Ok(previous) = serde_json::from_slice::<Tag>(&old) {
                            index_tree.remove(facility_key(&previous.facility_id, epc))?;
                        }
                    }
                }
                Ok(removed)
            })
            .map_err(flatten)
    }

    fn delete_all(&self) -> Result<usize, StoreError> {
        let removed = self.tags.len();
        self.tags.clear()?;
        self.by_facility.clear()?;
        self.db.flush()?;
        Ok(removed)
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.tags.len())
    }

    fn record_handheld_event(&self, event: &HandheldEvent) -> Result<(), StoreError> {
        let key = event_key(event.timestamp, self.db.generate_id()?);
        self.handheld.insert(key, serde_json::to_vec(event)?)?;
        Ok(())
    }

    fn handheld_events(&self, facility_id: Option<&str>) -> Result<Vec<HandheldEvent>, StoreError> {
        let mut events = Vec::new();
        for entry in self.handheld.iter() {
            let (_, bytes) = entry?;
            let event: HandheldEvent = serde_json::from_slice(&bytes)?;
            if facility_id.map_or(true, |id| event.facility_id == id) {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}
