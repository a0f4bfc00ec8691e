//! In-memory tag index
//!
//! Thread-safe via `RwLock`. Not durable, data lost on restart.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use super::{StoreError, TagStore};
use crate::types::{HandheldEvent, Tag};

#[derive(Default)]
struct Index {
    tags: BTreeMap<String, Tag>,
    by_facility: HashMap<String, BTreeSet<String>>,
}

impl Index {
    fn unlink(&mut self, tag: &Tag) {
        if let Some(epcs) = self.by_facility.get_mut(&tag.facility_id) {
            epcs.remove(&tag.epc);
            if epcs.is_empty() {
                self.by_facility.remove(&tag.facility_id);
            }
        }
    }
}

#[derive(Default)]
pub struct InMemoryTagStore {
    index: RwLock<Index>,
    handheld: RwLock<Vec<HandheldEvent>>,
}

impl InMemoryTagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TagStore for InMemoryTagStore {
    fn find_by_epc(&self, epc: &str) -> Result<Option<Tag>, StoreError> {
        let index = self
            .index
            .read()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(index.tags.get(epc).cloned())
    }

    fn find_by_facility(&self, facility_id: &str) -> Result<Vec<Tag>, StoreError> {
        let index = self
            .index
            .read()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let Some(epcs) = index.by_facility.get(facility_id) else {
            return Ok(Vec::new());
        };
        Ok(epcs
            .iter()
            .filter_map(|epc| index.tags.get(epc).cloned())
            .collect())
    }

    fn replace(&self, tags: &[Tag]) -> Result<(), StoreError> {
        let mut index = self
            .index
            .write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        for tag in tags {
            if let Some(previous) = index.tags.remove(&tag.epc) {
                index.unlink(&previous);
            }
            index
                .by_facility
                .entry(tag.facility_id.clone())
                .or_default()
                .insert(tag.epc.clone());
            index.tags.insert(tag.epc.clone(), tag.clone());
        }
        Ok(())
    }

    fn delete(&self, epcs: &[String]) -> Result<usize, StoreError> {
        let mut index = self
            .index
            .write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let mut removed = 0;
        for epc in epcs {
            if let Some(previous) = index.tags.remove(epc) {
                index.unlink(&previous);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn delete_all(&self) -> Result<usize, StoreError> {
        let mut index = self
            .index
            .write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let removed = index.tags.len();
        *index = Index::default();
        Ok(removed)
    }

    fn count(&self) -> Result<usize, StoreError> {
        let index = self
            .index
            .read()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(index.tags.len())
    }

    fn record_handheld_event(&self, event: &HandheldEvent) -> Result<(), StoreError> {
        let mut events = self
            .handheld
            .write()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let at = events.partition_point(|e| e.timestamp <= event.timestamp);
        events.insert(at, event.clone());
        Ok(())
    }

    fn handheld_events(&self, facility_id: Option<&str>) -> Result<Vec<HandheldEvent>, StoreError> {
        let events = self
            .handheld
            .read()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(events
            .iter()
            .filter(|e| facility_id.map_or(true, |id| e.facility_id == id))
            .cloned()
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HandheldEvent, TagRead, TagState};

    fn tag(epc: &str, facility: &str) -> Tag {
        let mut tag = Tag::first_sighting(&TagRead::new(epc, -50, 1, "d1", facility));
        tag.state = TagState::Present;
        tag
    }

    #[test]
    fn test_replace_and_find() {
        let store = InMemoryTagStore::new();
        store.replace(&[tag("B", "F1"), tag("A", "F1"), tag("C", "F2")]).unwrap();

        assert_eq!(store.count().unwrap(), 3);
        assert!(store.find_by_epc("A").unwrap().is_some());
        assert!(store.find_by_epc("Z").unwrap().is_none());
        let f1: Vec<String> = store
            .find_by_facility("F1")
            .unwrap()
            .into_iter()
            .map(|t| t.epc)
            .collect();
        assert_eq!(f1, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_facility_move_updates_index() {
        let store = InMemoryTagStore::new();
        store.replace(&[tag("A", "F1")]).unwrap();
        store.replace(&[tag("A", "F2")]).unwrap();

        assert!(store.find_by_facility("F1").unwrap().is_empty());
        assert_eq!(store.find_by_facility("F2").unwrap().len(), 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_delete_and_delete_all() {
        let store = InMemoryTagStore::new();
        store.replace(&[tag("A", "F1"), tag("B", "F1"), tag("C", "F1")]).unwrap();

        assert_eq!(store.delete(&["A".into(), "Q".into()]).unwrap(), 1);
        assert_eq!(store.find_by_facility("F1").unwrap().len(), 2);
        assert_eq!(store.delete_all().unwrap(), 2);
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.find_by_facility("F1").unwrap().is_empty());
    }

    #[test]
    fn test_handheld_events_ordered_and_kept_across_delete_all() {
        let store = InMemoryTagStore::new();
        let event = |ts: i64, facility: &str| HandheldEvent {
            timestamp: ts,
            facility_id: facility.into(),
            controller_id: None,
            epc_count: 1,
            read_count: 1,
        };
        store.record_handheld_event(&event(300, "F1")).unwrap();
        store.record_handheld_event(&event(100, "F2")).unwrap();
        store.record_handheld_event(&event(200, "F1")).unwrap();
        store.replace(&[tag("A", "F1")]).unwrap();
        store.delete_all().unwrap();

        let all: Vec<i64> = store
            .handheld_events(None)
            .unwrap()
            .iter()
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(all, vec![100, 200, 300]);
        assert_eq!(store.handheld_events(Some("F1")).unwrap().len(), 2);
        assert!(store.handheld_events(Some("F9")).unwrap().is_empty());
    }
}
