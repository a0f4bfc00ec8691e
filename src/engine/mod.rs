//! Tag State Engine
//!
//! Owns every read-modify-write of the tag index:
//!
//! 1. Ingress admits and orders the batch's reads
//! 2. The stripes of every EPC the batch touches are locked (reads plus
//!    age-out candidates of the facility scope)
//! 3. Silent tags in scope are aged out, then reads are applied in
//!    timestamp order against a working copy
//! 4. All touched records go to the store in one `replace`
//! 5. Presence changes are derived by comparing each record before and after
//!
//! A store failure aborts the batch before anything is written.

pub mod locks;
pub mod transition;

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::confidence::{ConfidenceEngine, ScoredTag};
use crate::config::defaults;
use crate::facility::{FacilityDirectory, SensorDirectory};
use crate::ingress::{self, AdmittedRead, ReadProblem};
use crate::storage::{StoreError, TagStore};
use crate::types::{Facility, HandheldEvent, ReadBatch, ReadSource, Tag, TagStateChange};

use locks::KeyLocks;
use transition::{ReadContext, Skip, Transition};

/// Engine-wide settings; everything facility-specific comes from the directory.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub location_history_limit: usize,
    pub lock_stripes: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            location_history_limit: defaults::LOCATION_HISTORY_LIMIT,
            lock_stripes: defaults::LOCK_STRIPES,
        }
    }
}

impl From<&crate::config::EngineConfig> for EngineSettings {
    fn from(cfg: &crate::config::EngineConfig) -> Self {
        Self {
            location_history_limit: cfg.location_history_limit,
            lock_stripes: cfg.lock_stripes,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("tag store failure: {0}")]
    Store(#[from] StoreError),
    #[error("tag {epc} not found in facility {facility_id}")]
    TagNotFound { epc: String, facility_id: String },
    #[error("facility '{0}' is not configured")]
    UnknownFacility(String),
}

/// Counters for one ingest call.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct IngestStats {
    pub received: usize,
    pub admitted: usize,
    pub rejected: usize,
    pub filtered: usize,
    pub stale: usize,
    pub weak: usize,
    pub departed_ignored: usize,
    pub aged_out: usize,
    pub updated: usize,
    pub changed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestOutcome {
    /// Every record written by this batch, in EPC order
    pub updated: Vec<Tag>,
    /// Presence changes, in EPC order
    pub changes: Vec<TagStateChange>,
    pub problems: Vec<ReadProblem>,
    /// Sessions recorded for a handheld batch, one per facility
    pub handheld_events: Vec<HandheldEvent>,
    pub stats: IngestStats,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepOutcome {
    pub departed: Vec<Tag>,
    pub changes: Vec<TagStateChange>,
}

/// Records loaded under lock, plus the working copies derived from them.
struct WorkingSet<'a> {
    store: &'a dyn TagStore,
    original: BTreeMap<String, Option<Tag>>,
    working: BTreeMap<String, Tag>,
}

impl<'a> WorkingSet<'a> {
    fn new(store: &'a dyn TagStore) -> Self {
        Self {
            store,
            original: BTreeMap::new(),
            working: BTreeMap::new(),
        }
    }

    fn current(&mut self, epc: &str) -> Result<Option<Tag>, StoreError> {
        if let Some(tag) = self.working.get(epc) {
            return Ok(Some(tag.clone()));
        }
        if let Some(original) = self.original.get(epc) {
            return Ok(original.clone());
        }
        let loaded = self.store.find_by_epc(epc)?;
        self.original.insert(epc.to_string(), loaded.clone());
        Ok(loaded)
    }

    fn put(&mut self, tag: Tag) {
        self.working.insert(tag.epc.clone(), tag);
    }

    /// Persist the working copies and derive the presence changes.
    fn commit(self) -> Result<(Vec<Tag>, Vec<TagStateChange>), StoreError> {
        let updated: Vec<Tag> = self.working.into_values().collect();
        if !updated.is_empty() {
            self.store.replace(&updated)?;
        }
        let changes = updated
            .iter()
            .filter_map(|tag| {
                let before = self.original.get(&tag.epc).and_then(Option::as_ref);
                TagStateChange::between(before, tag)
            })
            .collect();
        Ok((updated, changes))
    }
}

pub struct TagEngine {
    store: Arc<dyn TagStore>,
    facilities: Arc<dyn FacilityDirectory>,
    sensors: Arc<dyn SensorDirectory>,
    confidence: ConfidenceEngine,
    locks: KeyLocks,
    settings: EngineSettings,
}

impl TagEngine {
    pub fn new(
        store: Arc<dyn TagStore>,
        facilities: Arc<dyn FacilityDirectory>,
        sensors: Arc<dyn SensorDirectory>,
        settings: EngineSettings,
    ) -> Self {
        info!(
            backend = store.backend_name(),
            stripes = settings.lock_stripes,
            "Tag engine ready"
        );
        Self {
            store,
            confidence: ConfidenceEngine::new(Arc::clone(&facilities)),
            facilities,
            sensors,
            locks: KeyLocks::new(settings.lock_stripes),
            settings,
        }
    }

    pub fn confidence(&self) -> &ConfidenceEngine {
        &self.confidence
    }

    pub fn store(&self) -> &dyn TagStore {
        self.store.as_ref()
    }

    /// Ingest one batch of reads at wall-clock time `now` (epoch ms).
    pub fn ingest(&self, batch: ReadBatch, now: i64) -> Result<IngestOutcome, EngineError> {
        let received = batch.reads.len();
        let source = batch.source;
        let controller_id = batch.controller_id.clone();
        let explicit_scope = batch.facility_scope.clone();
        let report = ingress::admit(batch, self.facilities.as_ref());

        let mut stats = IngestStats {
            received,
            admitted: report.admitted.len(),
            rejected: report.problems.len(),
            filtered: report.filtered,
            ..IngestStats::default()
        };

        let scope: BTreeSet<String> = if explicit_scope.is_empty() {
            report
                .admitted
                .iter()
                .map(|a| a.read.facility_id.clone())
                .collect()
        } else {
            explicit_scope.into_iter().collect()
        };
        let candidates = self.age_out_candidates(&scope, now)?;

        let keys: BTreeSet<&str> = report
            .admitted
            .iter()
            .map(|a| a.read.epc.as_str())
            .chain(candidates.iter().map(|(_, epc)| epc.as_str()))
            .collect();
        let _guard = self.locks.lock(keys);

        let mut set = WorkingSet::new(self.store.as_ref());

        // Candidates were picked before locking; re-check on fresh records
        for (facility, epc) in &candidates {
            if let Some(tag) = set.current(epc)? {
                if tag.facility_id != facility.id {
                    continue;
                }
                if let Some(departed) = transition::age_out(&tag, now, facility.age_out_ms()) {
                    stats.aged_out += 1;
                    set.put(departed);
                }
            }
        }

        for admitted in &report.admitted {
            let read = &admitted.read;
            let sensor = self.sensors.sensor(&read.device_id);
            if let Some(ref s) = sensor {
                if s.facility_id != read.facility_id {
                    debug!(
                        device = %read.device_id,
                        sensor_facility = %s.facility_id,
                        read_facility = %read.facility_id,
                        "Sensor reports a read for a facility it is not registered to"
                    );
                }
            }
            let ctx = ReadContext {
                personality: sensor.as_ref().map(|s| s.personality).unwrap_or_default(),
                policy: &admitted.facility.read_policy,
                min_rssi_override: sensor.as_ref().and_then(|s| s.min_rssi),
                history_limit: self.settings.location_history_limit,
            };

            let current = set.current(&read.epc)?;
            match transition::apply_read(current.as_ref(), read, &ctx) {
                Transition::Write(tag) => set.put(tag),
                Transition::Skip(Skip::Stale) => stats.stale += 1,
                Transition::Skip(Skip::Weak) => stats.weak += 1,
                Transition::Skip(Skip::Departed) => stats.departed_ignored += 1,
            }
        }

        let (updated, changes) = set.commit()?;
        stats.updated = updated.len();
        stats.changed = changes.len();

        let handheld_events = match source {
            ReadSource::Handheld => self.record_handheld_session(&report.admitted, controller_id.as_deref()),
            ReadSource::FixedSensor => Vec::new(),
        };

        debug!(?stats, "Batch ingested");
        Ok(IngestOutcome {
            updated,
            changes,
            problems: report.problems,
            handheld_events,
            stats,
        })
    }

    /// Record one handheld event per facility the batch read.
    ///
    /// The tag updates are already committed, so a failed write is logged
    /// rather than failing the batch.
    fn record_handheld_session(
        &self,
        admitted: &[AdmittedRead],
        controller_id: Option<&str>,
    ) -> Vec<HandheldEvent> {
        let mut sessions: BTreeMap<&str, (BTreeSet<&str>, usize, i64)> = BTreeMap::new();
        for a in admitted {
            let (epcs, reads, newest) = sessions
                .entry(a.read.facility_id.as_str())
                .or_insert_with(|| (BTreeSet::new(), 0, i64::MIN));
            epcs.insert(a.read.epc.as_str());
            *reads += 1;
            *newest = (*newest).max(a.read.timestamp);
        }

        let mut recorded = Vec::with_capacity(sessions.len());
        for (facility_id, (epcs, read_count, timestamp)) in sessions {
            let event = HandheldEvent {
                timestamp,
                facility_id: facility_id.to_string(),
                controller_id: controller_id.map(str::to_string),
                epc_count: epcs.len(),
                read_count,
            };
            match self.store.record_handheld_event(&event) {
                Ok(()) => {
                    info!(facility = %facility_id, epcs = event.epc_count, "Handheld session recorded");
                    recorded.push(event);
                }
                Err(e) => warn!(facility = %facility_id, error = %e, "Handheld session not recorded"),
            }
        }
        recorded
    }

    /// Age out every silent tag of one facility without waiting for reads.
    pub fn force_departure_sweep(&self, facility_id: &str, now: i64) -> Result<SweepOutcome, EngineError> {
        let scope = BTreeSet::from([facility_id.to_string()]);
        if self.facilities.facility(facility_id).is_none() {
            return Err(EngineError::UnknownFacility(facility_id.to_string()));
        }
        let candidates = self.age_out_candidates(&scope, now)?;
        if candidates.is_empty() {
            return Ok(SweepOutcome::default());
        }

        let _guard = self
            .locks
            .lock(candidates.iter().map(|(_, epc)| epc.as_str()));
        let mut set = WorkingSet::new(self.store.as_ref());
        for (facility, epc) in &candidates {
            if let Some(tag) = set.current(epc)? {
                if tag.facility_id != facility.id {
                    continue;
                }
                if let Some(departed) = transition::age_out(&tag, now, facility.age_out_ms()) {
                    set.put(departed);
                }
            }
        }

        let (departed, changes) = set.commit()?;
        if !departed.is_empty() {
            info!(facility = %facility_id, departed = departed.len(), "Departure sweep aged out tags");
        }
        Ok(SweepOutcome { departed, changes })
    }

    /// Tags of the scoped facilities that look aged out, checked without locks.
    fn age_out_candidates(
        &self,
        scope: &BTreeSet<String>,
        now: i64,
    ) -> Result<Vec<(Arc<Facility>, String)>, StoreError> {
        let mut candidates = Vec::new();
        for facility_id in scope {
            let Some(facility) = self.facilities.facility(facility_id) else {
                warn!(facility = %facility_id, "Age-out scope names an unknown facility, skipping");
                continue;
            };
            let age_out_ms = facility.age_out_ms();
            for tag in self.store.find_by_facility(facility_id)? {
                if tag.state.is_on_premises() && tag.silent_for(now) > age_out_ms {
                    candidates.push((Arc::clone(&facility), tag.epc));
                }
            }
        }
        Ok(candidates)
    }

    // ========================================================================
    // Record operations
    // ========================================================================

    /// One tag with its current confidence.
    pub fn lookup(&self, epc: &str, now: i64) -> Result<Option<ScoredTag>, EngineError> {
        let epc = epc.trim().to_ascii_uppercase();
        Ok(self.store.find_by_epc(&epc)?.map(|tag| ScoredTag {
            confidence: self.confidence.confidence(&tag, now),
            tag,
        }))
    }

    /// Every tag of one facility with its current confidence.
    pub fn facility_tags(&self, facility_id: &str, now: i64) -> Result<Vec<ScoredTag>, EngineError> {
        let tags = self.store.find_by_facility(facility_id)?;
        Ok(self.confidence.score_all(tags, now))
    }

    pub fn set_epc_context(&self, epc: &str, facility_id: &str, context: &str) -> Result<Tag, EngineError> {
        let context = context.to_string();
        self.update_record(epc, facility_id, move |tag| tag.epc_context = Some(context))
    }

    pub fn clear_epc_context(&self, epc: &str, facility_id: &str) -> Result<Tag, EngineError> {
        self.update_record(epc, facility_id, |tag| tag.epc_context = None)
    }

    pub fn set_qualified_state(&self, epc: &str, facility_id: &str, state: &str) -> Result<Tag, EngineError> {
        let state = state.to_string();
        self.update_record(epc, facility_id, move |tag| tag.qualified_state = Some(state))
    }

    /// Remove specific tags; returns how many existed.
    pub fn delete_tags(&self, epcs: &[String]) -> Result<usize, EngineError> {
        let epcs: Vec<String> = epcs.iter().map(|e| e.trim().to_ascii_uppercase()).collect();
        let _guard = self.locks.lock(epcs.iter().map(String::as_str));
        let removed = self.store.delete(&epcs)?;
        info!(requested = epcs.len(), removed, "Tags deleted");
        Ok(removed)
    }

    /// Remove every tag; returns how many existed.
    ///
    /// Holds every stripe, so a batch that loaded records before the delete
    /// finishes its commit first and cannot write them back afterwards.
    pub fn delete_all(&self) -> Result<usize, EngineError> {
        let _guard = self.locks.lock_all();
        let removed = self.store.delete_all()?;
        info!(removed, "Tag collection deleted");
        Ok(removed)
    }

    /// Recorded handheld sessions, oldest first, optionally for one facility.
    pub fn handheld_events(&self, facility_id: Option<&str>) -> Result<Vec<HandheldEvent>, EngineError> {
        Ok(self.store.handheld_events(facility_id)?)
    }

    fn update_record<F>(&self, epc: &str, facility_id: &str, apply: F) -> Result<Tag, EngineError>
    where
        F: FnOnce(&mut Tag),
    {
        let epc = epc.trim().to_ascii_uppercase();
        let _guard = self.locks.lock([epc.as_str()]);
        let mut tag = self
            .store
            .find_by_epc(&epc)?
            .filter(|t| t.facility_id == facility_id)
            .ok_or_else(|| EngineError::TagNotFound {
                epc: epc.clone(),
                facility_id: facility_id.to_string(),
            })?;
        apply(&mut tag);
        self.store.replace(std::slice::from_ref(&tag))?;
        Ok(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facility::{FacilityRegistry, SensorRegistry};
    use crate::storage::InMemoryTagStore;
    use crate::types::{RfidSensor, SensorPersonality, TagRead, TagState};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn engine_with(store: Arc<dyn TagStore>) -> TagEngine {
        let mut f1 = Facility::new("F1");
        f1.age_out_minutes = 1;
        let facilities = Arc::new(FacilityRegistry::new(vec![f1, Facility::new("F2")], Facility::new("default")));
        let sensors = Arc::new(SensorRegistry::new(vec![
            RfidSensor {
                device_id: "exit-1".into(),
                facility_id: "F1".into(),
                personality: SensorPersonality::Exit,
                min_rssi: None,
            },
            RfidSensor {
                device_id: "pos-1".into(),
                facility_id: "F1".into(),
                personality: SensorPersonality::Pos,
                min_rssi: None,
            },
        ]));
        TagEngine::new(store, facilities, sensors, EngineSettings::default())
    }

    fn engine() -> TagEngine {
        engine_with(Arc::new(InMemoryTagStore::new()))
    }

    fn read(epc: &str, device: &str, ts: i64) -> TagRead {
        TagRead::new(epc, -50, ts, device, "F1")
    }

    #[test]
    fn test_first_read_creates_present_tag() {
        let engine = engine();
        let outcome = engine
            .ingest(ReadBatch::fixed(vec![read("aa", "floor-1", 1_000)]), 1_000)
            .unwrap();
        assert_eq!(outcome.updated.len(), 1);
        assert_eq!(outcome.changes.len(), 1);
        assert_eq!(outcome.changes[0].previous_state(), TagState::Unknown);
        assert_eq!(outcome.changes[0].current_state(), TagState::Present);
        assert_eq!(engine.store().find_by_epc("AA").unwrap().unwrap().state, TagState::Present);
    }

    #[test]
    fn test_intermediate_states_within_batch_collapse() {
        let engine = engine();
        engine.ingest(ReadBatch::fixed(vec![read("AA", "floor-1", 1_000)]), 1_000).unwrap();

        // Exit read then floor read in one batch: Present -> Exiting -> Present
        let outcome = engine
            .ingest(
                ReadBatch::fixed(vec![read("AA", "floor-1", 3_000), read("AA", "exit-1", 2_000)]),
                3_000,
            )
            .unwrap();
        assert!(outcome.changes.is_empty());
        assert_eq!(outcome.updated[0].last_read, 3_000);
        assert_eq!(outcome.updated[0].state, TagState::Present);
    }

    #[test]
    fn test_stats_count_each_skip() {
        let engine = engine();
        engine.ingest(ReadBatch::fixed(vec![read("AA", "floor-1", 5_000)]), 5_000).unwrap();

        let mut weak = read("BB", "floor-1", 6_000);
        weak.rssi = -95;
        let outcome = engine
            .ingest(
                ReadBatch::fixed(vec![
                    read("AA", "floor-1", 4_000),
                    weak,
                    read("ZZ", "floor-1", 6_000),
                    TagRead::new("QQ", -50, 6_000, "floor-1", "NOWHERE"),
                ]),
                6_000,
            )
            .unwrap();
        assert_eq!(outcome.stats.received, 4);
        assert_eq!(outcome.stats.admitted, 3);
        assert_eq!(outcome.stats.rejected, 1);
        assert_eq!(outcome.stats.stale, 1);
        assert_eq!(outcome.stats.weak, 1);
        assert_eq!(outcome.stats.updated, 1);
        assert_eq!(outcome.problems.len(), 1);
    }

    #[test]
    fn test_pos_read_sells_tag() {
        let engine = engine();
        engine.ingest(ReadBatch::fixed(vec![read("AA", "floor-1", 1_000)]), 1_000).unwrap();
        let outcome = engine
            .ingest(ReadBatch::fixed(vec![read("AA", "pos-1", 2_000)]), 2_000)
            .unwrap();
        assert_eq!(outcome.changes[0].current_state(), TagState::DepartedPos);

        // A weak read cannot revive a sold tag
        let mut weak = read("AA", "floor-1", 3_000);
        weak.rssi = -90;
        let outcome = engine.ingest(ReadBatch::fixed(vec![weak]), 3_000).unwrap();
        assert_eq!(outcome.stats.departed_ignored, 1);
        assert!(outcome.updated.is_empty());
    }

    #[test]
    fn test_age_out_runs_before_reads() {
        let engine = engine();
        engine
            .ingest(ReadBatch::fixed(vec![read("AA", "floor-1", 1_000), read("BB", "floor-1", 1_000)]), 1_000)
            .unwrap();

        // Two minutes later only BB is read again; AA ages out
        let now = 121_000;
        let outcome = engine
            .ingest(ReadBatch::fixed(vec![read("BB", "floor-1", now)]), now)
            .unwrap();
        assert_eq!(outcome.stats.aged_out, 2);
        assert_eq!(outcome.changes.len(), 1);
        assert_eq!(outcome.changes[0].epc(), "AA");
        assert_eq!(outcome.changes[0].current_state(), TagState::DepartedExit);
        let bb = engine.store().find_by_epc("BB").unwrap().unwrap();
        assert_eq!(bb.state, TagState::Present);
    }

    #[test]
    fn test_explicit_scope_limits_age_out() {
        let engine = engine();
        engine.ingest(ReadBatch::fixed(vec![read("AA", "floor-1", 1_000)]), 1_000).unwrap();

        let outcome = engine
            .ingest(ReadBatch::fixed(Vec::new()).with_scope(["F2"]), 500_000)
            .unwrap();
        assert_eq!(outcome.stats.aged_out, 0);

        let outcome = engine
            .ingest(ReadBatch::fixed(Vec::new()).with_scope(["F1"]), 500_000)
            .unwrap();
        assert_eq!(outcome.stats.aged_out, 1);
    }

    #[test]
    fn test_force_departure_sweep() {
        let engine = engine();
        engine.ingest(ReadBatch::fixed(vec![read("AA", "floor-1", 1_000)]), 1_000).unwrap();

        assert!(engine.force_departure_sweep("F1", 61_000).unwrap().departed.is_empty());
        let sweep = engine.force_departure_sweep("F1", 61_001).unwrap();
        assert_eq!(sweep.departed.len(), 1);
        assert_eq!(sweep.changes[0].current_state(), TagState::DepartedExit);
        assert!(matches!(
            engine.force_departure_sweep("F9", 0),
            Err(EngineError::UnknownFacility(_))
        ));
    }

    #[test]
    fn test_record_operations() {
        let engine = engine();
        engine.ingest(ReadBatch::fixed(vec![read("AA", "floor-1", 1_000)]), 1_000).unwrap();

        let tag = engine.set_epc_context("aa", "F1", "shelf-3").unwrap();
        assert_eq!(tag.epc_context.as_deref(), Some("shelf-3"));
        let tag = engine.set_qualified_state("AA", "F1", "sold").unwrap();
        assert_eq!(tag.qualified_state.as_deref(), Some("sold"));
        assert_eq!(tag.epc_context.as_deref(), Some("shelf-3"));
        let tag = engine.clear_epc_context("AA", "F1").unwrap();
        assert_eq!(tag.epc_context, None);

        assert!(matches!(
            engine.set_qualified_state("AA", "F2", "sold"),
            Err(EngineError::TagNotFound { .. })
        ));
        assert!(matches!(
            engine.set_epc_context("BB", "F1", "x"),
            Err(EngineError::TagNotFound { .. })
        ));
    }

    #[test]
    fn test_lookup_and_facility_listing_scores() {
        let engine = engine();
        engine.ingest(ReadBatch::fixed(vec![read("AA", "floor-1", 1_000)]), 1_000).unwrap();

        let scored = engine.lookup("aa", 1_000).unwrap().unwrap();
        assert!((scored.confidence - 1.0).abs() < 1e-12);
        assert!(engine.lookup("BB", 1_000).unwrap().is_none());

        let listing = engine.facility_tags("F1", 1_000 + 86_400_000).unwrap();
        assert_eq!(listing.len(), 1);
        assert!(listing[0].confidence < 1.0);
    }

    #[test]
    fn test_delete_operations() {
        let engine = engine();
        engine
            .ingest(ReadBatch::fixed(vec![read("AA", "floor-1", 1_000), read("BB", "floor-1", 1_000)]), 1_000)
            .unwrap();
        assert_eq!(engine.delete_tags(&["aa".to_string()]).unwrap(), 1);
        assert_eq!(engine.delete_all().unwrap(), 1);
        assert_eq!(engine.store().count().unwrap(), 0);
    }

    /// Store whose writes can be switched off.
    struct FlakyStore {
        inner: InMemoryTagStore,
        fail_writes: AtomicBool,
        fail_handheld: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: InMemoryTagStore::new(),
                fail_writes: AtomicBool::new(false),
                fail_handheld: AtomicBool::new(false),
            }
        }
    }

    impl TagStore for FlakyStore {
        fn find_by_epc(&self, epc: &str) -> Result<Option<Tag>, StoreError> {
            self.inner.find_by_epc(epc)
        }
        fn find_by_facility(&self, facility_id: &str) -> Result<Vec<Tag>, StoreError> {
            self.inner.find_by_facility(facility_id)
        }
        fn replace(&self, tags: &[Tag]) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.inner.replace(tags)
        }
        fn delete(&self, epcs: &[String]) -> Result<usize, StoreError> {
            self.inner.delete(epcs)
        }
        fn delete_all(&self) -> Result<usize, StoreError> {
            self.inner.delete_all()
        }
        fn count(&self) -> Result<usize, StoreError> {
            self.inner.count()
        }
        fn record_handheld_event(&self, event: &HandheldEvent) -> Result<(), StoreError> {
            if self.fail_handheld.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.inner.record_handheld_event(event)
        }
        fn handheld_events(&self, facility_id: Option<&str>) -> Result<Vec<HandheldEvent>, StoreError> {
            self.inner.handheld_events(facility_id)
        }
        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    #[test]
    fn test_store_failure_aborts_batch_without_partial_commit() {
        let store = Arc::new(FlakyStore::new());
        let engine = engine_with(store.clone());
        engine.ingest(ReadBatch::fixed(vec![read("AA", "floor-1", 1_000)]), 1_000).unwrap();

        store.fail_writes.store(true, Ordering::SeqCst);
        let result = engine.ingest(
            ReadBatch::fixed(vec![read("AA", "floor-2", 2_000), read("BB", "floor-1", 2_000)]),
            2_000,
        );
        assert!(matches!(result, Err(EngineError::Store(_))));
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.find_by_epc("AA").unwrap().unwrap().location, "floor-1");

        // Nothing was committed, so the same batch succeeds once writes recover
        store.fail_writes.store(false, Ordering::SeqCst);
        let outcome = engine
            .ingest(
                ReadBatch::fixed(vec![read("AA", "floor-2", 2_000), read("BB", "floor-1", 2_000)]),
                2_000,
            )
            .unwrap();
        assert_eq!(outcome.updated.len(), 2);
    }

    #[test]
    fn test_concurrent_batches_keep_one_record_per_epc() {
        let engine = Arc::new(engine());
        let handles: Vec<_> = (0..8_i64)
            .map(|worker| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    for i in 0..50_i64 {
                        let ts = 1_000 + i * 8 + worker;
                        let device = format!("floor-{worker}");
                        engine
                            .ingest(ReadBatch::fixed(vec![read("AA", &device, ts), read("BB", &device, ts)]), ts)
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(engine.store().count().unwrap(), 2);
        // Last-write-wins by timestamp: the newest read overall is 1_000 + 49 * 8 + 7
        let aa = engine.store().find_by_epc("AA").unwrap().unwrap();
        assert_eq!(aa.last_read, 1_399);
        assert_eq!(aa.location, "floor-7");
        assert_eq!(aa.state, TagState::Present);
    }

    #[test]
    fn test_handheld_batch_records_one_event_per_facility() {
        let engine = engine();
        let outcome = engine
            .ingest(
                ReadBatch::handheld(vec![
                    read("AA", "hh-1", 1_000),
                    read("AA", "hh-1", 1_500),
                    read("BB", "hh-1", 2_000),
                    TagRead::new("CC", -50, 1_200, "hh-1", "F2"),
                    read("XYZ!", "hh-1", 1_800),
                ])
                .with_controller("hh-7"),
                2_000,
            )
            .unwrap();

        assert_eq!(outcome.problems.len(), 1);
        assert_eq!(outcome.handheld_events.len(), 2);
        let f1 = &outcome.handheld_events[0];
        assert_eq!(f1.facility_id, "F1");
        assert_eq!(f1.epc_count, 2);
        assert_eq!(f1.read_count, 3);
        assert_eq!(f1.timestamp, 2_000);
        assert_eq!(f1.controller_id.as_deref(), Some("hh-7"));
        assert_eq!(outcome.handheld_events[1].epc_count, 1);

        // Fixed-sensor batches leave no handheld record
        let outcome = engine
            .ingest(ReadBatch::fixed(vec![read("AA", "floor-1", 3_000)]), 3_000)
            .unwrap();
        assert!(outcome.handheld_events.is_empty());

        assert_eq!(engine.handheld_events(None).unwrap().len(), 2);
        let f2 = engine.handheld_events(Some("F2")).unwrap();
        assert_eq!(f2.len(), 1);
        assert_eq!(f2[0].timestamp, 1_200);
    }

    #[test]
    fn test_handheld_event_write_failure_keeps_tag_updates() {
        let store = Arc::new(FlakyStore::new());
        store.fail_handheld.store(true, Ordering::SeqCst);
        let engine = engine_with(store.clone());

        let outcome = engine
            .ingest(ReadBatch::handheld(vec![read("AA", "hh-1", 1_000)]), 1_000)
            .unwrap();
        assert_eq!(outcome.changes.len(), 1);
        assert!(outcome.handheld_events.is_empty());
        assert_eq!(store.find_by_epc("AA").unwrap().unwrap().state, TagState::Present);
    }

    #[test]
    fn test_delete_all_waits_for_batch_holding_a_stripe() {
        let engine = Arc::new(engine());
        engine
            .ingest(ReadBatch::fixed(vec![read("AA", "floor-1", 1_000), read("BB", "floor-1", 1_000)]), 1_000)
            .unwrap();

        // Stands in for a batch that has loaded AA and not yet committed
        let in_flight = engine.locks.lock(["AA"]);
        let handle = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.delete_all().unwrap())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(engine.store().count().unwrap(), 2);

        drop(in_flight);
        assert_eq!(handle.join().unwrap(), 2);
        assert_eq!(engine.store().count().unwrap(), 0);
    }
}
