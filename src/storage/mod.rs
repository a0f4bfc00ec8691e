//! Tag index storage
//!
//! [`TagStore`] is the pluggable index the engine reads and writes through:
//! - `InMemoryTagStore`: for tests and `--in-memory` runs
//! - `SledTagStore`: durable embedded index with a per-facility secondary tree
//!
//! The engine serializes access per EPC itself; stores only have to make a
//! single `replace` call all-or-nothing.

pub mod lockfile;
mod memory;
mod sled_store;

pub use lockfile::ProcessLock;
pub use memory::InMemoryTagStore;
pub use sled_store::SledTagStore;

use crate::types::{HandheldEvent, Tag};

/// Trait for pluggable tag index backends
///
/// Implementations must be thread-safe (Send + Sync) for shared access
/// across the ingest workers.
pub trait TagStore: Send + Sync {
    fn find_by_epc(&self, epc: &str) -> Result<Option<Tag>, StoreError>;

    /// Every tag whose current facility is `facility_id`, in EPC order.
    fn find_by_facility(&self, facility_id: &str) -> Result<Vec<Tag>, StoreError>;

    /// Upsert every tag in one atomic step: all are written or none are.
    fn replace(&self, tags: &[Tag]) -> Result<(), StoreError>;

    /// Remove the listed EPCs, returning how many existed.
    fn delete(&self, epcs: &[String]) -> Result<usize, StoreError>;

    /// Remove every tag, returning how many existed.
    fn delete_all(&self) -> Result<usize, StoreError>;

    fn count(&self) -> Result<usize, StoreError>;

    /// Append one handheld session record. Not touched by `delete_all`.
    fn record_handheld_event(&self, event: &HandheldEvent) -> Result<(), StoreError>;

    /// Recorded handheld sessions, oldest first, optionally for one facility.
    fn handheld_events(&self, facility_id: Option<&str>) -> Result<Vec<HandheldEvent>, StoreError>;

    /// Make buffered writes durable.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
