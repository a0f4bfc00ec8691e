//! Shared data structures for RFID presence tracking
//!
//! - Reads: TagRead, ReadBatch (what arrives from sensors)
//! - Tags: Tag, TagState, TagStateChange (what the engine stores and emits)
//! - Reference data: Facility, FacilityCoefficients, ReadPolicy, RfidSensor

mod facility;
mod read;
mod tag;

pub use facility::*;
pub use read::*;
pub use tag::*;

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
