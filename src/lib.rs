//! RFID Inventory: tag presence tracking for retail facilities
//!
//! Turns raw RFID tag reads into a per-tag presence state and a decaying
//! confidence that each tag is still on the premises, and fans presence
//! changes out to downstream consumers.
//!
//! ## Architecture
//!
//! - **Ingress**: read validation, EPC allow-lists, handheld normalization
//! - **Engine**: per-tag state machine, exit debounce, age-out, striped locking
//! - **Confidence**: exponential presence decay driven by facility coefficients
//! - **Publisher**: bounded queue plus worker dispatching to webhook and time-series sinks
//! - **Pipeline**: batch sources, processing loop, departure sweeper

pub mod config;
pub mod confidence;
pub mod engine;
pub mod facility;
pub mod ingress;
pub mod pipeline;
pub mod publisher;
pub mod storage;
pub mod types;

pub use config::InventoryConfig;
pub use confidence::{ConfidenceEngine, ConfidenceScore, ScoredTag};
pub use engine::{EngineError, EngineSettings, IngestOutcome, IngestStats, SweepOutcome, TagEngine};
pub use facility::{FacilityDirectory, FacilityRegistry, SensorDirectory, SensorRegistry};
pub use publisher::{ChangePublisher, PublishEvent, PublishSink, PublisherWorker};
pub use storage::{InMemoryTagStore, SledTagStore, StoreError, TagStore};
pub use types::{
    Facility, FacilityCoefficients, HandheldEvent, ReadBatch, ReadPolicy, ReadSource, RfidSensor,
    SensorPersonality, Tag, TagEvent, TagRead, TagState, TagStateChange,
};
