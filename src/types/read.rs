//! Raw read types: what sensors and handhelds report before the engine sees them.

use serde::{Deserialize, Serialize};

// ============================================================================
// Read Source
// ============================================================================

/// Where a batch of reads came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReadSource {
    /// Ceiling or portal reader with a configured personality
    #[default]
    FixedSensor,
    /// Operator-held scanner; every read is treated as an arrival
    Handheld,
}

impl ReadSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadSource::FixedSensor => "fixed_sensor",
            ReadSource::Handheld => "handheld",
        }
    }

    /// Parse from string (for CLI/config)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fixed" | "fixed_sensor" | "sensor" => Some(ReadSource::FixedSensor),
            "handheld" | "hh" => Some(ReadSource::Handheld),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event-type hint carried on a read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReadHint {
    /// The reader asserts the tag has just arrived
    Arrival,
    #[default]
    Seen,
}

// ============================================================================
// Tag Read
// ============================================================================

/// One sighting of one EPC by one sensor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagRead {
    pub epc: String,
    /// Signal strength in dBm
    pub rssi: i32,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub device_id: String,
    pub facility_id: String,
    #[serde(default)]
    pub hint: ReadHint,
}

impl TagRead {
    pub fn new(
        epc: impl Into<String>,
        rssi: i32,
        timestamp: i64,
        device_id: impl Into<String>,
        facility_id: impl Into<String>,
    ) -> Self {
        Self {
            epc: epc.into(),
            rssi,
            timestamp,
            device_id: device_id.into(),
            facility_id: facility_id.into(),
            hint: ReadHint::Seen,
        }
    }
}

// ============================================================================
// Read Batch
// ============================================================================

/// A batch of reads delivered together by one controller.
///
/// `facility_scope` bounds the age-out pass. When empty, the facilities named
/// by the reads themselves are swept.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReadBatch {
    #[serde(default)]
    pub source: ReadSource,
    #[serde(default)]
    pub facility_scope: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_id: Option<String>,
    pub reads: Vec<TagRead>,
}

impl ReadBatch {
    pub fn fixed(reads: Vec<TagRead>) -> Self {
        Self {
            source: ReadSource::FixedSensor,
            reads,
            ..Self::default()
        }
    }

    pub fn handheld(reads: Vec<TagRead>) -> Self {
        Self {
            source: ReadSource::Handheld,
            reads,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_scope<I, S>(mut self, facilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.facility_scope = facilities.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_controller(mut self, controller_id: impl Into<String>) -> Self {
        self.controller_id = Some(controller_id.into());
        self
    }
}

// ============================================================================
// Handheld Event
// ============================================================================

/// One handheld session in one facility, recorded when the batch is ingested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandheldEvent {
    /// Newest read of the session (epoch ms)
    pub timestamp: i64,
    pub facility_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_id: Option<String>,
    /// Distinct EPCs read
    pub epc_count: usize,
    pub read_count: usize,
}
