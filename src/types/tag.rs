//! Durable tag record, presence states and the change snapshots fanned out downstream.

use serde::{Deserialize, Serialize};

use super::read::TagRead;

// ============================================================================
// Presence State
// ============================================================================

/// Presence state of a tag.
///
/// Departed states end presence but not the record: a later qualifying read
/// brings the tag back to `Present`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TagState {
    #[default]
    Unknown,
    Present,
    /// Read at an exit portal, departure not yet confirmed
    Exiting,
    DepartedExit,
    /// Sold at a point-of-sale reader
    DepartedPos,
}

impl TagState {
    pub const ALL: [TagState; 5] = [
        TagState::Unknown,
        TagState::Present,
        TagState::Exiting,
        TagState::DepartedExit,
        TagState::DepartedPos,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TagState::Unknown => "unknown",
            TagState::Present => "present",
            TagState::Exiting => "exiting",
            TagState::DepartedExit => "departed_exit",
            TagState::DepartedPos => "departed_pos",
        }
    }

    pub fn is_departed(&self) -> bool {
        matches!(self, TagState::DepartedExit | TagState::DepartedPos)
    }

    /// Present or Exiting: the tag is believed to be on the premises.
    pub fn is_on_premises(&self) -> bool {
        matches!(self, TagState::Present | TagState::Exiting)
    }
}

impl std::fmt::Display for TagState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the last accepted update did to the tag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TagEvent {
    Arrival,
    Moved,
    CycleCount,
    Departed,
}

impl std::fmt::Display for TagEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TagEvent::Arrival => "arrival",
            TagEvent::Moved => "moved",
            TagEvent::CycleCount => "cycle_count",
            TagEvent::Departed => "departed",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Tag Record
// ============================================================================

/// One entry of a tag's location trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocationHistory {
    pub location: String,
    pub timestamp: i64,
}

/// The durable per-EPC record.
///
/// Confidence is derived at query time and never stored here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag {
    pub epc: String,
    pub state: TagState,
    /// Device id of the last qualifying read
    pub location: String,
    pub facility_id: String,
    pub last_read: i64,
    pub last_rssi: i32,
    pub event: TagEvent,
    /// Newest first, bounded by the engine's history limit
    #[serde(default)]
    pub location_history: Vec<LocationHistory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epc_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualified_state: Option<String>,
    /// Consecutive qualifying exit reads in the current sequence
    #[serde(default)]
    pub exit_reads: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit_read: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub departed_at: Option<i64>,
}

impl Tag {
    /// Skeleton record for an EPC seen for the first time. State stays
    /// `Unknown` until a transition settles it.
    pub fn first_sighting(read: &TagRead) -> Self {
        Self {
            epc: read.epc.clone(),
            state: TagState::Unknown,
            location: String::new(),
            facility_id: read.facility_id.clone(),
            last_read: 0,
            last_rssi: read.rssi,
            event: TagEvent::Arrival,
            location_history: Vec::new(),
            epc_context: None,
            qualified_state: None,
            exit_reads: 0,
            last_exit_read: None,
            departed_at: None,
        }
    }

    /// Refresh last-read bookkeeping and move the tag to the read's device.
    ///
    /// Returns true when the location changed.
    pub fn mark_seen(&mut self, read: &TagRead, history_limit: usize) -> bool {
        self.last_read = read.timestamp;
        self.last_rssi = read.rssi;
        self.facility_id.clone_from(&read.facility_id);
        if self.location == read.device_id {
            return false;
        }
        self.location.clone_from(&read.device_id);
        self.location_history.insert(
            0,
            LocationHistory {
                location: read.device_id.clone(),
                timestamp: read.timestamp,
            },
        );
        self.location_history.truncate(history_limit.max(1));
        true
    }

    /// Refresh only the last-read time and signal, leaving location alone.
    pub fn touch(&mut self, read: &TagRead) {
        self.last_read = read.timestamp;
        self.last_rssi = read.rssi;
    }

    pub fn reset_exit_sequence(&mut self) {
        self.exit_reads = 0;
        self.last_exit_read = None;
    }

    /// Milliseconds since the last accepted read, never negative.
    pub fn silent_for(&self, now: i64) -> i64 {
        now.saturating_sub(self.last_read).max(0)
    }
}

// ============================================================================
// State Change
// ============================================================================

/// Snapshot pair emitted when a tag's presence state differs across an update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagStateChange {
    /// Absent for a tag that had no record before the update
    pub previous: Option<Tag>,
    pub current: Tag,
}

impl TagStateChange {
    /// Build a change only if the presence state actually moved.
    pub fn between(previous: Option<&Tag>, current: &Tag) -> Option<Self> {
        let before = previous.map_or(TagState::Unknown, |t| t.state);
        if before == current.state {
            return None;
        }
        Some(Self {
            previous: previous.cloned(),
            current: current.clone(),
        })
    }

    pub fn epc(&self) -> &str {
        &self.current.epc
    }

    pub fn previous_state(&self) -> TagState {
        self.previous.as_ref().map_or(TagState::Unknown, |t| t.state)
    }

    pub fn current_state(&self) -> TagState {
        self.current.state
    }
}
