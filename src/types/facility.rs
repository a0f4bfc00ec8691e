//! Facility and sensor reference data.

use serde::{Deserialize, Serialize};

use crate::config::defaults;

// ============================================================================
// Coefficients
// ============================================================================

/// Per-facility inputs to the confidence decay model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FacilityCoefficients {
    /// Share of the inventory the readers cover per day, in percent
    #[serde(default = "default_daily_inventory_percentage")]
    pub daily_inventory_percentage: f64,
    /// Chance a present tag is read during one full inventory cycle
    #[serde(default = "default_prob_unread_to_read")]
    pub prob_unread_to_read: f64,
    /// Extra decay weight for tags whose last read was weak
    #[serde(default = "default_prob_in_store_read")]
    pub prob_in_store_read: f64,
    /// Chance an exit-portal read was spurious
    #[serde(default = "default_prob_exit_error")]
    pub prob_exit_error: f64,
    /// Confidence never decays below this value
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
}

fn default_daily_inventory_percentage() -> f64 {
    defaults::DAILY_INVENTORY_PERCENTAGE
}
fn default_prob_unread_to_read() -> f64 {
    defaults::PROB_UNREAD_TO_READ
}
fn default_prob_in_store_read() -> f64 {
    defaults::PROB_IN_STORE_READ
}
fn default_prob_exit_error() -> f64 {
    defaults::PROB_EXIT_ERROR
}
fn default_confidence_floor() -> f64 {
    defaults::CONFIDENCE_FLOOR
}

impl Default for FacilityCoefficients {
    fn default() -> Self {
        Self {
            daily_inventory_percentage: defaults::DAILY_INVENTORY_PERCENTAGE,
            prob_unread_to_read: defaults::PROB_UNREAD_TO_READ,
            prob_in_store_read: defaults::PROB_IN_STORE_READ,
            prob_exit_error: defaults::PROB_EXIT_ERROR,
            confidence_floor: defaults::CONFIDENCE_FLOOR,
        }
    }
}

impl FacilityCoefficients {
    /// Push one message per out-of-range coefficient onto `errors`.
    ///
    /// The decay curve is only strictly decreasing when every bound here holds.
    pub fn check(&self, name: &str, errors: &mut Vec<String>) {
        let values = [
            ("daily_inventory_percentage", self.daily_inventory_percentage),
            ("prob_unread_to_read", self.prob_unread_to_read),
            ("prob_in_store_read", self.prob_in_store_read),
            ("prob_exit_error", self.prob_exit_error),
            ("confidence_floor", self.confidence_floor),
        ];
        for (field, value) in values {
            if !value.is_finite() {
                errors.push(format!("{name}.{field} must be finite (got {value})"));
            }
        }
        if self.daily_inventory_percentage <= 0.0 {
            errors.push(format!(
                "{name}.daily_inventory_percentage ({:.2}) must be > 0",
                self.daily_inventory_percentage
            ));
        }
        if !(self.prob_unread_to_read > 0.0 && self.prob_unread_to_read < 1.0) {
            errors.push(format!(
                "{name}.prob_unread_to_read ({:.3}) must be in (0, 1)",
                self.prob_unread_to_read
            ));
        }
        if !(0.0..=1.0).contains(&self.prob_in_store_read) {
            errors.push(format!(
                "{name}.prob_in_store_read ({:.3}) must be in [0, 1]",
                self.prob_in_store_read
            ));
        }
        if !(0.0..1.0).contains(&self.prob_exit_error) {
            errors.push(format!(
                "{name}.prob_exit_error ({:.3}) must be in [0, 1)",
                self.prob_exit_error
            ));
        }
        if !(0.0..1.0).contains(&self.confidence_floor) {
            errors.push(format!(
                "{name}.confidence_floor ({:.3}) must be in [0, 1)",
                self.confidence_floor
            ));
        }
    }
}

// ============================================================================
// Read Policy
// ============================================================================

/// RSSI thresholds and exit debounce rules for one facility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadPolicy {
    /// Minimum RSSI for a read to count as an arrival (dBm)
    #[serde(default = "default_arrival_min_rssi")]
    pub arrival_min_rssi: i32,
    /// Reads below this RSSI are weak and decay faster (dBm)
    #[serde(default = "default_weak_read_rssi")]
    pub weak_read_rssi: i32,
    /// Minimum RSSI for an exit-portal read to advance a departure (dBm)
    #[serde(default = "default_exit_min_rssi")]
    pub exit_min_rssi: i32,
    /// Consecutive qualifying exit reads that confirm a departure
    #[serde(default = "default_exit_confirm_reads")]
    pub exit_confirm_reads: u32,
    /// Largest gap between consecutive exit reads in one sequence (ms)
    #[serde(default = "default_exit_confirm_window_ms")]
    pub exit_confirm_window_ms: i64,
}

fn default_arrival_min_rssi() -> i32 {
    defaults::ARRIVAL_MIN_RSSI_DBM
}
fn default_weak_read_rssi() -> i32 {
    defaults::WEAK_READ_RSSI_DBM
}
fn default_exit_min_rssi() -> i32 {
    defaults::EXIT_MIN_RSSI_DBM
}
fn default_exit_confirm_reads() -> u32 {
    defaults::EXIT_CONFIRM_READS
}
fn default_exit_confirm_window_ms() -> i64 {
    defaults::EXIT_CONFIRM_WINDOW_MS
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self {
            arrival_min_rssi: defaults::ARRIVAL_MIN_RSSI_DBM,
            weak_read_rssi: defaults::WEAK_READ_RSSI_DBM,
            exit_min_rssi: defaults::EXIT_MIN_RSSI_DBM,
            exit_confirm_reads: defaults::EXIT_CONFIRM_READS,
            exit_confirm_window_ms: defaults::EXIT_CONFIRM_WINDOW_MS,
        }
    }
}

impl ReadPolicy {
    pub fn check(&self, name: &str, errors: &mut Vec<String>) {
        let rssi_range = defaults::MIN_RSSI_DBM..=defaults::MAX_RSSI_DBM;
        for (field, value) in [
            ("arrival_min_rssi", self.arrival_min_rssi),
            ("weak_read_rssi", self.weak_read_rssi),
            ("exit_min_rssi", self.exit_min_rssi),
        ] {
            if !rssi_range.contains(&value) {
                errors.push(format!(
                    "{name}.{field} = {value} dBm is outside the reader range ({} to {} dBm)",
                    defaults::MIN_RSSI_DBM,
                    defaults::MAX_RSSI_DBM
                ));
            }
        }
        if self.exit_confirm_reads < 2 {
            errors.push(format!(
                "{name}.exit_confirm_reads ({}) must be >= 2 so a single exit read never confirms a departure",
                self.exit_confirm_reads
            ));
        }
        if self.exit_confirm_window_ms <= 0 {
            errors.push(format!(
                "{name}.exit_confirm_window_ms ({}) must be > 0",
                self.exit_confirm_window_ms
            ));
        }
    }
}

// ============================================================================
// Facility
// ============================================================================

/// A site with its own coefficients, age-out and EPC allow-list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Facility {
    pub id: String,
    pub active: bool,
    pub coefficients: FacilityCoefficients,
    pub age_out_minutes: u64,
    /// EPC prefixes admitted at this facility; empty admits everything
    pub epc_filters: Vec<String>,
    pub read_policy: ReadPolicy,
}

impl Facility {
    /// Facility with built-in defaults and no allow-list.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            active: true,
            coefficients: FacilityCoefficients::default(),
            age_out_minutes: defaults::AGE_OUT_MINUTES,
            epc_filters: Vec::new(),
            read_policy: ReadPolicy::default(),
        }
    }

    pub fn age_out_ms(&self) -> i64 {
        i64::try_from(self.age_out_minutes.saturating_mul(60_000)).unwrap_or(i64::MAX)
    }

    /// Case-insensitive prefix match against the allow-list.
    pub fn admits(&self, epc: &str) -> bool {
        if self.epc_filters.is_empty() {
            return true;
        }
        let epc = epc.to_ascii_uppercase();
        self.epc_filters
            .iter()
            .any(|prefix| epc.starts_with(&prefix.to_ascii_uppercase()))
    }
}

// ============================================================================
// Sensors
// ============================================================================

/// Role of a fixed sensor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SensorPersonality {
    /// Sales floor or backroom coverage
    #[default]
    None,
    /// Exit portal
    Exit,
    /// Point of sale
    Pos,
}

impl std::fmt::Display for SensorPersonality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SensorPersonality::None => "none",
            SensorPersonality::Exit => "exit",
            SensorPersonality::Pos => "pos",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RfidSensor {
    pub device_id: String,
    pub facility_id: String,
    #[serde(default)]
    pub personality: SensorPersonality,
    /// Replaces the facility's qualifying threshold for this sensor (dBm)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_rssi: Option<i32>,
}
