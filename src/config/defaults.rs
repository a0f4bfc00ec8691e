//! System-wide default constants.
//!
//! Grouped by subsystem for easy discovery. Anything an operator may want to
//! tune is also exposed through `inventory_config.toml`.

// ============================================================================
// Read Validation
// ============================================================================

/// Longest accepted EPC, in hex characters (256-bit EPC memory bank).
pub const MAX_EPC_HEX_LEN: usize = 64;

/// Weakest RSSI a reader can plausibly report (dBm).
pub const MIN_RSSI_DBM: i32 = -128;

/// Strongest RSSI a reader can plausibly report (dBm).
pub const MAX_RSSI_DBM: i32 = 20;

// ============================================================================
// Read Policy
// ============================================================================

/// Reads at or above this RSSI count as arrivals (dBm).
pub const ARRIVAL_MIN_RSSI_DBM: i32 = -80;

/// Reads below this RSSI are weak; weak last reads decay faster (dBm).
pub const WEAK_READ_RSSI_DBM: i32 = -70;

/// Exit-portal reads at or above this RSSI advance a departure (dBm).
pub const EXIT_MIN_RSSI_DBM: i32 = -60;

/// Consecutive qualifying exit reads that confirm a departure.
pub const EXIT_CONFIRM_READS: u32 = 3;

/// Largest gap between consecutive exit reads of one sequence (ms).
pub const EXIT_CONFIRM_WINDOW_MS: i64 = 30_000;

/// Silence after which a present tag is aged out (minutes). 1 440 = 1 day.
pub const AGE_OUT_MINUTES: u64 = 1_440;

// ============================================================================
// Confidence Model
// ============================================================================

/// Share of inventory covered per day by the readers (percent).
pub const DAILY_INVENTORY_PERCENTAGE: f64 = 100.0;

/// Probability a present tag is read in one inventory cycle.
pub const PROB_UNREAD_TO_READ: f64 = 0.2;

/// Decay weight added when the last read was weak.
pub const PROB_IN_STORE_READ: f64 = 0.75;

/// Probability an exit read was spurious.
pub const PROB_EXIT_ERROR: f64 = 0.1;

/// Lower bound of the decay curve.
pub const CONFIDENCE_FLOOR: f64 = 0.0;

/// Milliseconds in one day, the decay model's time unit.
pub const MS_PER_DAY: f64 = 86_400_000.0;

// ============================================================================
// Engine
// ============================================================================

/// Location history entries kept per tag.
pub const LOCATION_HISTORY_LIMIT: usize = 10;

/// Stripes in the per-EPC lock table.
pub const LOCK_STRIPES: usize = 256;

/// Facility created when no facilities are configured.
pub const DEFAULT_FACILITY_ID: &str = "DEFAULT_FACILITY";

// ============================================================================
// Publisher
// ============================================================================

/// Buffered publish events before new ones are dropped.
pub const PUBLISH_QUEUE_CAPACITY: usize = 1_024;

/// Per-sink delivery timeout (seconds).
pub const SINK_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Service
// ============================================================================

/// Service name used in logs.
pub const SERVICE_NAME: &str = "rfid-inventory";

/// Directory for the sled stores and the process lock.
pub const DATA_DIR: &str = "./data";

/// File name of the tag index inside the data directory.
pub const TAG_DB_DIR: &str = "tags.db";

/// File name of the change time series inside the data directory.
pub const TIME_SERIES_DB_DIR: &str = "changes.db";
