//! Inventory service configuration loaded from TOML.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::defaults;
use crate::types::{Facility, FacilityCoefficients, ReadPolicy, RfidSensor};

// ============================================================================
// Top-level Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    /// Values inherited by every facility that does not override them
    #[serde(default)]
    pub defaults: FacilityDefaults,

    #[serde(default = "default_facilities")]
    pub facilities: BTreeMap<String, FacilityConfig>,

    #[serde(default)]
    pub sensors: Vec<RfidSensor>,

    #[serde(default)]
    pub publisher: PublisherConfig,
}

fn default_facilities() -> BTreeMap<String, FacilityConfig> {
    let mut facilities = BTreeMap::new();
    facilities.insert(
        defaults::DEFAULT_FACILITY_ID.to_string(),
        FacilityConfig::default(),
    );
    facilities
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            engine: EngineConfig::default(),
            defaults: FacilityDefaults::default(),
            facilities: default_facilities(),
            sensors: Vec::new(),
            publisher: PublisherConfig::default(),
        }
    }
}

impl InventoryConfig {
    /// Load configuration using the standard search order:
    /// 1. `$RFID_CONFIG` environment variable
    /// 2. `./inventory_config.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("RFID_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), service = %config.service.name, "Loaded inventory config from RFID_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from RFID_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "RFID_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from("inventory_config.toml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(service = %config.service.name, "Loaded inventory config from ./inventory_config.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./inventory_config.toml, using defaults");
                }
            }
        }

        info!("No inventory_config.toml found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, err) => ConfigError::Parse(path.to_path_buf(), err),
            other => other,
        })
    }

    /// Parse and validate TOML text. Unknown keys only warn.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self = toml::from_str(contents)
            .map_err(|e| ConfigError::Parse(PathBuf::from("<inline>"), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = self.to_toml()?;
        std::fs::write(path, contents).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        info!(path = %path.display(), "Inventory config saved");
        Ok(())
    }

    /// Validate cross-field invariants and ranges.
    ///
    /// Errors block startup; suspicious values are logged as warnings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.engine.location_history_limit == 0 {
            errors.push("engine.location_history_limit must be > 0".to_string());
        }
        if self.engine.lock_stripes == 0 {
            errors.push("engine.lock_stripes must be > 0".to_string());
        }
        if self.publisher.queue_capacity == 0 {
            errors.push("publisher.queue_capacity must be > 0".to_string());
        }
        if self.publisher.sink_timeout_secs == 0 {
            errors.push("publisher.sink_timeout_secs must be > 0".to_string());
        }
        for (key, url) in [
            ("publisher.cloud_connector_url", &self.publisher.cloud_connector_url),
            ("publisher.rules_url", &self.publisher.rules_url),
        ] {
            if let Some(url) = url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    errors.push(format!("{key} = '{url}' must be an http(s) URL"));
                }
            }
        }

        if self.defaults.age_out_minutes == 0 {
            errors.push("defaults.age_out_minutes must be > 0".to_string());
        }
        self.defaults
            .coefficients
            .check("defaults.coefficients", &mut errors);
        self.defaults
            .read_policy
            .check("defaults.read_policy", &mut errors);

        for (id, facility) in &self.facilities {
            if id.trim().is_empty() {
                errors.push("facility ids must not be empty".to_string());
            }
            if facility.age_out_minutes == Some(0) {
                errors.push(format!("facilities.{id}.age_out_minutes must be > 0"));
            }
            if let Some(ref c) = facility.coefficients {
                c.check(&format!("facilities.{id}.coefficients"), &mut errors);
            }
            if let Some(ref p) = facility.read_policy {
                p.check(&format!("facilities.{id}.read_policy"), &mut errors);
            }
            for prefix in &facility.epc_filters {
                if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
                    errors.push(format!(
                        "facilities.{id}.epc_filters entry '{prefix}' must be a non-empty hex prefix"
                    ));
                }
            }
        }

        let mut seen = HashSet::new();
        for sensor in &self.sensors {
            if sensor.device_id.trim().is_empty() {
                errors.push("sensors: device_id must not be empty".to_string());
            } else if !seen.insert(sensor.device_id.as_str()) {
                errors.push(format!("sensors: duplicate device_id '{}'", sensor.device_id));
            }
        }

        let (range_errors, range_warnings) = super::validation::validate_ranges(self);
        errors.extend(range_errors);
        for w in &range_warnings {
            warn!("{}", w);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Resolve every configured facility against the `[defaults]` section.
    pub fn resolved_facilities(&self) -> Vec<Facility> {
        self.facilities
            .iter()
            .map(|(id, f)| Facility {
                id: id.clone(),
                active: f.active,
                coefficients: f.coefficients.unwrap_or(self.defaults.coefficients),
                age_out_minutes: f.age_out_minutes.unwrap_or(self.defaults.age_out_minutes),
                epc_filters: f.epc_filters.clone(),
                read_policy: f.read_policy.unwrap_or(self.defaults.read_policy),
            })
            .collect()
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_service_name() -> String {
    defaults::SERVICE_NAME.to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(defaults::DATA_DIR)
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    #[serde(default = "default_location_history_limit")]
    pub location_history_limit: usize,
    #[serde(default = "default_lock_stripes")]
    pub lock_stripes: usize,
}

fn default_location_history_limit() -> usize {
    defaults::LOCATION_HISTORY_LIMIT
}
fn default_lock_stripes() -> usize {
    defaults::LOCK_STRIPES
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            location_history_limit: defaults::LOCATION_HISTORY_LIMIT,
            lock_stripes: defaults::LOCK_STRIPES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FacilityDefaults {
    #[serde(default = "default_age_out_minutes")]
    pub age_out_minutes: u64,
    #[serde(default)]
    pub coefficients: FacilityCoefficients,
    #[serde(default)]
    pub read_policy: ReadPolicy,
}

fn default_age_out_minutes() -> u64 {
    defaults::AGE_OUT_MINUTES
}

impl Default for FacilityDefaults {
    fn default() -> Self {
        Self {
            age_out_minutes: defaults::AGE_OUT_MINUTES,
            coefficients: FacilityCoefficients::default(),
            read_policy: ReadPolicy::default(),
        }
    }
}

/// One `[facilities.<id>]` table. Unset fields inherit from `[defaults]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FacilityConfig {
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_out_minutes: Option<u64>,
    #[serde(default)]
    pub epc_filters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coefficients: Option<FacilityCoefficients>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_policy: Option<ReadPolicy>,
}

fn default_active() -> bool {
    true
}

impl Default for FacilityConfig {
    fn default() -> Self {
        Self {
            active: true,
            age_out_minutes: None,
            epc_filters: Vec::new(),
            coefficients: None,
            read_policy: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublisherConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_sink_timeout_secs")]
    pub sink_timeout_secs: u64,
    /// Receives every committed batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_connector_url: Option<String>,
    /// Receives only batches that changed a presence state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_url: Option<String>,
    /// Record state changes in the sled time series
    #[serde(default)]
    pub time_series: bool,
}

fn default_queue_capacity() -> usize {
    defaults::PUBLISH_QUEUE_CAPACITY
}
fn default_sink_timeout_secs() -> u64 {
    defaults::SINK_TIMEOUT_SECS
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::PUBLISH_QUEUE_CAPACITY,
            sink_timeout_secs: defaults::SINK_TIMEOUT_SECS,
            cloud_connector_url: None,
            rules_url: None,
            time_series: false,
        }
    }
}
