//! Config validation: unknown-key detection with Levenshtein suggestions
//! and range checks.
//!
//! Two-pass parse approach: first deserialize raw TOML into `toml::Value`,
//! walk the key tree, compare against known field names, and emit warnings
//! with "did you mean?" suggestions. Then proceed with normal serde
//! deserialization. Warnings never break existing configs.

use std::collections::HashSet;

/// A non-fatal config warning (typo, suspicious value).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (did you mean '{s}'?)")?;
        }
        Ok(())
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Every valid dotted key path for `InventoryConfig`.
///
/// `*` stands for one user-chosen segment (a facility id). Array-of-tables
/// entries such as `[[sensors]]` are walked without an index.
/// Any new field added to `InventoryConfig` must be added here too.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [service]
        "service",
        "service.name",
        "service.data_dir",
        // [engine]
        "engine",
        "engine.location_history_limit",
        "engine.lock_stripes",
        // [defaults]
        "defaults",
        "defaults.age_out_minutes",
        "defaults.coefficients",
        "defaults.coefficients.daily_inventory_percentage",
        "defaults.coefficients.prob_unread_to_read",
        "defaults.coefficients.prob_in_store_read",
        "defaults.coefficients.prob_exit_error",
        "defaults.coefficients.confidence_floor",
        "defaults.read_policy",
        "defaults.read_policy.arrival_min_rssi",
        "defaults.read_policy.weak_read_rssi",
        "defaults.read_policy.exit_min_rssi",
        "defaults.read_policy.exit_confirm_reads",
        "defaults.read_policy.exit_confirm_window_ms",
        // [facilities.<id>]
        "facilities",
        "facilities.*",
        "facilities.*.active",
        "facilities.*.age_out_minutes",
        "facilities.*.epc_filters",
        "facilities.*.coefficients",
        "facilities.*.coefficients.daily_inventory_percentage",
        "facilities.*.coefficients.prob_unread_to_read",
        "facilities.*.coefficients.prob_in_store_read",
        "facilities.*.coefficients.prob_exit_error",
        "facilities.*.coefficients.confidence_floor",
        "facilities.*.read_policy",
        "facilities.*.read_policy.arrival_min_rssi",
        "facilities.*.read_policy.weak_read_rssi",
        "facilities.*.read_policy.exit_min_rssi",
        "facilities.*.read_policy.exit_confirm_reads",
        "facilities.*.read_policy.exit_confirm_window_ms",
        // [[sensors]]
        "sensors",
        "sensors.device_id",
        "sensors.facility_id",
        "sensors.personality",
        "sensors.min_rssi",
        // [publisher]
        "publisher",
        "publisher.queue_capacity",
        "publisher.sink_timeout_secs",
        "publisher.cloud_connector_url",
        "publisher.rules_url",
        "publisher.time_series",
    ];
    keys.iter().copied().collect()
}

/// Segment-wise match where `*` in the pattern accepts any single segment.
fn matches_pattern(key: &str, pattern: &str) -> bool {
    let mut k = key.split('.');
    let mut p = pattern.split('.');
    loop {
        match (k.next(), p.next()) {
            (None, None) => return true,
            (Some(ks), Some(ps)) if ps == "*" || ps == ks => {}
            _ => return false,
        }
    }
}

/// Substitute the key's own segments for the pattern's wildcards, so the
/// suggestion reads `facilities.STORE_1.active`, not `facilities.*.active`.
fn instantiate(pattern: &str, key: &str) -> Option<String> {
    let key_segments: Vec<&str> = key.split('.').collect();
    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    if key_segments.len() != pattern_segments.len() {
        return None;
    }
    let joined = pattern_segments
        .iter()
        .zip(&key_segments)
        .map(|(p, k)| if *p == "*" { *k } else { *p })
        .collect::<Vec<_>>()
        .join(".");
    Some(joined)
}

// ============================================================================
// TOML Key Walking
// ============================================================================

/// Recursively walks a `toml::Value` tree and collects all dotted key paths.
///
/// For example, a table `{ a = { b = 1, c = 2 } }` yields:
/// `["a", "a.b", "a.c"]`. Tables inside arrays contribute their keys under
/// the array's path.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(table) = value.as_table() {
        for (k, v) in table {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{prefix}.{k}")
            };
            keys.push(path.clone());
            match v {
                toml::Value::Table(_) => keys.extend(walk_toml_keys(v, &path)),
                toml::Value::Array(items) => {
                    for item in items.iter().filter(|i| i.is_table()) {
                        for nested in walk_toml_keys(item, &path) {
                            if !keys.contains(&nested) {
                                keys.push(nested);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
    keys
}

// ============================================================================
// Levenshtein Distance
// ============================================================================

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Suggest the closest known key for an unknown key, if within edit distance 3.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    let mut best: Option<(String, usize)> = None;
    for &pattern in known {
        let Some(candidate) = instantiate(pattern, unknown) else {
            continue;
        };
        let dist = levenshtein(unknown, &candidate);
        if dist <= 3 && best.as_ref().map_or(true, |(_, d)| dist < *d) {
            best = Some((candidate, dist));
        }
    }
    best.map(|(k, _)| k)
}

// ============================================================================
// Unknown Key Validation (entry point)
// ============================================================================

/// Parse a raw TOML string and return warnings for any unknown config keys.
///
/// This does NOT fail on unknown keys, it only warns.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let value: toml::Value = match raw_toml.parse() {
        Ok(v) => v,
        Err(_) => return Vec::new(), // parse errors are reported by serde later
    };

    let known = known_config_keys();
    let mut warnings = Vec::new();

    for key in walk_toml_keys(&value, "") {
        if known.iter().any(|pattern| matches_pattern(&key, pattern)) {
            continue;
        }
        let suggestion = suggest_correction(&key, &known);
        warnings.push(ValidationWarning {
            message: format!("Unknown config key '{key}'"),
            field: key,
            suggestion,
        });
    }

    warnings
}

// ============================================================================
// Range Validation
// ============================================================================

/// Validate value ranges on a parsed `InventoryConfig`.
///
/// Returns (errors, warnings). Errors are impossible values that must
/// prevent startup; warnings are suspicious but not fatal.
pub fn validate_ranges(config: &super::InventoryConfig) -> (Vec<String>, Vec<ValidationWarning>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    // Stripes beyond this only burn memory; EPC hashing is already uniform.
    if config.engine.lock_stripes > 65_536 {
        errors.push(format!(
            "engine.lock_stripes = {} exceeds the maximum of 65536",
            config.engine.lock_stripes
        ));
    }

    for facility in config.resolved_facilities() {
        let policy = &facility.read_policy;
        if policy.exit_min_rssi < policy.arrival_min_rssi {
            warnings.push(ValidationWarning {
                field: format!("facilities.{}.read_policy.exit_min_rssi", facility.id),
                message: format!(
                    "facility {}: exit_min_rssi ({}) is weaker than arrival_min_rssi ({}); exit reads will qualify more easily than arrivals",
                    facility.id, policy.exit_min_rssi, policy.arrival_min_rssi
                ),
                suggestion: None,
            });
        }
        if policy.weak_read_rssi < policy.arrival_min_rssi {
            warnings.push(ValidationWarning {
                field: format!("facilities.{}.read_policy.weak_read_rssi", facility.id),
                message: format!(
                    "facility {}: weak_read_rssi ({}) is below arrival_min_rssi ({}); no accepted read will ever count as weak",
                    facility.id, policy.weak_read_rssi, policy.arrival_min_rssi
                ),
                suggestion: None,
            });
        }
        // A week is far beyond any realistic read cadence.
        if facility.age_out_minutes > 10_080 {
            warnings.push(ValidationWarning {
                field: format!("facilities.{}.age_out_minutes", facility.id),
                message: format!(
                    "facility {}: age_out_minutes = {} is over a week",
                    facility.id, facility.age_out_minutes
                ),
                suggestion: None,
            });
        }
    }

    for sensor in &config.sensors {
        if !config.facilities.contains_key(&sensor.facility_id) {
            warnings.push(ValidationWarning {
                field: "sensors.facility_id".to_string(),
                message: format!(
                    "sensor '{}' references unconfigured facility '{}'",
                    sensor.device_id, sensor.facility_id
                ),
                suggestion: None,
            });
        }
        if let Some(rssi) = sensor.min_rssi {
            if !(super::defaults::MIN_RSSI_DBM..=super::defaults::MAX_RSSI_DBM).contains(&rssi) {
                errors.push(format!(
                    "sensor '{}': min_rssi = {rssi} dBm is outside the reader range",
                    sensor.device_id
                ));
            }
        }
    }

    (errors, warnings)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein_identical() {
        assert_eq!(levenshtein("hello", "hello"), 0);
    }

    #[test]
    fn test_levenshtein_one_edit() {
        assert_eq!(levenshtein("epc_filter", "epc_filters"), 1);
    }

    #[test]
    fn test_levenshtein_empty() {
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", ""), 3);
    }

    #[test]
    fn test_walk_toml_keys_nested() {
        let toml: toml::Value = r#"
            [defaults]
            [defaults.coefficients]
            prob_exit_error = 0.1
        "#
        .parse()
        .unwrap();
        let keys = walk_toml_keys(&toml, "");
        assert!(keys.contains(&"defaults".to_string()));
        assert!(keys.contains(&"defaults.coefficients".to_string()));
        assert!(keys.contains(&"defaults.coefficients.prob_exit_error".to_string()));
    }

    #[test]
    fn test_walk_toml_keys_array_of_tables() {
        let toml: toml::Value = r#"
            [[sensors]]
            device_id = "a"
            [[sensors]]
            device_id = "b"
            personality = "exit"
        "#
        .parse()
        .unwrap();
        let keys = walk_toml_keys(&toml, "");
        assert_eq!(
            keys.iter().filter(|k| *k == "sensors.device_id").count(),
            1
        );
        assert!(keys.contains(&"sensors.personality".to_string()));
    }

    #[test]
    fn test_wildcard_facility_keys_are_known() {
        let warnings = validate_unknown_keys(
            r#"
            [facilities.STORE_9]
            active = true
            [facilities.STORE_9.coefficients]
            prob_exit_error = 0.2
        "#,
        );
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    #[test]
    fn test_facility_typo_suggests_instantiated_key() {
        let warnings = validate_unknown_keys(
            r#"
            [facilities.STORE_9]
            epc_filter = ["3034"]
        "#,
        );
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "facilities.STORE_9.epc_filter");
        assert_eq!(
            warnings[0].suggestion.as_deref(),
            Some("facilities.STORE_9.epc_filters")
        );
    }

    #[test]
    fn test_unknown_section_without_suggestion() {
        let warnings = validate_unknown_keys("[dashboard]\nport = 8080\n");
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().all(|w| w.suggestion.is_none()));
    }

    #[test]
    fn test_sensor_unknown_facility_warns() {
        let mut config = super::super::InventoryConfig::default();
        config.sensors.push(crate::types::RfidSensor {
            device_id: "d1".into(),
            facility_id: "NOWHERE".into(),
            personality: crate::types::SensorPersonality::None,
            min_rssi: None,
        });
        let (errors, warnings) = validate_ranges(&config);
        assert!(errors.is_empty());
        assert!(warnings.iter().any(|w| w.message.contains("NOWHERE")));
    }
}
