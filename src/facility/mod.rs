//! Facility and sensor directories.
//!
//! The engine only reads reference data through [`FacilityDirectory`] and
//! [`SensorDirectory`]. [`FacilityRegistry`] is the in-process implementation:
//! readers load a snapshot without locking, and administrative updates swap in
//! a new map.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::InventoryConfig;
use crate::types::{Facility, FacilityCoefficients, RfidSensor};

// ============================================================================
// Directory Traits
// ============================================================================

/// Read-only facility lookup used by ingress, engine and confidence scoring.
pub trait FacilityDirectory: Send + Sync {
    fn facility(&self, id: &str) -> Option<Arc<Facility>>;

    /// Template used when a tag names a facility the directory does not know.
    fn fallback(&self) -> Arc<Facility>;
}

/// Read-only sensor lookup. Unknown devices behave as plain floor sensors.
pub trait SensorDirectory: Send + Sync {
    fn sensor(&self, device_id: &str) -> Option<RfidSensor>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("facility '{0}' is not registered")]
    NotFound(String),
    #[error("invalid coefficients for facility '{facility}': {}", .errors.join("; "))]
    Invalid { facility: String, errors: Vec<String> },
}

// ============================================================================
// Facility Registry
// ============================================================================

pub struct FacilityRegistry {
    facilities: ArcSwap<HashMap<String, Arc<Facility>>>,
    fallback: Arc<Facility>,
}

impl FacilityRegistry {
    pub fn new(facilities: Vec<Facility>, fallback: Facility) -> Self {
        let map = facilities
            .into_iter()
            .map(|f| (f.id.clone(), Arc::new(f)))
            .collect();
        Self {
            facilities: ArcSwap::from_pointee(map),
            fallback: Arc::new(fallback),
        }
    }

    pub fn from_config(config: &InventoryConfig) -> Self {
        let mut fallback = Facility::new("default");
        fallback.coefficients = config.defaults.coefficients;
        fallback.read_policy = config.defaults.read_policy;
        fallback.age_out_minutes = config.defaults.age_out_minutes;
        Self::new(config.resolved_facilities(), fallback)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.facilities.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids of facilities currently accepting reads.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .facilities
            .load()
            .values()
            .filter(|f| f.active)
            .map(|f| f.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Insert or replace one facility.
    pub fn upsert(&self, facility: Facility) {
        let facility = Arc::new(facility);
        self.facilities.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(facility.id.clone(), Arc::clone(&facility));
            next
        });
    }

    /// Replace a facility's confidence coefficients.
    pub fn update_coefficients(
        &self,
        id: &str,
        coefficients: FacilityCoefficients,
    ) -> Result<(), RegistryError> {
        let mut errors = Vec::new();
        coefficients.check("coefficients", &mut errors);
        if !errors.is_empty() {
            return Err(RegistryError::Invalid {
                facility: id.to_string(),
                errors,
            });
        }
        self.modify(id, |f| f.coefficients = coefficients)?;
        info!(facility = %id, ?coefficients, "Facility coefficients updated");
        Ok(())
    }

    pub fn set_active(&self, id: &str, active: bool) -> Result<(), RegistryError> {
        self.modify(id, |f| f.active = active)?;
        info!(facility = %id, active, "Facility activation changed");
        Ok(())
    }

    /// Swap in the facilities of a freshly loaded config.
    ///
    /// Returns the ids whose definition changed, was added or was removed.
    pub fn reload(&self, config: &InventoryConfig) -> Vec<String> {
        let incoming: HashMap<String, Arc<Facility>> = config
            .resolved_facilities()
            .into_iter()
            .map(|f| (f.id.clone(), Arc::new(f)))
            .collect();
        let previous = self.facilities.swap(Arc::new(incoming.clone()));

        let mut changed = Vec::new();
        for (id, facility) in &incoming {
            let same = previous
                .get(id)
                .is_some_and(|old| Facility::eq(old, facility));
            if !same {
                changed.push(id.clone());
            }
        }
        changed.extend(
            previous
                .keys()
                .filter(|id| !incoming.contains_key(*id))
                .cloned(),
        );
        changed.sort();
        changed
    }

    fn modify<F>(&self, id: &str, apply: F) -> Result<(), RegistryError>
    where
        F: Fn(&mut Facility),
    {
        if !self.facilities.load().contains_key(id) {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        self.facilities.rcu(|current| {
            let mut next = HashMap::clone(current);
            if let Some(existing) = next.get(id) {
                let mut updated = Facility::clone(existing);
                apply(&mut updated);
                next.insert(id.to_string(), Arc::new(updated));
            }
            next
        });
        Ok(())
    }
}

impl FacilityDirectory for FacilityRegistry {
    fn facility(&self, id: &str) -> Option<Arc<Facility>> {
        self.facilities.load().get(id).cloned()
    }

    fn fallback(&self) -> Arc<Facility> {
        Arc::clone(&self.fallback)
    }
}

// ============================================================================
// Sensor Registry
// ============================================================================

#[derive(Debug, Default)]
pub struct SensorRegistry {
    sensors: HashMap<String, RfidSensor>,
}

impl SensorRegistry {
    pub fn new(sensors: Vec<RfidSensor>) -> Self {
        Self {
            sensors: sensors
                .into_iter()
                .map(|s| (s.device_id.clone(), s))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

impl SensorDirectory for SensorRegistry {
    fn sensor(&self, device_id: &str) -> Option<RfidSensor> {
        self.sensors.get(device_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SensorPersonality;

    fn registry() -> FacilityRegistry {
        FacilityRegistry::new(
            vec![Facility::new("F1"), Facility::new("F2")],
            Facility::new("default"),
        )
    }

    #[test]
    fn test_lookup_and_fallback() {
        let registry = registry();
        assert!(registry.facility("F1").is_some());
        assert!(registry.facility("F9").is_none());
        assert_eq!(registry.fallback().id, "default");
        assert_eq!(registry.ids(), vec!["F1".to_string(), "F2".to_string()]);
    }

    #[test]
    fn test_update_coefficients_visible_to_new_loads() {
        let registry = registry();
        let before = registry.facility("F1").unwrap();

        let coefficients = FacilityCoefficients {
            prob_unread_to_read: 0.5,
            ..FacilityCoefficients::default()
        };
        registry.update_coefficients("F1", coefficients).unwrap();

        let after = registry.facility("F1").unwrap();
        assert!((after.coefficients.prob_unread_to_read - 0.5).abs() < f64::EPSILON);
        // Snapshots taken earlier keep their values
        assert!((before.coefficients.prob_unread_to_read - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_update_coefficients_errors() {
        let registry = registry();
        assert!(matches!(
            registry.update_coefficients("F9", FacilityCoefficients::default()),
            Err(RegistryError::NotFound(_))
        ));
        let invalid = FacilityCoefficients {
            prob_unread_to_read: 0.0,
            ..FacilityCoefficients::default()
        };
        assert!(matches!(
            registry.update_coefficients("F1", invalid),
            Err(RegistryError::Invalid { .. })
        ));
    }

    #[test]
    fn test_set_active() {
        let registry = registry();
        registry.set_active("F2", false).unwrap();
        assert_eq!(registry.active_ids(), vec!["F1".to_string()]);
    }

    #[test]
    fn test_reload_reports_changed_ids() {
        let registry = registry();
        let mut config = InventoryConfig::default();
        config.facilities.clear();
        config
            .facilities
            .insert("F1".into(), crate::config::FacilityConfig::default());
        config.facilities.insert(
            "F3".into(),
            crate::config::FacilityConfig {
                age_out_minutes: Some(5),
                ..crate::config::FacilityConfig::default()
            },
        );

        let changed = registry.reload(&config);
        // F1 unchanged, F2 removed, F3 added
        assert_eq!(changed, vec!["F2".to_string(), "F3".to_string()]);
        assert!(registry.facility("F2").is_none());
        assert_eq!(registry.facility("F3").unwrap().age_out_minutes, 5);
    }

    #[test]
    fn test_sensor_registry() {
        let sensors = SensorRegistry::new(vec![RfidSensor {
            device_id: "exit-1".into(),
            facility_id: "F1".into(),
            personality: SensorPersonality::Exit,
            min_rssi: None,
        }]);
        assert_eq!(
            sensors.sensor("exit-1").map(|s| s.personality),
            Some(SensorPersonality::Exit)
        );
        assert!(sensors.sensor("floor-1").is_none());
    }
}
