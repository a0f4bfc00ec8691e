//! Presence confidence
//!
//! A present tag is assumed to be read at a constant rate while it stays on
//! the premises, so the chance it is still there after a silence of `t` days
//! decays exponentially:
//!
//! ```text
//! cycles_per_day = daily_inventory_percentage / 100
//! rate           = -ln(1 - prob_unread_to_read) * cycles_per_day
//! weight         = 1
//!                  * (1 + prob_in_store_read)   last read weaker than weak_read_rssi
//!                  * (1 - prob_exit_error)      tag is Exiting
//! confidence     = floor + (1 - floor) * exp(-rate * weight * t)
//! ```
//!
//! Departed and Unknown tags score 0. Scores are computed on demand and
//! never stored.

use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::config::defaults::MS_PER_DAY;
use crate::facility::FacilityDirectory;
use crate::types::{FacilityCoefficients, ReadPolicy, Tag, TagState};

/// Where the coefficients behind a score came from.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CoefficientSource {
    Facility,
    /// The tag's facility is unknown; built-in defaults were used
    Default,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct ConfidenceScore {
    pub value: f64,
    pub source: CoefficientSource,
}

/// A tag paired with its confidence at query time.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScoredTag {
    #[serde(flatten)]
    pub tag: Tag,
    pub confidence: f64,
}

/// Decay rate per day for a tag under the given coefficients.
pub fn decay_rate_per_day(coefficients: &FacilityCoefficients, policy: &ReadPolicy, tag: &Tag) -> f64 {
    // Keep ln() finite and the weights positive even for unvalidated inputs
    let p_read = coefficients
        .prob_unread_to_read
        .clamp(f64::EPSILON, 1.0 - f64::EPSILON);
    let cycles_per_day = (coefficients.daily_inventory_percentage / 100.0).max(0.0);
    let mut rate = -(1.0 - p_read).ln() * cycles_per_day;

    if tag.last_rssi < policy.weak_read_rssi {
        rate *= 1.0 + coefficients.prob_in_store_read.clamp(0.0, 1.0);
    }
    if tag.state == TagState::Exiting {
        rate *= 1.0 - coefficients.prob_exit_error.clamp(0.0, 1.0 - f64::EPSILON);
    }
    rate
}

/// Probability that `tag` is still present at `now`.
pub fn presence_probability(
    coefficients: &FacilityCoefficients,
    policy: &ReadPolicy,
    tag: &Tag,
    now: i64,
) -> f64 {
    match tag.state {
        TagState::Unknown | TagState::DepartedExit | TagState::DepartedPos => 0.0,
        TagState::Present | TagState::Exiting => {
            #[allow(clippy::cast_precision_loss)]
            let elapsed_days = tag.silent_for(now) as f64 / MS_PER_DAY;
            let floor = coefficients.confidence_floor.clamp(0.0, 1.0);
            let rate = decay_rate_per_day(coefficients, policy, tag);
            (floor + (1.0 - floor) * (-rate * elapsed_days).exp()).clamp(0.0, 1.0)
        }
    }
}

/// Scores tags against the coefficients of their facility.
pub struct ConfidenceEngine {
    facilities: Arc<dyn FacilityDirectory>,
}

impl ConfidenceEngine {
    pub fn new(facilities: Arc<dyn FacilityDirectory>) -> Self {
        Self { facilities }
    }

    pub fn score(&self, tag: &Tag, now: i64) -> ConfidenceScore {
        let (facility, source) = match self.facilities.facility(&tag.facility_id) {
            Some(f) => (f, CoefficientSource::Facility),
            None => {
                warn!(
                    epc = %tag.epc,
                    facility = %tag.facility_id,
                    "No coefficients for facility, scoring with defaults"
                );
                (self.facilities.fallback(), CoefficientSource::Default)
            }
        };
        ConfidenceScore {
            value: presence_probability(&facility.coefficients, &facility.read_policy, tag, now),
            source,
        }
    }

    pub fn confidence(&self, tag: &Tag, now: i64) -> f64 {
        self.score(tag, now).value
    }

    pub fn score_all(&self, tags: Vec<Tag>, now: i64) -> Vec<ScoredTag> {
        tags.into_iter()
            .map(|tag| {
                let confidence = self.confidence(&tag, now);
                ScoredTag { tag, confidence }
            })
            .collect()
    }
}
