//! Risk fusion: merges the latest known result of every source into one level.
//!
//! Pure functions over values. The engine only knows which numeric tiers
//! have a UI mapping and how long a retained level stays valid.

use std::collections::BTreeMap;

use chrono::Duration;

use crate::config::StatusConfig;
use crate::types::{FusionOutcome, RiskLevel, SourceId, Timestamp};

#[derive(Debug, Clone, PartialEq)]
pub struct RiskFusionEngine {
    tiers: Vec<f64>,
    risk_validity: Option<Duration>,
}

impl RiskFusionEngine {
    pub fn new(tiers: impl IntoIterator<Item = f64>) -> Self {
        Self {
            tiers: tiers.into_iter().collect(),
            risk_validity: None,
        }
    }

    pub fn from_config(config: &StatusConfig) -> Self {
        Self::new(config.risk_tiers.iter().map(|t| t.level))
            .with_risk_validity(config.risk_validity())
    }

    /// Retained (not freshly reported) nonzero levels older than `validity`
    /// decay to zero in [`fuse_at`](Self::fuse_at).
    pub fn with_risk_validity(mut self, validity: Duration) -> Self {
        self.risk_validity = Some(validity);
        self
    }

    pub fn has_tier(&self, level: f64) -> bool {
        self.tiers.iter().any(|t| (t - level).abs() < f64::EPSILON)
    }

    /// Levels without a configured tier become "no risk".
    pub fn normalize(&self, level: RiskLevel) -> RiskLevel {
        if level.is_none() || !self.has_tier(level.level) {
            return RiskLevel::none();
        }
        level
    }

    /// Merge the latest known result of every source against the previously
    /// presented level.
    ///
    /// The maximum result (by level, then scoring recency) becomes the new
    /// level. When no source has a result the previous level is retained.
    pub fn fuse(
        &self,
        previous: &RiskLevel,
        results: &BTreeMap<SourceId, Option<RiskLevel>>,
    ) -> FusionOutcome {
        let selected = match Self::max_result(results.values().flatten()) {
            Some(level) => self.normalize(level),
            None => self.normalize(previous.clone()),
        };
        Self::outcome(previous, selected)
    }

    /// Fusion for one refresh cycle.
    ///
    /// `fresh` holds this cycle's answers and `retained` the last result each
    /// source produced before. A fresh result replaces the source's retained
    /// one. Retained results past the validity window drop out, and so does a
    /// retained previous level once no source vouches for anything.
    pub fn fuse_at(
        &self,
        previous: &RiskLevel,
        fresh: &BTreeMap<SourceId, Option<RiskLevel>>,
        retained: &BTreeMap<SourceId, Option<RiskLevel>>,
        now: Timestamp,
    ) -> FusionOutcome {
        let mut latest = BTreeMap::new();
        for (id, level) in retained {
            match level {
                Some(level) if self.is_expired(level, now) => {
                    log::info!("Risk fusion: retained {} result {} expired", id, level);
                }
                Some(level) => {
                    latest.insert(*id, level);
                }
                None => {}
            }
        }
        for (id, level) in fresh {
            if let Some(level) = level {
                latest.insert(*id, level);
            }
        }

        let selected = match Self::max_result(latest.into_values()) {
            Some(level) => self.normalize(level),
            None if self.is_expired(previous, now) => {
                log::info!("Risk fusion: {} expired, resetting to no risk", previous);
                RiskLevel::none()
            }
            None => self.normalize(previous.clone()),
        };
        Self::outcome(previous, selected)
    }

    fn is_expired(&self, level: &RiskLevel, now: Timestamp) -> bool {
        match (self.risk_validity, level.reference_date()) {
            (Some(validity), Some(date)) if !level.is_none() => now - date > validity,
            _ => false,
        }
    }

    fn max_result<'a>(levels: impl Iterator<Item = &'a RiskLevel>) -> Option<RiskLevel> {
        levels.max_by(|a, b| a.fusion_cmp(b)).cloned()
    }

    fn outcome(previous: &RiskLevel, new_level: RiskLevel) -> FusionOutcome {
        let rising = new_level.level > previous.level;
        let repeat_exposure = !new_level.is_none()
            && new_level.level == previous.level
            && new_level.scoring_date > previous.scoring_date;

        FusionOutcome {
            changed: new_level.level != previous.level,
            must_notify: rising || repeat_exposure,
            must_alert_in_app: new_level.scoring_date != previous.scoring_date,
            previous_level: previous.clone(),
            new_level,
        }
    }
}
