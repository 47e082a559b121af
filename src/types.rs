//! Core domain types shared by the rate limiter, sources, fusion engine,
//! notification policy and orchestrator.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Timestamp = DateTime<Utc>;

// ---------------------------------------------------------------------------
// Risk level
// ---------------------------------------------------------------------------

/// A risk measurement: numeric tier plus when it was scored and, optionally,
/// when the triggering exposure happened.
///
/// A zero level never carries dates; use [`RiskLevel::none`] or
/// [`RiskLevel::new`], which normalizes a zero tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskLevel {
    pub level: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring_date: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_contact_date: Option<Timestamp>,
}

impl RiskLevel {
    /// The "no risk" level.
    pub fn none() -> Self {
        Self {
            level: 0.0,
            scoring_date: None,
            last_contact_date: None,
        }
    }

    pub fn new(
        level: f64,
        scoring_date: Option<Timestamp>,
        last_contact_date: Option<Timestamp>,
    ) -> Self {
        if !level.is_finite() || level <= 0.0 {
            return Self::none();
        }
        Self {
            level,
            scoring_date,
            last_contact_date,
        }
    }

    /// Nonzero level scored at `scoring_date`.
    pub fn scored(level: f64, scoring_date: Timestamp) -> Self {
        Self::new(level, Some(scoring_date), None)
    }

    pub fn is_none(&self) -> bool {
        self.level <= 0.0
    }

    /// Fusion ordering: numeric level first; at equal nonzero level the more
    /// recent scoring date wins (a missing date is the oldest).
    pub fn fusion_cmp(&self, other: &RiskLevel) -> Ordering {
        match self.level.total_cmp(&other.level) {
            Ordering::Equal if !self.is_none() => self.scoring_date.cmp(&other.scoring_date),
            ord => ord,
        }
    }

    /// Date used to judge whether a retained level has expired.
    pub fn reference_date(&self) -> Option<Timestamp> {
        self.last_contact_date.or(self.scoring_date)
    }
}

impl Default for RiskLevel {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scoring_date {
            Some(date) => write!(f, "level {} (scored {})", self.level, date.to_rfc3339()),
            None => write!(f, "level {}", self.level),
        }
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Identifies an independent channel of exposure evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    Proximity,
    VenueWarning,
}

impl SourceId {
    pub const ALL: [SourceId; 2] = [SourceId::Proximity, SourceId::VenueWarning];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Proximity => "proximity",
            SourceId::VenueWarning => "venue_warning",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "proximity" => Some(SourceId::Proximity),
            "venue_warning" => Some(SourceId::VenueWarning),
            _ => None,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping for one signal source. Never deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceState {
    pub last_attempt_at: Option<Timestamp>,
    /// Last time the source produced an actual result (not an empty answer).
    pub last_success_at: Option<Timestamp>,
    pub last_error_at: Option<Timestamp>,
    pub last_result: Option<RiskLevel>,
    /// Last time the source answered, with or without a result.
    #[serde(default)]
    pub last_contact_at: Option<Timestamp>,
    /// Earliest time the per-source cadence allows a new query (cadence + jitter).
    #[serde(default)]
    pub next_due_at: Option<Timestamp>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

/// How a settled query is recorded by the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// The source produced a risk level.
    Result,
    /// The source answered but had nothing new to report.
    Empty,
    /// Network, decoding or timeout failure.
    Failed,
}

// ---------------------------------------------------------------------------
// Triggers and app visibility
// ---------------------------------------------------------------------------

/// What started a refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshTrigger {
    Manual,
    Foreground,
    Background,
}

impl fmt::Display for RefreshTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshTrigger::Manual => write!(f, "manual"),
            RefreshTrigger::Foreground => write!(f, "foreground"),
            RefreshTrigger::Background => write!(f, "background"),
        }
    }
}

/// Whether the app UI is currently visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppVisibility {
    Foreground,
    #[default]
    Background,
}

// ---------------------------------------------------------------------------
// Fusion and notification
// ---------------------------------------------------------------------------

/// Result of one fusion pass. Computed fresh every cycle, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionOutcome {
    pub previous_level: RiskLevel,
    pub new_level: RiskLevel,
    pub changed: bool,
    pub must_notify: bool,
    pub must_alert_in_app: bool,
}

/// Used to enforce the minimum re-notification interval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub last_notified_level: Option<f64>,
    pub last_notified_at: Option<Timestamp>,
}

/// What the notification policy wants done for one fusion outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NotificationAction {
    None,
    ScheduleLocalNotification { title: String, body: String },
    ShowInAppAlert,
}

// ---------------------------------------------------------------------------
// Persisted status and snapshots
// ---------------------------------------------------------------------------

/// Everything the orchestrator keeps across process restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedStatus {
    pub current_level: RiskLevel,
    #[serde(default)]
    pub sources: BTreeMap<SourceId, SourceState>,
    #[serde(default)]
    pub notification: NotificationRecord,
    #[serde(default)]
    pub last_refreshed_at: Option<Timestamp>,
}

/// Immutable view handed to UI observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub level: RiskLevel,
    pub label: String,
    /// True when no source answered within the staleness window.
    pub is_stale: bool,
    pub last_refreshed_at: Option<Timestamp>,
    pub sources: BTreeMap<SourceId, SourceState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_zero_level_drops_dates() {
        let level = RiskLevel::new(0.0, Some(at(1)), Some(at(0)));
        assert_eq!(level, RiskLevel::none());
    }

    #[test]
    fn test_negative_and_nan_levels_normalize() {
        assert!(RiskLevel::new(-2.0, Some(at(1)), None).is_none());
        assert!(RiskLevel::new(f64::NAN, Some(at(1)), None).is_none());
    }

    #[test]
    fn test_higher_level_wins_regardless_of_date() {
        let old_high = RiskLevel::scored(4.0, at(1));
        let new_low = RiskLevel::scored(2.0, at(9));
        assert_eq!(old_high.fusion_cmp(&new_low), Ordering::Greater);
    }

    #[test]
    fn test_equal_level_recency_breaks_tie() {
        let older = RiskLevel::scored(4.0, at(1));
        let newer = RiskLevel::scored(4.0, at(2));
        assert_eq!(newer.fusion_cmp(&older), Ordering::Greater);
        assert_eq!(older.fusion_cmp(&newer), Ordering::Less);
    }

    #[test]
    fn test_source_id_round_trips_through_str() {
        for id in SourceId::ALL {
            assert_eq!(SourceId::parse(id.as_str()), Some(id));
        }
        assert_eq!(SourceId::parse("bluetooth"), None);
    }

    #[test]
    fn test_reference_date_prefers_contact_date() {
        let level = RiskLevel::new(4.0, Some(at(5)), Some(at(2)));
        assert_eq!(level.reference_date(), Some(at(2)));
    }
}
