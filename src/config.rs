//! Tunable intervals, risk tiers and endpoints.
//!
//! The config mirrors what the remote-config service publishes. It is read
//! from `~/.exposure-status/config.json` (or an explicit path) and can be
//! swapped at runtime through [`ConfigHandle`]; each refresh cycle works on
//! one snapshot.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::SourceId;

/// Query cadence and deadline for one signal source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSchedule {
    /// Minimum time between two successful results from this source.
    /// A reload shifts the pending due time by the change.
    pub refresh_interval_secs: u64,
    /// Deadline for a single query.
    pub query_timeout_secs: u64,
}

impl SourceSchedule {
    pub fn refresh_interval(&self) -> Duration {
        Duration::seconds(self.refresh_interval_secs as i64)
    }

    pub fn query_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.query_timeout_secs)
    }
}

fn default_proximity_schedule() -> SourceSchedule {
    SourceSchedule {
        refresh_interval_secs: 24 * 3600,
        query_timeout_secs: 30,
    }
}

fn default_venue_schedule() -> SourceSchedule {
    SourceSchedule {
        refresh_interval_secs: 24 * 3600,
        query_timeout_secs: 20,
    }
}

/// UI mapping for one numeric risk tier. Levels without a tier are
/// normalized to zero by the fusion engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskTier {
    pub level: f64,
    pub label: String,
    /// Localization key of the notification title.
    pub notification_title: String,
    /// Localization key of the notification body.
    pub notification_body: String,
    /// Body key used when the tier is unchanged but a newer exposure was scored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_notification_body: Option<String>,
}

impl RiskTier {
    fn keyed(level: f64, label: &str) -> Self {
        Self {
            level,
            label: label.to_string(),
            notification_title: format!("notification.risk.{}.title", label),
            notification_body: format!("notification.risk.{}.body", label),
            repeat_notification_body: Some(format!("notification.risk.{}.repeat", label)),
        }
    }
}

fn default_risk_tiers() -> Vec<RiskTier> {
    vec![
        RiskTier::keyed(0.0, "none"),
        RiskTier::keyed(1.0, "low"),
        RiskTier::keyed(2.0, "moderate"),
        RiskTier::keyed(3.0, "elevated"),
        RiskTier::keyed(4.0, "high"),
    ]
}

/// Remote scoring endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proximity_status_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_status_url: Option<String>,
    /// PEM file of the only root certificate the client accepts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_certificate_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
}

fn default_min_retry_interval() -> u64 {
    30 * 60
}

fn default_jitter_max() -> u64 {
    3600
}

fn default_min_renotify_interval() -> u64 {
    24 * 3600
}

fn default_risk_validity_days() -> u32 {
    14
}

fn default_stale_after() -> u64 {
    48 * 3600
}

fn default_checkin_retention_days() -> u32 {
    14
}

fn default_poll_interval() -> u64 {
    3600
}

/// Status engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusConfig {
    /// Global backoff across all sources.
    #[serde(default = "default_min_retry_interval")]
    pub min_retry_interval_secs: u64,
    #[serde(default = "default_proximity_schedule")]
    pub proximity: SourceSchedule,
    #[serde(default = "default_venue_schedule")]
    pub venue_warning: SourceSchedule,
    /// Upper bound of the random delay added to each source's cadence.
    #[serde(default = "default_jitter_max")]
    pub status_jitter_max_secs: u64,
    #[serde(default = "default_min_renotify_interval")]
    pub min_renotify_interval_secs: u64,
    /// A retained nonzero result older than this (by contact date, else
    /// scoring date) stops counting towards the fused level.
    #[serde(default = "default_risk_validity_days")]
    pub risk_validity_days: u32,
    /// Status is reported stale when no source produced a result for this long.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "default_checkin_retention_days")]
    pub checkin_retention_days: u32,
    /// Sleep between background refreshes of the poller.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_risk_tiers")]
    pub risk_tiers: Vec<RiskTier>,
    #[serde(default)]
    pub endpoints: EndpointConfig,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            min_retry_interval_secs: default_min_retry_interval(),
            proximity: default_proximity_schedule(),
            venue_warning: default_venue_schedule(),
            status_jitter_max_secs: default_jitter_max(),
            min_renotify_interval_secs: default_min_renotify_interval(),
            risk_validity_days: default_risk_validity_days(),
            stale_after_secs: default_stale_after(),
            checkin_retention_days: default_checkin_retention_days(),
            poll_interval_secs: default_poll_interval(),
            risk_tiers: default_risk_tiers(),
            endpoints: EndpointConfig::default(),
        }
    }
}

impl StatusConfig {
    pub fn schedule(&self, source: SourceId) -> &SourceSchedule {
        match source {
            SourceId::Proximity => &self.proximity,
            SourceId::VenueWarning => &self.venue_warning,
        }
    }

    pub fn min_retry_interval(&self) -> Duration {
        Duration::seconds(self.min_retry_interval_secs as i64)
    }

    pub fn status_jitter_max(&self) -> Duration {
        Duration::seconds(self.status_jitter_max_secs as i64)
    }

    pub fn min_renotify_interval(&self) -> Duration {
        Duration::seconds(self.min_renotify_interval_secs as i64)
    }

    pub fn risk_validity(&self) -> Duration {
        Duration::days(self.risk_validity_days as i64)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::seconds(self.stale_after_secs as i64)
    }

    pub fn checkin_retention(&self) -> Duration {
        Duration::days(self.checkin_retention_days as i64)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs)
    }

    /// Tier configured for `level`, if any.
    pub fn tier_for(&self, level: f64) -> Option<&RiskTier> {
        self.risk_tiers
            .iter()
            .find(|tier| (tier.level - level).abs() < f64::EPSILON)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, schedule) in [
            ("proximity.queryTimeoutSecs", &self.proximity),
            ("venueWarning.queryTimeoutSecs", &self.venue_warning),
        ] {
            if schedule.query_timeout_secs == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "pollIntervalSecs",
                reason: "must be greater than zero".to_string(),
            });
        }

        if let Some(tier) = self
            .risk_tiers
            .iter()
            .find(|t| !t.level.is_finite() || t.level < 0.0)
        {
            return Err(ConfigError::Invalid {
                field: "riskTiers",
                reason: format!("level {} is not a non-negative number", tier.level),
            });
        }

        for (field, value) in [
            ("endpoints.proximityStatusUrl", &self.endpoints.proximity_status_url),
            ("endpoints.warningStatusUrl", &self.endpoints.warning_status_url),
        ] {
            if let Some(raw) = value {
                let parsed = url::Url::parse(raw).map_err(|e| ConfigError::Invalid {
                    field,
                    reason: e.to_string(),
                })?;
                if parsed.scheme() != "https" {
                    return Err(ConfigError::Invalid {
                        field,
                        reason: format!("scheme must be https, got {}", parsed.scheme()),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Get the state directory (~/.exposure-status), creating it if needed
pub fn state_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
    let dir = home.join(".exposure-status");
    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|source| ConfigError::Read {
            path: dir.clone(),
            source,
        })?;
    }
    Ok(dir)
}

/// Get the canonical config file path (~/.exposure-status/config.json)
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
    Ok(home.join(".exposure-status").join("config.json"))
}

/// Load and validate configuration from `path`.
pub fn load_config_from(path: &Path) -> Result<StatusConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let config: StatusConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from the canonical path, falling back to defaults
/// when no config file exists yet.
pub fn load_config() -> Result<StatusConfig, ConfigError> {
    let path = config_path()?;
    match load_config_from(&path) {
        Ok(config) => Ok(config),
        Err(ConfigError::NotFound(_)) => {
            log::info!(
                "No config at {}, using built-in defaults",
                path.display()
            );
            Ok(StatusConfig::default())
        }
        Err(e) => Err(e),
    }
}

/// Shared, reloadable config. Readers take a cloned snapshot.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<StatusConfig>>,
}

impl ConfigHandle {
    pub fn new(config: StatusConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn snapshot(&self) -> StatusConfig {
        self.inner.read().clone()
    }

    /// Replace the config after validating it.
    pub fn replace(&self, config: StatusConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.inner.write() = config;
        Ok(())
    }

    /// Apply a mutation; the previous config stays in place if the result is invalid.
    pub fn update(&self, mutator: impl FnOnce(&mut StatusConfig)) -> Result<StatusConfig, ConfigError> {
        let mut guard = self.inner.write();
        let mut next = guard.clone();
        mutator(&mut next);
        next.validate()?;
        *guard = next.clone();
        Ok(next)
    }

    /// Reload from disk; keeps the current config on failure.
    pub fn reload_from(&self, path: &Path) -> Result<StatusConfig, ConfigError> {
        let config = load_config_from(path)?;
        *self.inner.write() = config.clone();
        log::info!("Status config reloaded from {}", path.display());
        Ok(config)
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(StatusConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: StatusConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, StatusConfig::default());
        assert_eq!(config.min_retry_interval(), Duration::minutes(30));
    }

    #[test]
    fn test_partial_json_overrides_fields() {
        let config: StatusConfig = serde_json::from_str(
            r#"{ "minRetryIntervalSecs": 600, "proximity": { "refreshIntervalSecs": 3600, "queryTimeoutSecs": 5 } }"#,
        )
        .unwrap();
        assert_eq!(config.min_retry_interval_secs, 600);
        assert_eq!(config.proximity.refresh_interval(), Duration::hours(1));
        assert_eq!(config.venue_warning, default_venue_schedule());
    }

    #[test]
    fn test_tier_lookup() {
        let config = StatusConfig::default();
        assert_eq!(config.tier_for(4.0).map(|t| t.label.as_str()), Some("high"));
        assert!(config.tier_for(7.0).is_none());
    }

    #[test]
    fn test_validate_rejects_plain_http() {
        let mut config = StatusConfig::default();
        config.endpoints.proximity_status_url = Some("http://status.example.org/v1".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("https"), "got {}", err);
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = StatusConfig::default();
        config.venue_warning.query_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "minRenotifyIntervalSecs": 120 }"#).unwrap();

        let config = load_config_from(&path).expect("config loads");
        assert_eq!(config.min_renotify_interval(), Duration::minutes(2));
    }

    #[test]
    fn test_load_config_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = load_config_from(&dir.path().join("absent.json"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_handle_update_keeps_old_config_when_invalid() {
        let handle = ConfigHandle::default();
        let result = handle.update(|c| c.poll_interval_secs = 0);
        assert!(result.is_err());
        assert_eq!(handle.snapshot().poll_interval_secs, default_poll_interval());

        handle.update(|c| c.poll_interval_secs = 60).expect("valid update");
        assert_eq!(handle.snapshot().poll_interval_secs, 60);
    }
}
