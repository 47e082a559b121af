//! Notification policy and the delivery collaborator.
//!
//! The policy is a pure decision over a fusion outcome. Delivery goes through
//! [`NotificationDelivery`], and the [`NotificationRecord`] is only advanced
//! by [`NotificationPolicy::commit`] once delivery went through, so a crash
//! between decision and delivery never marks a notification as sent.

use chrono::Duration;

use crate::config::{RiskTier, StatusConfig};
use crate::error::DeliveryError;
use crate::types::{
    AppVisibility, FusionOutcome, NotificationAction, NotificationRecord, Timestamp,
};

/// Identifier of the risk notification; a new one replaces the pending one.
pub const RISK_NOTIFICATION_ID: &str = "exposure-status.risk";

const FALLBACK_TITLE: &str = "notification.risk.title";
const FALLBACK_BODY: &str = "notification.risk.body";

/// OS notification center as seen by the engine.
pub trait NotificationDelivery: Send + Sync {
    fn schedule_local_notification(
        &self,
        title: &str,
        body: &str,
        identifier: &str,
    ) -> Result<(), DeliveryError>;

    fn cancel_notification(&self, identifier: &str) -> Result<(), DeliveryError>;
}

/// Delivery that only writes to the log. Used by the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotificationDelivery for LogNotifier {
    fn schedule_local_notification(
        &self,
        title: &str,
        body: &str,
        identifier: &str,
    ) -> Result<(), DeliveryError> {
        log::info!("Notification [{}]: {} / {}", identifier, title, body);
        Ok(())
    }

    fn cancel_notification(&self, identifier: &str) -> Result<(), DeliveryError> {
        log::info!("Notification [{}] cancelled", identifier);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationPolicy {
    min_renotify_interval: Duration,
    tiers: Vec<RiskTier>,
}

impl NotificationPolicy {
    pub fn new(min_renotify_interval: Duration, tiers: Vec<RiskTier>) -> Self {
        Self {
            min_renotify_interval,
            tiers,
        }
    }

    pub fn from_config(config: &StatusConfig) -> Self {
        Self::new(config.min_renotify_interval(), config.risk_tiers.clone())
    }

    /// Decide what to surface for `outcome`. Rules, in order:
    /// 1. nothing to say → `None`
    /// 2. same level notified within the interval → push suppressed
    /// 3. foreground with a new scoring → in-app alert
    /// 4. otherwise a qualifying change → local notification
    pub fn decide(
        &self,
        outcome: &FusionOutcome,
        visibility: AppVisibility,
        record: &NotificationRecord,
        now: Timestamp,
    ) -> NotificationAction {
        if !outcome.must_notify && !outcome.must_alert_in_app {
            return NotificationAction::None;
        }

        let push_suppressed = self.recently_notified(record, outcome.new_level.level, now);

        if visibility == AppVisibility::Foreground && outcome.must_alert_in_app {
            return NotificationAction::ShowInAppAlert;
        }

        if outcome.must_notify && !push_suppressed {
            let (title, body) = self.text_buckets(outcome);
            return NotificationAction::ScheduleLocalNotification { title, body };
        }

        if push_suppressed {
            log::debug!(
                "Notification policy: level {} already notified, push suppressed",
                outcome.new_level.level
            );
        }
        NotificationAction::None
    }

    /// Record after `action` was delivered. Only local notifications advance it.
    pub fn commit(
        &self,
        record: &NotificationRecord,
        action: &NotificationAction,
        outcome: &FusionOutcome,
        now: Timestamp,
    ) -> NotificationRecord {
        match action {
            NotificationAction::ScheduleLocalNotification { .. } => NotificationRecord {
                last_notified_level: Some(outcome.new_level.level),
                last_notified_at: Some(now),
            },
            NotificationAction::None | NotificationAction::ShowInAppAlert => record.clone(),
        }
    }

    fn recently_notified(&self, record: &NotificationRecord, level: f64, now: Timestamp) -> bool {
        match (record.last_notified_level, record.last_notified_at) {
            (Some(notified), Some(at)) => {
                notified == level && now - at < self.min_renotify_interval
            }
            _ => false,
        }
    }

    fn text_buckets(&self, outcome: &FusionOutcome) -> (String, String) {
        let tier = self
            .tiers
            .iter()
            .find(|t| (t.level - outcome.new_level.level).abs() < f64::EPSILON);

        match tier {
            Some(tier) => {
                let body = if outcome.changed {
                    tier.notification_body.clone()
                } else {
                    tier.repeat_notification_body
                        .clone()
                        .unwrap_or_else(|| tier.notification_body.clone())
                };
                (tier.notification_title.clone(), body)
            }
            None => (FALLBACK_TITLE.to_string(), FALLBACK_BODY.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RiskLevel;
    use chrono::{TimeZone, Utc};

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap()
    }

    fn policy() -> NotificationPolicy {
        NotificationPolicy::from_config(&StatusConfig::default())
    }

    fn rising() -> FusionOutcome {
        FusionOutcome {
            previous_level: RiskLevel::none(),
            new_level: RiskLevel::scored(4.0, t0()),
            changed: true,
            must_notify: true,
            must_alert_in_app: true,
        }
    }

    #[test]
    fn test_nothing_to_say() {
        let outcome = FusionOutcome {
            previous_level: RiskLevel::scored(4.0, t0()),
            new_level: RiskLevel::scored(4.0, t0()),
            changed: false,
            must_notify: false,
            must_alert_in_app: false,
        };
        let action = policy().decide(
            &outcome,
            AppVisibility::Foreground,
            &NotificationRecord::default(),
            t0(),
        );
        assert_eq!(action, NotificationAction::None);
    }

    #[test]
    fn test_background_rise_schedules_notification() {
        let action = policy().decide(
            &rising(),
            AppVisibility::Background,
            &NotificationRecord::default(),
            t0(),
        );
        assert_eq!(
            action,
            NotificationAction::ScheduleLocalNotification {
                title: "notification.risk.high.title".into(),
                body: "notification.risk.high.body".into(),
            }
        );
    }

    #[test]
    fn test_foreground_rise_shows_in_app_alert() {
        let action = policy().decide(
            &rising(),
            AppVisibility::Foreground,
            &NotificationRecord::default(),
            t0(),
        );
        assert_eq!(action, NotificationAction::ShowInAppAlert);
    }

    #[test]
    fn test_repeat_exposure_uses_repeat_body() {
        let outcome = FusionOutcome {
            previous_level: RiskLevel::scored(4.0, t0()),
            new_level: RiskLevel::scored(4.0, t0() + Duration::days(1)),
            changed: false,
            must_notify: true,
            must_alert_in_app: true,
        };
        let action = policy().decide(
            &outcome,
            AppVisibility::Background,
            &NotificationRecord::default(),
            t0(),
        );
        match action {
            NotificationAction::ScheduleLocalNotification { body, .. } => {
                assert_eq!(body, "notification.risk.high.repeat")
            }
            other => panic!("expected local notification, got {:?}", other),
        }
    }

    #[test]
    fn test_suppressed_push_still_alerts_in_foreground() {
        let record = NotificationRecord {
            last_notified_level: Some(4.0),
            last_notified_at: Some(t0() - Duration::hours(1)),
        };
        let policy = policy();
        assert_eq!(
            policy.decide(&rising(), AppVisibility::Background, &record, t0()),
            NotificationAction::None
        );
        assert_eq!(
            policy.decide(&rising(), AppVisibility::Foreground, &record, t0()),
            NotificationAction::ShowInAppAlert
        );
    }

    #[test]
    fn test_renotify_after_interval() {
        let record = NotificationRecord {
            last_notified_level: Some(4.0),
            last_notified_at: Some(t0() - Duration::hours(25)),
        };
        let action = policy().decide(&rising(), AppVisibility::Background, &record, t0());
        assert!(matches!(
            action,
            NotificationAction::ScheduleLocalNotification { .. }
        ));
    }

    #[test]
    fn test_two_decisions_within_interval_notify_once() {
        let policy = policy();
        let outcome = rising();
        let mut record = NotificationRecord::default();
        let mut scheduled = 0;

        for minutes in [0, 10] {
            let now = t0() + Duration::minutes(minutes);
            let action = policy.decide(&outcome, AppVisibility::Background, &record, now);
            if matches!(action, NotificationAction::ScheduleLocalNotification { .. }) {
                scheduled += 1;
            }
            record = policy.commit(&record, &action, &outcome, now);
        }
        assert_eq!(scheduled, 1);
    }

    #[test]
    fn test_commit_only_advances_on_push() {
        let policy = policy();
        let record = NotificationRecord::default();
        let untouched = policy.commit(&record, &NotificationAction::ShowInAppAlert, &rising(), t0());
        assert_eq!(untouched, record);

        let action = NotificationAction::ScheduleLocalNotification {
            title: "t".into(),
            body: "b".into(),
        };
        let advanced = policy.commit(&record, &action, &rising(), t0());
        assert_eq!(advanced.last_notified_level, Some(4.0));
        assert_eq!(advanced.last_notified_at, Some(t0()));
    }

    #[test]
    fn test_unknown_tier_falls_back_to_generic_text() {
        let policy = NotificationPolicy::new(Duration::hours(1), Vec::new());
        let action = policy.decide(
            &rising(),
            AppVisibility::Background,
            &NotificationRecord::default(),
            t0(),
        );
        assert_eq!(
            action,
            NotificationAction::ScheduleLocalNotification {
                title: FALLBACK_TITLE.into(),
                body: FALLBACK_BODY.into(),
            }
        );
    }
}
