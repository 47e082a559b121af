//! Proximity-based risk source.
//!
//! Asks the exposure scoring service for the status derived from Bluetooth
//! exchanges. The exchange protocol itself is behind [`ProximityData`].

use std::sync::Arc;

use async_trait::async_trait;

use super::{QueryContext, RemoteRiskStatus, SignalSource};
use crate::error::SourceError;
use crate::types::{RiskLevel, SourceId, Timestamp};

/// Local view of the proximity subsystem.
pub trait ProximityData: Send + Sync {
    /// Whether this device was ever registered with the scoring backend.
    fn is_registered(&self) -> bool;

    /// Whether exchange data was collected after `since` (`None`: ever).
    fn has_new_data_since(&self, since: Option<Timestamp>) -> bool;
}

/// Remote exposure scoring endpoint.
#[async_trait]
pub trait ExposureScoringApi: Send + Sync {
    async fn fetch_proximity_status(&self) -> Result<RemoteRiskStatus, SourceError>;
}

pub struct ProximitySource {
    data: Arc<dyn ProximityData>,
    api: Arc<dyn ExposureScoringApi>,
}

impl ProximitySource {
    pub fn new(data: Arc<dyn ProximityData>, api: Arc<dyn ExposureScoringApi>) -> Self {
        Self { data, api }
    }
}

#[async_trait]
impl SignalSource for ProximitySource {
    fn id(&self) -> SourceId {
        SourceId::Proximity
    }

    async fn query(&self, ctx: &QueryContext) -> Result<Option<RiskLevel>, SourceError> {
        if !self.data.is_registered() {
            log::debug!("Proximity source: not registered, nothing to query");
            return Ok(None);
        }

        if !ctx.force
            && ctx.last_success_at.is_some()
            && !self.data.has_new_data_since(ctx.last_success_at)
        {
            log::debug!("Proximity source: no new exchange data since last check");
            return Ok(None);
        }

        let status = self.api.fetch_proximity_status().await?;
        let level = status.into_risk_level(ctx.now);
        log::info!("Proximity source: scored {}", level);
        Ok(Some(level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RefreshTrigger;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeData {
        registered: bool,
        last_exchange: Option<Timestamp>,
    }

    impl ProximityData for FakeData {
        fn is_registered(&self) -> bool {
            self.registered
        }

        fn has_new_data_since(&self, since: Option<Timestamp>) -> bool {
            match (self.last_exchange, since) {
                (Some(exchange), Some(since)) => exchange > since,
                (Some(_), None) => true,
                (None, _) => false,
            }
        }
    }

    struct CountingApi {
        calls: AtomicUsize,
        result: Result<RemoteRiskStatus, SourceError>,
    }

    #[async_trait]
    impl ExposureScoringApi for CountingApi {
        async fn fetch_proximity_status(&self) -> Result<RemoteRiskStatus, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 4, 10, 7, 0, 0).unwrap()
    }

    fn ctx(last_success_at: Option<Timestamp>, force: bool) -> QueryContext {
        QueryContext {
            trigger: RefreshTrigger::Background,
            now: t0(),
            force,
            last_success_at,
        }
    }

    fn api(risk_level: f64) -> Arc<CountingApi> {
        Arc::new(CountingApi {
            calls: AtomicUsize::new(0),
            result: Ok(RemoteRiskStatus {
                risk_level,
                last_risk_scoring_date: Some(t0() - Duration::hours(1)),
                last_contact_date: None,
            }),
        })
    }

    #[tokio::test]
    async fn test_unregistered_short_circuits_without_io() {
        let api = api(4.0);
        let source = ProximitySource::new(
            Arc::new(FakeData {
                registered: false,
                last_exchange: Some(t0()),
            }),
            api.clone(),
        );
        assert_eq!(source.query(&ctx(None, true)).await, Ok(None));
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_new_data_skips_unless_forced() {
        let api = api(4.0);
        let source = ProximitySource::new(
            Arc::new(FakeData {
                registered: true,
                last_exchange: Some(t0() - Duration::days(2)),
            }),
            api.clone(),
        );
        let last_success = Some(t0() - Duration::days(1));

        assert_eq!(source.query(&ctx(last_success, false)).await, Ok(None));
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);

        let forced = source.query(&ctx(last_success, true)).await.expect("forced query");
        assert_eq!(forced.map(|l| l.level), Some(4.0));
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_query_reaches_service() {
        let api = api(2.0);
        let source = ProximitySource::new(
            Arc::new(FakeData {
                registered: true,
                last_exchange: None,
            }),
            api.clone(),
        );
        let level = source.query(&ctx(None, false)).await.expect("query");
        assert_eq!(level, Some(RiskLevel::scored(2.0, t0() - Duration::hours(1))));
    }

    #[tokio::test]
    async fn test_service_error_propagates() {
        let api = Arc::new(CountingApi {
            calls: AtomicUsize::new(0),
            result: Err(SourceError::Unauthorized),
        });
        let source = ProximitySource::new(
            Arc::new(FakeData {
                registered: true,
                last_exchange: Some(t0()),
            }),
            api,
        );
        assert_eq!(
            source.query(&ctx(None, false)).await,
            Err(SourceError::Unauthorized)
        );
    }
}
