//! Venue check-in based warning source.
//!
//! Sends the unexpired check-ins to the warning scoring service. Check-ins
//! older than the retention window are pruned before every query.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::{QueryContext, RemoteRiskStatus, SignalSource};
use crate::error::SourceError;
use crate::types::{RiskLevel, SourceId, Timestamp};

/// One recorded venue visit. The payload is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueCheckin {
    pub payload: String,
    pub timestamp: Timestamp,
}

/// Recorded venue visits.
pub trait VenueCheckinStore: Send + Sync {
    fn checkins(&self) -> Vec<VenueCheckin>;

    /// Drop visits older than `cutoff`; returns how many were removed.
    fn prune_before(&self, cutoff: Timestamp) -> usize;
}

/// Remote warning scoring endpoint.
#[async_trait]
pub trait WarningScoringApi: Send + Sync {
    async fn fetch_warning_status(
        &self,
        checkins: &[VenueCheckin],
    ) -> Result<RemoteRiskStatus, SourceError>;
}

pub struct VenueWarningSource {
    store: Arc<dyn VenueCheckinStore>,
    api: Arc<dyn WarningScoringApi>,
    retention: Duration,
}

impl VenueWarningSource {
    pub fn new(
        store: Arc<dyn VenueCheckinStore>,
        api: Arc<dyn WarningScoringApi>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            api,
            retention,
        }
    }
}

#[async_trait]
impl SignalSource for VenueWarningSource {
    fn id(&self) -> SourceId {
        SourceId::VenueWarning
    }

    async fn query(&self, ctx: &QueryContext) -> Result<Option<RiskLevel>, SourceError> {
        let cutoff = ctx.now - self.retention;
        let pruned = self.store.prune_before(cutoff);
        if pruned > 0 {
            log::info!("Venue warning source: pruned {} expired check-ins", pruned);
        }

        let eligible: Vec<VenueCheckin> = self
            .store
            .checkins()
            .into_iter()
            .filter(|c| c.timestamp >= cutoff)
            .collect();

        if eligible.is_empty() {
            log::debug!("Venue warning source: no check-ins to evaluate");
            return Ok(None);
        }

        let status = self.api.fetch_warning_status(&eligible).await?;
        let level = status.into_risk_level(ctx.now);
        log::info!(
            "Venue warning source: scored {} from {} check-ins",
            level,
            eligible.len()
        );
        Ok(Some(level))
    }
}
