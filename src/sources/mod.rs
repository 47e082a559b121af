//! Signal sources: independent channels of exposure evidence.
//!
//! Each source answers "what is the risk level now?" with a result, an
//! empty answer (`Ok(None)`, nothing new to report) or a typed failure.
//! Sources never retry on their own; retry timing is the rate limiter's job.

pub mod client;
pub mod local;
pub mod proximity;
pub mod venue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::types::{RefreshTrigger, RiskLevel, SourceId, Timestamp};

pub use proximity::{ExposureScoringApi, ProximityData, ProximitySource};
pub use venue::{VenueCheckin, VenueCheckinStore, VenueWarningSource, WarningScoringApi};

/// What a source gets to know about the cycle querying it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryContext {
    pub trigger: RefreshTrigger,
    pub now: Timestamp,
    pub force: bool,
    /// When this source last produced a result.
    pub last_success_at: Option<Timestamp>,
}

#[async_trait]
pub trait SignalSource: Send + Sync {
    fn id(&self) -> SourceId;

    async fn query(&self, ctx: &QueryContext) -> Result<Option<RiskLevel>, SourceError>;
}

/// Risk status as returned by the remote scoring services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRiskStatus {
    pub risk_level: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_risk_scoring_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_contact_date: Option<DateTime<Utc>>,
}

impl RemoteRiskStatus {
    /// Convert to a risk level; a missing scoring date defaults to `received_at`.
    pub fn into_risk_level(self, received_at: Timestamp) -> RiskLevel {
        RiskLevel::new(
            self.risk_level,
            Some(self.last_risk_scoring_date.unwrap_or(received_at)),
            self.last_contact_date,
        )
    }
}
