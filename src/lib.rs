//! Exposure risk status engine.
//!
//! Decides when each exposure signal source may be queried, fuses their
//! results into one risk level, decides whether the user is notified, and
//! persists the outcome. [`StatusOrchestrator`] is the entry point.

pub mod clock;
pub mod config;
pub mod error;
pub mod fusion;
pub mod notification;
pub mod orchestrator;
pub mod poller;
pub mod rate_limiter;
pub mod sources;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use clock::{Clock, SystemClock};
pub use config::{ConfigHandle, StatusConfig};
pub use error::{ConfigError, DeliveryError, RefreshError, SourceError, StoreError};
pub use fusion::RiskFusionEngine;
pub use notification::{LogNotifier, NotificationDelivery, NotificationPolicy};
pub use orchestrator::{CyclePhase, RefreshReport, SourceReport, StatusOrchestrator};
pub use poller::run_status_poller;
pub use rate_limiter::RateLimiter;
pub use sources::SignalSource;
pub use store::StatusStore;
pub use types::{
    AppVisibility, FusionOutcome, NotificationAction, RefreshTrigger, RiskLevel, SourceId,
    StatusSnapshot,
};
