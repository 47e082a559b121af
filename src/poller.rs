//! Background status poller.
//!
//! Long-lived async task: short startup delay, then one background refresh
//! per `pollIntervalSecs`. The rate limiter decides whether a refresh
//! actually reaches any source, so the poller can wake as often as it likes.

use std::sync::Arc;

use tokio::sync::Notify;

use crate::error::RefreshError;
use crate::orchestrator::StatusOrchestrator;
use crate::types::RefreshTrigger;

const STARTUP_DELAY: std::time::Duration = std::time::Duration::from_secs(30);

/// Background status poller.
///
/// - 30 s startup delay
/// - Background refresh, then sleep `pollIntervalSecs`
/// - `wake` cuts the sleep short; the next refresh runs as a foreground one
/// - Exits once the orchestrator shuts down
pub async fn run_status_poller(orchestrator: Arc<StatusOrchestrator>, wake: Arc<Notify>) {
    let mut shutdown = orchestrator.shutdown_signal();

    tokio::select! {
        _ = tokio::time::sleep(STARTUP_DELAY) => {},
        _ = shutdown.wait_for(|stopped| *stopped) => {
            log::info!("Status poller: stopped before first refresh");
            return;
        },
    }

    let mut trigger = RefreshTrigger::Background;
    loop {
        match orchestrator.refresh(trigger, false).await {
            Ok(report) => {
                log::info!(
                    "Status poller: {} refresh queried {} source(s), level {}",
                    trigger,
                    report.queried(),
                    report.outcome.new_level.level
                );
            }
            Err(RefreshError::Cancelled) => break,
            Err(e) => log::warn!("Status poller: {}", e),
        }

        let interval = orchestrator.config().snapshot().poll_interval();
        trigger = tokio::select! {
            _ = tokio::time::sleep(interval) => RefreshTrigger::Background,
            _ = wake.notified() => {
                log::info!("Status poller: woken by refresh signal");
                RefreshTrigger::Foreground
            },
            _ = shutdown.wait_for(|stopped| *stopped) => break,
        };
    }

    log::info!("Status poller: stopped");
}
