//! `exposure-status`: command-line front end of the status engine.
//!
//! Usage:
//!   exposure-status [--config PATH] status
//!   exposure-status [--config PATH] refresh [--force]
//!   exposure-status [--config PATH] watch
//!   exposure-status [--config PATH] checkin <payload>
//!
//! State lives in `~/.exposure-status/`: `status.db`, `proximity.json` and
//! `checkins.json` (written by the scanning layers of the app).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::Notify;

use exposure_status::config::{self, ConfigHandle, StatusConfig};
use exposure_status::notification::LogNotifier;
use exposure_status::sources::client::HttpScoringClient;
use exposure_status::sources::local::{FileProximityData, JsonCheckinStore};
use exposure_status::sources::{ProximitySource, VenueCheckin, VenueWarningSource};
use exposure_status::store::SqliteStore;
use exposure_status::types::{NotificationAction, RefreshTrigger, SourceId};
use exposure_status::{run_status_poller, RefreshError, RefreshReport, StatusOrchestrator};

#[derive(Parser)]
#[command(name = "exposure-status")]
#[command(about = "Exposure risk status engine", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.exposure-status/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Print the current status snapshot
    Status,

    /// Run one refresh cycle
    Refresh {
        /// Skip per-source cadence checks (global backoff still applies)
        #[arg(long)]
        force: bool,
    },

    /// Poll in the background until Ctrl-C
    Watch,

    /// Record a venue check-in
    Checkin {
        /// Venue payload as scanned
        payload: String,
    },
}

fn load(config_path: Option<&PathBuf>) -> anyhow::Result<StatusConfig> {
    let config = match config_path {
        Some(path) => config::load_config_from(path)?,
        None => config::load_config()?,
    };
    Ok(config)
}

fn build_orchestrator(config: ConfigHandle) -> anyhow::Result<StatusOrchestrator> {
    let snapshot = config.snapshot();
    let dir = config::state_dir()?;

    let store =
        SqliteStore::open(&dir.join("status.db")).context("Failed to open status store")?;
    let timeout = snapshot
        .schedule(SourceId::Proximity)
        .query_timeout()
        .max(snapshot.schedule(SourceId::VenueWarning).query_timeout());
    let client = Arc::new(HttpScoringClient::new(&snapshot.endpoints, timeout)?);

    let proximity = ProximitySource::new(
        Arc::new(FileProximityData::new(dir.join("proximity.json"))),
        client.clone(),
    );
    let venue = VenueWarningSource::new(
        Arc::new(JsonCheckinStore::new(dir.join("checkins.json"))),
        client,
        snapshot.checkin_retention(),
    );

    let orchestrator = StatusOrchestrator::builder(config)
        .store(Arc::new(store))
        .delivery(Arc::new(LogNotifier))
        .source(Arc::new(proximity))
        .source(Arc::new(venue))
        .build()?;
    Ok(orchestrator)
}

fn print_report(report: &RefreshReport) {
    println!("cycle {} ({})", report.cycle_id, report.trigger);
    for (id, source) in &report.sources {
        println!("  {:<14} {}", id.as_str(), source);
    }
    println!(
        "  level          {} -> {}",
        report.outcome.previous_level, report.outcome.new_level
    );
    match &report.action {
        NotificationAction::None => {}
        NotificationAction::ShowInAppAlert => println!("  action         in-app alert"),
        NotificationAction::ScheduleLocalNotification { title, body } => {
            println!("  action         notify {} / {}", title, body)
        }
    }
    if let Some(e) = &report.delivery_error {
        println!("  delivery       {}", e);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = ConfigHandle::new(load(cli.config.as_ref())?);

    match cli.command.unwrap_or(Command::Status) {
        Command::Checkin { payload } => {
            let dir = config::state_dir()?;
            let store = JsonCheckinStore::new(dir.join("checkins.json"));
            store
                .record(VenueCheckin {
                    payload,
                    timestamp: Utc::now(),
                })
                .map_err(anyhow::Error::msg)?;
            println!("check-in recorded in {}", store.path().display());
        }
        Command::Status => {
            let orchestrator = build_orchestrator(config)?;
            println!("{}", serde_json::to_string_pretty(&orchestrator.snapshot())?);
        }
        Command::Refresh { force } => {
            let orchestrator = Arc::new(build_orchestrator(config)?);
            match orchestrator.refresh(RefreshTrigger::Manual, force).await {
                Ok(report) => print_report(&report),
                Err(RefreshError::PersistenceWrite { message, report, .. }) => {
                    print_report(&report);
                    bail!("status computed but not saved: {}", message);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Watch => {
            let orchestrator = Arc::new(build_orchestrator(config)?);
            orchestrator.on_risk_level_changed(|level| log::info!("Risk level now {}", level));

            let poller = tokio::spawn(run_status_poller(
                orchestrator.clone(),
                Arc::new(Notify::new()),
            ));

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            orchestrator.shutdown();
            poller.await.context("Status poller task failed")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_subcommands() {
        let cli = Cli::try_parse_from(["exposure-status", "refresh", "--force"]).unwrap();
        assert_eq!(cli.command, Some(Command::Refresh { force: true }));
        assert_eq!(cli.config, None);

        let cli = Cli::try_parse_from(["exposure-status", "--config", "/tmp/c.json", "checkin", "abc"])
            .unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Checkin {
                payload: "abc".to_string()
            })
        );
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.json")));

        let cli = Cli::try_parse_from(["exposure-status"]).unwrap();
        assert_eq!(cli.command, None);
    }

    #[test]
    fn test_rejects_unknown_arguments() {
        assert!(Cli::try_parse_from(["exposure-status", "refresh", "--now"]).is_err());
        assert!(Cli::try_parse_from(["exposure-status", "checkin"]).is_err());
    }
}
