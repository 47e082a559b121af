//! Status orchestrator: the single writer of the engine's state.
//!
//! One refresh cycle runs `Idle → Querying → Fusing → Notifying → Idle`:
//! admission by the rate limiter, concurrent source queries with independent
//! timeouts, fusion once every query settled, the notification decision and
//! delivery, then persistence and observers. A `refresh()` arriving while a
//! cycle is in flight joins that cycle instead of starting another one.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigHandle, StatusConfig};
use crate::error::{DeliveryError, RefreshError, SourceError, StoreError};
use crate::fusion::RiskFusionEngine;
use crate::notification::{
    LogNotifier, NotificationDelivery, NotificationPolicy, RISK_NOTIFICATION_ID,
};
use crate::rate_limiter::{random_jitter, JitterFn, RateLimitPolicy, RateLimiter, SkipReason};
use crate::sources::{QueryContext, SignalSource};
use crate::store::{MemoryStore, StatusStore};
use crate::types::{
    AppVisibility, FusionOutcome, NotificationAction, NotificationRecord, PersistedStatus,
    QueryOutcome, RefreshTrigger, RiskLevel, SourceId, StatusSnapshot, Timestamp,
};

type CycleResult = Result<RefreshReport, RefreshError>;
type SettledQuery = (SourceId, Result<Option<RiskLevel>, SourceError>);

pub type LevelObserver = Arc<dyn Fn(&RiskLevel) + Send + Sync>;
pub type AlertObserver = Arc<dyn Fn(&FusionOutcome) + Send + Sync>;

/// Where the current refresh cycle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CyclePhase {
    #[default]
    Idle,
    Querying,
    Fusing,
    Notifying,
}

/// How one source fared in a cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceReport {
    /// Not queried: the rate limiter refused.
    Skipped { reason: SkipReason },
    /// Queried; `None` means the source had nothing new.
    Succeeded { result: Option<RiskLevel> },
    Failed { error: SourceError },
}

impl fmt::Display for SourceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceReport::Skipped { reason } => write!(f, "skipped ({})", reason),
            SourceReport::Succeeded { result: Some(level) } => write!(f, "{}", level),
            SourceReport::Succeeded { result: None } => write!(f, "nothing new"),
            SourceReport::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// Outcome of one refresh cycle. Shared by every caller coalesced onto it.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshReport {
    pub cycle_id: Uuid,
    pub trigger: RefreshTrigger,
    pub forced: bool,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub sources: BTreeMap<SourceId, SourceReport>,
    pub outcome: FusionOutcome,
    pub action: NotificationAction,
    /// Set when the notification collaborator refused the action.
    pub delivery_error: Option<DeliveryError>,
}

impl RefreshReport {
    pub fn source(&self, id: SourceId) -> Option<&SourceReport> {
        self.sources.get(&id)
    }

    /// Number of sources actually queried this cycle.
    pub fn queried(&self) -> usize {
        self.sources
            .values()
            .filter(|r| !matches!(r, SourceReport::Skipped { .. }))
            .count()
    }
}

struct EngineState {
    limiter: RateLimiter,
    current_level: RiskLevel,
    notification: NotificationRecord,
    last_refreshed_at: Option<Timestamp>,
}

fn build_snapshot(state: &EngineState, config: &StatusConfig, now: Timestamp) -> StatusSnapshot {
    let last_answer = state
        .limiter
        .states()
        .values()
        .flat_map(|s| [s.last_success_at, s.last_contact_at])
        .flatten()
        .max();
    let is_stale = match last_answer {
        Some(at) => now - at > config.stale_after(),
        None => true,
    };
    let label = config
        .tier_for(state.current_level.level)
        .map(|tier| tier.label.clone())
        .unwrap_or_else(|| "none".to_string());

    StatusSnapshot {
        level: state.current_level.clone(),
        label,
        is_stale,
        last_refreshed_at: state.last_refreshed_at,
        sources: state.limiter.states().clone(),
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct OrchestratorBuilder {
    config: ConfigHandle,
    store: Arc<dyn StatusStore>,
    delivery: Arc<dyn NotificationDelivery>,
    clock: Arc<dyn Clock>,
    jitter: JitterFn,
    sources: Vec<Arc<dyn SignalSource>>,
}

impl OrchestratorBuilder {
    pub fn store(mut self, store: Arc<dyn StatusStore>) -> Self {
        self.store = store;
        self
    }

    pub fn delivery(mut self, delivery: Arc<dyn NotificationDelivery>) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn jitter(mut self, jitter: JitterFn) -> Self {
        self.jitter = jitter;
        self
    }

    /// Register a source. A second source with the same id is ignored.
    pub fn source(mut self, source: Arc<dyn SignalSource>) -> Self {
        if self.sources.iter().any(|s| s.id() == source.id()) {
            log::warn!("Status engine: duplicate {} source ignored", source.id());
            return self;
        }
        self.sources.push(source);
        self
    }

    /// Load the persisted status and assemble the orchestrator.
    pub fn build(self) -> Result<StatusOrchestrator, StoreError> {
        let persisted = self.store.load()?.unwrap_or_default();
        let config = self.config.snapshot();

        if persisted.last_refreshed_at.is_some() {
            log::info!(
                "Status engine: restored {} from last refresh at {}",
                persisted.current_level,
                persisted
                    .last_refreshed_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default()
            );
        }

        let state = EngineState {
            limiter: RateLimiter::new(
                RateLimitPolicy::from_config(&config),
                self.jitter,
                persisted.sources,
            ),
            current_level: persisted.current_level,
            notification: persisted.notification,
            last_refreshed_at: persisted.last_refreshed_at,
        };
        let (snapshot_tx, _) = watch::channel(build_snapshot(&state, &config, self.clock.now()));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(StatusOrchestrator {
            config: self.config,
            store: self.store,
            delivery: self.delivery,
            clock: self.clock,
            sources: self.sources,
            state: Mutex::new(state),
            phase: Mutex::new(CyclePhase::Idle),
            visibility: Mutex::new(AppVisibility::default()),
            inflight: Mutex::new(None),
            level_observers: RwLock::new(Vec::new()),
            alert_observers: RwLock::new(Vec::new()),
            snapshot_tx,
            shutdown_tx,
        })
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct StatusOrchestrator {
    config: ConfigHandle,
    store: Arc<dyn StatusStore>,
    delivery: Arc<dyn NotificationDelivery>,
    clock: Arc<dyn Clock>,
    sources: Vec<Arc<dyn SignalSource>>,
    state: Mutex<EngineState>,
    phase: Mutex<CyclePhase>,
    visibility: Mutex<AppVisibility>,
    /// Receiver of the in-flight cycle's result; `Some` while a cycle runs.
    inflight: Mutex<Option<watch::Receiver<Option<CycleResult>>>>,
    level_observers: RwLock<Vec<LevelObserver>>,
    alert_observers: RwLock<Vec<AlertObserver>>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    shutdown_tx: watch::Sender<bool>,
}

/// Releases the in-flight slot when the cycle task ends, however it ends.
struct CycleGuard<'a> {
    orchestrator: &'a StatusOrchestrator,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        *self.orchestrator.inflight.lock() = None;
        self.orchestrator.set_phase(CyclePhase::Idle);
    }
}

impl StatusOrchestrator {
    /// Start building an orchestrator. Defaults: in-memory store, log-only
    /// notifications, system clock, random jitter, no sources.
    pub fn builder(config: ConfigHandle) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            store: Arc::new(MemoryStore::new()),
            delivery: Arc::new(LogNotifier),
            clock: Arc::new(SystemClock),
            jitter: random_jitter(),
            sources: Vec::new(),
        }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// The level currently presented to the user.
    pub fn current_level(&self) -> RiskLevel {
        self.state.lock().current_level.clone()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let config = self.config.snapshot();
        let now = self.clock.now();
        build_snapshot(&self.state.lock(), &config, now)
    }

    /// Snapshots published after every completed cycle.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Called whenever the presented level (or its dates) changes.
    /// Callbacks run on the refresh task and must not block.
    pub fn on_risk_level_changed(&self, callback: impl Fn(&RiskLevel) + Send + Sync + 'static) {
        self.level_observers.write().push(Arc::new(callback));
    }

    /// Called when the notification policy asks for an in-app alert.
    pub fn on_in_app_alert(&self, callback: impl Fn(&FusionOutcome) + Send + Sync + 'static) {
        self.alert_observers.write().push(Arc::new(callback));
    }

    pub fn set_visibility(&self, visibility: AppVisibility) {
        *self.visibility.lock() = visibility;
    }

    pub fn visibility(&self) -> AppVisibility {
        *self.visibility.lock()
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.lock()
    }

    /// Cancel the in-flight cycle (its partial results are discarded) and
    /// refuse further refreshes.
    pub fn shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            log::info!("Status engine: shutting down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn set_phase(&self, phase: CyclePhase) {
        *self.phase.lock() = phase;
    }

    /// Run a refresh cycle, or join the one already in flight.
    ///
    /// The cycle runs on its own task, so it completes for every coalesced
    /// caller even when the caller that started it goes away. Source
    /// failures only show up in the report. The cycle fails as a whole when
    /// the status could not be persisted (observers have still been
    /// notified) or when the engine shut down mid-cycle.
    pub async fn refresh(self: &Arc<Self>, trigger: RefreshTrigger, force: bool) -> CycleResult {
        if matches!(trigger, RefreshTrigger::Manual | RefreshTrigger::Foreground) {
            self.set_visibility(AppVisibility::Foreground);
        }

        let rx = {
            let mut slot = self.inflight.lock();
            match slot.clone() {
                Some(rx) => {
                    log::debug!("Status refresh: {} trigger joined the cycle in flight", trigger);
                    rx
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());
                    let orchestrator = Arc::clone(self);
                    tokio::spawn(async move {
                        let guard = CycleGuard {
                            orchestrator: &orchestrator,
                        };
                        let result = orchestrator.run_cycle(trigger, force).await;
                        drop(guard);
                        tx.send_replace(Some(result));
                    });
                    rx
                }
            }
        };

        Self::join_inflight(rx).await
    }

    async fn join_inflight(mut rx: watch::Receiver<Option<CycleResult>>) -> CycleResult {
        match rx.wait_for(Option::is_some).await {
            Ok(settled) => (*settled).clone().unwrap_or(Err(RefreshError::Aborted)),
            // The cycle task panicked before sending.
            Err(_) => Err(RefreshError::Aborted),
        }
    }

    async fn run_cycle(&self, trigger: RefreshTrigger, force: bool) -> CycleResult {
        if self.is_shut_down() {
            return Err(RefreshError::Cancelled);
        }

        let config = self.config.snapshot();
        let cycle_id = Uuid::new_v4();
        let started_at = self.clock.now();
        let (mut limiter, previous, record) = {
            let state = self.state.lock();
            let mut limiter = state.limiter.clone();
            limiter.set_policy(RateLimitPolicy::from_config(&config));
            (limiter, state.current_level.clone(), state.notification.clone())
        };

        log::info!(
            "Status refresh: cycle {} started ({} trigger{})",
            cycle_id,
            trigger,
            if force { ", forced" } else { "" }
        );
        self.set_phase(CyclePhase::Querying);

        // Admission is decided for every source before any attempt is
        // recorded, so one source's attempt cannot lock out the others.
        let mut reports = BTreeMap::new();
        let mut permitted = Vec::new();
        for source in &self.sources {
            let id = source.id();
            match limiter.check(id, started_at, force) {
                Ok(()) => permitted.push(Arc::clone(source)),
                Err(reason) => {
                    log::debug!("Status refresh: {} {}", id, reason);
                    reports.insert(id, SourceReport::Skipped { reason });
                }
            }
        }
        for source in &permitted {
            limiter.record_attempt(source.id(), started_at);
        }

        let settled = match self
            .query_all(&config, &limiter, &permitted, trigger, force, started_at)
            .await
        {
            Some(settled) => settled,
            None => {
                log::info!(
                    "Status refresh: cycle {} cancelled, partial results discarded",
                    cycle_id
                );
                return Err(RefreshError::Cancelled);
            }
        };

        self.set_phase(CyclePhase::Fusing);
        let settled_at = self.clock.now();
        let retained: BTreeMap<_, _> = self
            .sources
            .iter()
            .map(|source| (source.id(), limiter.state(source.id()).last_result.clone()))
            .collect();
        let mut fresh = BTreeMap::new();
        for (id, result) in settled {
            match result {
                Ok(Some(level)) => {
                    limiter.record_outcome(id, settled_at, QueryOutcome::Result);
                    limiter.remember_result(id, level.clone());
                    fresh.insert(id, Some(level.clone()));
                    reports.insert(id, SourceReport::Succeeded { result: Some(level) });
                }
                Ok(None) => {
                    limiter.record_outcome(id, settled_at, QueryOutcome::Empty);
                    fresh.insert(id, None);
                    reports.insert(id, SourceReport::Succeeded { result: None });
                }
                Err(error) => {
                    limiter.record_outcome(id, settled_at, QueryOutcome::Failed);
                    let failures = limiter.state(id).consecutive_failures;
                    if error.is_retryable() {
                        log::warn!(
                            "Status refresh: {} failed ({:?}, failure #{}): {}",
                            id,
                            error.kind(),
                            failures,
                            error
                        );
                    } else {
                        log::error!(
                            "Status refresh: {} rejected the query ({:?}, failure #{}): {}",
                            id,
                            error.kind(),
                            failures,
                            error
                        );
                    }
                    reports.insert(id, SourceReport::Failed { error });
                }
            }
        }

        let outcome = RiskFusionEngine::from_config(&config).fuse_at(
            &previous,
            &fresh,
            &retained,
            settled_at,
        );

        self.set_phase(CyclePhase::Notifying);
        let policy = NotificationPolicy::from_config(&config);
        let action = policy.decide(&outcome, self.visibility(), &record, settled_at);
        let (record, delivery_error) = self.deliver(&policy, &record, &action, &outcome, settled_at);

        let finished_at = self.clock.now();
        let persisted = PersistedStatus {
            current_level: outcome.new_level.clone(),
            sources: limiter.states().clone(),
            notification: record.clone(),
            last_refreshed_at: Some(finished_at),
        };
        let store = Arc::clone(&self.store);
        let write = match tokio::task::spawn_blocking(move || store.save(&persisted)).await {
            Ok(write) => write,
            Err(e) => Err(StoreError::from(e)),
        };

        // In-memory state moves ahead even when the write failed; the next
        // successful cycle rewrites everything.
        let snapshot = {
            let mut state = self.state.lock();
            state.limiter = limiter;
            state.current_level = outcome.new_level.clone();
            state.notification = record;
            state.last_refreshed_at = Some(finished_at);
            build_snapshot(&state, &config, finished_at)
        };
        self.publish(&outcome, snapshot);

        let report = RefreshReport {
            cycle_id,
            trigger,
            forced: force,
            started_at,
            finished_at,
            sources: reports,
            outcome,
            action,
            delivery_error,
        };

        log::info!(
            "Status refresh: cycle {} finished, {} source(s) queried, level {} -> {}",
            cycle_id,
            report.queried(),
            report.outcome.previous_level.level,
            report.outcome.new_level.level
        );

        match write {
            Ok(()) => Ok(report),
            Err(e) => {
                log::error!("Status refresh: failed to persist status: {}", e);
                Err(RefreshError::PersistenceWrite {
                    message: e.to_string(),
                    at: finished_at,
                    report: Box::new(report),
                })
            }
        }
    }

    /// Query every permitted source concurrently, each under its own
    /// deadline. Returns `None` if the engine shut down first; dropping the
    /// join set aborts the queries still running.
    async fn query_all(
        &self,
        config: &StatusConfig,
        limiter: &RateLimiter,
        permitted: &[Arc<dyn SignalSource>],
        trigger: RefreshTrigger,
        force: bool,
        now: Timestamp,
    ) -> Option<Vec<SettledQuery>> {
        let mut set: JoinSet<SettledQuery> = JoinSet::new();
        for source in permitted {
            let id = source.id();
            let source = Arc::clone(source);
            let timeout = config.schedule(id).query_timeout();
            let ctx = QueryContext {
                trigger,
                now,
                force,
                last_success_at: limiter.state(id).last_success_at,
            };
            set.spawn(async move {
                let result = match tokio::time::timeout(timeout, source.query(&ctx)).await {
                    Ok(result) => result,
                    Err(_) => Err(SourceError::Timeout(timeout)),
                };
                (id, result)
            });
        }

        let mut shutdown = self.shutdown_signal();
        let mut settled = tokio::select! {
            settled = Self::settle(&mut set) => settled,
            _ = shutdown.wait_for(|stopped| *stopped) => return None,
        };

        for source in permitted {
            let id = source.id();
            if !settled.iter().any(|(settled_id, _)| *settled_id == id) {
                settled.push((id, Err(SourceError::Network("query task aborted".to_string()))));
            }
        }
        Some(settled)
    }

    async fn settle(set: &mut JoinSet<SettledQuery>) -> Vec<SettledQuery> {
        let mut settled = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(query) => settled.push(query),
                Err(e) => log::warn!("Status refresh: query task did not complete: {}", e),
            }
        }
        settled
    }

    /// Carry out `action`. The record only advances once delivery succeeded.
    fn deliver(
        &self,
        policy: &NotificationPolicy,
        record: &NotificationRecord,
        action: &NotificationAction,
        outcome: &FusionOutcome,
        now: Timestamp,
    ) -> (NotificationRecord, Option<DeliveryError>) {
        if outcome.changed && outcome.new_level.is_none() {
            if let Err(e) = self.delivery.cancel_notification(RISK_NOTIFICATION_ID) {
                log::warn!("Status refresh: failed to withdraw risk notification: {}", e);
            }
        }

        match action {
            NotificationAction::None => (record.clone(), None),
            NotificationAction::ShowInAppAlert => {
                let observers = self.alert_observers.read().clone();
                for observer in observers {
                    observer(outcome);
                }
                (record.clone(), None)
            }
            NotificationAction::ScheduleLocalNotification { title, body } => {
                match self
                    .delivery
                    .schedule_local_notification(title, body, RISK_NOTIFICATION_ID)
                {
                    Ok(()) => (policy.commit(record, action, outcome, now), None),
                    Err(e) => {
                        log::warn!("Status refresh: notification not delivered: {}", e);
                        (record.clone(), Some(e))
                    }
                }
            }
        }
    }

    fn publish(&self, outcome: &FusionOutcome, snapshot: StatusSnapshot) {
        if outcome.new_level != outcome.previous_level {
            let observers = self.level_observers.read().clone();
            for observer in observers {
                observer(&outcome.new_level);
            }
        }
        self.snapshot_tx.send_replace(snapshot);
    }
}
