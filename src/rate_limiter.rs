//! Query admission for signal sources.
//!
//! Two rules must both hold for a source to be queried:
//! - global backoff: the most recent attempt or success of *any* source is at
//!   least `min_retry_interval` old (never bypassed)
//! - per-source cadence: the source's next due time has passed (bypassed by
//!   `force`)
//!
//! The next due time is fixed when a result arrives, as
//! `success + cadence + jitter`, so decisions stay deterministic between
//! successes. Pure timestamp bookkeeping; the clock is always passed in.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Duration;

use crate::config::StatusConfig;
use crate::types::{QueryOutcome, RiskLevel, SourceId, SourceState, Timestamp};

/// Maps the configured maximum jitter to the delay actually added.
pub type JitterFn = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

/// Uniform random delay in `[0, max)`, whole seconds.
pub fn random_jitter() -> JitterFn {
    Arc::new(|max: Duration| {
        let max_secs = max.num_seconds();
        if max_secs <= 0 {
            return Duration::zero();
        }
        let secs = (rand::random::<f64>() * max_secs as f64) as i64;
        Duration::seconds(secs.min(max_secs - 1))
    })
}

/// No jitter at all.
pub fn no_jitter() -> JitterFn {
    Arc::new(|_| Duration::zero())
}

/// Intervals the limiter enforces, taken from one config snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitPolicy {
    pub min_retry_interval: Duration,
    pub cadences: BTreeMap<SourceId, Duration>,
    pub jitter_max: Duration,
}

impl RateLimitPolicy {
    pub fn from_config(config: &StatusConfig) -> Self {
        Self {
            min_retry_interval: config.min_retry_interval(),
            cadences: SourceId::ALL
                .iter()
                .map(|id| (*id, config.schedule(*id).refresh_interval()))
                .collect(),
            jitter_max: config.status_jitter_max(),
        }
    }

    fn cadence(&self, source: SourceId) -> Duration {
        self.cadences
            .get(&source)
            .copied()
            .unwrap_or_else(Duration::zero)
    }
}

/// Why a source was not queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another query (of any source) happened too recently.
    GlobalBackoff { until: Timestamp },
    /// This source's own cadence has not elapsed.
    NotDue { until: Timestamp },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::GlobalBackoff { until } => {
                write!(f, "global backoff until {}", until.to_rfc3339())
            }
            SkipReason::NotDue { until } => write!(f, "not due until {}", until.to_rfc3339()),
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    jitter: JitterFn,
    states: BTreeMap<SourceId, SourceState>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .field("states", &self.states)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Build a limiter over previously persisted source states. Every known
    /// source gets an entry, so states are created once and never removed.
    pub fn new(
        policy: RateLimitPolicy,
        jitter: JitterFn,
        mut states: BTreeMap<SourceId, SourceState>,
    ) -> Self {
        for id in SourceId::ALL {
            states.entry(id).or_default();
        }
        Self {
            policy,
            jitter,
            states,
        }
    }

    /// Swap in a reloaded policy. A changed cadence moves every pending due
    /// time by the same amount, keeping the jitter drawn at success.
    pub fn set_policy(&mut self, policy: RateLimitPolicy) {
        for (id, state) in self.states.iter_mut() {
            let shift = policy.cadence(*id) - self.policy.cadence(*id);
            if shift == Duration::zero() {
                continue;
            }
            if let Some(due) = state.next_due_at.as_mut() {
                *due += shift;
            }
        }
        self.policy = policy;
    }

    pub fn state(&self, source: SourceId) -> &SourceState {
        // `new` inserts every SourceId, so the entry is always present.
        static EMPTY: SourceState = SourceState {
            last_attempt_at: None,
            last_success_at: None,
            last_error_at: None,
            last_result: None,
            last_contact_at: None,
            next_due_at: None,
            consecutive_failures: 0,
        };
        self.states.get(&source).unwrap_or(&EMPTY)
    }

    pub fn states(&self) -> &BTreeMap<SourceId, SourceState> {
        &self.states
    }

    /// Latest attempt or success across every source.
    fn last_activity(&self) -> Option<Timestamp> {
        self.states
            .values()
            .flat_map(|s| [s.last_attempt_at, s.last_success_at, s.last_contact_at])
            .flatten()
            .max()
    }

    /// Admission decision with the reason for a refusal.
    pub fn check(&self, source: SourceId, now: Timestamp, force: bool) -> Result<(), SkipReason> {
        if let Some(last) = self.last_activity() {
            let until = last + self.policy.min_retry_interval;
            if now < until {
                return Err(SkipReason::GlobalBackoff { until });
            }
        }

        if force {
            return Ok(());
        }

        let state = self.state(source);
        let due = state.next_due_at.or_else(|| {
            state
                .last_success_at
                .map(|at| at + self.policy.cadence(source))
        });
        match due {
            Some(until) if now < until => Err(SkipReason::NotDue { until }),
            _ => Ok(()),
        }
    }

    pub fn may_query(&self, source: SourceId, now: Timestamp, force: bool) -> bool {
        self.check(source, now, force).is_ok()
    }

    pub fn record_attempt(&mut self, source: SourceId, now: Timestamp) {
        self.states.entry(source).or_default().last_attempt_at = Some(now);
    }

    /// Record how a query settled. An empty answer counts as contact for the
    /// global backoff but leaves the per-source success marker untouched.
    pub fn record_outcome(&mut self, source: SourceId, now: Timestamp, outcome: QueryOutcome) {
        let cadence = self.policy.cadence(source);
        let jitter = (self.jitter)(self.policy.jitter_max);
        let state = self.states.entry(source).or_default();
        match outcome {
            QueryOutcome::Result => {
                state.last_success_at = Some(now);
                state.last_contact_at = Some(now);
                state.next_due_at = Some(now + cadence + jitter);
                state.consecutive_failures = 0;
            }
            QueryOutcome::Empty => {
                state.last_contact_at = Some(now);
                state.consecutive_failures = 0;
            }
            QueryOutcome::Failed => {
                state.last_error_at = Some(now);
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            }
        }
    }

    /// Remember the latest result a source produced.
    pub fn remember_result(&mut self, source: SourceId, level: RiskLevel) {
        self.states.entry(source).or_default().last_result = Some(level);
    }
}
