//! Shared fakes for unit tests.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{DeliveryError, SourceError, StoreError};
use crate::notification::NotificationDelivery;
use crate::sources::{QueryContext, SignalSource};
use crate::store::StatusStore;
use crate::types::{PersistedStatus, RiskLevel, SourceId, Timestamp};

pub(crate) fn t0() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 9, 2, 10, 0, 0).unwrap()
}

type Scripted = Result<Option<RiskLevel>, SourceError>;

/// Source that replays scripted answers, then answers `Ok(None)`.
pub(crate) struct ScriptedSource {
    id: SourceId,
    answers: Mutex<VecDeque<Scripted>>,
    calls: AtomicUsize,
    contexts: Mutex<Vec<QueryContext>>,
    delay: Option<Duration>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedSource {
    pub(crate) fn new(id: SourceId) -> Self {
        Self {
            id,
            answers: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
            delay: None,
            gate: None,
        }
    }

    pub(crate) fn answer(self, answer: Scripted) -> Self {
        self.answers.lock().push_back(answer);
        self
    }

    /// Sleep this long before answering.
    pub(crate) fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Block every query until `gate` is notified.
    pub(crate) fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn push(&self, answer: Scripted) {
        self.answers.lock().push_back(answer);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_context(&self) -> Option<QueryContext> {
        self.contexts.lock().last().cloned()
    }
}

#[async_trait]
impl SignalSource for ScriptedSource {
    fn id(&self) -> SourceId {
        self.id
    }

    async fn query(&self, ctx: &QueryContext) -> Result<Option<RiskLevel>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().push(ctx.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.answers.lock().pop_front();
        next.unwrap_or(Ok(None))
    }
}

/// Notifier that records every call.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    scheduled: Mutex<Vec<(String, String, String)>>,
    cancelled: Mutex<Vec<String>>,
    deny: AtomicBool,
}

impl RecordingNotifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make every schedule call fail with `PermissionDenied`.
    pub(crate) fn deny(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    pub(crate) fn scheduled(&self) -> Vec<(String, String, String)> {
        self.scheduled.lock().clone()
    }

    pub(crate) fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }
}

impl NotificationDelivery for RecordingNotifier {
    fn schedule_local_notification(
        &self,
        title: &str,
        body: &str,
        identifier: &str,
    ) -> Result<(), DeliveryError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(DeliveryError::PermissionDenied);
        }
        self.scheduled
            .lock()
            .push((title.to_string(), body.to_string(), identifier.to_string()));
        Ok(())
    }

    fn cancel_notification(&self, identifier: &str) -> Result<(), DeliveryError> {
        self.cancelled.lock().push(identifier.to_string());
        Ok(())
    }
}

/// Store whose writes always fail.
#[derive(Default)]
pub(crate) struct FailingStore {
    attempts: AtomicUsize,
}

impl FailingStore {
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl StatusStore for FailingStore {
    fn load(&self) -> Result<Option<PersistedStatus>, StoreError> {
        Ok(None)
    }

    fn save(&self, _status: &PersistedStatus) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Io {
            path: PathBuf::from("/read-only/status.db"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        })
    }
}
