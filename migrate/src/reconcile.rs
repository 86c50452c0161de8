//! Level-triggered reconciliation runtime
//!
//! A [`ControlLoop`] owns a deduplicated work queue of record keys. Keys
//! enter the queue from store events, from explicit triggers, and from the
//! requeue delay each pass returns. Passes for different keys run
//! concurrently up to the configured limit; passes for the same key never
//! overlap, and a key triggered while its pass is running is queued again
//! once that pass completes.

use crate::error::{MigrateError, Result};
use crate::metrics;
use crate::store::StoreEvent;
use crate::types::ObjectKey;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// What the loop should do with a key after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Run another pass after the delay
    Requeue(Duration),
    /// Nothing to do until the record changes
    AwaitChange,
}

impl Action {
    pub fn requeue(delay: Duration) -> Self {
        Action::Requeue(delay)
    }

    pub fn await_change() -> Self {
        Action::AwaitChange
    }

    pub fn delay(&self) -> Option<Duration> {
        match self {
            Action::Requeue(d) => Some(*d),
            Action::AwaitChange => None,
        }
    }

    /// The more urgent of two actions
    pub fn sooner(self, other: Action) -> Action {
        match (self.delay(), other.delay()) {
            (Some(a), Some(b)) => Action::Requeue(a.min(b)),
            (Some(_), None) => self,
            (None, _) => other,
        }
    }
}

/// `base * 2^(attempt-1)`, capped at `max`
pub fn exponential_backoff(base: Duration, attempt: u32, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// One controller's reconciliation logic
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Short controller name used in spans and metrics
    fn name(&self) -> &'static str;

    /// Keys to reconcile at start-up and after a missed event
    fn keys(&self) -> Vec<ObjectKey>;

    /// Drive the record towards its desired state
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action>;

    /// Requeue policy after a failed pass; `attempt` counts consecutive failures
    fn error_policy(&self, key: &ObjectKey, error: &MigrateError, attempt: u32) -> Action {
        let delay = exponential_backoff(Duration::from_secs(5), attempt, Duration::from_secs(300));
        warn!(
            "{} reconcile of {} failed (attempt {}): {}, retrying in {:?}",
            self.name(),
            key,
            attempt,
            error,
            delay
        );
        Action::Requeue(delay)
    }
}

/// Deduplicated delay queue with per-key in-flight tracking
#[derive(Debug, Default)]
pub struct WorkQueue {
    scheduled: HashMap<ObjectKey, Instant>,
    running: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `key` at `at`, keeping an earlier existing deadline.
    /// A running key is marked to run again when its pass completes.
    pub fn schedule(&mut self, key: ObjectKey, at: Instant) {
        if self.running.contains(&key) {
            // The running pass will requeue it; only an immediate trigger
            // needs remembering.
            if at <= Instant::now() {
                self.dirty.insert(key);
            } else {
                self.scheduled
                    .entry(key)
                    .and_modify(|t| *t = (*t).min(at))
                    .or_insert(at);
            }
            return;
        }
        self.scheduled
            .entry(key)
            .and_modify(|t| *t = (*t).min(at))
            .or_insert(at);
    }

    /// Keys due at `now` that are not currently running
    pub fn due(&self, now: Instant) -> Vec<ObjectKey> {
        let mut due: Vec<(&ObjectKey, &Instant)> = self
            .scheduled
            .iter()
            .filter(|(key, at)| **at <= now && !self.running.contains(*key))
            .collect();
        due.sort_by_key(|(_, at)| **at);
        due.into_iter().map(|(key, _)| key.clone()).collect()
    }

    /// Mark a key as running, removing it from the schedule
    pub fn start(&mut self, key: &ObjectKey) {
        self.scheduled.remove(key);
        self.running.insert(key.clone());
    }

    /// Mark a pass finished. Returns true if the key was triggered while running.
    pub fn finish(&mut self, key: &ObjectKey) -> bool {
        self.running.remove(key);
        self.dirty.remove(key)
    }

    /// Earliest deadline among keys that can start
    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduled
            .iter()
            .filter(|(key, _)| !self.running.contains(*key))
            .map(|(_, at)| *at)
            .min()
    }

    pub fn is_running(&self, key: &ObjectKey) -> bool {
        self.running.contains(key)
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn scheduled_len(&self) -> usize {
        self.scheduled.len()
    }
}

/// Handle for triggering passes from outside the loop
#[derive(Debug, Clone)]
pub struct Trigger {
    tx: mpsc::UnboundedSender<ObjectKey>,
}

impl Trigger {
    pub fn trigger(&self, key: ObjectKey) {
        // Loop gone means nothing left to trigger
        let _ = self.tx.send(key);
    }
}

/// Drives one [`Reconciler`] until shutdown
pub struct ControlLoop<R: Reconciler> {
    reconciler: Arc<R>,
    concurrency: usize,
    trigger_tx: mpsc::UnboundedSender<ObjectKey>,
    trigger_rx: mpsc::UnboundedReceiver<ObjectKey>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<R: Reconciler> ControlLoop<R> {
    pub fn new(reconciler: Arc<R>, concurrency: usize, shutdown_rx: watch::Receiver<bool>) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        Self {
            reconciler,
            concurrency: concurrency.max(1),
            trigger_tx,
            trigger_rx,
            shutdown_rx,
        }
    }

    pub fn trigger(&self) -> Trigger {
        Trigger {
            tx: self.trigger_tx.clone(),
        }
    }

    /// Run until the shutdown signal flips, then wait for in-flight passes
    pub async fn run(mut self, mut events: broadcast::Receiver<StoreEvent>) {
        let name = self.reconciler.name();
        info!(
            "{} control loop started (concurrency: {})",
            name, self.concurrency
        );

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(ObjectKey, Result<Action>)>();
        let mut queue = WorkQueue::new();
        let mut failures: HashMap<ObjectKey, u32> = HashMap::new();
        let mut events_open = true;

        let now = Instant::now();
        for key in self.reconciler.keys() {
            queue.schedule(key, now);
        }

        loop {
            // Dispatch everything due while permits last
            for key in queue.due(Instant::now()) {
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    break;
                };
                queue.start(&key);

                let reconciler = self.reconciler.clone();
                let done_tx = done_tx.clone();
                let span = tracing::info_span!("reconcile", controller = name, key = %key);
                tokio::spawn(
                    async move {
                        let started = std::time::Instant::now();
                        // A panicking pass counts as a failed one so the key
                        // leaves the in-flight set and is retried with backoff
                        let result = AssertUnwindSafe(reconciler.reconcile(&key))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|panic| {
                                Err(MigrateError::Internal(format!(
                                    "reconcile panicked: {}",
                                    panic_message(panic.as_ref())
                                )))
                            });
                        metrics::record_reconcile(name, started.elapsed(), result.as_ref().err());
                        drop(permit);
                        let _ = done_tx.send((key, result));
                    }
                    .instrument(span),
                );
            }

            // With every permit taken, only a completion can make progress
            let deadline = if permits.available_permits() > 0 {
                queue.next_deadline()
            } else {
                None
            };
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("{} control loop shutting down", name);
                        break;
                    }
                }
                Some((key, result)) = done_rx.recv() => {
                    let rerun = queue.finish(&key);
                    let now = Instant::now();
                    match result {
                        Ok(action) => {
                            failures.remove(&key);
                            if let Some(delay) = action.delay() {
                                queue.schedule(key.clone(), now + delay);
                            }
                        }
                        Err(e) => {
                            let attempt = failures.entry(key.clone()).or_insert(0);
                            *attempt += 1;
                            let action = self.reconciler.error_policy(&key, &e, *attempt);
                            if let Some(delay) = action.delay() {
                                queue.schedule(key.clone(), now + delay);
                            }
                        }
                    }
                    if rerun {
                        queue.schedule(key, now);
                    }
                }
                event = events.recv(), if events_open => {
                    match event {
                        Ok(event) if event.triggers_reconcile() => {
                            debug!("{} event {:?} for {}", name, event.kind, event.key);
                            queue.schedule(event.key, Instant::now());
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("{} missed {} store events, resyncing", name, missed);
                            let now = Instant::now();
                            for key in self.reconciler.keys() {
                                queue.schedule(key, now);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            events_open = false;
                        }
                    }
                }
                Some(key) = self.trigger_rx.recv() => {
                    queue.schedule(key, Instant::now());
                }
                _ = sleep_until(deadline) => {}
            }
        }

        // Let in-flight passes finish; they never abort external calls midway
        let _ = permits.acquire_many(self.concurrency as u32).await;
        info!("{} control loop stopped", name);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
