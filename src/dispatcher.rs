//! # Dispatcher
//!
//! In-memory work queue feeding a pool of cycle workers. Provides at-least-
//! once processing, per-internal-key serialisation with coalescing of
//! duplicate notifications, retry with exponential backoff on transient
//! failures, and a synchronous flush.

use crate::diff::{Diff, Provenance};
use crate::error::{ReconcileError, Result};
use crate::model::{DiffId, OpId, WorkItem};
use crate::reconciler::{CycleOutcome, Reconciler};
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const QUEUE_CAPACITY: usize = 1024;
const DEFAULT_WORKERS: usize = 4;

/// Exponential backoff tuning for cycles failing with `Unavailable`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Retries after the initial attempt; exhaustion drops the item.
    pub attempts: u32,
    /// Fractional jitter applied to each delay, e.g. 0.25 for +/-25%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            attempts: 8,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-based retry attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let raw = self
            .base
            .as_millis()
            .saturating_mul(1u128 << exponent)
            .min(self.cap.as_millis()) as f64;
        let jitter = if self.jitter > 0.0 {
            raw * rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        Duration::from_millis((raw + jitter).max(0.0) as u64)
    }
}

#[derive(Debug, Clone)]
enum Job {
    Reconcile { item: WorkItem, attempt: u32 },
    Resolution {
        diff: DiffId,
        ops: Vec<OpId>,
        attempt: u32,
    },
}

impl Job {
    fn attempt(&self) -> u32 {
        match self {
            Job::Reconcile { attempt, .. } | Job::Resolution { attempt, .. } => *attempt,
        }
    }

    fn bump(&mut self) {
        match self {
            Job::Reconcile { attempt, .. } | Job::Resolution { attempt, .. } => *attempt += 1,
        }
    }
}

enum Command {
    Submit(WorkItem),
    Resolve { diff: DiffId, ops: Vec<OpId> },
    Flush(oneshot::Sender<u64>),
}

enum Event {
    Done {
        slot: String,
        job: Job,
        result: Result<CycleOutcome>,
    },
    Retry {
        slot: String,
        job: Job,
    },
}

#[derive(Default)]
struct SlotState {
    /// One coalesced reconcile rerun behind the running job.
    rerun: Option<Job>,
    /// Resolutions queued behind the running job, in arrival order.
    pending: VecDeque<Job>,
}

/// Cloneable handle for submitting work and flushing the queue.
#[derive(Clone)]
pub struct DispatcherHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl DispatcherHandle {
    /// Enqueue a reconciliation for a change notification.
    pub async fn submit(&self, item: WorkItem) -> Result<()> {
        self.cmd_tx
            .send(Command::Submit(item))
            .await
            .map_err(|_| stopped())
    }

    /// Schedule the follow-up cycle for an operator resolution.
    pub async fn resolve(&self, diff: DiffId, ops: Vec<OpId>) -> Result<()> {
        self.cmd_tx
            .send(Command::Resolve { diff, ops })
            .await
            .map_err(|_| stopped())
    }

    /// Block until the queue drains; returns the number of items fully
    /// processed since the previous flush.
    pub async fn flush(&self) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Flush(tx))
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }
}

fn stopped() -> ReconcileError {
    ReconcileError::Unavailable("dispatcher stopped".to_string())
}

/// Spawns the scheduler task and its worker pool.
pub struct Dispatcher;

impl Dispatcher {
    pub fn spawn(
        reconciler: Arc<Reconciler>,
        policy: RetryPolicy,
        workers: usize,
        cancel: CancellationToken,
    ) -> DispatcherHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let worker_txs = spawn_workers(
            workers.max(1),
            reconciler.clone(),
            event_tx.clone(),
            cancel.clone(),
        );
        let scheduler = Scheduler {
            reconciler,
            policy,
            worker_txs,
            slots: HashMap::new(),
            outstanding: 0,
            processed: 0,
            flush_waiters: Vec::new(),
            event_tx,
            cancel,
        };
        tokio::spawn(scheduler.run(cmd_rx, event_rx));
        DispatcherHandle { cmd_tx }
    }

    pub fn default_workers() -> usize {
        DEFAULT_WORKERS
    }
}

fn spawn_workers(
    count: usize,
    reconciler: Arc<Reconciler>,
    event_tx: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) -> Vec<mpsc::UnboundedSender<(String, Job)>> {
    (0..count)
        .map(|index| {
            let (tx, mut rx) = mpsc::unbounded_channel::<(String, Job)>();
            let reconciler = reconciler.clone();
            let event_tx = event_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                while let Some((slot, job)) = rx.recv().await {
                    let result = match &job {
                        Job::Reconcile { item, .. } => reconciler.run_cycle(item, &cancel).await,
                        Job::Resolution { diff, ops, .. } => {
                            reconciler.run_resolution(*diff, ops, &cancel).await
                        }
                    };
                    if event_tx.send(Event::Done { slot, job, result }).is_err() {
                        break;
                    }
                }
                debug!(worker = index, "dispatcher worker stopped");
            });
            tx
        })
        .collect()
}

struct Scheduler {
    reconciler: Arc<Reconciler>,
    policy: RetryPolicy,
    worker_txs: Vec<mpsc::UnboundedSender<(String, Job)>>,
    /// Occupied serialisation slots; the running job is the map entry itself.
    slots: HashMap<String, SlotState>,
    /// Items accepted but not yet fully processed, including backoff sleepers.
    outstanding: u64,
    /// Items fully processed since the previous flush.
    processed: u64,
    flush_waiters: Vec<oneshot::Sender<u64>>,
    event_tx: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
}

impl Scheduler {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut event_rx: mpsc::UnboundedReceiver<Event>,
    ) {
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                biased;
                Some(event) = event_rx.recv() => match event {
                    Event::Done { slot, job, result } => self.handle_done(slot, job, result),
                    Event::Retry { slot, job } => self.dispatch(slot, job),
                },
                maybe_cmd = cmd_rx.recv() => match maybe_cmd {
                    Some(Command::Submit(item)) => self.handle_submit(item),
                    Some(Command::Resolve { diff, ops }) => self.handle_resolve(diff, ops),
                    Some(Command::Flush(reply)) => {
                        self.flush_waiters.push(reply);
                        self.maybe_flush();
                    }
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
        // Unblock any flush callers left at shutdown.
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(self.processed);
        }
        debug!("dispatcher scheduler stopped");
    }

    /// Serialisation slot for a work item. Identity is resolved eagerly so
    /// concurrent notifications for the same record serialise on the
    /// internal key from the very first cycle.
    fn slot_for_item(&self, item: &WorkItem) -> String {
        let store = self.reconciler.store();
        let resolved = store
            .lookup_internal_key(&item.entity, &item.source, &item.foreign_key)
            .and_then(|found| match found {
                Some(key) => Ok(Some(key)),
                None => store.allocate_internal_key(&item.entity).and_then(|key| {
                    store
                        .record_foreign_key(&key, &item.source, &item.foreign_key)
                        .map(|_| Some(key))
                }),
            });
        match resolved {
            Ok(Some(key)) => key.to_string(),
            Ok(None) | Err(_) => {
                format!("{}/{}:{}", item.entity, item.source, item.foreign_key)
            }
        }
    }

    fn handle_submit(&mut self, item: WorkItem) {
        let slot = self.slot_for_item(&item);
        let job = Job::Reconcile { item, attempt: 0 };
        if let Some(state) = self.slots.get_mut(&slot) {
            if state.rerun.is_none() {
                // The running cycle may already have fetched; one rerun
                // guarantees the latest change is observed.
                state.rerun = Some(job);
                self.outstanding += 1;
            } else {
                debug!(%slot, "coalesced duplicate notification");
            }
            return;
        }
        self.slots.insert(slot.clone(), SlotState::default());
        self.outstanding += 1;
        self.dispatch(slot, job);
    }

    fn handle_resolve(&mut self, diff: DiffId, ops: Vec<OpId>) {
        let slot = match self.reconciler.store().get_diff(diff) {
            Ok(Some(record)) => record.key.to_string(),
            _ => format!("diff:{diff}"),
        };
        let job = Job::Resolution {
            diff,
            ops,
            attempt: 0,
        };
        self.outstanding += 1;
        if let Some(state) = self.slots.get_mut(&slot) {
            state.pending.push_back(job);
            return;
        }
        self.slots.insert(slot.clone(), SlotState::default());
        self.dispatch(slot, job);
    }

    fn handle_done(&mut self, slot: String, mut job: Job, result: Result<CycleOutcome>) {
        match result {
            Ok(outcome) => {
                debug!(%slot, key = %outcome.key, "work item processed");
                self.complete(slot);
            }
            Err(err) if err.is_retryable() => {
                job.bump();
                if job.attempt() > self.policy.attempts {
                    warn!(%slot, attempts = job.attempt(), "retries exhausted; dropping work item");
                    self.record_failure(&job);
                    self.complete(slot);
                } else {
                    let delay = self.policy.delay(job.attempt());
                    debug!(%slot, attempt = job.attempt(), delay_ms = delay.as_millis() as u64, "scheduling retry");
                    let event_tx = self.event_tx.clone();
                    let cancel = self.cancel.clone();
                    // The slot stays occupied while the retry sleeps, so
                    // later notifications queue behind it.
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {
                                let _ = event_tx.send(Event::Retry { slot, job });
                            }
                            _ = cancel.cancelled() => {}
                        }
                    });
                }
            }
            Err(err) => {
                warn!(%slot, %err, "work item failed permanently");
                self.complete(slot);
            }
        }
    }

    fn complete(&mut self, slot: String) {
        self.processed += 1;
        self.outstanding = self.outstanding.saturating_sub(1);
        let next = self.slots.get_mut(&slot).and_then(|state| {
            state.pending.pop_front().or_else(|| state.rerun.take())
        });
        match next {
            Some(job) => self.dispatch(slot, job),
            None => {
                self.slots.remove(&slot);
            }
        }
        self.maybe_flush();
    }

    fn dispatch(&self, slot: String, job: Job) {
        let index = (slot_hash(&slot) as usize) % self.worker_txs.len();
        if self.worker_txs[index].send((slot, job)).is_err() {
            warn!("dispatcher worker unavailable; dropping job");
        }
    }

    /// After exhaustion the item is recorded as a failed notification so the
    /// operator drain surfaces it.
    fn record_failure(&self, job: &Job) {
        let store = self.reconciler.store();
        let key = match job {
            Job::Reconcile { item, .. } => store
                .lookup_internal_key(&item.entity, &item.source, &item.foreign_key)
                .ok()
                .flatten(),
            Job::Resolution { diff, .. } => {
                store.get_diff(*diff).ok().flatten().map(|record| record.key)
            }
        };
        let Some(key) = key else { return };
        let recorded = store
            .record_diffs(&key, Diff::empty(Provenance::Merged), Vec::new())
            .and_then(|id| store.record_notification(&key, id));
        if let Err(err) = recorded {
            warn!(key = %key, %err, "could not record failure notification");
        }
    }

    fn maybe_flush(&mut self) {
        if self.outstanding == 0 && !self.flush_waiters.is_empty() {
            let count = self.processed;
            self.processed = 0;
            for waiter in self.flush_waiters.drain(..) {
                let _ = waiter.send(count);
            }
        }
    }
}

fn slot_hash(slot: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    slot.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverError, DriverRegistry};
    use crate::model::ForeignKey;
    use crate::store::{MemoryStore, Store, StoreRead};
    use crate::test_support::{doc, MemoryDriver};

    struct Fixture {
        store: Arc<MemoryStore>,
        driver: MemoryDriver,
        handle: DispatcherHandle,
        cancel: CancellationToken,
    }

    fn fixture(policy: RetryPolicy) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let driver = MemoryDriver::new();
        let mut registry = DriverRegistry::new();
        registry.register(
            "customer",
            "acct",
            std::collections::HashMap::new(),
            Arc::new(driver.clone()),
        );
        let reconciler = Arc::new(Reconciler::new(store.clone(), Arc::new(registry)));
        let cancel = CancellationToken::new();
        let handle = Dispatcher::spawn(reconciler, policy, 2, cancel.clone());
        Fixture {
            store,
            driver,
            handle,
            cancel,
        }
    }

    fn quick_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(5),
            cap: Duration::from_millis(20),
            attempts,
            jitter: 0.0,
        }
    }

    fn item(fk: &str) -> WorkItem {
        WorkItem {
            entity: "customer".to_string(),
            source: "acct".to_string(),
            foreign_key: ForeignKey::new(fk),
        }
    }

    #[tokio::test]
    async fn test_flush_counts_processed_items() {
        let fx = fixture(RetryPolicy::default());
        for i in 0..5 {
            let fk = format!("A{i}");
            fx.driver.put(&fk, doc(&[("name", "Alice")]));
            fx.handle.submit(item(&fk)).await.unwrap();
        }
        assert_eq!(fx.handle.flush().await.unwrap(), 5);
        // The counter resets between flushes.
        assert_eq!(fx.handle.flush().await.unwrap(), 0);
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_notifications_coalesce() {
        let fx = fixture(RetryPolicy::default());
        fx.driver.put("A1", doc(&[("name", "Alice")]));
        for _ in 0..6 {
            fx.handle.submit(item("A1")).await.unwrap();
        }
        let processed = fx.handle.flush().await.unwrap();
        assert!(processed >= 1 && processed <= 6);

        let key = fx
            .store
            .lookup_internal_key("customer", "acct", &ForeignKey::new("A1"))
            .unwrap()
            .unwrap();
        // Only the first cycle saw a change; reruns were no-ops.
        assert_eq!(fx.store.list_diff_ids(&key).unwrap().len(), 1);
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_transient_failure_retries_until_success() {
        let fx = fixture(quick_retry(8));
        fx.driver.put("A1", doc(&[("name", "Alice")]));
        fx.driver
            .fail_next_get(DriverError::Unavailable("flaky".to_string()));
        fx.driver
            .fail_next_get(DriverError::Unavailable("flaky".to_string()));

        fx.handle.submit(item("A1")).await.unwrap();
        assert_eq!(fx.handle.flush().await.unwrap(), 1);

        let key = fx
            .store
            .lookup_internal_key("customer", "acct", &ForeignKey::new("A1"))
            .unwrap()
            .unwrap();
        assert_eq!(
            fx.store.get_baseline(&key).unwrap().unwrap(),
            doc(&[("name", "Alice")])
        );
        // A recovered item leaves no notifications behind.
        assert_eq!(fx.store.fetch_notifications(16).unwrap().1.len(), 0);
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_retry_exhaustion_records_failed_notification() {
        let fx = fixture(quick_retry(2));
        fx.driver.put("A1", doc(&[("name", "Alice")]));
        for _ in 0..8 {
            fx.driver
                .fail_next_get(DriverError::Unavailable("down".to_string()));
        }

        fx.handle.submit(item("A1")).await.unwrap();
        assert_eq!(fx.handle.flush().await.unwrap(), 1);

        let (_, notes) = fx.store.fetch_notifications(16).unwrap();
        assert_eq!(notes.len(), 1);
        let record = fx.store.get_diff(notes[0].diff).unwrap().unwrap();
        assert!(record.applied.is_empty());
        assert!(!record.has_conflicts());
        fx.cancel.cancel();
    }

    #[tokio::test]
    async fn test_flush_on_idle_queue_returns_zero() {
        let fx = fixture(RetryPolicy::default());
        assert_eq!(fx.handle.flush().await.unwrap(), 0);
        fx.cancel.cancel();
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            attempts: 8,
            jitter: 0.0,
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(12), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for _ in 0..64 {
            let delay = policy.delay(3).as_millis() as f64;
            assert!((3000.0..=5000.0).contains(&delay));
        }
    }
}
