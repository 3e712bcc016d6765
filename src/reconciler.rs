//! # Reconciler
//!
//! Runs one fetch -> diff -> merge -> write cycle per work item, plus the
//! follow-up cycles that apply operator conflict resolutions. A cycle is the
//! atomic unit of work: the baseline only advances when write-back to every
//! present source succeeded within the same cycle.

use crate::diff::{self, Diff, MergeOutcome, MergeStrategy, Op, Provenance, RejectOnDisagreement};
use crate::document::Document;
use crate::driver::{DriverError, DriverRegistry, SourceDriver};
use crate::error::{ReconcileError, Result};
use crate::model::{DiffId, ForeignKey, InternalKey, OpId, WorkItem};
use crate::store::{Store, StoreRead};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default per-call driver timeout; expiry is treated as `Unavailable`.
pub const DEFAULT_DRIVER_TIMEOUT: Duration = Duration::from_secs(30);

/// What a committed cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    pub key: InternalKey,
    pub diff_id: Option<DiffId>,
    pub applied_ops: usize,
    pub rejected_ops: usize,
}

enum SourceState {
    /// The source holds the record.
    Present { fk: ForeignKey, doc: Document },
    /// The source reported the foreign key gone.
    Deleted,
    /// No foreign key recorded for this source yet.
    Absent,
}

struct SourceFetch {
    source: String,
    state: SourceState,
}

/// Orchestrates fetch, diff, merge, and write-back for one logical record.
pub struct Reconciler {
    store: Arc<dyn Store>,
    registry: Arc<DriverRegistry>,
    strategy: Arc<dyn MergeStrategy>,
    driver_timeout: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, registry: Arc<DriverRegistry>) -> Self {
        Self {
            store,
            registry,
            strategy: Arc::new(RejectOnDisagreement),
            driver_timeout: DEFAULT_DRIVER_TIMEOUT,
        }
    }

    /// Substitute the merge strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn MergeStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_driver_timeout(mut self, driver_timeout: Duration) -> Self {
        self.driver_timeout = driver_timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    /// Run one reconciliation cycle for a work item.
    pub async fn run_cycle(
        &self,
        item: &WorkItem,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome> {
        let sources = self.declared_sources(&item.entity, Some(&item.source))?;

        // Step 1: identity resolution.
        let key = match self.store.lookup_internal_key(
            &item.entity,
            &item.source,
            &item.foreign_key,
        )? {
            Some(key) => key,
            None => {
                let key = self.store.allocate_internal_key(&item.entity)?;
                self.store
                    .record_foreign_key(&key, &item.source, &item.foreign_key)?;
                debug!(key = %key, item = %item, "allocated internal key");
                key
            }
        };
        check_cancelled(cancel)?;

        // Step 2: fetch each declared source.
        let fetches = self
            .fetch_sources(&*self.store, &key, &sources, cancel)
            .await?;
        check_cancelled(cancel)?;

        // Steps 3-6: baseline, per-source diffs, merge, new baseline.
        let baseline = load_baseline(&*self.store, &key)?;
        let patches = build_patches(&baseline, &fetches);
        let outcome = self.strategy.merge(&baseline, &patches);
        let new_baseline = diff::apply(&outcome.applied, &baseline)
            .map_err(|err| ReconcileError::Internal(format!("merged patch did not apply: {err}")))?;

        let any_present = fetches
            .iter()
            .any(|f| matches!(f.state, SourceState::Present { .. }));
        let any_deleted = fetches
            .iter()
            .any(|f| matches!(f.state, SourceState::Deleted));
        if !any_present && any_deleted && new_baseline.is_empty() {
            info!(key = %key, "record deleted from every source");
            self.store.delete_internal_key(&key)?;
            return Ok(CycleOutcome {
                key,
                diff_id: None,
                applied_ops: 0,
                rejected_ops: 0,
            });
        }

        // Step 7: write-back. After the first successful set the cycle must
        // run to commit, so cancellation is only observed before it.
        let mut first_set_done = false;
        for fetch in &fetches {
            let target = match &fetch.state {
                SourceState::Present { fk, .. } => Some(Some(fk.clone())),
                SourceState::Absent if !new_baseline.is_empty() => Some(None),
                SourceState::Absent | SourceState::Deleted => None,
            };
            let Some(fk) = target else { continue };
            if !first_set_done {
                check_cancelled(cancel)?;
            }
            let driver = self.driver(&key.entity, &fetch.source)?;
            match self
                .call_set(driver.as_ref(), &new_baseline, fk.as_ref())
                .await
            {
                Ok(minted) => {
                    first_set_done = true;
                    if fk.is_none() {
                        // Record the minted key before commit so a retried
                        // cycle never calls create twice.
                        self.store.record_foreign_key(&key, &fetch.source, &minted)?;
                        debug!(key = %key, source = %fetch.source, fk = %minted, "propagated to absent source");
                    }
                }
                Err(err) => return self.abort_write_back(&key, &fetch.source, outcome, err),
            }
        }

        // Step 7 commit + step 8 notification, atomically.
        let applied_ops = outcome.applied.len();
        let rejected_ops = outcome.rejected_op_count();
        let diff_id = if applied_ops > 0 || rejected_ops > 0 {
            Some(self.store.commit_reconciliation(
                &key,
                outcome.applied,
                outcome.rejected,
                Some(new_baseline),
            )?)
        } else {
            None
        };

        // Deleted sources leave the index; removing the last one cascades.
        for fetch in &fetches {
            if matches!(fetch.state, SourceState::Deleted) {
                self.store.delete_foreign_key(&key, &fetch.source)?;
            }
        }

        info!(key = %key, applied_ops, rejected_ops, "cycle committed");
        Ok(CycleOutcome {
            key,
            diff_id,
            applied_ops,
            rejected_ops,
        })
    }

    /// Apply an operator resolution: the chosen rejected operations land on
    /// top of the current baseline, the result is written to every source,
    /// and the diff record's conflict clears.
    pub async fn run_resolution(
        &self,
        diff_id: DiffId,
        chosen: &[OpId],
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome> {
        let record = self
            .store
            .get_diff(diff_id)?
            .ok_or_else(|| ReconcileError::NotFound(format!("diff {diff_id}")))?;
        let key = record.key.clone();
        let sources = self.declared_sources(&key.entity, None)?;

        // Operation ids index the flattening of the rejected patches in
        // recorded order.
        let flat: Vec<(Option<&str>, &Op)> = record
            .rejected
            .iter()
            .flat_map(|patch| {
                patch
                    .ops
                    .iter()
                    .map(move |op| (patch.label.source_name(), op))
            })
            .collect();
        let mut ops = Vec::with_capacity(chosen.len());
        for op_id in chosen {
            let (source, op) = flat.get(op_id.0 as usize).ok_or_else(|| {
                ReconcileError::NotFound(format!("op {op_id} in diff {diff_id}"))
            })?;
            let mut op = (*op).clone();
            op.source = source.map(str::to_string);
            ops.push(op);
        }
        ops.sort_by(|a, b| a.path.cmp(&b.path));
        let resolution = Diff::new(Provenance::Resolved, ops);

        check_cancelled(cancel)?;
        let baseline = load_baseline(&*self.store, &key)?;
        let new_baseline = diff::apply_forced(&resolution, &baseline);

        let mut first_set_done = false;
        for source in &sources {
            let driver = self.driver(&key.entity, source)?;
            let fk = self.store.lookup_foreign_key(&key, source)?;
            if fk.is_none() && new_baseline.is_empty() {
                continue;
            }
            if !first_set_done {
                check_cancelled(cancel)?;
            }
            match self
                .call_set(driver.as_ref(), &new_baseline, fk.as_ref())
                .await
            {
                Ok(minted) => {
                    first_set_done = true;
                    if fk.is_none() {
                        self.store.record_foreign_key(&key, source, &minted)?;
                    }
                }
                Err(err) => {
                    warn!(key = %key, diff = %diff_id, source = %source, %err, "resolution write-back failed");
                    return Err(ReconcileError::Unavailable(format!("{source}: {err}")));
                }
            }
        }

        let mut applied = record.applied;
        applied.ops.extend(resolution.ops);
        applied.ops.sort_by(|a, b| a.path.cmp(&b.path));
        let applied_ops = applied.len();
        // One atomic commit: the conflict clears and the baseline advances
        // together, or neither does.
        self.store.commit_resolution(diff_id, applied, &new_baseline)?;

        info!(key = %key, diff = %diff_id, chosen = chosen.len(), "resolution committed");
        Ok(CycleOutcome {
            key,
            diff_id: Some(diff_id),
            applied_ops,
            rejected_ops: 0,
        })
    }

    async fn fetch_sources<S: StoreRead + ?Sized>(
        &self,
        store: &S,
        key: &InternalKey,
        sources: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<SourceFetch>> {
        let mut fetches = Vec::with_capacity(sources.len());
        for source in sources {
            check_cancelled(cancel)?;
            let state = match store.lookup_foreign_key(key, source)? {
                None => SourceState::Absent,
                Some(fk) => {
                    let driver = self.driver(&key.entity, source)?;
                    match self.call_get(driver.as_ref(), &fk).await {
                        Ok(doc) => SourceState::Present { fk, doc },
                        Err(DriverError::NotFound) => {
                            debug!(key = %key, source = %source, "source no longer holds the record");
                            SourceState::Deleted
                        }
                        Err(DriverError::Unavailable(reason)) => {
                            return Err(ReconcileError::Unavailable(format!(
                                "{source}: {reason}"
                            )));
                        }
                    }
                }
            };
            fetches.push(SourceFetch {
                source: source.clone(),
                state,
            });
        }
        Ok(fetches)
    }

    fn abort_write_back(
        &self,
        key: &InternalKey,
        source: &str,
        outcome: MergeOutcome,
        err: DriverError,
    ) -> Result<CycleOutcome> {
        // Persist what was computed so operators can inspect; the baseline
        // stays put and the dispatcher retries the item.
        if !outcome.applied.is_empty() || outcome.rejected_op_count() > 0 {
            let diff_id =
                self.store
                    .commit_reconciliation(key, outcome.applied, outcome.rejected, None)?;
            warn!(key = %key, source = %source, diff = %diff_id, %err, "write-back failed; diff recorded without baseline advance");
        } else {
            warn!(key = %key, source = %source, %err, "write-back failed");
        }
        Err(ReconcileError::Unavailable(format!("{source}: {err}")))
    }

    async fn call_get(
        &self,
        driver: &dyn SourceDriver,
        fk: &ForeignKey,
    ) -> std::result::Result<Document, DriverError> {
        match timeout(self.driver_timeout, driver.get(fk)).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Unavailable("driver call timed out".to_string())),
        }
    }

    async fn call_set(
        &self,
        driver: &dyn SourceDriver,
        doc: &Document,
        fk: Option<&ForeignKey>,
    ) -> std::result::Result<ForeignKey, DriverError> {
        match timeout(self.driver_timeout, driver.set(doc, fk)).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Unavailable("driver call timed out".to_string())),
        }
    }

    fn declared_sources(&self, entity: &str, source: Option<&str>) -> Result<Vec<String>> {
        let sources = self
            .registry
            .sources(entity)
            .ok_or_else(|| ReconcileError::UnknownEntity(entity.to_string()))?;
        if let Some(source) = source {
            if !sources.iter().any(|s| s == source) {
                return Err(ReconcileError::UnknownSource(format!("{entity}/{source}")));
            }
        }
        Ok(sources.to_vec())
    }

    fn driver(&self, entity: &str, source: &str) -> Result<Arc<dyn SourceDriver>> {
        self.registry
            .driver(entity, source)
            .ok_or_else(|| ReconcileError::UnknownSource(format!("{entity}/{source}")))
    }
}

fn load_baseline<S: StoreRead + ?Sized>(store: &S, key: &InternalKey) -> Result<Document> {
    Ok(store.get_baseline(key)?.unwrap_or_default())
}

fn build_patches(baseline: &Document, fetches: &[SourceFetch]) -> Vec<Diff> {
    fetches
        .iter()
        .filter_map(|fetch| match &fetch.state {
            SourceState::Present { doc, .. } => Some(diff::diff(
                baseline,
                doc,
                Provenance::Source(fetch.source.clone()),
            )),
            SourceState::Deleted => Some(diff::diff(
                baseline,
                &Document::empty(),
                Provenance::Deleted(fetch.source.clone()),
            )),
            SourceState::Absent => None,
        })
        .collect()
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(ReconcileError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::FieldPath;
    use crate::store::MemoryStore;
    use crate::test_support::{doc, MemoryDriver};
    use std::collections::HashMap;

    struct Fixture {
        store: Arc<MemoryStore>,
        reconciler: Reconciler,
        drivers: HashMap<&'static str, MemoryDriver>,
    }

    fn fixture(entity: &str, sources: &[&'static str]) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mut registry = DriverRegistry::new();
        let mut drivers = HashMap::new();
        for &source in sources {
            let driver = MemoryDriver::new();
            registry.register(entity, source, HashMap::new(), Arc::new(driver.clone()));
            drivers.insert(source, driver);
        }
        let reconciler = Reconciler::new(store.clone(), Arc::new(registry));
        Fixture {
            store,
            reconciler,
            drivers,
        }
    }

    fn item(entity: &str, source: &str, fk: &str) -> WorkItem {
        WorkItem {
            entity: entity.to_string(),
            source: source.to_string(),
            foreign_key: ForeignKey::new(fk),
        }
    }

    fn path(dotted: &str) -> FieldPath {
        FieldPath::parse(dotted).unwrap()
    }

    #[tokio::test]
    async fn test_single_source_first_contact() {
        let fx = fixture("customer", &["acct"]);
        fx.drivers["acct"].put("A1", doc(&[("name", "Alice")]));

        let cancel = CancellationToken::new();
        let outcome = fx
            .reconciler
            .run_cycle(&item("customer", "acct", "A1"), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.key.entity, "customer");
        assert_eq!(outcome.rejected_ops, 0);
        let baseline = fx.store.get_baseline(&outcome.key).unwrap().unwrap();
        assert_eq!(baseline, doc(&[("name", "Alice")]));
        assert_eq!(fx.store.fetch_notifications(16).unwrap().1.len(), 0);
        let sets = fx.drivers["acct"].set_calls();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].1, doc(&[("name", "Alice")]));
    }

    #[tokio::test]
    async fn test_two_sources_agree() {
        let fx = fixture("customer", &["acct", "users"]);
        let target = doc(&[("name", "Alice"), ("tier", "gold")]);
        fx.drivers["acct"].put("A1", target.clone());
        fx.drivers["users"].put("U1", target.clone());

        // Pre-arrange both foreign keys under the same internal key.
        let key = fx.store.allocate_internal_key("customer").unwrap();
        fx.store
            .record_foreign_key(&key, "acct", &ForeignKey::new("A1"))
            .unwrap();
        fx.store
            .record_foreign_key(&key, "users", &ForeignKey::new("U1"))
            .unwrap();

        let cancel = CancellationToken::new();
        let outcome = fx
            .reconciler
            .run_cycle(&item("customer", "acct", "A1"), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.rejected_ops, 0);
        assert_eq!(fx.store.get_baseline(&key).unwrap().unwrap(), target);
        assert_eq!(fx.drivers["acct"].set_calls().len(), 1);
        assert_eq!(fx.drivers["users"].set_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_on_one_path() {
        let fx = fixture("customer", &["acct", "users"]);
        fx.drivers["acct"].put("A1", doc(&[("name", "Alice"), ("tier", "gold")]));
        fx.drivers["users"].put("U1", doc(&[("name", "Alice"), ("tier", "silver")]));

        let key = fx.store.allocate_internal_key("customer").unwrap();
        fx.store
            .record_foreign_key(&key, "acct", &ForeignKey::new("A1"))
            .unwrap();
        fx.store
            .record_foreign_key(&key, "users", &ForeignKey::new("U1"))
            .unwrap();

        let cancel = CancellationToken::new();
        let outcome = fx
            .reconciler
            .run_cycle(&item("customer", "acct", "A1"), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.applied_ops, 1);
        assert_eq!(outcome.rejected_ops, 2);
        assert_eq!(
            fx.store.get_baseline(&key).unwrap().unwrap(),
            doc(&[("name", "Alice")])
        );

        let record = fx.store.get_diff(outcome.diff_id.unwrap()).unwrap().unwrap();
        assert_eq!(record.applied.ops[0].path, path("name"));
        let rejected_values: Vec<_> = record
            .rejected
            .iter()
            .flat_map(|patch| patch.ops.iter())
            .map(|op| op.final_value().unwrap().to_string())
            .collect();
        assert_eq!(rejected_values, vec!["gold", "silver"]);

        let (_, notes) = fx.store.fetch_notifications(16).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].diff, outcome.diff_id.unwrap());
    }

    #[tokio::test]
    async fn test_resolution_applies_chosen_ops() {
        let fx = fixture("customer", &["acct", "users"]);
        fx.drivers["acct"].put("A1", doc(&[("name", "Alice"), ("tier", "gold")]));
        fx.drivers["users"].put("U1", doc(&[("name", "Alice"), ("tier", "silver")]));

        let key = fx.store.allocate_internal_key("customer").unwrap();
        fx.store
            .record_foreign_key(&key, "acct", &ForeignKey::new("A1"))
            .unwrap();
        fx.store
            .record_foreign_key(&key, "users", &ForeignKey::new("U1"))
            .unwrap();

        let cancel = CancellationToken::new();
        let outcome = fx
            .reconciler
            .run_cycle(&item("customer", "acct", "A1"), &cancel)
            .await
            .unwrap();
        let diff_id = outcome.diff_id.unwrap();

        // Op 1 of the flattened rejected list is users' tier=silver.
        fx.reconciler
            .run_resolution(diff_id, &[OpId(1)], &cancel)
            .await
            .unwrap();

        let resolved = doc(&[("name", "Alice"), ("tier", "silver")]);
        assert_eq!(fx.store.get_baseline(&key).unwrap().unwrap(), resolved);
        let record = fx.store.get_diff(diff_id).unwrap().unwrap();
        assert!(!record.has_conflicts());
        assert_eq!(fx.drivers["acct"].document("A1").unwrap(), resolved);
        assert_eq!(fx.drivers["users"].document("U1").unwrap(), resolved);
    }

    #[tokio::test]
    async fn test_write_back_failure_keeps_baseline() {
        let fx = fixture("customer", &["acct"]);
        fx.drivers["acct"].put("A1", doc(&[("name", "Alice")]));
        fx.drivers["acct"].fail_next_set(DriverError::Unavailable("boom".to_string()));

        let cancel = CancellationToken::new();
        let err = fx
            .reconciler
            .run_cycle(&item("customer", "acct", "A1"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        // Baseline unchanged, but the computed diff was recorded.
        let key = fx
            .store
            .lookup_internal_key("customer", "acct", &ForeignKey::new("A1"))
            .unwrap()
            .unwrap();
        assert!(fx.store.get_baseline(&key).unwrap().is_none());
        assert_eq!(fx.store.list_diff_ids(&key).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_unavailable_aborts_without_records() {
        let fx = fixture("customer", &["acct"]);
        fx.drivers["acct"].put("A1", doc(&[("name", "Alice")]));
        fx.drivers["acct"].fail_next_get(DriverError::Unavailable("flaky".to_string()));

        let cancel = CancellationToken::new();
        let err = fx
            .reconciler
            .run_cycle(&item("customer", "acct", "A1"), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let key = fx
            .store
            .lookup_internal_key("customer", "acct", &ForeignKey::new("A1"))
            .unwrap()
            .unwrap();
        assert!(fx.store.list_diff_ids(&key).unwrap().is_empty());
        assert!(fx.store.get_baseline(&key).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_absent_source_receives_created_record() {
        let fx = fixture("customer", &["acct", "users"]);
        fx.drivers["acct"].put("A1", doc(&[("name", "Alice")]));

        let cancel = CancellationToken::new();
        let outcome = fx
            .reconciler
            .run_cycle(&item("customer", "acct", "A1"), &cancel)
            .await
            .unwrap();

        // users had no copy; the cycle created one and recorded its key.
        let minted = fx
            .store
            .lookup_foreign_key(&outcome.key, "users")
            .unwrap()
            .expect("foreign key recorded for users");
        assert_eq!(
            fx.drivers["users"].document(minted.as_str()).unwrap(),
            doc(&[("name", "Alice")])
        );
    }

    #[tokio::test]
    async fn test_deleted_source_cleans_index() {
        let fx = fixture("customer", &["acct", "users"]);
        fx.drivers["users"].put("U1", doc(&[("name", "Alice")]));

        let key = fx.store.allocate_internal_key("customer").unwrap();
        fx.store
            .record_foreign_key(&key, "acct", &ForeignKey::new("A1"))
            .unwrap();
        fx.store
            .record_foreign_key(&key, "users", &ForeignKey::new("U1"))
            .unwrap();
        fx.store.put_baseline(&key, &doc(&[("name", "Alice")])).unwrap();

        // acct no longer holds A1; its mapping should disappear while the
        // record survives on users.
        let cancel = CancellationToken::new();
        fx.reconciler
            .run_cycle(&item("customer", "users", "U1"), &cancel)
            .await
            .unwrap();

        assert_eq!(fx.store.lookup_foreign_key(&key, "acct").unwrap(), None);
        assert_eq!(
            fx.store.lookup_foreign_key(&key, "users").unwrap(),
            Some(ForeignKey::new("U1"))
        );
    }

    #[tokio::test]
    async fn test_all_sources_deleted_removes_key() {
        let fx = fixture("customer", &["acct"]);
        let key = fx.store.allocate_internal_key("customer").unwrap();
        fx.store
            .record_foreign_key(&key, "acct", &ForeignKey::new("A1"))
            .unwrap();
        fx.store.put_baseline(&key, &doc(&[("name", "Alice")])).unwrap();

        let cancel = CancellationToken::new();
        fx.reconciler
            .run_cycle(&item("customer", "acct", "A1"), &cancel)
            .await
            .unwrap();

        assert!(fx
            .store
            .lookup_internal_key("customer", "acct", &ForeignKey::new("A1"))
            .unwrap()
            .is_none());
        assert!(fx.store.get_baseline(&key).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_entity_and_source() {
        let fx = fixture("customer", &["acct"]);
        let cancel = CancellationToken::new();
        let err = fx
            .reconciler
            .run_cycle(&item("order", "erp", "X"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownEntity(_)));

        let err = fx
            .reconciler
            .run_cycle(&item("customer", "erp", "X"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownSource(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_fetch() {
        let fx = fixture("customer", &["acct"]);
        fx.drivers["acct"].put("A1", doc(&[("name", "Alice")]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fx
            .reconciler
            .run_cycle(&item("customer", "acct", "A1"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, ReconcileError::Cancelled);
    }

    #[tokio::test]
    async fn test_no_change_cycle_records_nothing() {
        let fx = fixture("customer", &["acct"]);
        fx.drivers["acct"].put("A1", doc(&[("name", "Alice")]));
        let cancel = CancellationToken::new();
        let first = fx
            .reconciler
            .run_cycle(&item("customer", "acct", "A1"), &cancel)
            .await
            .unwrap();
        assert!(first.diff_id.is_some());

        // Second cycle sees no difference against the baseline.
        let second = fx
            .reconciler
            .run_cycle(&item("customer", "acct", "A1"), &cancel)
            .await
            .unwrap();
        assert!(second.diff_id.is_none());
        assert_eq!(fx.store.list_diff_ids(&first.key).unwrap().len(), 1);
    }
}
