//! # Store Contract
//!
//! Persistence of the key index, baselines, diff records, and conflict
//! notifications. The contract is split into a read-only capability view and
//! the full read-write view; reconciliation's fetch and diff steps only ever
//! receive the former.

use crate::diff::Diff;
use crate::document::Document;
use crate::error::{ReconcileError, Result};
use crate::model::{DiffId, ForeignKey, InternalKey, Notification};
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// A persisted reconciliation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffRecord {
    pub id: DiffId,
    pub key: InternalKey,
    /// The merged patch that advanced (or would have advanced) the baseline.
    pub applied: Diff,
    /// Per-source patches whose operations could not be merged.
    pub rejected: Vec<Diff>,
}

impl DiffRecord {
    pub fn has_conflicts(&self) -> bool {
        self.rejected.iter().any(|patch| !patch.is_empty())
    }
}

/// Read-only capability view over the store.
pub trait StoreRead: Send + Sync {
    fn lookup_internal_key(
        &self,
        entity: &str,
        source: &str,
        fk: &ForeignKey,
    ) -> Result<Option<InternalKey>>;

    fn lookup_foreign_key(&self, key: &InternalKey, source: &str) -> Result<Option<ForeignKey>>;

    fn get_baseline(&self, key: &InternalKey) -> Result<Option<Document>>;

    fn list_diff_ids(&self, key: &InternalKey) -> Result<Vec<DiffId>>;

    fn get_diff(&self, id: DiffId) -> Result<Option<DiffRecord>>;
}

/// Full read-write capability view.
pub trait Store: StoreRead {
    /// Mint a fresh internal key for `entity`. Ids are never reused.
    fn allocate_internal_key(&self, entity: &str) -> Result<InternalKey>;

    /// Bind a foreign key to an internal key. Idempotent on the exact pair;
    /// fails with `Conflict` if the foreign key already maps to a different
    /// internal key.
    fn record_foreign_key(&self, key: &InternalKey, source: &str, fk: &ForeignKey) -> Result<()>;

    /// Remove one binding. Removing the last foreign key of an internal key
    /// cascades to `delete_internal_key` in the same transaction.
    fn delete_foreign_key(&self, key: &InternalKey, source: &str) -> Result<()>;

    /// Remove the key and everything hanging off it: foreign keys, baseline,
    /// diff records, notifications.
    fn delete_internal_key(&self, key: &InternalKey) -> Result<()>;

    fn put_baseline(&self, key: &InternalKey, doc: &Document) -> Result<()>;

    fn delete_baseline(&self, key: &InternalKey) -> Result<()>;

    fn record_diffs(&self, key: &InternalKey, applied: Diff, rejected: Vec<Diff>)
        -> Result<DiffId>;

    /// Rewrite an existing diff record in place, keeping its id stable.
    fn update_diff(&self, id: DiffId, applied: Diff, rejected: Vec<Diff>) -> Result<()>;

    fn delete_diff(&self, id: DiffId) -> Result<()>;

    fn delete_diffs(&self, key: &InternalKey) -> Result<usize>;

    fn record_notification(&self, key: &InternalKey, diff: DiffId) -> Result<()>;

    /// Atomically remove and return up to `max` notifications in recorded
    /// order, along with the count still pending afterwards. A notification
    /// is never returned twice.
    fn fetch_notifications(&self, max: usize) -> Result<(usize, Vec<Notification>)>;

    /// The compound commit at the end of a cycle: persist the diff record,
    /// advance the baseline when `new_baseline` is given, and append the
    /// conflict notification when `rejected` is non-empty — all atomically.
    fn commit_reconciliation(
        &self,
        key: &InternalKey,
        applied: Diff,
        rejected: Vec<Diff>,
        new_baseline: Option<Document>,
    ) -> Result<DiffId>;

    /// The compound commit at the end of a resolution cycle: rewrite the
    /// diff record in place (conflict cleared, id stable) and advance its
    /// key's baseline, atomically.
    fn commit_resolution(&self, id: DiffId, applied: Diff, new_baseline: &Document)
        -> Result<()>;
}

#[derive(Default)]
struct MemoryInner {
    next_key_ids: HashMap<String, u64>,
    /// (entity, source, fk) -> internal id
    fk_index: HashMap<(String, String, ForeignKey), u64>,
    /// internal key -> source -> fk
    key_sources: HashMap<InternalKey, BTreeMap<String, ForeignKey>>,
    baselines: HashMap<InternalKey, Document>,
    diffs: BTreeMap<u64, DiffRecord>,
    diff_index: HashMap<InternalKey, Vec<DiffId>>,
    notifications: VecDeque<Notification>,
    next_diff_id: u64,
}

impl MemoryInner {
    fn record_foreign_key(
        &mut self,
        key: &InternalKey,
        source: &str,
        fk: &ForeignKey,
    ) -> Result<()> {
        let index_key = (key.entity.clone(), source.to_string(), fk.clone());
        if let Some(&bound) = self.fk_index.get(&index_key) {
            if bound == key.id {
                return Ok(());
            }
            return Err(ReconcileError::Conflict(format!(
                "{fk} already bound to {}#{bound}",
                key.entity
            )));
        }
        self.fk_index.insert(index_key, key.id);
        self.key_sources
            .entry(key.clone())
            .or_default()
            .insert(source.to_string(), fk.clone());
        Ok(())
    }

    fn delete_internal_key(&mut self, key: &InternalKey) {
        if let Some(sources) = self.key_sources.remove(key) {
            for (source, fk) in sources {
                self.fk_index.remove(&(key.entity.clone(), source, fk));
            }
        }
        self.baselines.remove(key);
        for id in self.diff_index.remove(key).unwrap_or_default() {
            self.diffs.remove(&id.0);
        }
        self.notifications.retain(|n| &n.key != key);
    }

    fn record_diffs(&mut self, key: &InternalKey, applied: Diff, rejected: Vec<Diff>) -> DiffId {
        let id = DiffId(self.next_diff_id);
        self.next_diff_id += 1;
        self.diffs.insert(
            id.0,
            DiffRecord {
                id,
                key: key.clone(),
                applied,
                rejected,
            },
        );
        self.diff_index.entry(key.clone()).or_default().push(id);
        id
    }
}

/// In-memory store, the default for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreRead for MemoryStore {
    fn lookup_internal_key(
        &self,
        entity: &str,
        source: &str,
        fk: &ForeignKey,
    ) -> Result<Option<InternalKey>> {
        let inner = self.inner.lock();
        Ok(inner
            .fk_index
            .get(&(entity.to_string(), source.to_string(), fk.clone()))
            .map(|&id| InternalKey::new(entity, id)))
    }

    fn lookup_foreign_key(&self, key: &InternalKey, source: &str) -> Result<Option<ForeignKey>> {
        let inner = self.inner.lock();
        Ok(inner
            .key_sources
            .get(key)
            .and_then(|sources| sources.get(source))
            .cloned())
    }

    fn get_baseline(&self, key: &InternalKey) -> Result<Option<Document>> {
        Ok(self.inner.lock().baselines.get(key).cloned())
    }

    fn list_diff_ids(&self, key: &InternalKey) -> Result<Vec<DiffId>> {
        Ok(self
            .inner
            .lock()
            .diff_index
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    fn get_diff(&self, id: DiffId) -> Result<Option<DiffRecord>> {
        Ok(self.inner.lock().diffs.get(&id.0).cloned())
    }
}

impl Store for MemoryStore {
    fn allocate_internal_key(&self, entity: &str) -> Result<InternalKey> {
        let mut inner = self.inner.lock();
        let next = inner.next_key_ids.entry(entity.to_string()).or_insert(1);
        let id = *next;
        *next += 1;
        Ok(InternalKey::new(entity, id))
    }

    fn record_foreign_key(&self, key: &InternalKey, source: &str, fk: &ForeignKey) -> Result<()> {
        self.inner.lock().record_foreign_key(key, source, fk)
    }

    fn delete_foreign_key(&self, key: &InternalKey, source: &str) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let mut emptied = false;
        if let Some(sources) = inner.key_sources.get_mut(key) {
            if let Some(fk) = sources.remove(source) {
                inner
                    .fk_index
                    .remove(&(key.entity.clone(), source.to_string(), fk));
            }
            emptied = sources.is_empty();
        }
        if emptied {
            inner.delete_internal_key(key);
        }
        Ok(())
    }

    fn delete_internal_key(&self, key: &InternalKey) -> Result<()> {
        self.inner.lock().delete_internal_key(key);
        Ok(())
    }

    fn put_baseline(&self, key: &InternalKey, doc: &Document) -> Result<()> {
        self.inner.lock().baselines.insert(key.clone(), doc.clone());
        Ok(())
    }

    fn delete_baseline(&self, key: &InternalKey) -> Result<()> {
        self.inner.lock().baselines.remove(key);
        Ok(())
    }

    fn record_diffs(
        &self,
        key: &InternalKey,
        applied: Diff,
        rejected: Vec<Diff>,
    ) -> Result<DiffId> {
        Ok(self.inner.lock().record_diffs(key, applied, rejected))
    }

    fn update_diff(&self, id: DiffId, applied: Diff, rejected: Vec<Diff>) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.diffs.get_mut(&id.0) {
            Some(record) => {
                record.applied = applied;
                record.rejected = rejected;
                Ok(())
            }
            None => Err(ReconcileError::NotFound(format!("diff {id}"))),
        }
    }

    fn delete_diff(&self, id: DiffId) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.diffs.remove(&id.0) {
            if let Some(ids) = inner.diff_index.get_mut(&record.key) {
                ids.retain(|&existing| existing != id);
            }
        }
        Ok(())
    }

    fn delete_diffs(&self, key: &InternalKey) -> Result<usize> {
        let mut inner = self.inner.lock();
        let ids = inner.diff_index.remove(key).unwrap_or_default();
        for id in &ids {
            inner.diffs.remove(&id.0);
        }
        Ok(ids.len())
    }

    fn record_notification(&self, key: &InternalKey, diff: DiffId) -> Result<()> {
        self.inner
            .lock()
            .notifications
            .push_back(Notification::now(key.clone(), diff));
        Ok(())
    }

    fn fetch_notifications(&self, max: usize) -> Result<(usize, Vec<Notification>)> {
        let mut inner = self.inner.lock();
        let take = max.min(inner.notifications.len());
        let drained = inner.notifications.drain(..take).collect();
        Ok((inner.notifications.len(), drained))
    }

    fn commit_reconciliation(
        &self,
        key: &InternalKey,
        applied: Diff,
        rejected: Vec<Diff>,
        new_baseline: Option<Document>,
    ) -> Result<DiffId> {
        let mut inner = self.inner.lock();
        let has_conflicts = rejected.iter().any(|patch| !patch.is_empty());
        let id = inner.record_diffs(key, applied, rejected);
        if let Some(doc) = new_baseline {
            inner.baselines.insert(key.clone(), doc);
        }
        if has_conflicts {
            inner
                .notifications
                .push_back(Notification::now(key.clone(), id));
        }
        Ok(id)
    }

    fn commit_resolution(
        &self,
        id: DiffId,
        applied: Diff,
        new_baseline: &Document,
    ) -> Result<()> {
        let inner = &mut *self.inner.lock();
        let record = inner
            .diffs
            .get_mut(&id.0)
            .ok_or_else(|| ReconcileError::NotFound(format!("diff {id}")))?;
        record.applied = applied;
        record.rejected = Vec::new();
        let key = record.key.clone();
        inner.baselines.insert(key, new_baseline.clone());
        Ok(())
    }
}
