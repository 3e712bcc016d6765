//! # Persistent Store
//!
//! RocksDB-backed implementation of the store contract. One column family
//! per logical table, bincode value blobs, and `WriteBatch` for the atomic
//! compound commits the reconciler depends on.

use crate::diff::Diff;
use crate::document::Document;
use crate::error::{ReconcileError, Result};
use crate::model::{DiffId, ForeignKey, InternalKey, Notification};
use crate::store::{DiffRecord, Store, StoreRead};
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

const CF_FK_INDEX: &str = "fk_index";
const CF_KEY_SOURCES: &str = "key_sources";
const CF_BASELINES: &str = "baselines";
const CF_DIFFS: &str = "diffs";
const CF_DIFF_INDEX: &str = "diff_index";
const CF_NOTIFICATIONS: &str = "notifications";
const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";
const KEY_NEXT_DIFF_ID: &[u8] = b"next_diff_id";
const KEY_NEXT_NOTIFICATION_SEQ: &[u8] = b"next_notification_seq";
const KEY_PREFIX_NEXT_KEY: &str = "next_key:";

const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

#[derive(Default)]
struct Counters {
    next_key_ids: HashMap<String, u64>,
    next_diff_id: u64,
    next_notification_seq: u64,
}

/// Durable store over a RocksDB directory.
///
/// All mutating operations serialise on the counters lock, which makes the
/// compound commits (record diffs + baseline + notification, and the
/// read-and-delete of `fetch_notifications`) linearisable.
pub struct RocksStore {
    db: DB,
    counters: Mutex<Counters>,
}

impl RocksStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);
        let descriptors = [
            CF_FK_INDEX,
            CF_KEY_SOURCES,
            CF_BASELINES,
            CF_DIFFS,
            CF_DIFF_INDEX,
            CF_NOTIFICATIONS,
            CF_METADATA,
        ]
        .iter()
        .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
        .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&options, path, descriptors).map_err(storage_err)?;
        let store = Self {
            db,
            counters: Mutex::new(Counters::default()),
        };
        store.validate_or_init_manifest()?;
        store.load_counters()?;
        Ok(store)
    }

    fn validate_or_init_manifest(&self) -> Result<()> {
        let metadata = self.cf(CF_METADATA)?;
        match self.db.get_cf(metadata, KEY_MANIFEST).map_err(storage_err)? {
            Some(bytes) => {
                let manifest: StorageManifest = decode(&bytes)?;
                if manifest.format_version != STORAGE_FORMAT_VERSION {
                    return Err(ReconcileError::Internal(format!(
                        "storage format {} is not supported (expected {})",
                        manifest.format_version, STORAGE_FORMAT_VERSION
                    )));
                }
            }
            None => {
                let manifest = StorageManifest {
                    format_version: STORAGE_FORMAT_VERSION,
                    app_version: env!("CARGO_PKG_VERSION").to_string(),
                };
                self.db
                    .put_cf(metadata, KEY_MANIFEST, encode(&manifest)?)
                    .map_err(storage_err)?;
            }
        }
        Ok(())
    }

    fn load_counters(&self) -> Result<()> {
        let metadata = self.cf(CF_METADATA)?;
        let mut counters = self.counters.lock();
        if let Some(bytes) = self
            .db
            .get_cf(metadata, KEY_NEXT_DIFF_ID)
            .map_err(storage_err)?
        {
            counters.next_diff_id = decode(&bytes)?;
        }
        if let Some(bytes) = self
            .db
            .get_cf(metadata, KEY_NEXT_NOTIFICATION_SEQ)
            .map_err(storage_err)?
        {
            counters.next_notification_seq = decode(&bytes)?;
        }
        for item in self.db.iterator_cf(metadata, IteratorMode::Start) {
            let (key, value) = item.map_err(storage_err)?;
            if let Ok(text) = std::str::from_utf8(&key) {
                if let Some(entity) = text.strip_prefix(KEY_PREFIX_NEXT_KEY) {
                    counters
                        .next_key_ids
                        .insert(entity.to_string(), decode(&value)?);
                }
            }
        }
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ReconcileError::Internal(format!("missing column family {name}")))
    }

    /// Sources recorded under a key, with their foreign keys, in source order.
    fn sources_of(&self, key: &InternalKey) -> Result<Vec<(String, ForeignKey)>> {
        let cf = self.cf(CF_KEY_SOURCES)?;
        let prefix = key_prefix(key)?;
        let mut found = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (raw_key, raw_value) = item.map_err(storage_err)?;
            if !raw_key.starts_with(&prefix) {
                break;
            }
            let (_, _, source): (String, u64, String) = decode(&raw_key)?;
            let fk: String = decode(&raw_value)?;
            found.push((source, ForeignKey(fk)));
        }
        Ok(found)
    }

    fn diff_ids_of(&self, key: &InternalKey) -> Result<Vec<DiffId>> {
        let cf = self.cf(CF_DIFF_INDEX)?;
        let prefix = key_prefix(key)?;
        let mut ids = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (raw_key, _) = item.map_err(storage_err)?;
            if !raw_key.starts_with(&prefix) {
                break;
            }
            let suffix: [u8; 8] = raw_key[raw_key.len() - 8..]
                .try_into()
                .map_err(|_| ReconcileError::Internal("bad diff index key".to_string()))?;
            ids.push(DiffId(u64::from_be_bytes(suffix)));
        }
        Ok(ids)
    }

    /// Stage removal of a key and everything hanging off it.
    fn stage_delete_internal_key(&self, batch: &mut WriteBatch, key: &InternalKey) -> Result<()> {
        let fk_index = self.cf(CF_FK_INDEX)?;
        let key_sources = self.cf(CF_KEY_SOURCES)?;
        let baselines = self.cf(CF_BASELINES)?;
        let diffs = self.cf(CF_DIFFS)?;
        let diff_index = self.cf(CF_DIFF_INDEX)?;
        let notifications = self.cf(CF_NOTIFICATIONS)?;

        for (source, fk) in self.sources_of(key)? {
            batch.delete_cf(fk_index, triple_key(&key.entity, &source, &fk)?);
            batch.delete_cf(key_sources, source_key(key, &source)?);
        }
        batch.delete_cf(baselines, key_prefix(key)?);
        let prefix = key_prefix(key)?;
        for id in self.diff_ids_of(key)? {
            batch.delete_cf(diffs, id.0.to_be_bytes());
            let mut index_key = prefix.clone();
            index_key.extend_from_slice(&id.0.to_be_bytes());
            batch.delete_cf(diff_index, index_key);
        }
        for item in self.db.iterator_cf(notifications, IteratorMode::Start) {
            let (raw_key, raw_value) = item.map_err(storage_err)?;
            let note: Notification = decode(&raw_value)?;
            if &note.key == key {
                batch.delete_cf(notifications, raw_key);
            }
        }
        Ok(())
    }

    fn stage_record_diffs(
        &self,
        counters: &mut Counters,
        batch: &mut WriteBatch,
        key: &InternalKey,
        applied: Diff,
        rejected: Vec<Diff>,
    ) -> Result<DiffId> {
        let id = DiffId(counters.next_diff_id);
        counters.next_diff_id += 1;
        let record = DiffRecord {
            id,
            key: key.clone(),
            applied,
            rejected,
        };
        batch.put_cf(self.cf(CF_DIFFS)?, id.0.to_be_bytes(), encode(&record)?);
        let mut index_key = key_prefix(key)?;
        index_key.extend_from_slice(&id.0.to_be_bytes());
        batch.put_cf(self.cf(CF_DIFF_INDEX)?, index_key, b"");
        batch.put_cf(
            self.cf(CF_METADATA)?,
            KEY_NEXT_DIFF_ID,
            encode(&counters.next_diff_id)?,
        );
        Ok(id)
    }

    fn stage_put_baseline(
        &self,
        batch: &mut WriteBatch,
        key: &InternalKey,
        doc: &Document,
    ) -> Result<()> {
        batch.put_cf(self.cf(CF_BASELINES)?, key_prefix(key)?, encode(doc)?);
        Ok(())
    }

    fn stage_notification(
        &self,
        counters: &mut Counters,
        batch: &mut WriteBatch,
        key: &InternalKey,
        diff: DiffId,
    ) -> Result<()> {
        let seq = counters.next_notification_seq;
        counters.next_notification_seq += 1;
        let note = Notification::now(key.clone(), diff);
        batch.put_cf(
            self.cf(CF_NOTIFICATIONS)?,
            seq.to_be_bytes(),
            encode(&note)?,
        );
        batch.put_cf(
            self.cf(CF_METADATA)?,
            KEY_NEXT_NOTIFICATION_SEQ,
            encode(&counters.next_notification_seq)?,
        );
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        self.db.write(batch).map_err(storage_err)
    }
}

impl StoreRead for RocksStore {
    fn lookup_internal_key(
        &self,
        entity: &str,
        source: &str,
        fk: &ForeignKey,
    ) -> Result<Option<InternalKey>> {
        let cf = self.cf(CF_FK_INDEX)?;
        let raw = self
            .db
            .get_cf(cf, triple_key(entity, source, fk)?)
            .map_err(storage_err)?;
        match raw {
            Some(bytes) => Ok(Some(InternalKey::new(entity, decode::<u64>(&bytes)?))),
            None => Ok(None),
        }
    }

    fn lookup_foreign_key(&self, key: &InternalKey, source: &str) -> Result<Option<ForeignKey>> {
        let cf = self.cf(CF_KEY_SOURCES)?;
        let raw = self
            .db
            .get_cf(cf, source_key(key, source)?)
            .map_err(storage_err)?;
        match raw {
            Some(bytes) => Ok(Some(ForeignKey(decode(&bytes)?))),
            None => Ok(None),
        }
    }

    fn get_baseline(&self, key: &InternalKey) -> Result<Option<Document>> {
        let cf = self.cf(CF_BASELINES)?;
        let raw = self
            .db
            .get_cf(cf, key_prefix(key)?)
            .map_err(storage_err)?;
        match raw {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_diff_ids(&self, key: &InternalKey) -> Result<Vec<DiffId>> {
        self.diff_ids_of(key)
    }

    fn get_diff(&self, id: DiffId) -> Result<Option<DiffRecord>> {
        let cf = self.cf(CF_DIFFS)?;
        let raw = self
            .db
            .get_cf(cf, id.0.to_be_bytes())
            .map_err(storage_err)?;
        match raw {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl Store for RocksStore {
    fn allocate_internal_key(&self, entity: &str) -> Result<InternalKey> {
        let mut counters = self.counters.lock();
        let next = counters
            .next_key_ids
            .entry(entity.to_string())
            .or_insert(1);
        let id = *next;
        *next += 1;
        let metadata_key = format!("{KEY_PREFIX_NEXT_KEY}{entity}");
        self.db
            .put_cf(self.cf(CF_METADATA)?, metadata_key, encode(&(id + 1))?)
            .map_err(storage_err)?;
        Ok(InternalKey::new(entity, id))
    }

    fn record_foreign_key(&self, key: &InternalKey, source: &str, fk: &ForeignKey) -> Result<()> {
        let _guard = self.counters.lock();
        let fk_index = self.cf(CF_FK_INDEX)?;
        let index_key = triple_key(&key.entity, source, fk)?;
        if let Some(bytes) = self.db.get_cf(fk_index, &index_key).map_err(storage_err)? {
            let bound: u64 = decode(&bytes)?;
            if bound == key.id {
                return Ok(());
            }
            return Err(ReconcileError::Conflict(format!(
                "{fk} already bound to {}#{bound}",
                key.entity
            )));
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(fk_index, index_key, encode(&key.id)?);
        batch.put_cf(
            self.cf(CF_KEY_SOURCES)?,
            source_key(key, source)?,
            encode(&fk.0)?,
        );
        self.write(batch)
    }

    fn delete_foreign_key(&self, key: &InternalKey, source: &str) -> Result<()> {
        let _guard = self.counters.lock();
        let remaining = self.sources_of(key)?;
        let Some((_, fk)) = remaining.iter().find(|(s, _)| s == source) else {
            return Ok(());
        };
        let mut batch = WriteBatch::default();
        if remaining.len() == 1 {
            self.stage_delete_internal_key(&mut batch, key)?;
        } else {
            batch.delete_cf(self.cf(CF_FK_INDEX)?, triple_key(&key.entity, source, fk)?);
            batch.delete_cf(self.cf(CF_KEY_SOURCES)?, source_key(key, source)?);
        }
        self.write(batch)
    }

    fn delete_internal_key(&self, key: &InternalKey) -> Result<()> {
        let _guard = self.counters.lock();
        let mut batch = WriteBatch::default();
        self.stage_delete_internal_key(&mut batch, key)?;
        self.write(batch)
    }

    fn put_baseline(&self, key: &InternalKey, doc: &Document) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.stage_put_baseline(&mut batch, key, doc)?;
        self.write(batch)
    }

    fn delete_baseline(&self, key: &InternalKey) -> Result<()> {
        self.db
            .delete_cf(self.cf(CF_BASELINES)?, key_prefix(key)?)
            .map_err(storage_err)
    }

    fn record_diffs(
        &self,
        key: &InternalKey,
        applied: Diff,
        rejected: Vec<Diff>,
    ) -> Result<DiffId> {
        let mut counters = self.counters.lock();
        let mut batch = WriteBatch::default();
        let id = self.stage_record_diffs(&mut counters, &mut batch, key, applied, rejected)?;
        self.write(batch)?;
        Ok(id)
    }

    fn update_diff(&self, id: DiffId, applied: Diff, rejected: Vec<Diff>) -> Result<()> {
        let _guard = self.counters.lock();
        let mut record = self
            .get_diff(id)?
            .ok_or_else(|| ReconcileError::NotFound(format!("diff {id}")))?;
        record.applied = applied;
        record.rejected = rejected;
        self.db
            .put_cf(self.cf(CF_DIFFS)?, id.0.to_be_bytes(), encode(&record)?)
            .map_err(storage_err)
    }

    fn delete_diff(&self, id: DiffId) -> Result<()> {
        let _guard = self.counters.lock();
        let Some(record) = self.get_diff(id)? else {
            return Ok(());
        };
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DIFFS)?, id.0.to_be_bytes());
        let mut index_key = key_prefix(&record.key)?;
        index_key.extend_from_slice(&id.0.to_be_bytes());
        batch.delete_cf(self.cf(CF_DIFF_INDEX)?, index_key);
        self.write(batch)
    }

    fn delete_diffs(&self, key: &InternalKey) -> Result<usize> {
        let _guard = self.counters.lock();
        let ids = self.diff_ids_of(key)?;
        let mut batch = WriteBatch::default();
        let prefix = key_prefix(key)?;
        for id in &ids {
            batch.delete_cf(self.cf(CF_DIFFS)?, id.0.to_be_bytes());
            let mut index_key = prefix.clone();
            index_key.extend_from_slice(&id.0.to_be_bytes());
            batch.delete_cf(self.cf(CF_DIFF_INDEX)?, index_key);
        }
        self.write(batch)?;
        Ok(ids.len())
    }

    fn record_notification(&self, key: &InternalKey, diff: DiffId) -> Result<()> {
        let mut counters = self.counters.lock();
        let mut batch = WriteBatch::default();
        self.stage_notification(&mut counters, &mut batch, key, diff)?;
        self.write(batch)
    }

    fn fetch_notifications(&self, max: usize) -> Result<(usize, Vec<Notification>)> {
        let _guard = self.counters.lock();
        let cf = self.cf(CF_NOTIFICATIONS)?;
        let mut drained = Vec::new();
        let mut remaining = 0usize;
        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (raw_key, raw_value) = item.map_err(storage_err)?;
            if drained.len() < max {
                drained.push(decode(&raw_value)?);
                batch.delete_cf(cf, raw_key);
            } else {
                remaining += 1;
            }
        }
        self.write(batch)?;
        Ok((remaining, drained))
    }

    fn commit_reconciliation(
        &self,
        key: &InternalKey,
        applied: Diff,
        rejected: Vec<Diff>,
        new_baseline: Option<Document>,
    ) -> Result<DiffId> {
        let mut counters = self.counters.lock();
        let has_conflicts = rejected.iter().any(|patch| !patch.is_empty());
        let mut batch = WriteBatch::default();
        let id = self.stage_record_diffs(&mut counters, &mut batch, key, applied, rejected)?;
        if let Some(doc) = new_baseline {
            self.stage_put_baseline(&mut batch, key, &doc)?;
        }
        if has_conflicts {
            self.stage_notification(&mut counters, &mut batch, key, id)?;
        }
        self.write(batch)?;
        Ok(id)
    }

    fn commit_resolution(&self, id: DiffId, applied: Diff, new_baseline: &Document) -> Result<()> {
        let _guard = self.counters.lock();
        let mut record = self
            .get_diff(id)?
            .ok_or_else(|| ReconcileError::NotFound(format!("diff {id}")))?;
        record.applied = applied;
        record.rejected = Vec::new();
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DIFFS)?, id.0.to_be_bytes(), encode(&record)?);
        self.stage_put_baseline(&mut batch, &record.key, new_baseline)?;
        self.write(batch)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|err| ReconcileError::Internal(format!("encode failed: {err}")))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|err| ReconcileError::Internal(format!("decode failed: {err}")))
}

fn storage_err(err: rocksdb::Error) -> ReconcileError {
    ReconcileError::Unavailable(format!("storage: {err}"))
}

fn key_prefix(key: &InternalKey) -> Result<Vec<u8>> {
    encode(&(&key.entity, key.id))
}

fn source_key(key: &InternalKey, source: &str) -> Result<Vec<u8>> {
    encode(&(&key.entity, key.id, source))
}

fn triple_key(entity: &str, source: &str, fk: &ForeignKey) -> Result<Vec<u8>> {
    encode(&(entity, source, &fk.0))
}
