//! Scripted in-memory source driver and small fixtures shared by unit and
//! integration tests.

use crate::document::{Document, FieldPath};
use crate::driver::{DriverError, SourceDriver};
use crate::model::ForeignKey;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Build a document from dotted-path pairs.
pub fn doc(pairs: &[(&str, &str)]) -> Document {
    Document::from_fields(
        pairs
            .iter()
            .map(|(p, v)| (FieldPath::parse(p).unwrap(), v.to_string())),
    )
}

#[derive(Default)]
struct MemoryDriverState {
    records: HashMap<ForeignKey, Document>,
    next_id: u64,
    /// Scripted failures consumed by the next `get` calls.
    get_failures: VecDeque<DriverError>,
    /// Scripted failures consumed by the next `set` calls.
    set_failures: VecDeque<DriverError>,
    set_calls: Vec<(Option<ForeignKey>, Document)>,
}

/// In-memory source driver with scripted failures and a call log.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryDriverState>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record.
    pub fn put(&self, fk: &str, document: Document) {
        self.state
            .lock()
            .records
            .insert(ForeignKey::new(fk), document);
    }

    pub fn remove(&self, fk: &str) {
        self.state.lock().records.remove(&ForeignKey::new(fk));
    }

    pub fn document(&self, fk: &str) -> Option<Document> {
        self.state.lock().records.get(&ForeignKey::new(fk)).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Queue a failure for an upcoming `get` call.
    pub fn fail_next_get(&self, err: DriverError) {
        self.state.lock().get_failures.push_back(err);
    }

    /// Queue a failure for an upcoming `set` call.
    pub fn fail_next_set(&self, err: DriverError) {
        self.state.lock().set_failures.push_back(err);
    }

    /// Every `set` call observed so far, in order.
    pub fn set_calls(&self) -> Vec<(Option<ForeignKey>, Document)> {
        self.state.lock().set_calls.clone()
    }
}

#[async_trait]
impl SourceDriver for MemoryDriver {
    async fn get(&self, fk: &ForeignKey) -> Result<Document, DriverError> {
        let mut state = self.state.lock();
        if let Some(err) = state.get_failures.pop_front() {
            return Err(err);
        }
        state.records.get(fk).cloned().ok_or(DriverError::NotFound)
    }

    async fn set(
        &self,
        doc: &Document,
        fk: Option<&ForeignKey>,
    ) -> Result<ForeignKey, DriverError> {
        let mut state = self.state.lock();
        state.set_calls.push((fk.cloned(), doc.clone()));
        if let Some(err) = state.set_failures.pop_front() {
            return Err(err);
        }
        let fk = match fk {
            Some(fk) => fk.clone(),
            None => {
                state.next_id += 1;
                ForeignKey::new(format!("G{}", state.next_id))
            }
        };
        state.records.insert(fk.clone(), doc.clone());
        Ok(fk)
    }

    async fn delete(&self, fk: &ForeignKey) -> Result<(), DriverError> {
        self.state.lock().records.remove(fk);
        Ok(())
    }
}
