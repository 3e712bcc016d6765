//! # Data Model
//!
//! Identifier newtypes and the small records that flow between the server,
//! the dispatcher, and the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// The reconciler's identifier for one logical record.
///
/// Carries the entity name alongside the numeric id so a key minted for one
/// entity can never be resolved against another entity's index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InternalKey {
    /// The entity this key belongs to.
    pub entity: String,
    /// Store-allocated id, unique per entity, never reused.
    pub id: u64,
}

impl InternalKey {
    pub fn new(entity: impl Into<String>, id: u64) -> Self {
        Self {
            entity: entity.into(),
            id,
        }
    }
}

impl fmt::Display for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// An external source's identifier for its copy of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForeignKey(pub String);

impl ForeignKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ForeignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one persisted diff record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiffId(pub u64);

impl fmt::Display for DiffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}", self.0)
    }
}

/// Index of a rejected operation within its diff record, in recorded order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u32);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "O{}", self.0)
    }
}

/// Inbound change notification from a source or an upstream producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub entity: String,
    pub source: String,
    pub foreign_id: String,
}

impl ChangeNotification {
    pub fn new(
        entity: impl Into<String>,
        source: impl Into<String>,
        foreign_id: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            source: source.into(),
            foreign_id: foreign_id.into(),
        }
    }
}

/// Conflict notification appended whenever a diff record with rejected
/// operations is persisted. Drained by operators in batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub key: InternalKey,
    pub diff: DiffId,
    /// Unix epoch seconds at record time.
    pub created_at: i64,
}

impl Notification {
    pub fn now(key: InternalKey, diff: DiffId) -> Self {
        Self {
            key,
            diff,
            created_at: unix_now(),
        }
    }
}

/// One pending reconciliation request, consumed exactly once by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub entity: String,
    pub source: String,
    pub foreign_key: ForeignKey,
}

impl From<ChangeNotification> for WorkItem {
    fn from(change: ChangeNotification) -> Self {
        Self {
            entity: change.entity,
            source: change.source,
            foreign_key: ForeignKey(change.foreign_id),
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.entity, self.source, self.foreign_key)
    }
}

/// Current time as unix epoch seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_key_display() {
        let key = InternalKey::new("customer", 42);
        assert_eq!(key.to_string(), "customer#42");
    }

    #[test]
    fn test_keys_distinguish_entities() {
        let a = InternalKey::new("customer", 1);
        let b = InternalKey::new("order", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_work_item_from_notification() {
        let change = ChangeNotification::new("customer", "acct", "A1");
        let item = WorkItem::from(change);
        assert_eq!(item.entity, "customer");
        assert_eq!(item.source, "acct");
        assert_eq!(item.foreign_key, ForeignKey::new("A1"));
    }
}
