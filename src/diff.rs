//! # Diff Algebra
//!
//! Patch computation, application, and merging over documents. A diff is a
//! labelled, ordered sequence of per-path operations; applying the diff
//! produced by [`diff`] to its first argument yields the second.

use crate::document::{Document, FieldPath};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Provenance label carried by a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// Patch computed from a source fetch.
    Source(String),
    /// Patch synthesized for a source that no longer holds the record.
    Deleted(String),
    /// Union of non-conflicting operations across sources.
    Merged,
    /// Operator-chosen operations from a conflict resolution.
    Resolved,
}

impl Provenance {
    /// The source name this label refers to, if any.
    pub fn source_name(&self) -> Option<&str> {
        match self {
            Provenance::Source(name) | Provenance::Deleted(name) => Some(name),
            Provenance::Merged | Provenance::Resolved => None,
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Source(name) => write!(f, "{name}"),
            Provenance::Deleted(name) => write!(f, "{name} (deleted)"),
            Provenance::Merged => write!(f, "merged"),
            Provenance::Resolved => write!(f, "resolved"),
        }
    }
}

/// The change an operation makes at its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Insert { value: String },
    Delete,
    Replace { old: String, new: String },
}

/// A single per-path operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    pub path: FieldPath,
    pub kind: OpKind,
    /// Source tag preserved on uncontested operations of a merged diff.
    pub source: Option<String>,
}

impl Op {
    pub fn insert(path: FieldPath, value: impl Into<String>) -> Self {
        Self {
            path,
            kind: OpKind::Insert {
                value: value.into(),
            },
            source: None,
        }
    }

    pub fn delete(path: FieldPath) -> Self {
        Self {
            path,
            kind: OpKind::Delete,
            source: None,
        }
    }

    pub fn replace(path: FieldPath, old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            path,
            kind: OpKind::Replace {
                old: old.into(),
                new: new.into(),
            },
            source: None,
        }
    }

    pub fn tagged(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// The value this operation leaves at its path; `None` means absent.
    pub fn final_value(&self) -> Option<&str> {
        match &self.kind {
            OpKind::Insert { value } => Some(value),
            OpKind::Replace { new, .. } => Some(new),
            OpKind::Delete => None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OpKind::Insert { value } => write!(f, "+{}={}", self.path, value),
            OpKind::Delete => write!(f, "-{}", self.path),
            OpKind::Replace { old, new } => write!(f, "~{}={}->{}", self.path, old, new),
        }
    }
}

/// A labelled, ordered sequence of operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub label: Provenance,
    pub ops: Vec<Op>,
}

impl Diff {
    /// The zero-length diff.
    pub fn empty(label: Provenance) -> Self {
        Self {
            label,
            ops: Vec::new(),
        }
    }

    pub fn new(label: Provenance, ops: Vec<Op>) -> Self {
        Self { label, ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Error raised when a patch does not match the document it is applied to.
/// Identifies the first failing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffMismatch {
    pub index: usize,
    pub op: Op,
    pub reason: String,
}

impl fmt::Display for DiffMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op {} ({}): {}", self.index, self.op, self.reason)
    }
}

impl std::error::Error for DiffMismatch {}

/// Compute the patch turning `a` into `b`.
///
/// Exactly one operation is emitted per path whose value differs between the
/// two documents, ordered lexicographically by path so that equal diffs
/// compare and persist identically.
pub fn diff(a: &Document, b: &Document, label: Provenance) -> Diff {
    let mut ops = Vec::new();
    let mut b_fields: BTreeMap<&FieldPath, &str> = b.iter().collect();
    for (path, old) in a.iter() {
        match b_fields.remove(path) {
            Some(new) if new == old => {}
            Some(new) => ops.push(Op::replace(path.clone(), old, new)),
            None => ops.push(Op::delete(path.clone())),
        }
    }
    for (path, value) in b_fields {
        ops.push(Op::insert(path.clone(), value));
    }
    ops.sort_by(|x, y| x.path.cmp(&y.path));
    Diff::new(label, ops)
}

/// Apply a patch to a document, yielding a new document.
///
/// Total when every `Delete` and `Replace` matches the document; otherwise
/// fails with [`DiffMismatch`] for the first failing operation. `Insert`
/// always sets its value.
pub fn apply(patch: &Diff, doc: &Document) -> Result<Document, DiffMismatch> {
    let mut out = doc.clone();
    for (index, op) in patch.ops.iter().enumerate() {
        match &op.kind {
            OpKind::Insert { value } => {
                out.set(op.path.clone(), value.clone());
            }
            OpKind::Delete => {
                if out.remove(&op.path).is_none() {
                    return Err(DiffMismatch {
                        index,
                        op: op.clone(),
                        reason: "path not present".to_string(),
                    });
                }
            }
            OpKind::Replace { old, new } => match out.get(&op.path) {
                Some(current) if current == old => {
                    out.set(op.path.clone(), new.clone());
                }
                Some(current) => {
                    return Err(DiffMismatch {
                        index,
                        op: op.clone(),
                        reason: format!("expected {old:?}, found {current:?}"),
                    });
                }
                None => {
                    return Err(DiffMismatch {
                        index,
                        op: op.clone(),
                        reason: "path not present".to_string(),
                    });
                }
            },
        }
    }
    Ok(out)
}

/// Apply final values without old-value matching.
///
/// Used by conflict resolution, where operator-chosen operations land on top
/// of a baseline that may have moved since the conflict was recorded.
pub fn apply_forced(patch: &Diff, doc: &Document) -> Document {
    let mut out = doc.clone();
    for op in &patch.ops {
        match op.final_value() {
            Some(value) => out.set(op.path.clone(), value.to_string()),
            None => {
                out.remove(&op.path);
            }
        }
    }
    out
}

/// The partition a merge produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Union of non-conflicting operations, one per path.
    pub applied: Diff,
    /// Per-source diffs of the operations that could not be merged.
    pub rejected: Vec<Diff>,
}

impl MergeOutcome {
    pub fn rejected_op_count(&self) -> usize {
        self.rejected.iter().map(Diff::len).sum()
    }
}

/// Strategy deciding how same-path operations across patches combine.
pub trait MergeStrategy: Send + Sync {
    fn merge(&self, baseline: &Document, patches: &[Diff]) -> MergeOutcome;
}

/// The conservative default: if any two patches leave differing final values
/// at a path, every operation touching that path in every patch is rejected.
/// Operations whose final value equals the baseline are vacuous and never
/// conflict.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectOnDisagreement;

impl MergeStrategy for RejectOnDisagreement {
    fn merge(&self, baseline: &Document, patches: &[Diff]) -> MergeOutcome {
        // Group every op by path, remembering which patch it came from.
        let mut by_path: BTreeMap<&FieldPath, Vec<(usize, &Op)>> = BTreeMap::new();
        for (patch_index, patch) in patches.iter().enumerate() {
            for op in &patch.ops {
                by_path.entry(&op.path).or_default().push((patch_index, op));
            }
        }

        let mut applied = Vec::new();
        let mut rejected_paths: Vec<&FieldPath> = Vec::new();
        for (path, touches) in &by_path {
            let current = baseline.get(path);
            let effective: Vec<&(usize, &Op)> = touches
                .iter()
                .filter(|(_, op)| op.final_value() != current)
                .collect();
            let mut finals: Vec<Option<&str>> =
                effective.iter().map(|(_, op)| op.final_value()).collect();
            finals.sort();
            finals.dedup();

            match finals.len() {
                0 => {} // every touch is vacuous
                1 => {
                    let contested = touches.len() > 1;
                    if contested {
                        // Agreeing touches from several patches collapse to one
                        // synthesized op without a source tag.
                        let op = synthesize_op(path, current, finals[0]);
                        applied.push(op);
                    } else {
                        let (patch_index, op) = *effective[0];
                        let mut op = op.clone();
                        op.source = patches[patch_index]
                            .label
                            .source_name()
                            .map(str::to_string);
                        applied.push(op);
                    }
                }
                _ => rejected_paths.push(path),
            }
        }

        let rejected = patches
            .iter()
            .map(|patch| {
                let ops = patch
                    .ops
                    .iter()
                    .filter(|op| rejected_paths.contains(&&op.path))
                    .cloned()
                    .collect::<Vec<_>>();
                Diff::new(patch.label.clone(), ops)
            })
            .filter(|patch| !patch.is_empty())
            .collect();

        applied.sort_by(|x, y| x.path.cmp(&y.path));
        MergeOutcome {
            applied: Diff::new(Provenance::Merged, applied),
            rejected,
        }
    }
}

fn synthesize_op(path: &FieldPath, current: Option<&str>, wanted: Option<&str>) -> Op {
    match (current, wanted) {
        (None, Some(value)) => Op::insert(path.clone(), value),
        (Some(old), Some(new)) => Op::replace(path.clone(), old, new),
        (Some(_), None) | (None, None) => Op::delete(path.clone()),
    }
}

/// Merge per-source patches against a baseline with the default strategy.
pub fn merge(baseline: &Document, patches: &[Diff]) -> MergeOutcome {
    RejectOnDisagreement.merge(baseline, patches)
}
