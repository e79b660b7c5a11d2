//! Per-document append-only operation log.
//!
//! ```text
//!   ops:      [ op@0 ][ op@1 ][ op@2 ] ... [ op@n-1 ]
//!   version:                                          n
//!   snapshot: replay(ops[0..n]) applied to the empty document
//! ```
//!
//! The version always equals the number of committed operations, and the
//! snapshot is the deterministic replay of the log. The operation list is
//! shared behind an `Arc<RwLock<_>>` so [`LogRange`] readers can iterate a
//! fixed window without holding up later appends.

use crate::error::AppendError;
use crate::operation::{CommitRecord, DocKey, Operation, Snapshot};
use crate::ot::{DocState, OtEngine};
use std::sync::{Arc, PoisonError, RwLock};

pub struct OperationLog {
    key: DocKey,
    state: DocState,
    version: u64,
    ops: Arc<RwLock<Vec<Operation>>>,
}

impl OperationLog {
    pub fn new(key: DocKey) -> Self {
        Self {
            key,
            state: DocState::default(),
            version: 0,
            ops: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn key(&self) -> &DocKey {
        &self.key
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            id: self.key.id.clone(),
            v: self.version,
            doc_type: self.state.doc_type.clone(),
            data: self.state.data.clone(),
        }
    }

    /// Commits `op` if `expected_version` is the current version.
    ///
    /// The operation is applied atomically: on any error neither the
    /// snapshot nor the version changes.
    pub fn append(
        &mut self,
        op: Operation,
        expected_version: u64,
    ) -> Result<CommitRecord, AppendError> {
        if expected_version != self.version {
            return Err(self.conflict(expected_version));
        }
        let mut next = self.state.clone();
        let applied = OtEngine::apply(&mut next, &op.kind)?;
        let committed = Operation {
            v: self.version,
            kind: applied,
            ..op
        };

        self.ops
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(committed.clone());
        self.state = next;
        self.version += 1;

        log::debug!("{} committed v{} from {}", self.key, self.version, committed.src);
        Ok(CommitRecord::new(&self.key, self.version, committed))
    }

    /// Rebases `op` onto the current version and commits it.
    ///
    /// Edits submitted against an older version are transformed against
    /// the operations committed since. Create and delete are never
    /// rebased, and an edit whose every component is cancelled by the
    /// rebase is reported as a conflict so the submitter can resync.
    pub fn submit(&mut self, op: Operation) -> Result<CommitRecord, AppendError> {
        let current = self.version;
        if op.v > current {
            return Err(AppendError::VersionConflict {
                current_version: current,
                missing: Vec::new(),
            });
        }
        if op.v == current {
            return self.append(op, current);
        }
        if !op.is_edit() {
            return Err(self.conflict(op.v));
        }

        let missing: Vec<Operation> = self.read(op.v).collect();
        let rebased = OtEngine::transform(&op, &missing)?;
        if rebased.components().is_empty() && !op.components().is_empty() {
            log::debug!(
                "{}: edit from {} cancelled by concurrent ops since v{}",
                self.key,
                op.src,
                op.v
            );
            return Err(AppendError::VersionConflict {
                current_version: current,
                missing,
            });
        }
        self.append(rebased, current)
    }

    /// Operations from version `from` up to the version current at call time.
    pub fn read(&self, from: u64) -> LogRange {
        LogRange::new(self.ops.clone(), from.min(self.version), self.version)
    }

    fn conflict(&self, from: u64) -> AppendError {
        AppendError::VersionConflict {
            current_version: self.version,
            missing: self.read(from).collect(),
        }
    }
}

/// Lazy, restartable view over `[start, end)` of an operation log.
///
/// The end is fixed at creation; operations appended later are not
/// yielded. Each step takes the read lock only long enough to clone one
/// operation.
#[derive(Clone)]
pub struct LogRange {
    ops: Arc<RwLock<Vec<Operation>>>,
    start: u64,
    next: u64,
    end: u64,
}

impl LogRange {
    fn new(ops: Arc<RwLock<Vec<Operation>>>, start: u64, end: u64) -> Self {
        Self {
            ops,
            start,
            next: start,
            end,
        }
    }

    /// Rewinds to the first operation of the range.
    pub fn restart(&mut self) {
        self.next = self.start;
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl Iterator for LogRange {
    type Item = Operation;

    fn next(&mut self) -> Option<Operation> {
        if self.next >= self.end {
            return None;
        }
        let index = usize::try_from(self.next).ok()?;
        let op = self
            .ops
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned();
        self.next += 1;
        op
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = usize::try_from(self.end.saturating_sub(self.next)).unwrap_or(usize::MAX);
        (left, Some(left))
    }
}

impl std::fmt::Debug for LogRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRange")
            .field("start", &self.start)
            .field("next", &self.next)
            .field("end", &self.end)
            .finish()
    }
}
