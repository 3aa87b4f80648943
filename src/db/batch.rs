//! Writebatches: ordered delta sequences with nested savepoints.
//!
//! A batch is engine state until commit; the mapping onto the library's
//! batch happens in one pass under the database write mutex. That keeps
//! savepoints cheap (an index stack) and lets `has`/`for_each` work
//! without replaying library internals.

use std::ops::{Deref, DerefMut};

use bitflags::bitflags;

bitflags! {
    /// Options applied to a whole commit.
    pub struct WriteFlags: u8 {
        /// fsync the journal before returning.
        const FSYNC = 0b0001;
        /// Skip the journal entirely.
        const NO_JOURNAL = 0b0010;
        /// Deltas naming unknown columns are dropped instead of failing
        /// the commit.
        const MISSING_COLUMNS = 0b0100;
    }
}

impl Default for WriteFlags {
    fn default() -> Self {
        WriteFlags::empty()
    }
}

/// Build the library-side write options for a commit.
pub(crate) fn make_opts(flags: WriteFlags) -> rocksdb::WriteOptions {
    let mut opts = rocksdb::WriteOptions::default();
    opts.set_sync(flags.contains(WriteFlags::FSYNC));
    opts.disable_wal(flags.contains(WriteFlags::NO_JOURNAL));
    opts
}

/// Delta kinds. A read is never a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Set,
    Merge,
    Delete,
    DeleteRange,
    SingleDelete,
}

/// One `(op, column, key, value?)` entry.
#[derive(Debug, Clone)]
pub struct Delta {
    pub op: Op,
    pub column: String,
    pub key: Vec<u8>,
    /// SET/MERGE payload; the end key for DELETE_RANGE.
    pub value: Option<Vec<u8>>,
}

/// Ordered, atomic delta sequence.
#[derive(Default)]
pub struct Batch {
    deltas: Vec<Delta>,
    savepoints: Vec<usize>,
}

impl Batch {
    pub fn new() -> Self {
        Batch::default()
    }

    pub fn set(&mut self, column: &str, key: &[u8], value: &[u8]) -> &mut Self {
        self.push(Op::Set, column, key, Some(value.to_vec()))
    }

    pub fn merge(&mut self, column: &str, key: &[u8], value: &[u8]) -> &mut Self {
        self.push(Op::Merge, column, key, Some(value.to_vec()))
    }

    pub fn delete(&mut self, column: &str, key: &[u8]) -> &mut Self {
        self.push(Op::Delete, column, key, None)
    }

    pub fn delete_range(&mut self, column: &str, begin: &[u8], end: &[u8]) -> &mut Self {
        self.push(Op::DeleteRange, column, begin, Some(end.to_vec()))
    }

    pub fn single_delete(&mut self, column: &str, key: &[u8]) -> &mut Self {
        self.push(Op::SingleDelete, column, key, None)
    }

    fn push(&mut self, op: Op, column: &str, key: &[u8], value: Option<Vec<u8>>) -> &mut Self {
        self.deltas.push(Delta { op, column: column.to_owned(), key: key.to_vec(), value });
        self
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn clear(&mut self) {
        self.deltas.clear();
        self.savepoints.clear();
    }

    /// Whether any delta of the given kind is present.
    pub fn has(&self, op: Op) -> bool {
        self.deltas.iter().any(|delta| delta.op == op)
    }

    /// Replay the batch through a visitor, in insertion order.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Delta),
    {
        for delta in &self.deltas {
            visitor(delta);
        }
    }

    pub(crate) fn deltas(&self) -> &[Delta] {
        &self.deltas
    }

    /// Open a savepoint scope. Dropping the guard during a panic rolls
    /// the batch back to this point; a normal drop just pops the
    /// savepoint.
    pub fn checkpoint(&mut self) -> BatchCheckpoint<'_> {
        self.savepoints.push(self.deltas.len());
        BatchCheckpoint { batch: self }
    }

    fn pop_savepoint(&mut self) {
        self.savepoints.pop();
    }

    fn rollback_to_savepoint(&mut self) {
        if let Some(mark) = self.savepoints.pop() {
            self.deltas.truncate(mark);
        }
    }
}

/// Scope guard for one savepoint; nestable through `DerefMut`.
pub struct BatchCheckpoint<'a> {
    batch: &'a mut Batch,
}

impl Deref for BatchCheckpoint<'_> {
    type Target = Batch;

    fn deref(&self) -> &Batch {
        self.batch
    }
}

impl DerefMut for BatchCheckpoint<'_> {
    fn deref_mut(&mut self) -> &mut Batch {
        self.batch
    }
}

impl Drop for BatchCheckpoint<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.batch.rollback_to_savepoint();
        } else {
            self.batch.pop_savepoint();
        }
    }
}
