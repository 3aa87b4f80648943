//! Read-consistent views pinned to a sequence number.

use rocksdb::SnapshotWithThreadMode;

use crate::error::Result;

use super::database::{Database, Db};

/// A pinned view of the database.
///
/// Borrowing from the database ties the snapshot's lifetime to it; the
/// pin is released when the snapshot drops, and no snapshot can outlive
/// its database.
pub struct Snapshot<'db> {
    db: &'db Database,
    inner: SnapshotWithThreadMode<'db, Db>,
    sequence: u64,
}

impl<'db> Snapshot<'db> {
    pub(crate) fn new(db: &'db Database) -> Self {
        let sequence = db.sequence();
        Snapshot { db, inner: db.db().snapshot(), sequence }
    }

    /// The sequence number this view is anchored to.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Point lookup through the pinned view.
    pub fn get(&self, column: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.db.cf(column)?;
        Ok(self.inner.get_cf(&cf, key)?)
    }

    pub fn contains(&self, column: &str, key: &[u8]) -> Result<bool> {
        Ok(self.get(column, key)?.is_some())
    }
}
