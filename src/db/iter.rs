//! Ordered iteration over one column.

use rocksdb::{DBRawIteratorWithThreadMode, ReadOptions};

use crate::error::Result;

use super::database::{Database, Db};

/// Cursor over a column's keyspace.
///
/// Stepping past either end leaves the cursor invalid; stepping an
/// invalid cursor wraps to the front (forward) or back (reverse). Any
/// two invalid cursors compare equal.
pub struct ColumnIterator<'a> {
    raw: DBRawIteratorWithThreadMode<'a, Db>,
}

impl<'a> ColumnIterator<'a> {
    pub(crate) fn new(db: &'a Database, column: &str) -> Result<Self> {
        let cf = db.cf(column)?;
        let mut ropts = ReadOptions::default();
        ropts.set_total_order_seek(true);
        Ok(ColumnIterator { raw: db.db().raw_iterator_cf_opt(&cf, ropts) })
    }

    pub fn valid(&self) -> bool {
        self.raw.valid()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.raw.key()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.raw.value()
    }

    pub fn pair(&self) -> Option<(&[u8], &[u8])> {
        match (self.raw.key(), self.raw.value()) {
            (Some(k), Some(v)) => Some((k, v)),
            _ => None,
        }
    }

    /// Position on the first key `>= key`.
    pub fn seek(&mut self, key: &[u8]) {
        self.raw.seek(key);
    }

    /// Position on the last key `<= key`.
    pub fn seek_for_prev(&mut self, key: &[u8]) {
        self.raw.seek_for_prev(key);
    }

    pub fn seek_to_first(&mut self) {
        self.raw.seek_to_first();
    }

    pub fn seek_to_last(&mut self) {
        self.raw.seek_to_last();
    }

    /// Advance; an invalid cursor wraps to the front.
    pub fn step(&mut self) {
        if self.raw.valid() {
            self.raw.next();
        } else {
            self.raw.seek_to_first();
        }
    }

    /// Reverse; an invalid cursor wraps to the back.
    pub fn step_back(&mut self) {
        if self.raw.valid() {
            self.raw.prev();
        } else {
            self.raw.seek_to_last();
        }
    }

    /// Force the invalid state.
    pub(crate) fn invalidate(&mut self) {
        self.raw.seek_to_last();
        if self.raw.valid() {
            self.raw.next();
        }
    }

    /// Cursor equality: same position, or both invalid.
    pub fn same(&self, other: &ColumnIterator) -> bool {
        match (self.key(), other.key()) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// Forward consumption for `for` loops; stops at the end instead of
/// wrapping.
impl Iterator for ColumnIterator<'_> {
    type Item = (Box<[u8]>, Box<[u8]>);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self
            .pair()
            .map(|(k, v)| (k.to_vec().into_boxed_slice(), v.to_vec().into_boxed_slice()))?;
        self.raw.next();
        Some(item)
    }
}
