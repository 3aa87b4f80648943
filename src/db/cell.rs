//! Cells: stateful single-key cursors.

use std::sync::Arc;

use crate::error::Result;

use super::access::ColumnRef;
use super::column::{self, Column};
use super::iter::ColumnIterator;

/// How a cell's cursor relates to the key it was pointed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Not positioned.
    Invalid,
    /// Positioned exactly on the key.
    Equal,
    /// Positioned on the nearest key greater than the one sought.
    Gt,
    /// Positioned on the nearest key at or below the one sought.
    Lte,
}

/// A cursor over `(column, key)` owning its iterator.
pub struct Cell<'a> {
    column: Arc<Column>,
    iter: ColumnIterator<'a>,
    sought: Vec<u8>,
    validity: Validity,
}

impl<'a> Cell<'a> {
    pub fn new(column: &'a ColumnRef) -> Result<Self> {
        Ok(Cell {
            column: column.column().clone(),
            iter: column.raw_iter()?,
            sought: Vec::new(),
            validity: Validity::Invalid,
        })
    }

    pub fn column(&self) -> &Arc<Column> {
        &self.column
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    pub fn valid(&self) -> bool {
        self.validity != Validity::Invalid
    }

    /// Positioned exactly on the sought key.
    pub fn valid_eq(&self) -> bool {
        self.validity == Validity::Equal
    }

    /// Position at the first key `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> Validity {
        self.sought = key.to_vec();
        self.iter.seek(key);
        self.revalidate();
        self.validity
    }

    /// Position at the last key `<= key`.
    pub fn seek_prev(&mut self, key: &[u8]) -> Validity {
        self.sought = key.to_vec();
        self.iter.seek_for_prev(key);
        self.revalidate();
        self.validity
    }

    /// Step to the next key; validity becomes relative to the new
    /// position.
    pub fn next(&mut self) {
        self.iter.step();
        self.revalidate();
    }

    pub fn prev(&mut self) {
        self.iter.step_back();
        self.revalidate();
    }

    fn revalidate(&mut self) {
        // classify under the column's own comparator, not raw byte order
        let key_type = self.column.descriptor().key_type;
        self.validity = match self.iter.key() {
            None => Validity::Invalid,
            Some(found) => match column::key_cmp(key_type, found, &self.sought) {
                std::cmp::Ordering::Equal => Validity::Equal,
                std::cmp::Ordering::Greater => Validity::Gt,
                std::cmp::Ordering::Less => Validity::Lte,
            },
        };
    }

    pub fn key(&self) -> Option<&[u8]> {
        if self.valid() {
            self.iter.key()
        } else {
            None
        }
    }

    /// The value at the cursor, as of the read.
    pub fn value(&self) -> Option<&[u8]> {
        if self.valid() {
            self.iter.value()
        } else {
            None
        }
    }
}
