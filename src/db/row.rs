//! Rows: one key viewed across a set of columns.

use std::sync::Arc;

use rocksdb::ReadOptions;

use crate::error::Result;
use crate::pool::{self, Latch};

use super::access::ColumnRef;
use super::cell::Cell;

/// Fixed-size vector of cells spanning a set of columns for one key.
pub struct Row<'a> {
    columns: &'a [ColumnRef],
    cells: Vec<Cell<'a>>,
}

impl<'a> Row<'a> {
    pub fn new(columns: &'a [ColumnRef]) -> Result<Self> {
        let mut cells = Vec::with_capacity(columns.len());
        for column in columns {
            cells.push(Cell::new(column)?);
        }
        Ok(Row { columns, cells })
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cell(&self, index: usize) -> &Cell<'a> {
        &self.cells[index]
    }

    pub fn cells(&self) -> &[Cell<'a>] {
        &self.cells
    }

    /// A row is valid when any of its cells is.
    pub fn valid(&self) -> bool {
        self.cells.iter().any(|cell| cell.valid())
    }

    /// Seek every cell to `key`.
    ///
    /// Cells whose key is not block-cache-resident get their read warmed
    /// in parallel on the request pool first (the resident ones skip the
    /// second cache lookup); the seeks themselves then run against warm
    /// caches. Returns how many cells became exactly valid.
    pub fn seek(&mut self, key: &[u8]) -> Result<usize> {
        let mut cold = Vec::new();
        for column in self.columns {
            if !column.cached(key)? {
                cold.push(column.clone());
            }
        }

        if !cold.is_empty() {
            let latch = Arc::new(Latch::new(cold.len()));
            for column in cold {
                let latch = Arc::clone(&latch);
                let db = Arc::clone(column.db());
                let name = column.name().to_owned();
                let key = key.to_vec();
                pool::post_with_cancel(
                    db.request_tag(),
                    {
                        let latch = Arc::clone(&latch);
                        move || {
                            if let Ok(cf) = db.cf(&name) {
                                let mut ropts = ReadOptions::default();
                                ropts.fill_cache(true);
                                let _ = db.db().get_pinned_cf_opt(&cf, &key, &ropts);
                            }
                            latch.count_down();
                        }
                    },
                    move || latch.count_down(),
                );
            }
            latch.wait();
        }

        if let Some(column) = self.columns.first() {
            column.db().stats().record_row_seek();
        }

        let mut valid = 0;
        for cell in &mut self.cells {
            if cell.seek(key).eq(&super::cell::Validity::Equal) {
                valid += 1;
            }
        }
        Ok(valid)
    }
}
