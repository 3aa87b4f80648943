//! Per-column access surface: point reads, presence probes, cache
//! queries, prefetch, single-delta writes.

use std::sync::Arc;

use rocksdb::{ReadOptions, ReadTier};

use crate::error::{DbError, Result};
use crate::pool;
use crate::tools::block_in_place;

use super::batch::{Batch, WriteFlags};
use super::column::Column;
use super::database::Database;
use super::iter::ColumnIterator;

/// Shared handle to one column of an open database.
#[derive(Clone)]
pub struct ColumnRef {
    pub(crate) db: Arc<Database>,
    pub(crate) column: Arc<Column>,
}

impl Database {
    /// Obtain a column handle for the access surface.
    pub fn column_ref(self: &Arc<Self>, name: &str) -> Result<ColumnRef> {
        let column = self.column(name)?.clone();
        Ok(ColumnRef { db: Arc::clone(self), column })
    }
}

impl ColumnRef {
    pub fn name(&self) -> &str {
        self.column.name()
    }

    pub fn column(&self) -> &Arc<Column> {
        &self.column
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Point lookup; the closure sees the value on a hit.
    ///
    /// A missing key is `NotFound`; use [`ColumnRef::get_opt`] for the
    /// non-throwing form.
    pub fn get<F, R>(&self, key: &[u8], closure: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        let cf = self.db.cf(self.name())?;
        let value = block_in_place(|| self.db.db().get_pinned_cf(&cf, key))?;
        match value {
            Some(value) => Ok(closure(&value)),
            None => Err(DbError::NotFound),
        }
    }

    /// Point lookup returning the value, `None` when absent.
    pub fn get_opt(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.db.cf(self.name())?;
        Ok(block_in_place(|| self.db.db().get_cf(&cf, key))?)
    }

    /// Whether the key is present, co-operating with the bloom filter:
    /// a negative filter answer avoids the read entirely.
    pub fn has(&self, key: &[u8]) -> Result<bool> {
        let cf = self.db.cf(self.name())?;
        if !self.db.db().key_may_exist_cf(&cf, key) {
            return Ok(false);
        }
        let value = block_in_place(|| self.db.db().get_pinned_cf(&cf, key))?;
        Ok(value.is_some())
    }

    /// Whether the key's block is resident in the block cache right now.
    ///
    /// Uses a non-blocking read confined to the cache tier with cache
    /// fill disabled, so the probe itself never does I/O or perturbs the
    /// cache.
    pub fn cached(&self, key: &[u8]) -> Result<bool> {
        let cf = self.db.cf(self.name())?;
        let mut ropts = ReadOptions::default();
        ropts.set_read_tier(ReadTier::BlockCache);
        ropts.fill_cache(false);
        let resident = match self.db.db().get_pinned_cf_opt(&cf, key, &ropts) {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(err) => match DbError::from(err) {
                // the block is not in cache and the read refused to go
                // further
                DbError::Incomplete(_) => false,
                other => return Err(other),
            },
        };
        if let Some(cache) = self.column.cache() {
            if resident {
                cache.record_hit();
            } else {
                cache.record_miss();
            }
        }
        Ok(resident)
    }

    /// Warm the cache for a predicted future read. Returns immediately;
    /// the read happens on the shared request pool.
    pub fn prefetch(&self, key: &[u8]) -> Result<()> {
        if self.cached(key)? {
            return Ok(());
        }
        let db = Arc::clone(&self.db);
        let column = self.name().to_owned();
        let key = key.to_vec();
        let charge = key.len() as u64;
        db.stats().record_prefetch();
        pool::post(self.db.request_tag(), move || {
            let cf = match db.cf(&column) {
                Ok(cf) => cf,
                Err(_) => return,
            };
            let mut ropts = ReadOptions::default();
            ropts.fill_cache(true);
            if let Ok(Some(value)) = db.db().get_pinned_cf_opt(&cf, &key, &ropts) {
                if let Ok(col) = db.column(&column) {
                    if let Some(cache) = col.cache() {
                        cache.record_insert(charge + value.len() as u64);
                    }
                }
            }
        });
        Ok(())
    }

    /// Write a SET delta for this key.
    pub async fn write(&self, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        let mut batch = Batch::new();
        batch.set(self.name(), key, value);
        self.db.write(&batch, flags).await
    }

    /// Write a DELETE delta for this key.
    pub async fn del(&self, key: &[u8], flags: WriteFlags) -> Result<()> {
        let mut batch = Batch::new();
        batch.delete(self.name(), key);
        self.db.write(&batch, flags).await
    }

    // ---- iteration ------------------------------------------------------

    /// Iterator positioned on the first key.
    pub fn begin(&self) -> Result<ColumnIterator<'_>> {
        let mut iter = self.raw_iter()?;
        iter.seek_to_first();
        Ok(iter)
    }

    /// The invalid end position.
    pub fn end(&self) -> Result<ColumnIterator<'_>> {
        self.raw_iter()
    }

    /// Iterator positioned on the last key.
    pub fn rbegin(&self) -> Result<ColumnIterator<'_>> {
        let mut iter = self.raw_iter()?;
        iter.seek_to_last();
        Ok(iter)
    }

    pub fn rend(&self) -> Result<ColumnIterator<'_>> {
        self.raw_iter()
    }

    /// Position exactly on `key`, or invalid.
    pub fn find(&self, key: &[u8]) -> Result<ColumnIterator<'_>> {
        let mut iter = self.raw_iter()?;
        iter.seek(key);
        if iter.valid() && iter.key() != Some(key) {
            iter.invalidate();
        }
        Ok(iter)
    }

    /// First key `>= key` (the library's seek contract).
    pub fn lower_bound(&self, key: &[u8]) -> Result<ColumnIterator<'_>> {
        let mut iter = self.raw_iter()?;
        iter.seek(key);
        Ok(iter)
    }

    /// First key `> key`.
    pub fn upper_bound(&self, key: &[u8]) -> Result<ColumnIterator<'_>> {
        let mut iter = self.raw_iter()?;
        iter.seek(key);
        while iter.valid() && iter.key() == Some(key) {
            iter.step();
        }
        Ok(iter)
    }

    pub(crate) fn raw_iter(&self) -> Result<ColumnIterator<'_>> {
        ColumnIterator::new(&self.db, self.name())
    }
}
