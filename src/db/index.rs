//! Prefix-bounded iteration for index columns.
//!
//! Index keys encode `prefix || suffix`. Forward iteration is a plain
//! bounded scan. The underlying engine cannot iterate a prefix range in
//! reverse, so reverse iteration scans forward to the end of the prefix
//! range first and then walks back.

use crate::error::Result;

use super::access::ColumnRef;
use super::iter::ColumnIterator;

/// A column whose keys are `prefix || suffix`.
#[derive(Clone)]
pub struct IndexRef {
    inner: ColumnRef,
}

impl IndexRef {
    pub fn new(column: ColumnRef) -> Self {
        IndexRef { inner: column }
    }

    pub fn column(&self) -> &ColumnRef {
        &self.inner
    }

    /// Forward iteration over all keys sharing `prefix`.
    pub fn iter(&self, prefix: &[u8]) -> Result<PrefixIter<'_>> {
        let mut iter = self.inner.raw_iter()?;
        iter.seek(prefix);
        Ok(PrefixIter { iter, prefix: prefix.to_vec() })
    }

    /// Reverse iteration over all keys sharing `prefix`.
    pub fn iter_rev(&self, prefix: &[u8]) -> Result<RevPrefixIter<'_>> {
        let mut iter = self.inner.raw_iter()?;

        // forward-scan to the first key past the prefix range
        iter.seek(prefix);
        let mut any = false;
        while iter.valid() && starts_with(iter.key(), prefix) {
            any = true;
            iter.step();
        }
        if !any {
            return Ok(RevPrefixIter { iter, prefix: prefix.to_vec(), done: true });
        }

        // walk back onto the last key of the range
        iter.step_back();
        Ok(RevPrefixIter { iter, prefix: prefix.to_vec(), done: false })
    }

    /// Number of keys under `prefix`.
    pub fn count(&self, prefix: &[u8]) -> Result<usize> {
        Ok(self.iter(prefix)?.count())
    }
}

fn starts_with(key: Option<&[u8]>, prefix: &[u8]) -> bool {
    matches!(key, Some(key) if key.starts_with(prefix))
}

pub struct PrefixIter<'a> {
    iter: ColumnIterator<'a>,
    prefix: Vec<u8>,
}

impl Iterator for PrefixIter<'_> {
    type Item = (Box<[u8]>, Box<[u8]>);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.iter.valid() || !starts_with(self.iter.key(), &self.prefix) {
            return None;
        }
        let item = self
            .iter
            .pair()
            .map(|(k, v)| (k.to_vec().into_boxed_slice(), v.to_vec().into_boxed_slice()))?;
        self.iter.step();
        Some(item)
    }
}

pub struct RevPrefixIter<'a> {
    iter: ColumnIterator<'a>,
    prefix: Vec<u8>,
    done: bool,
}

impl Iterator for RevPrefixIter<'_> {
    type Item = (Box<[u8]>, Box<[u8]>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || !self.iter.valid() || !starts_with(self.iter.key(), &self.prefix) {
            self.done = true;
            return None;
        }
        let item = self
            .iter
            .pair()
            .map(|(k, v)| (k.to_vec().into_boxed_slice(), v.to_vec().into_boxed_slice()))?;
        if self.iter.key().map(|k| k == self.prefix.as_slice()).unwrap_or(false) {
            // reached the bare prefix itself; nothing earlier can match
            self.done = true;
        } else {
            self.iter.step_back();
        }
        Some(item)
    }
}
