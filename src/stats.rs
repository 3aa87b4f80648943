//! Statistics mirror.
//!
//! The library keeps its own tickers but only exports them as a text dump,
//! and its per-cache plumbing is unreliable; the engine mirrors the
//! interesting counters locally and folds the dump in on demand.

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use regex::Regex;

static TICKER_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(rocksdb\.[a-z0-9._-]+) COUNT : (\d+)").unwrap());

#[derive(Debug, Default)]
pub struct DbStats {
    // folded from the library dump
    block_cache_hit: AtomicU64,
    block_cache_miss: AtomicU64,
    block_cache_add: AtomicU64,
    block_cache_add_failures: AtomicU64,
    block_cache_bytes_write: AtomicU64,
    // engine-side counters
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_inserts: AtomicU64,
    cache_insert_failures: AtomicU64,
    cache_insert_bytes: AtomicU64,
    prefetches: AtomicU64,
    row_seeks: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub block_cache_hit: u64,
    pub block_cache_miss: u64,
    pub block_cache_add: u64,
    pub block_cache_add_failures: u64,
    pub block_cache_bytes_write: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_inserts: u64,
    pub cache_insert_failures: u64,
    pub cache_insert_bytes: u64,
    pub prefetches: u64,
    pub row_seeks: u64,
}

impl DbStats {
    pub fn new() -> Self {
        DbStats::default()
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_insert(&self, charge: u64) {
        self.cache_inserts.fetch_add(1, Ordering::Relaxed);
        self.cache_insert_bytes.fetch_add(charge, Ordering::Relaxed);
    }

    pub fn record_cache_insert_failure(&self) {
        self.cache_insert_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch(&self) {
        self.prefetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_row_seek(&self) {
        self.row_seeks.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a library statistics dump into the mirror. Library values are
    /// cumulative, so the latest dump simply replaces the mirror.
    pub fn fold_dump(&self, dump: &str) {
        for line in dump.lines() {
            let caps = match TICKER_LINE.captures(line.trim()) {
                Some(caps) => caps,
                None => continue,
            };
            let value: u64 = match caps[2].parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            let slot = match &caps[1] {
                "rocksdb.block.cache.hit" => &self.block_cache_hit,
                "rocksdb.block.cache.miss" => &self.block_cache_miss,
                "rocksdb.block.cache.add" => &self.block_cache_add,
                "rocksdb.block.cache.add.failures" => &self.block_cache_add_failures,
                "rocksdb.block.cache.bytes.write" => &self.block_cache_bytes_write,
                _ => continue,
            };
            slot.store(value, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            block_cache_hit: self.block_cache_hit.load(Ordering::Relaxed),
            block_cache_miss: self.block_cache_miss.load(Ordering::Relaxed),
            block_cache_add: self.block_cache_add.load(Ordering::Relaxed),
            block_cache_add_failures: self.block_cache_add_failures.load(Ordering::Relaxed),
            block_cache_bytes_write: self.block_cache_bytes_write.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_inserts: self.cache_inserts.load(Ordering::Relaxed),
            cache_insert_failures: self.cache_insert_failures.load(Ordering::Relaxed),
            cache_insert_bytes: self.cache_insert_bytes.load(Ordering::Relaxed),
            prefetches: self.prefetches.load(Ordering::Relaxed),
            row_seeks: self.row_seeks.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_ticker_lines() {
        let stats = DbStats::new();
        let dump = "\
rocksdb.block.cache.miss COUNT : 12
rocksdb.block.cache.hit COUNT : 34
rocksdb.block.cache.add COUNT : 5
rocksdb.block.cache.add.failures COUNT : 1
rocksdb.block.cache.bytes.write COUNT : 4096
rocksdb.something.else COUNT : 99
not a ticker line";
        stats.fold_dump(dump);

        let snap = stats.snapshot();
        assert_eq!(snap.block_cache_miss, 12);
        assert_eq!(snap.block_cache_hit, 34);
        assert_eq!(snap.block_cache_add, 5);
        assert_eq!(snap.block_cache_add_failures, 1);
        assert_eq!(snap.block_cache_bytes_write, 4096);
    }

    #[test]
    fn engine_counters_accumulate() {
        let stats = DbStats::new();
        stats.record_cache_hit();
        stats.record_cache_miss();
        stats.record_cache_miss();
        stats.record_cache_insert(100);
        stats.record_cache_insert(28);
        stats.record_cache_insert_failure();

        let snap = stats.snapshot();
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 2);
        assert_eq!(snap.cache_inserts, 2);
        assert_eq!(snap.cache_insert_bytes, 128);
        assert_eq!(snap.cache_insert_failures, 1);
    }
}
