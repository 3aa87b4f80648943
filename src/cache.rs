//! Caching layer: LRU cache handles with engine-side accounting, and the
//! arena allocator backing cache-adjacent buffers.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use rocksdb::Cache;

use crate::stats::DbStats;

/// An LRU cache from the library plus local accounting.
///
/// Lookup and insert tickers are recorded here because the library's own
/// per-cache statistics plumbing is unreliable. The strict capacity limit
/// is likewise enforced on this side of the boundary.
pub struct CacheHandle {
    name: String,
    inner: Cache,
    capacity: AtomicUsize,
    strict: AtomicBool,
    charged: AtomicU64,
    stats: Arc<DbStats>,
}

impl CacheHandle {
    pub fn new(name: &str, capacity: usize, stats: Arc<DbStats>) -> Self {
        CacheHandle {
            name: name.to_owned(),
            inner: Cache::new_lru_cache(capacity),
            capacity: AtomicUsize::new(capacity),
            strict: AtomicBool::new(false),
            charged: AtomicU64::new(0),
            stats,
        }
    }

    /// The library cache to bind into table/db options.
    pub fn inner(&self) -> &Cache {
        &self.inner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn usage(&self) -> usize {
        self.inner.get_usage()
    }

    pub fn pinned_usage(&self) -> usize {
        self.inner.get_pinned_usage()
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.inner.clone().set_capacity(capacity);
        self.capacity.store(capacity, Ordering::Release);
        debug!("cache '{}': capacity set to {}", self.name, capacity);
    }

    pub fn set_strict_capacity_limit(&self, strict: bool) {
        self.strict.store(strict, Ordering::Release);
    }

    pub fn strict_capacity_limit(&self) -> bool {
        self.strict.load(Ordering::Acquire)
    }

    pub fn record_hit(&self) {
        self.stats.record_cache_hit();
    }

    pub fn record_miss(&self) {
        self.stats.record_cache_miss();
    }

    /// Account an insert of `charge` bytes. Under a strict limit an
    /// insert that would overflow is refused and counted as a failure.
    pub fn record_insert(&self, charge: u64) -> bool {
        let capacity = self.capacity() as u64;
        let mut current = self.charged.load(Ordering::Acquire);
        loop {
            if self.strict_capacity_limit() && current + charge > capacity {
                self.stats.record_cache_insert_failure();
                return false;
            }
            match self.charged.compare_exchange_weak(
                current,
                current + charge,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.stats.record_cache_insert(charge);
        true
    }

    /// Release `charge` bytes of accounting, e.g. on eviction.
    pub fn release(&self, charge: u64) {
        let mut current = self.charged.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(charge);
            match self.charged.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn charged(&self) -> u64 {
        self.charged.load(Ordering::Acquire)
    }
}

const ARENA_CHUNK: usize = 2 * 1024 * 1024;

struct ArenaChunk {
    base: *mut u8,
    len: usize,
    used: usize,
}

unsafe impl Send for ArenaChunk {}

impl ArenaChunk {
    fn map(len: usize, lock: bool) -> Option<ArenaChunk> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        if lock {
            let rc = unsafe { libc::mlock(ptr, len) };
            if rc != 0 {
                warn!("cache arena: mlock failed: {}", std::io::Error::last_os_error());
            }
        }
        Some(ArenaChunk { base: ptr as *mut u8, len, used: 0 })
    }
}

impl Drop for ArenaChunk {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
    }
}

/// Arena-scoped allocator for cache memory.
///
/// Carves bump-allocated slices out of anonymous mappings; memory is
/// returned to the system only when the whole arena goes away, which is
/// why the allocator has to outlive the caches using it. Pages are locked
/// on map when requested and the memlock rlimit permits.
pub struct CacheAllocator {
    chunks: Mutex<Vec<ArenaChunk>>,
    lock_pages: bool,
}

impl CacheAllocator {
    pub fn new(want_mlock: bool) -> Arc<Self> {
        let lock_pages = want_mlock && memlock_unlimited();
        if want_mlock && !lock_pages {
            warn!("cache arena: RLIMIT_MEMLOCK is finite, pages stay unlocked");
        }
        Arc::new(CacheAllocator { chunks: Mutex::new(Vec::new()), lock_pages })
    }

    pub fn locks_pages(&self) -> bool {
        self.lock_pages
    }

    /// Allocate `len` bytes from the arena. Returns the slice as a raw
    /// region valid for the allocator's lifetime.
    pub fn alloc(&self, len: usize) -> Option<*mut u8> {
        if len == 0 || len > ARENA_CHUNK {
            return None;
        }
        let mut chunks = self.chunks.lock().unwrap();
        // align every carve to 16 bytes
        let len = (len + 15) & !15;
        if let Some(chunk) = chunks.last_mut() {
            if chunk.used + len <= chunk.len {
                let ptr = unsafe { chunk.base.add(chunk.used) };
                chunk.used += len;
                return Some(ptr);
            }
        }
        let mut chunk = ArenaChunk::map(ARENA_CHUNK, self.lock_pages)?;
        let ptr = chunk.base;
        chunk.used = len;
        chunks.push(chunk);
        Some(ptr)
    }

    pub fn allocated_chunks(&self) -> usize {
        self.chunks.lock().unwrap().len()
    }
}

fn memlock_unlimited() -> bool {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut limit) };
    rc == 0 && limit.rlim_cur == libc::RLIM_INFINITY
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(capacity: usize) -> CacheHandle {
        CacheHandle::new("test", capacity, Arc::new(DbStats::new()))
    }

    #[test]
    fn strict_limit_bounds_charges() {
        let cache = handle(1000);
        cache.set_strict_capacity_limit(true);

        assert!(cache.record_insert(600));
        assert!(cache.record_insert(400));
        assert!(!cache.record_insert(1));
        assert!(cache.charged() <= 1000);

        cache.release(400);
        assert!(cache.record_insert(300));
    }

    #[test]
    fn loose_limit_admits_everything() {
        let cache = handle(10);
        assert!(cache.record_insert(1_000_000));
    }

    #[test]
    fn capacity_tracks_updates() {
        let cache = handle(4096);
        assert_eq!(cache.capacity(), 4096);
        cache.set_capacity(8192);
        assert_eq!(cache.capacity(), 8192);
    }

    #[test]
    fn arena_carves_and_reuses_chunks() {
        let arena = CacheAllocator::new(false);
        let a = arena.alloc(100).unwrap();
        let b = arena.alloc(100).unwrap();
        assert_ne!(a, b);
        assert_eq!(arena.allocated_chunks(), 1);

        // fill past one chunk
        for _ in 0..((ARENA_CHUNK / 4096) + 1) {
            arena.alloc(4096).unwrap();
        }
        assert!(arena.allocated_chunks() >= 2);
    }

    #[test]
    fn arena_refuses_oversize() {
        let arena = CacheAllocator::new(false);
        assert!(arena.alloc(ARENA_CHUNK + 1).is_none());
        assert!(arena.alloc(0).is_none());
    }
}
