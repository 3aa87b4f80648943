//! Environment layer: everything the LSM library would normally take from
//! the host OS, adapted to the engine's runtime.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use crate::config::DbOpts;
use crate::error::Result;
use crate::tools;

pub mod align;
pub mod coop;
pub mod file;
pub mod limiter;
pub mod logger;
pub mod task;
pub mod wal_filter;
pub mod writable;

pub use align::{AlignedBuf, Alignment};
pub use coop::{CoopCondvar, CoopMutex, CoopRwLock};
pub use file::{FileOpts, RandomAccessFile, RandomRwFile, SequentialFile};
pub use limiter::RateLimiter;
pub use logger::Severity;
pub use task::{IoPriority, Priority, RunGate, RunLevel, TaskPool};
pub use wal_filter::{KeepAll, WalFilter, WalRecord, WalVerdict};
pub use writable::{Dir, DirectWritableFile, WritableFile, WritableOpts};

/// Name of the sentinel file marking a base directory as safe for direct
/// I/O.
pub const DIRECT_IO_SENTINEL: &str = "SUPPORTS_DIRECT_IO";

/// Per-database environment: file options, worker pools, limiter, and the
/// library-side env handle.
pub struct Env {
    base: PathBuf,
    file_opts: FileOpts,
    writable_opts: WritableOpts,
    gate: Arc<RunGate>,
    low: TaskPool,
    high: TaskPool,
    bottom: TaskPool,
    limiter: RateLimiter,
    rocks: rocksdb::Env,
}

impl Env {
    pub fn new(base: &Path, opts: &DbOpts) -> Result<Self> {
        let file_opts = detect_file_opts(base);
        if file_opts.direct {
            info!("direct I/O enabled for {:?} (alignment {})", base, file_opts.alignment.0);
        }

        let mut writable_opts = WritableOpts::default();
        writable_opts.use_fallocate = opts.use_fallocate;

        let mut rocks = rocksdb::Env::new()?;
        rocks.set_low_priority_background_threads(opts.background_jobs as i32);
        rocks.set_high_priority_background_threads(2);
        rocks.set_bottom_priority_background_threads(1);

        let gate = RunGate::new();
        let low = TaskPool::new(Priority::Low, 1, gate.clone());
        let high = TaskPool::new(Priority::High, 1, gate.clone());
        let bottom = TaskPool::new(Priority::Bottom, 1, gate.clone());

        Ok(Env {
            base: base.to_owned(),
            file_opts,
            writable_opts,
            gate,
            low,
            high,
            bottom,
            limiter: RateLimiter::new(opts.rate_bytes_per_sec),
            rocks,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn file_opts(&self) -> FileOpts {
        self.file_opts
    }

    pub fn writable_opts(&self) -> WritableOpts {
        self.writable_opts
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn rocks(&self) -> &rocksdb::Env {
        &self.rocks
    }

    /// Let background work begin.
    pub fn start(&self) {
        self.gate.raise(RunLevel::Run);
    }

    pub fn pool(&self, prio: Priority) -> &TaskPool {
        match prio {
            Priority::Low => &self.low,
            Priority::High => &self.high,
            Priority::Bottom => &self.bottom,
        }
    }

    pub fn schedule<F>(&self, prio: Priority, tag: u64, run: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool(prio).schedule(tag, run);
    }

    pub fn unschedule(&self, prio: Priority, tag: u64) -> usize {
        self.pool(prio).unschedule(tag)
    }

    pub fn queue_len(&self, prio: Priority) -> usize {
        self.pool(prio).queue_len()
    }

    /// Cooperative sleep used by the library between retries.
    pub async fn sleep_for_micros(&self, micros: u64) {
        tokio::time::sleep(std::time::Duration::from_micros(micros)).await;
    }

    pub fn open_sequential(&self, path: &Path) -> Result<SequentialFile> {
        SequentialFile::open(path, self.file_opts)
    }

    pub fn open_random(&self, path: &Path) -> Result<RandomAccessFile> {
        RandomAccessFile::open(path, self.file_opts)
    }

    pub fn create_writable(&self, path: &Path) -> Result<WritableFile> {
        WritableFile::create(path, self.writable_opts)
    }

    /// Drain and stop every pool. Idempotent; close calls this before the
    /// library handle goes away.
    pub fn shutdown(&self) {
        self.gate.raise(RunLevel::Quit);
        self.low.join();
        self.high.join();
        self.bottom.join();
        debug!("environment for {:?} shut down", self.base);
    }
}

impl Drop for Env {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Probe the base directory for direct-I/O support.
///
/// The sentinel is an operator decision; the block-size probe just tells
/// us the alignment it implies.
fn detect_file_opts(base: &Path) -> FileOpts {
    if !base.join(DIRECT_IO_SENTINEL).exists() {
        return FileOpts::buffered();
    }
    match tools::fs_block_size(base) {
        Ok(block_size) => FileOpts::direct(block_size),
        Err(_) => FileOpts::buffered(),
    }
}
