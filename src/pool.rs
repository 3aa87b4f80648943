//! Process-wide background request pool ("db req").
//!
//! Shared by every open database; used to warm block caches ahead of
//! predicted reads and to parallelise multi-column row seeks. Requests
//! are tagged with their owning database so a closing database can pull
//! its pending work back out; in-flight work is awaited.

use std::sync::{Condvar, Mutex};

use lazy_static::lazy_static;

use crate::env::task::{Priority, RunGate, RunLevel, TaskPool};
use crate::tools::block_in_place;

lazy_static! {
    static ref POOL: TaskPool = {
        let gate = RunGate::new();
        gate.raise(RunLevel::Run);
        TaskPool::named("db req", Priority::High, DEFAULT_WORKERS, gate)
    };
}

const DEFAULT_WORKERS: usize = 4;

/// Make sure the pool has at least `n` workers.
pub fn ensure_workers(n: usize) {
    POOL.grow_to(n);
}

/// Post a request; returns immediately.
pub fn post<F>(tag: u64, run: F)
where
    F: FnOnce() + Send + 'static,
{
    POOL.schedule(tag, run);
}

pub fn post_with_cancel<F, C>(tag: u64, run: F, cancel: C)
where
    F: FnOnce() + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    POOL.schedule_with_cancel(tag, run, cancel);
}

/// Cancel every pending request tagged `tag`; returns how many were
/// pulled out. Requests already running are left to finish.
pub fn cancel_for(tag: u64) -> usize {
    POOL.unschedule(tag)
}

/// Wait for the pool to go quiet. Used by database teardown after
/// cancelling its pending requests.
pub fn drain() {
    block_in_place(|| POOL.wait_idle());
}

pub fn queue_len() -> usize {
    POOL.queue_len()
}

/// Countdown latch joining a fan-out of pool requests.
pub struct Latch {
    remaining: Mutex<usize>,
    cv: Condvar,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Latch { remaining: Mutex::new(count), cv: Condvar::new() }
    }

    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        debug_assert!(*remaining > 0);
        *remaining -= 1;
        if *remaining == 0 {
            self.cv.notify_all();
        }
    }

    /// Block until every participant counted down. A suspension point for
    /// the calling task; the wait itself runs off the executor.
    pub fn wait(&self) {
        block_in_place(|| {
            let mut remaining = self.remaining.lock().unwrap();
            while *remaining > 0 {
                remaining = self.cv.wait(remaining).unwrap();
            }
        });
    }
}
