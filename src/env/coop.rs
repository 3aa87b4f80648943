//! Cooperative locking primitives for the environment layer.
//!
//! The library reserves inline byte space sized for pthread primitives in
//! its own structures; each shim here must fit that reservation, which the
//! static assertions below pin down. Operations are no-ops outside the
//! runtime (static initialisation, foreign threads, teardown) and suspend
//! the current task instead of blocking the thread inside it.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use tokio::sync::Notify;

fn on_runtime() -> bool {
    tokio::runtime::Handle::try_current().is_ok()
}

/// Non-recursive cooperative mutex.
pub struct CoopMutex {
    locked: AtomicBool,
    notify: Box<Notify>,
}

// The shims pun into the library's inline pthread reservations.
const _: () = assert!(
    std::mem::size_of::<CoopMutex>() <= std::mem::size_of::<libc::pthread_mutex_t>()
);
const _: () = assert!(
    std::mem::size_of::<CoopRwLock>() <= std::mem::size_of::<libc::pthread_rwlock_t>()
);
const _: () = assert!(
    std::mem::size_of::<CoopCondvar>() <= std::mem::size_of::<libc::pthread_cond_t>()
);

pub struct CoopMutexGuard<'a> {
    mutex: &'a CoopMutex,
}

impl CoopMutex {
    pub fn new() -> Self {
        CoopMutex {
            locked: AtomicBool::new(false),
            notify: Box::new(Notify::new()),
        }
    }

    /// Acquire without waiting; `None` when already held.
    pub fn try_lock(&self) -> Option<CoopMutexGuard> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(CoopMutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Cooperative acquire; suspends the current task until the lock frees.
    pub async fn lock(&self) -> CoopMutexGuard<'_> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            self.notify.notified().await;
        }
    }

    /// Acquire from synchronous context.
    ///
    /// Outside the runtime contention cannot exist (single-threaded init
    /// and teardown), so a failed acquire there is a programmer error.
    pub fn lock_sync(&self) -> CoopMutexGuard<'_> {
        match self.try_lock() {
            Some(guard) => guard,
            None if !on_runtime() => panic!("coop mutex contended outside the runtime"),
            None => crate::tools::block_in_place(|| loop {
                if let Some(guard) = self.try_lock() {
                    return guard;
                }
                std::thread::yield_now();
            }),
        }
    }
}

impl Default for CoopMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CoopMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
        self.mutex.notify.notify_one();
    }
}

/// Cooperative reader/writer lock. Writers are exclusive; readers share.
pub struct CoopRwLock {
    // Low 31 bits: reader count. High bit: writer held.
    state: AtomicU32,
    notify: Box<Notify>,
}

const WRITER: u32 = 1 << 31;

pub struct CoopReadGuard<'a> {
    lock: &'a CoopRwLock,
}

pub struct CoopWriteGuard<'a> {
    lock: &'a CoopRwLock,
}

impl CoopRwLock {
    pub fn new() -> Self {
        CoopRwLock {
            state: AtomicU32::new(0),
            notify: Box::new(Notify::new()),
        }
    }

    pub fn try_read(&self) -> Option<CoopReadGuard> {
        let mut cur = self.state.load(Ordering::Relaxed);
        loop {
            if cur & WRITER != 0 {
                return None;
            }
            match self.state.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(CoopReadGuard { lock: self }),
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn try_write(&self) -> Option<CoopWriteGuard> {
        if self
            .state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(CoopWriteGuard { lock: self })
        } else {
            None
        }
    }

    pub async fn read(&self) -> CoopReadGuard<'_> {
        loop {
            if let Some(guard) = self.try_read() {
                return guard;
            }
            self.notify.notified().await;
        }
    }

    pub async fn write(&self) -> CoopWriteGuard<'_> {
        loop {
            if let Some(guard) = self.try_write() {
                return guard;
            }
            self.notify.notified().await;
        }
    }
}

impl Default for CoopRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CoopReadGuard<'_> {
    fn drop(&mut self) {
        if self.lock.state.fetch_sub(1, Ordering::Release) == 1 {
            self.lock.notify.notify_waiters();
        }
    }
}

impl Drop for CoopWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
        self.lock.notify.notify_waiters();
    }
}

/// Cooperative condition variable.
///
/// `notify_*` may be called from any thread, runtime or not; waiting only
/// makes sense from a task.
pub struct CoopCondvar {
    waiters: AtomicUsize,
    notify: Box<Notify>,
}

impl CoopCondvar {
    pub fn new() -> Self {
        CoopCondvar {
            waiters: AtomicUsize::new(0),
            notify: Box::new(Notify::new()),
        }
    }

    pub async fn wait(&self) {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        self.notify.notified().await;
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn notify_one(&self) {
        self.notify.notify_one();
    }

    pub fn notify_all(&self) {
        self.notify.notify_waiters();
    }

    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }
}

impl Default for CoopCondvar {
    fn default() -> Self {
        Self::new()
    }
}
