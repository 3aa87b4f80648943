//! Background task pools for the environment.
//!
//! One pool per library work priority. Workers are named OS threads (the
//! library's jobs are blocking), fed from a deque so that pending tasks
//! can still be pulled back out for cancellation. No worker starts a task
//! before the owning environment reaches the RUN level.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, warn};

/// Background work priorities, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Bottom,
    Low,
    High,
}

/// I/O priority hint carried by a pool. Demotion is one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPriority {
    Low,
    High,
}

/// Engine run level. Background work is gated until RUN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLevel {
    Start,
    Run,
    Quit,
}

/// Shared gate the pools consult before executing anything.
pub struct RunGate {
    state: Mutex<RunLevel>,
    cv: Condvar,
}

impl RunGate {
    pub fn new() -> Arc<Self> {
        Arc::new(RunGate { state: Mutex::new(RunLevel::Start), cv: Condvar::new() })
    }

    pub fn raise(&self, level: RunLevel) {
        let mut state = self.state.lock().unwrap();
        *state = level;
        self.cv.notify_all();
    }

    pub fn current(&self) -> RunLevel {
        *self.state.lock().unwrap()
    }

    fn wait_run(&self) {
        let mut state = self.state.lock().unwrap();
        while *state == RunLevel::Start {
            state = self.cv.wait(state).unwrap();
        }
    }
}

struct Task {
    run: Box<dyn FnOnce() + Send + 'static>,
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
    tag: u64,
}

struct PoolState {
    queue: VecDeque<Task>,
    shutdown: bool,
    active: usize,
}

struct PoolInner {
    name: String,
    state: Mutex<PoolState>,
    dock: Condvar,
    idle: Condvar,
    gate: Arc<RunGate>,
}

impl PoolInner {
    fn worker(self: &Arc<Self>) {
        self.gate.wait_run();
        if self.gate.current() == RunLevel::Quit {
            return;
        }
        loop {
            let task = {
                let mut state = self.state.lock().unwrap();
                loop {
                    if let Some(task) = state.queue.pop_front() {
                        state.active += 1;
                        break task;
                    }
                    if state.shutdown {
                        return;
                    }
                    state = self.dock.wait(state).unwrap();
                }
            };

            (task.run)();

            let mut state = self.state.lock().unwrap();
            state.active -= 1;
            if state.active == 0 && state.queue.is_empty() {
                self.idle.notify_all();
            }
        }
    }
}

/// A priority worker pool.
pub struct TaskPool {
    prio: Priority,
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    io_prio: Mutex<IoPriority>,
}

impl TaskPool {
    pub fn new(prio: Priority, workers: usize, gate: Arc<RunGate>) -> Self {
        let name = match prio {
            Priority::Bottom => "db btm",
            Priority::Low => "db low",
            Priority::High => "db high",
        };
        Self::named(name, prio, workers, gate)
    }

    pub fn named(name: &str, prio: Priority, workers: usize, gate: Arc<RunGate>) -> Self {
        let inner = Arc::new(PoolInner {
            name: name.to_owned(),
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                shutdown: false,
                active: 0,
            }),
            dock: Condvar::new(),
            idle: Condvar::new(),
            gate,
        });
        let pool = TaskPool {
            prio,
            inner,
            workers: Mutex::new(Vec::new()),
            io_prio: Mutex::new(IoPriority::High),
        };
        pool.grow_to(workers);
        pool
    }

    pub fn priority(&self) -> Priority {
        self.prio
    }

    /// Enqueue a task and wake one worker.
    pub fn schedule<F>(&self, tag: u64, run: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_with_cancel(tag, run, || {});
    }

    pub fn schedule_with_cancel<F, C>(&self, tag: u64, run: F, cancel: C)
    where
        F: FnOnce() + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        assert!(!state.shutdown, "schedule on a joined pool");
        state.queue.push_back(Task {
            run: Box::new(run),
            cancel: Some(Box::new(cancel)),
            tag,
        });
        self.inner.dock.notify_one();
    }

    /// Pull every pending task with `tag` back out of the queue, invoking
    /// each task's cancel callback exactly once. Returns the number of
    /// tasks cancelled. In-flight tasks are unaffected.
    pub fn unschedule(&self, tag: u64) -> usize {
        let cancels: Vec<_> = {
            let mut state = self.inner.state.lock().unwrap();
            let mut kept = VecDeque::with_capacity(state.queue.len());
            let mut cancels = Vec::new();
            while let Some(mut task) = state.queue.pop_front() {
                if task.tag == tag {
                    if let Some(cancel) = task.cancel.take() {
                        cancels.push(cancel);
                    }
                } else {
                    kept.push_back(task);
                }
            }
            state.queue = kept;
            cancels
        };
        let count = cancels.len();
        for cancel in cancels {
            cancel();
        }
        debug!("{}: cancelled {} pending task(s)", self.inner.name, count);
        count
    }

    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    /// Grow the pool to at least `n` workers. Shrinking live workers is
    /// not supported; the library only ever asks for more.
    pub fn grow_to(&self, n: usize) {
        let mut workers = self.workers.lock().unwrap();
        while workers.len() < n {
            let inner = Arc::clone(&self.inner);
            let name = format!("{} ({})", inner.name, workers.len());
            let handle = std::thread::Builder::new()
                .name(name)
                .spawn(move || inner.worker())
                .expect("spawn pool worker");
            workers.push(handle);
        }
    }

    pub fn workers(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    /// Demote the pool's I/O hint HIGH -> LOW. Never re-promotes.
    pub fn lower_io_priority(&self) {
        let mut prio = self.io_prio.lock().unwrap();
        if *prio == IoPriority::High {
            *prio = IoPriority::Low;
            debug!("{}: io priority lowered", self.inner.name);
        }
    }

    pub fn io_priority(&self) -> IoPriority {
        *self.io_prio.lock().unwrap()
    }

    /// Wait until nothing is queued and nothing is running.
    pub fn wait_idle(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while state.active > 0 || !state.queue.is_empty() {
            state = self.inner.idle.wait(state).unwrap();
        }
    }

    /// Drain and terminate. Pending tasks still run; workers exit once
    /// the queue is empty.
    pub fn join(&self) {
        // Torn down before RUN: release gated workers without letting
        // them pick up work.
        if self.inner.gate.current() == RunLevel::Start {
            self.inner.gate.raise(RunLevel::Quit);
        }
        {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
            self.inner.dock.notify_all();
        }
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                warn!("{}: worker panicked", self.inner.name);
            }
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.join();
    }
}
