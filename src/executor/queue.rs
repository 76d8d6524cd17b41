//! Shared FIFO of pending tasks plus the pool's shutdown state.
//!
//! Both live under one mutex and share one condition variable, so a worker
//! checks "work available" and "shutdown requested" in a single predicate
//! and cannot miss a wakeup between the two.

use super::task::Task;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::mem;

/// Lifecycle of a worker pool.
///
/// Variants are ordered by aggressiveness. A request only takes effect when
/// it is strictly more aggressive than the current state, so the state never
/// returns to `Running` and a hard shutdown can follow a soft one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShutdownState {
    Running,
    /// Drain the queue, then stop.
    SoftShutdown,
    /// Stop now; queued tasks are discarded.
    HardShutdown,
}

impl ShutdownState {
    pub fn is_running(self) -> bool {
        self == ShutdownState::Running
    }
}

#[derive(Debug)]
struct Inner {
    tasks: VecDeque<Task>,
    state: ShutdownState,
    // workers that may still pop
    live_workers: usize,
}

#[derive(Debug)]
pub(crate) struct WorkQueue {
    inner: Mutex<Inner>,
    available: Condvar,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: VecDeque::new(),
                state: ShutdownState::Running,
                live_workers: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Count a worker that will drain this queue.
    pub fn register_worker(&self) {
        self.inner.lock().live_workers += 1;
    }

    /// Account for a worker that died outside [`pop_blocking`](Self::pop_blocking).
    ///
    /// When it was the last one, the tasks nobody will run are handed back.
    pub fn worker_died(&self) -> VecDeque<Task> {
        let mut inner = self.inner.lock();
        inner.live_workers = inner.live_workers.saturating_sub(1);
        if inner.live_workers == 0 {
            mem::take(&mut inner.tasks)
        } else {
            VecDeque::new()
        }
    }

    /// Append one task. Hands the task back if nothing would ever run it:
    /// the queue is hard-shut-down, or every worker has exited.
    pub fn push(&self, task: Task) -> Result<(), Task> {
        let mut inner = self.inner.lock();
        if !inner.accepts() {
            return Err(task);
        }

        let was_empty = inner.tasks.is_empty();
        inner.tasks.push_back(task);
        drop(inner);

        if was_empty {
            self.available.notify_all();
        }
        Ok(())
    }

    /// Append a batch atomically with respect to other submitters.
    ///
    /// Returns the number of tasks queued, or the whole batch back when
    /// [`push`](Self::push) would refuse a single task.
    pub fn push_batch(&self, tasks: Vec<Task>) -> Result<usize, Vec<Task>> {
        if tasks.is_empty() {
            return Ok(0);
        }

        let mut inner = self.inner.lock();
        if !inner.accepts() {
            return Err(tasks);
        }

        let was_empty = inner.tasks.is_empty();
        let count = tasks.len();
        inner.tasks.extend(tasks);
        drop(inner);

        if was_empty {
            self.available.notify_all();
        }
        Ok(count)
    }

    /// Block until there is a task to run or the worker should exit.
    ///
    /// `None` means exit: either a hard shutdown, or a soft shutdown with
    /// nothing left to drain. The caller is deregistered before the lock is
    /// released, so no push can slip in behind the last exiting worker.
    pub fn pop_blocking(&self) -> Option<Task> {
        let mut inner = self.inner.lock();
        loop {
            if inner.state == ShutdownState::HardShutdown {
                break;
            }
            if let Some(task) = inner.tasks.pop_front() {
                return Some(task);
            }
            if inner.state == ShutdownState::SoftShutdown {
                break;
            }
            self.available.wait(&mut inner);
        }

        inner.live_workers = inner.live_workers.saturating_sub(1);
        None
    }

    /// Move to `target` if it is more aggressive than the current state and
    /// wake every waiting worker.
    ///
    /// Returns `None` when the request was a no-op, otherwise the tasks the
    /// transition discarded (always empty for a soft shutdown). The caller
    /// drops them outside the lock.
    pub fn request_shutdown(&self, target: ShutdownState) -> Option<VecDeque<Task>> {
        let mut inner = self.inner.lock();
        if target <= inner.state {
            return None;
        }

        inner.state = target;
        let discarded = if target == ShutdownState::HardShutdown {
            mem::take(&mut inner.tasks)
        } else {
            VecDeque::new()
        };
        drop(inner);

        self.available.notify_all();
        Some(discarded)
    }

    pub fn state(&self) -> ShutdownState {
        self.inner.lock().state
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn live_workers(&self) -> usize {
        self.inner.lock().live_workers
    }
}

impl Inner {
    fn accepts(&self) -> bool {
        self.state != ShutdownState::HardShutdown && self.live_workers > 0
    }
}
