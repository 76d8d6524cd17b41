use super::panic_handler::PanicHandler;
use super::task::Task;
use super::worker::execute_task;
use super::Executor;
use crate::config::Config;
use crate::error::Result;
use crate::telemetry::{Metrics, MetricsSnapshot};
use parking_lot::Mutex;
use std::cell::Cell;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

static GLOBAL_EXECUTOR: OnceLock<PerTaskExecutor> = OnceLock::new();
static NEXT_KEY: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    // key of the executor whose task runs on this thread, 0 otherwise
    static RUNNING_FOR: Cell<usize> = const { Cell::new(0) };
}

/// Starts a fresh OS thread for every task.
///
/// There is no queue and no bound on concurrency: each `spawn` begins
/// running its task right away. Handles are kept until
/// [`join_all`](Self::join_all), which dropping the executor also calls.
/// Meant as a baseline to compare against [`WorkerPoolExecutor`], not for
/// production load.
///
/// [`WorkerPoolExecutor`]: super::WorkerPoolExecutor
pub struct PerTaskExecutor {
    key: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
    // one join_all at a time, so a second caller waits for the first
    join_lock: Mutex<()>,
    config: Config,
    panic_handler: Arc<PanicHandler>,
    metrics: Arc<Metrics>,
}

impl PerTaskExecutor {
    pub fn new() -> Self {
        Self::build(Config::default())
    }

    pub fn with_config(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config.clone()))
    }

    fn build(config: Config) -> Self {
        Self {
            key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            threads: Mutex::new(Vec::new()),
            join_lock: Mutex::new(()),
            panic_handler: Arc::new(PanicHandler::from_config(&config)),
            metrics: Arc::new(Metrics::new()),
            config,
        }
    }

    /// Process-wide instance, created on first use.
    ///
    /// Statics are never dropped, so call [`join_all`](Self::join_all)
    /// before exit to wait for its threads.
    pub fn global() -> &'static PerTaskExecutor {
        GLOBAL_EXECUTOR.get_or_init(PerTaskExecutor::new)
    }

    /// Start `task` on a new thread, reporting thread creation failure.
    pub fn try_spawn<T>(&self, task: T) -> Result<()>
    where
        T: Into<Task>,
    {
        let task = task.into();
        let id = task.id();
        self.metrics.record_submitted(1);

        let panic_handler = self.panic_handler.clone();
        let metrics = self.metrics.clone();
        let name = format!("{}-task-{}", self.config.thread_name_prefix, id.as_u64());
        let key = self.key;

        // spawn under the lock so handles are recorded in start order
        let mut threads = self.threads.lock();
        let spawned = self
            .config
            .thread_builder(name)
            .spawn(move || {
                RUNNING_FOR.with(|k| k.set(key));
                execute_task(&panic_handler, &metrics, task)
            });

        match spawned {
            Ok(handle) => {
                threads.push(handle);
                tracing::trace!(task = %id, "task thread started");
                Ok(())
            }
            Err(e) => {
                self.metrics.record_dropped(1);
                Err(e.into())
            }
        }
    }

    pub fn spawn<T>(&self, task: T)
    where
        T: Into<Task>,
    {
        if let Err(e) = self.try_spawn(task) {
            tracing::error!(error = %e, "failed to start task thread");
        }
    }

    /// Join every thread started so far, in the order they were started.
    ///
    /// Threads spawned while this runs are joined too; it returns once no
    /// recorded handle is left. Concurrent callers are serialized, so each
    /// returns only after every thread has finished. Called from one of this
    /// executor's own tasks while another join is under way, it returns at
    /// once, since that join already waits for the calling task.
    pub fn join_all(&self) {
        let _joining = if RUNNING_FOR.with(|k| k.get()) == self.key {
            match self.join_lock.try_lock() {
                Some(guard) => guard,
                None => {
                    tracing::warn!("join_all called from a task thread during a join, not waiting");
                    return;
                }
            }
        } else {
            self.join_lock.lock()
        };

        let current = thread::current().id();
        loop {
            let batch = mem::take(&mut *self.threads.lock());
            if batch.is_empty() {
                break;
            }

            for handle in batch {
                if handle.thread().id() == current {
                    tracing::warn!("join_all called from a task thread, not joining itself");
                    continue;
                }
                if handle.join().is_err() {
                    tracing::error!("task thread ended by a propagated panic");
                }
            }
        }
    }

    /// Recorded threads that have not been joined yet.
    pub fn live_threads(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn panic_count(&self) -> usize {
        self.panic_handler.panic_count()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Default for PerTaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for PerTaskExecutor {
    fn spawn<T>(&self, task: T)
    where
        T: Into<Task>,
    {
        PerTaskExecutor::spawn(self, task);
    }

    fn shutdown(&self) {
        self.join_all();
    }
}

impl std::fmt::Debug for PerTaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerTaskExecutor")
            .field("live_threads", &self.live_threads())
            .finish()
    }
}

impl Drop for PerTaskExecutor {
    fn drop(&mut self) {
        self.join_all();
    }
}
