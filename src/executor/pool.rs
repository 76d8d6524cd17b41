use super::panic_handler::PanicHandler;
use super::queue::{ShutdownState, WorkQueue};
use super::task::Task;
use super::worker::{self, Worker, WorkerId};
use super::Executor;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::telemetry::{Metrics, MetricsSnapshot};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Fixed-size pool of worker threads fed from one shared FIFO queue.
///
/// Dropping the pool performs a soft shutdown: every task accepted so far
/// runs before the drop returns. [`shutdown_hard`](Self::shutdown_hard)
/// stops the workers without draining and discards what is still queued.
pub struct WorkerPoolExecutor {
    queue: Arc<WorkQueue>,
    workers: Mutex<Vec<WorkerHandle>>,
    num_threads: usize,
    panic_handler: Arc<PanicHandler>,
    metrics: Arc<Metrics>,
}

struct WorkerHandle {
    id: WorkerId,
    thread: JoinHandle<()>,
}

impl WorkerPoolExecutor {
    /// Start a pool of `num_threads` workers with default settings.
    ///
    /// Fails with [`Error::Config`] when `num_threads` is zero.
    pub fn new(num_threads: usize) -> Result<Self> {
        let config = Config::builder().num_threads(num_threads).build()?;
        Self::with_config(&config)
    }

    pub fn with_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let num_threads = config.worker_threads();

        let queue = Arc::new(WorkQueue::new());
        let panic_handler = Arc::new(PanicHandler::from_config(config));
        let metrics = Arc::new(Metrics::new());

        let mut pool = Self {
            queue,
            workers: Mutex::new(Vec::with_capacity(num_threads)),
            num_threads,
            panic_handler,
            metrics,
        };

        for id in 0..num_threads {
            let worker = Worker::new(
                id,
                pool.queue.clone(),
                pool.panic_handler.clone(),
                pool.metrics.clone(),
            );
            let name = format!("{}-{}", config.thread_name_prefix, id);

            match config.thread_builder(name).spawn(move || worker.run()) {
                Ok(thread) => pool.workers.get_mut().push(WorkerHandle { id, thread }),
                Err(e) => {
                    // don't leave the workers started so far running
                    pool.shutdown_hard();
                    return Err(Error::executor(format!("spawn failed: {}", e)));
                }
            }
        }

        tracing::debug!(
            num_threads,
            prefix = %config.thread_name_prefix,
            panic_strategy = ?pool.panic_handler.strategy(),
            "worker pool started"
        );
        Ok(pool)
    }

    /// Queue a task. Dropped once a hard shutdown was requested, or once a
    /// soft shutdown has let every worker exit.
    pub fn spawn<T>(&self, task: T)
    where
        T: Into<Task>,
    {
        let task = task.into();
        let id = task.id();
        self.metrics.record_submitted(1);

        match self.queue.push(task) {
            Ok(()) => tracing::trace!(task = %id, "task queued"),
            Err(rejected) => {
                self.metrics.record_dropped(1);
                tracing::warn!(task = %id, state = ?self.state(), "no worker will run it, dropping task");
                drop(rejected);
            }
        }
    }

    /// Queue a batch under a single lock acquisition, so no other
    /// submitter's tasks interleave with it.
    pub fn spawn_all<I>(&self, tasks: I)
    where
        I: IntoIterator,
        I::Item: Into<Task>,
    {
        let tasks: Vec<Task> = tasks.into_iter().map(Into::into).collect();
        let count = tasks.len() as u64;
        self.metrics.record_submitted(count);

        match self.queue.push_batch(tasks) {
            Ok(queued) => tracing::trace!(count = queued, "task batch queued"),
            Err(rejected) => {
                self.metrics.record_dropped(count);
                tracing::warn!(count, state = ?self.state(), "no worker will run it, dropping task batch");
                drop(rejected);
            }
        }
    }

    /// Let the workers drain the queue, then join them. Idempotent.
    pub fn shutdown(&self) {
        self.terminate(ShutdownState::SoftShutdown);
    }

    /// Stop the workers without draining and join them. Tasks still queued
    /// are dropped unrun, as is anything submitted afterwards. Idempotent.
    pub fn shutdown_hard(&self) {
        self.terminate(ShutdownState::HardShutdown);
    }

    fn terminate(&self, target: ShutdownState) {
        if let Some(discarded) = self.queue.request_shutdown(target) {
            tracing::debug!(state = ?target, discarded = discarded.len(), "shutdown requested");
            if !discarded.is_empty() {
                self.metrics.record_dropped(discarded.len() as u64);
            }
            drop(discarded);
        }

        if worker::is_worker_of(&self.queue) {
            // joining from inside the pool would wait on ourselves
            tracing::warn!("shutdown requested from a worker thread, not joining workers");
            return;
        }

        self.join_workers();
    }

    fn join_workers(&self) {
        // held across the joins so concurrent callers also wait for exit
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.thread.join().is_err() {
                tracing::error!(worker = handle.id, "worker ended by a propagated task panic");
            }
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Tasks queued but not yet picked up by a worker.
    pub fn pending_tasks(&self) -> usize {
        self.queue.len()
    }

    pub fn state(&self) -> ShutdownState {
        self.queue.state()
    }

    /// Workers still serving the queue.
    pub fn live_workers(&self) -> usize {
        self.queue.live_workers()
    }

    pub fn panic_count(&self) -> usize {
        self.panic_handler.panic_count()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Executor for WorkerPoolExecutor {
    fn spawn<T>(&self, task: T)
    where
        T: Into<Task>,
    {
        WorkerPoolExecutor::spawn(self, task);
    }

    fn spawn_all<I>(&self, tasks: I)
    where
        I: IntoIterator,
        I::Item: Into<Task>,
    {
        WorkerPoolExecutor::spawn_all(self, tasks);
    }

    fn shutdown(&self) {
        WorkerPoolExecutor::shutdown(self);
    }
}

impl std::fmt::Debug for WorkerPoolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolExecutor")
            .field("num_threads", &self.num_threads)
            .field("state", &self.state())
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}

impl Drop for WorkerPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
