// worker thread stuff
use super::panic_handler::PanicHandler;
use super::queue::WorkQueue;
use super::task::Task;
use crate::telemetry::Metrics;
use std::cell::Cell;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub type WorkerId = usize;

thread_local! {
    // address of the queue this thread serves, 0 outside a pool
    static SERVING_QUEUE: Cell<usize> = const { Cell::new(0) };
}

pub(crate) fn queue_key(queue: &Arc<WorkQueue>) -> usize {
    Arc::as_ptr(queue) as usize
}

/// True when called from one of the workers draining `queue`.
pub(crate) fn is_worker_of(queue: &Arc<WorkQueue>) -> bool {
    SERVING_QUEUE.with(|q| q.get() == queue_key(queue))
}

pub(crate) struct Worker {
    pub id: WorkerId,
    queue: Arc<WorkQueue>,
    panic_handler: Arc<PanicHandler>,
    metrics: Arc<Metrics>,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        queue: Arc<WorkQueue>,
        panic_handler: Arc<PanicHandler>,
        metrics: Arc<Metrics>,
    ) -> Self {
        queue.register_worker();
        Self {
            id,
            queue,
            panic_handler,
            metrics,
        }
    }

    // main loop
    pub fn run(&self) {
        SERVING_QUEUE.with(|q| q.set(queue_key(&self.queue)));
        tracing::debug!(worker = self.id, "worker started");
        let _death = DeathWatch { worker: self };

        while let Some(task) = self.queue.pop_blocking() {
            tracing::trace!(worker = self.id, task = %task.id(), "running task");
            execute_task(&self.panic_handler, &self.metrics, task);
        }

        tracing::debug!(worker = self.id, state = ?self.queue.state(), "worker exiting");
    }
}

/// Run `task` behind the panic boundary and record it.
pub(crate) fn execute_task(panic_handler: &PanicHandler, metrics: &Metrics, task: Task) {
    let record = ExecutionRecord {
        metrics,
        queued: task.created().elapsed(),
        start: Instant::now(),
    };

    if panic_handler.run(task).is_err() {
        metrics.record_panic();
    }
    drop(record);
}

// Clears the thread marker on every exit, and deregisters a worker
// unwinding out of `run`. A clean exit is deregistered by `pop_blocking`.
struct DeathWatch<'a> {
    worker: &'a Worker,
}

impl Drop for DeathWatch<'_> {
    fn drop(&mut self) {
        SERVING_QUEUE.with(|q| q.set(0));
        if !thread::panicking() {
            return;
        }

        let stranded = self.worker.queue.worker_died();
        tracing::error!(worker = self.worker.id, stranded = stranded.len(), "worker died");
        if !stranded.is_empty() {
            self.worker.metrics.record_dropped(stranded.len() as u64);
        }
    }
}

// Records on drop so a propagated panic is still counted.
struct ExecutionRecord<'a> {
    metrics: &'a Metrics,
    queued: Duration,
    start: Instant,
}

impl Drop for ExecutionRecord<'_> {
    fn drop(&mut self) {
        self.metrics
            .record_execution(self.queued, self.start.elapsed());
        if thread::panicking() {
            self.metrics.record_panic();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::panic_handler::PanicStrategy;
    use crate::executor::queue::ShutdownState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker(queue: &Arc<WorkQueue>, metrics: &Arc<Metrics>) -> Worker {
        Worker::new(
            0,
            queue.clone(),
            Arc::new(PanicHandler::new(PanicStrategy::Isolate)),
            metrics.clone(),
        )
    }

    #[test]
    fn test_worker_drains_then_exits_on_soft_shutdown() {
        let queue = Arc::new(WorkQueue::new());
        let metrics = Arc::new(Metrics::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let worker = worker(&queue, &metrics);

        for _ in 0..5 {
            let hits = hits.clone();
            queue
                .push(Task::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        queue.request_shutdown(ShutdownState::SoftShutdown);

        worker.run();

        assert_eq!(hits.load(Ordering::SeqCst), 5);
        assert_eq!(metrics.snapshot().tasks_executed, 5);
    }

    #[test]
    fn test_worker_survives_panicking_task() {
        let queue = Arc::new(WorkQueue::new());
        let metrics = Arc::new(Metrics::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let worker = worker(&queue, &metrics);

        queue.push(Task::new(|| panic!("first task fails"))).unwrap();
        let h = hits.clone();
        queue
            .push(Task::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        queue.request_shutdown(ShutdownState::SoftShutdown);

        worker.run();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_executed, 2);
        assert_eq!(snapshot.tasks_panicked, 1);
    }

    #[test]
    fn test_worker_marks_its_thread() {
        let queue = Arc::new(WorkQueue::new());
        let metrics = Arc::new(Metrics::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let worker = worker(&queue, &metrics);

        let q = queue.clone();
        let s = seen.clone();
        queue
            .push(Task::new(move || {
                if is_worker_of(&q) {
                    s.fetch_add(1, Ordering::SeqCst);
                }
            }))
            .unwrap();
        queue.request_shutdown(ShutdownState::SoftShutdown);

        assert!(!is_worker_of(&queue));
        worker.run();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!is_worker_of(&queue));
    }

    #[test]
    fn test_propagated_panic_deregisters_worker() {
        let queue = Arc::new(WorkQueue::new());
        let metrics = Arc::new(Metrics::new());
        let dying = Worker::new(
            0,
            queue.clone(),
            Arc::new(PanicHandler::new(PanicStrategy::Propagate)),
            metrics.clone(),
        );

        queue.push(Task::new(|| panic!("fatal"))).unwrap();
        queue.push(Task::new(|| {})).unwrap();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| dying.run()));
        assert!(outcome.is_err());

        let snapshot = metrics.snapshot();
        assert_eq!(queue.live_workers(), 0);
        assert_eq!(queue.len(), 0);
        assert_eq!(snapshot.tasks_panicked, 1);
        assert_eq!(snapshot.tasks_dropped, 1);
        assert!(!is_worker_of(&queue));
    }
}
