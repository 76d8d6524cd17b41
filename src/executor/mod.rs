//! Task execution policies.
//!
//! [`WorkerPoolExecutor`] runs tasks on a fixed set of long-lived workers
//! drawing from one shared queue. [`PerTaskExecutor`] starts a thread per
//! task. Both implement [`Executor`], so call sites can switch policy
//! without other changes.

pub mod panic_handler;
pub mod per_task;
pub mod pool;
pub mod queue;
pub mod task;
pub mod worker;

pub use panic_handler::{FailureSink, PanicHandler, PanicStrategy, TaskFailure};
pub use per_task::PerTaskExecutor;
pub use pool::WorkerPoolExecutor;
pub use queue::ShutdownState;
pub use task::{Task, TaskId};

/// Fire-and-forget task submission with a draining teardown.
pub trait Executor: Send + Sync {
    fn spawn<T>(&self, task: T)
    where
        T: Into<Task>;

    fn spawn_all<I>(&self, tasks: I)
    where
        I: IntoIterator,
        I::Item: Into<Task>,
    {
        for task in tasks {
            self.spawn(task);
        }
    }

    /// Wait until every accepted task has run, then release the threads.
    fn shutdown(&self);
}
