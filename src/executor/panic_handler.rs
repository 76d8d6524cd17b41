use super::task::{Task, TaskId};
use crate::config::Config;
use crate::error::Error;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// What a worker does after a task panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PanicStrategy {
    /// Abort the whole process.
    Abort,
    /// Swallow the panic; only the failure sink sees it.
    Isolate,
    /// Log the panic and keep going.
    #[default]
    LogAndContinue,
    /// Re-raise the panic on the executing thread, ending it.
    Propagate,
}

/// A task that panicked while running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub message: String,
}

impl TaskFailure {
    fn from_payload(task_id: TaskId, payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        Self { task_id, message }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} panicked: {}", self.task_id, self.message)
    }
}

impl From<TaskFailure> for Error {
    fn from(failure: TaskFailure) -> Self {
        Error::task_failed(failure.to_string())
    }
}

/// Caller-supplied callback receiving every [`TaskFailure`].
#[derive(Clone)]
pub struct FailureSink(Arc<dyn Fn(&TaskFailure) + Send + Sync>);

impl FailureSink {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&TaskFailure) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    fn call(&self, failure: &TaskFailure) {
        (self.0)(failure)
    }
}

impl fmt::Debug for FailureSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FailureSink(..)")
    }
}

/// Runs tasks behind an unwind boundary so a panicking task cannot take
/// its thread down unless [`PanicStrategy::Propagate`] asks for it.
#[derive(Debug)]
pub struct PanicHandler {
    strategy: PanicStrategy,
    sink: Option<FailureSink>,
    panic_count: AtomicUsize,
}

impl PanicHandler {
    pub fn new(strategy: PanicStrategy) -> Self {
        Self {
            strategy,
            sink: None,
            panic_count: AtomicUsize::new(0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            strategy: config.panic_strategy,
            sink: config.failure_sink.clone(),
            panic_count: AtomicUsize::new(0),
        }
    }

    pub fn with_sink(mut self, sink: FailureSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn run(&self, task: Task) -> Result<(), TaskFailure> {
        let task_id = task.id();

        let payload = match catch_unwind(AssertUnwindSafe(|| task.run())) {
            Ok(()) => return Ok(()),
            Err(payload) => payload,
        };

        self.panic_count.fetch_add(1, Ordering::Relaxed);
        let failure = TaskFailure::from_payload(task_id, &*payload);
        self.report(&failure);

        match self.strategy {
            PanicStrategy::Abort => {
                tracing::error!(task = %task_id, message = %failure.message, "task panicked, aborting");
                std::process::abort();
            }
            PanicStrategy::Isolate => {}
            PanicStrategy::LogAndContinue => {
                tracing::error!(task = %task_id, message = %failure.message, "task panicked");
            }
            PanicStrategy::Propagate => {
                tracing::error!(task = %task_id, message = %failure.message, "task panicked, propagating");
                resume_unwind(payload);
            }
        }

        Err(failure)
    }

    fn report(&self, failure: &TaskFailure) {
        let Some(sink) = &self.sink else {
            return;
        };

        // a sink that panics must not break isolation either
        if catch_unwind(AssertUnwindSafe(|| sink.call(failure))).is_err() {
            tracing::warn!(task = %failure.task_id, "failure sink panicked");
        }
    }

    pub fn panic_count(&self) -> usize {
        self.panic_count.load(Ordering::Relaxed)
    }

    pub fn reset_count(&self) {
        self.panic_count.store(0, Ordering::Relaxed);
    }

    pub fn strategy(&self) -> PanicStrategy {
        self.strategy
    }
}

impl Default for PanicHandler {
    fn default() -> Self {
        Self::new(PanicStrategy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_panic_handler_isolate() {
        let handler = PanicHandler::new(PanicStrategy::Isolate);

        let result = handler.run(Task::new(|| panic!("test panic")));

        let failure = result.unwrap_err();
        assert_eq!(failure.message, "test panic");
        assert_eq!(handler.panic_count(), 1);
    }

    #[test]
    fn test_strategy_from_config() {
        let config = Config::builder()
            .panic_strategy(PanicStrategy::Propagate)
            .build()
            .unwrap();
        assert_eq!(
            PanicHandler::from_config(&config).strategy(),
            PanicStrategy::Propagate
        );
        assert_eq!(
            PanicHandler::default().strategy(),
            PanicStrategy::LogAndContinue
        );
    }

    #[test]
    fn test_panic_handler_success() {
        let handler = PanicHandler::new(PanicStrategy::Isolate);

        assert!(handler.run(Task::new(|| {})).is_ok());
        assert_eq!(handler.panic_count(), 0);
    }

    #[test]
    fn test_formatted_panic_message() {
        let handler = PanicHandler::new(PanicStrategy::Isolate);

        let failure = handler
            .run(Task::new(|| panic!("bad value {}", 7)))
            .unwrap_err();
        assert_eq!(failure.message, "bad value 7");
    }

    #[test]
    fn test_panic_counter() {
        let handler = PanicHandler::new(PanicStrategy::LogAndContinue);

        for _ in 0..5 {
            let _ = handler.run(Task::new(|| panic!("test")));
        }

        assert_eq!(handler.panic_count(), 5);

        handler.reset_count();
        assert_eq!(handler.panic_count(), 0);
    }

    #[test]
    fn test_sink_receives_failure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let handler = PanicHandler::new(PanicStrategy::Isolate)
            .with_sink(FailureSink::new(move |f| sink_seen.lock().push(f.clone())));

        let task = Task::new(|| panic!("boom"));
        let id = task.id();
        let _ = handler.run(task);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].task_id, id);
        assert_eq!(seen[0].message, "boom");
    }

    #[test]
    fn test_panicking_sink_is_contained() {
        let handler = PanicHandler::new(PanicStrategy::Isolate)
            .with_sink(FailureSink::new(|_| panic!("sink broke")));

        let result = handler.run(Task::new(|| panic!("task broke")));
        assert!(result.is_err());
        assert_eq!(handler.panic_count(), 1);
    }

    #[test]
    fn test_propagate_resumes_unwind() {
        let handler = PanicHandler::new(PanicStrategy::Propagate);

        let outer = catch_unwind(AssertUnwindSafe(|| {
            let _ = handler.run(Task::new(|| panic!("again")));
        }));

        assert!(outer.is_err());
        assert_eq!(handler.panic_count(), 1);
    }

    #[test]
    fn test_failure_into_error() {
        let handler = PanicHandler::new(PanicStrategy::Isolate);
        let failure = handler.run(Task::new(|| panic!("oops"))).unwrap_err();

        let err: Error = failure.into();
        assert!(matches!(err, Error::TaskFailed(ref msg) if msg.contains("oops")));
    }
}
