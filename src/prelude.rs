pub use crate::config::{Config, ConfigBuilder};
pub use crate::error::{Error, Result};
pub use crate::executor::{
    Executor, PanicStrategy, PerTaskExecutor, ShutdownState, Task, TaskFailure,
    WorkerPoolExecutor,
};
pub use crate::telemetry::MetricsSnapshot;
