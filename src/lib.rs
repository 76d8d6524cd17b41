//! Spindle - interchangeable thread executors
//!
//! Two policies for running fire-and-forget tasks behind one
//! [`Executor`] trait:
//!
//! - [`WorkerPoolExecutor`]: a fixed number of worker threads fed from a
//!   shared FIFO queue, with soft (drain) and hard (discard) shutdown.
//! - [`PerTaskExecutor`]: one new thread per task, joined at teardown.
//!
//! # Quick Start
//!
//! ```no_run
//! use spindle::prelude::*;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let pool = WorkerPoolExecutor::new(4).unwrap();
//! let done = Arc::new(AtomicUsize::new(0));
//!
//! for _ in 0..100 {
//!     let done = done.clone();
//!     pool.spawn(move || {
//!         done.fetch_add(1, Ordering::Relaxed);
//!     });
//! }
//!
//! // drains the queue and joins the workers
//! drop(pool);
//! assert_eq!(done.load(Ordering::Relaxed), 100);
//! ```
//!
//! A task that panics is caught at the worker boundary and reported
//! through the configured [`PanicStrategy`] and failure sink, so one bad
//! task never shrinks the pool.

#![warn(missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod executor;
pub mod prelude;
pub mod telemetry;

pub use config::{Config, ConfigBuilder};
pub use error::{Error, Result};
pub use executor::{
    Executor, FailureSink, PanicStrategy, PerTaskExecutor, ShutdownState, Task, TaskFailure,
    TaskId, WorkerPoolExecutor,
};
pub use telemetry::MetricsSnapshot;
