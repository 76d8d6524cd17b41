//! Executor observability.
//!
//! Both executors keep a [`Metrics`] instance that counts submitted,
//! executed, panicked and dropped tasks and tracks how long tasks wait
//! before they start.

pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};
