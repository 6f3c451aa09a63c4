//! Operational visibility: Prometheus metrics export.

pub mod metrics;

pub use metrics::{MetricsConfig, MetricsError, init_metrics};
