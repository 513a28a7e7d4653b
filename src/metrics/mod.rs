//! Metrics module for Prometheus-based monitoring.
//!
//! # Example
//!
//! ```ignore
//! use job_forge::metrics::{EngineMetrics, MetricsCollector};
//! use std::sync::Arc;
//!
//! let metrics = Arc::new(EngineMetrics::new()?);
//! let collector = MetricsCollector::new(Arc::clone(&metrics));
//!
//! collector.record_job("echo", "finished", Some(0.4));
//!
//! // Export metrics for Prometheus scraping
//! let text = metrics.export();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::EngineMetrics;
