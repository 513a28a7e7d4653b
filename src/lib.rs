//! job-forge: a reliable job execution engine.
//!
//! Jobs are persisted in a durable store (SQLite or Redis), claimed by a pool
//! of workers and run as pluggable [`tasks::Task`]s inside isolated execution
//! contexts. Calls to external targets go through per-target circuit breakers,
//! a fallback manager that degrades gracefully, and a concurrency throttler. A
//! reconciler retries failed jobs with exponential backoff and moves exhausted
//! ones to a dead-letter queue; a resource monitor resizes the worker pool. A
//! health monitor scores the engine's components and raises threshold alerts.
//!
//! [`engine::Engine`] wires everything together.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod metrics;
pub mod resilience;
pub mod resources;
pub mod scheduler;
pub mod tasks;

pub use config::{ConfigError, EngineConfig, ServicePolicies};
pub use engine::{Engine, EngineBuilder, EngineError};
pub use error::{ErrorKind, TaskError};
