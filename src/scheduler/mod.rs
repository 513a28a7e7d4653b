//! Durable job scheduling and execution.
//!
//! - **JobStore**: persistent job records (SQLite or Redis) with atomic claims
//! - **JobManager**: submission, cancellation, dead-letter handling and the reconciler
//! - **WorkerPool**: workers that run jobs inside execution contexts
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  JobManager  │◄── submit / cancel / replay
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │   JobStore   │◄── reconciler (timeouts, retries, DLQ)
//!                      │ sqlite/redis │
//!                      └──────┬───────┘
//!                             │ claim
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └──── breaker / fallback / throttler ───┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use job_forge::scheduler::{JobStore, NewJob};
//! use serde_json::json;
//!
//! let store = JobStore::connect("sqlite://./jobs.db").await?;
//! let job = store
//!     .submit(NewJob::new("echo").with_params(json!({"hello": "world"})))
//!     .await?;
//! println!("queued {}", job.job_id);
//! ```

pub mod context;
pub mod job;
pub mod manager;
pub mod store;
pub mod worker_pool;

pub use context::{
    ContextError, ContextLease, ContextPool, ContextProvider, ExecutionContext,
    LocalContextProvider,
};
pub use job::{DeadLetterEntry, DlqStats, JobRecord, JobStatus, NewJob, QueueStats};
pub use manager::{
    CancellationRegistry, JobManager, JobView, ManagerConfig, ManagerError, ManagerStats,
    ReconcileReport, RunningJob,
};
pub use store::{JobBackend, JobFailure, JobStore, StoreError};
pub use worker_pool::{PoolDeps, PoolError, PoolStats, WorkerPool, WorkerPoolConfig, WorkerStatus};
