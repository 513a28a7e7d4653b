//! Durable job storage.
//!
//! [`JobBackend`] is the persistence seam: every lifecycle transition is a
//! single guarded, atomic operation in the backing store, so two workers can
//! never both hold a job and a stale worker can never overwrite a job that has
//! moved on. [`JobStore`] wraps a backend with blocking dequeue and one-shot
//! crash recovery.
//!
//! ```text
//!   submit ──► queued ──claim──► running ──► finished
//!                ▲                  │
//!                │                  ▼
//!                ├──── requeue ─── error ──► dead_letter
//!                │                                │
//!                └──────────── replay ────────────┘
//! ```

pub mod redis;
pub mod sqlite;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ErrorKind, TaskError};
use crate::scheduler::job::{
    DeadLetterEntry, DlqStats, JobRecord, JobStatus, NewJob, QueueStats, CANCELLED_REASON,
    TIMED_OUT_REASON,
};

pub use self::redis::RedisJobBackend;
pub use self::sqlite::SqliteJobBackend;

/// How often a blocked `dequeue` re-polls the backend without a wakeup.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Errors from job storage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Unsupported database URL: {0}")]
    UnsupportedUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis operation failed: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt job record {job_id}: {message}")]
    Corrupt { job_id: String, message: String },
}

/// Failure details written by `mark_error`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub message: String,
    pub kind: Option<ErrorKind>,
    pub retryable: bool,
}

impl JobFailure {
    pub fn from_task_error(err: &TaskError, retryable: bool) -> Self {
        Self {
            message: err.message.clone(),
            kind: Some(err.kind),
            retryable,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            message: CANCELLED_REASON.to_string(),
            kind: None,
            retryable: false,
        }
    }

    /// A running job reclaimed by the reconciler.
    pub fn timed_out() -> Self {
        Self {
            message: TIMED_OUT_REASON.to_string(),
            kind: Some(ErrorKind::Timeout),
            retryable: true,
        }
    }
}

/// Pluggable persistence for job records, the pending queue and the
/// dead-letter set.
///
/// Transitions return [`StoreError::InvalidTransition`] when their guard does
/// not hold and [`StoreError::JobNotFound`] for unknown ids.
#[async_trait]
pub trait JobBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn insert(&self, record: &JobRecord) -> Result<(), StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError>;

    /// Moves the highest-priority, oldest queued job to `running` for
    /// `worker_id`. At most one caller receives a given job.
    async fn claim(&self, worker_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// `running -> finished`; only the owning worker may finish a job.
    async fn mark_finished(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: Value,
    ) -> Result<JobRecord, StoreError>;

    /// `running -> error`. With `worker_id` set, only that worker's claim matches.
    async fn mark_error(
        &self,
        job_id: Uuid,
        worker_id: Option<&str>,
        failure: &JobFailure,
    ) -> Result<JobRecord, StoreError>;

    /// `error -> queued` with `retry_count + 1`, while retries remain and no
    /// cancel was requested.
    async fn requeue_for_retry(&self, job_id: Uuid) -> Result<JobRecord, StoreError>;

    /// `error -> dead_letter`.
    async fn move_to_dead_letter(&self, job_id: Uuid, reason: &str)
        -> Result<JobRecord, StoreError>;

    /// `dead_letter -> queued`, optionally resetting `retry_count`.
    async fn replay_dead_letter(
        &self,
        job_id: Uuid,
        reset_retries: bool,
    ) -> Result<JobRecord, StoreError>;

    /// Sets the cancel flag. False when the job already reached a terminal state.
    async fn request_cancel(&self, job_id: Uuid) -> Result<bool, StoreError>;

    /// Refreshes `last_heartbeat` of a job `worker_id` is running.
    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<bool, StoreError>;

    /// Puts every `running` job back in the queue; returns their ids.
    async fn recover_running(&self) -> Result<Vec<Uuid>, StoreError>;

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Dead-lettered jobs, newest first.
    async fn dead_letter_page(&self, start: usize, count: usize)
        -> Result<Vec<JobRecord>, StoreError>;

    async fn queue_stats(&self) -> Result<QueueStats, StoreError>;

    async fn dlq_stats(&self) -> Result<DlqStats, StoreError>;
}

/// Opens the backend selected by the URL scheme (`sqlite:` or `redis://`).
pub async fn open_backend(url: &str) -> Result<Arc<dyn JobBackend>, StoreError> {
    if url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteJobBackend::connect(url).await?))
    } else if url.starts_with("redis://") || url.starts_with("rediss://") {
        Ok(Arc::new(
            RedisJobBackend::connect(url, redis::DEFAULT_NAMESPACE).await?,
        ))
    } else {
        Err(StoreError::UnsupportedUrl(url.to_string()))
    }
}

/// A backend plus blocking dequeue and once-only crash recovery.
pub struct JobStore {
    backend: Arc<dyn JobBackend>,
    available: Notify,
    poll_interval: Duration,
    recovered: AtomicBool,
}

impl JobStore {
    pub fn new(backend: Arc<dyn JobBackend>) -> Self {
        Self {
            backend,
            available: Notify::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            recovered: AtomicBool::new(false),
        }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(open_backend(url).await?))
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Persists a new queued job and wakes one waiting worker.
    pub async fn submit(&self, new: NewJob) -> Result<JobRecord, StoreError> {
        let record = JobRecord::from_new(new);
        self.backend.insert(&record).await?;
        debug!(
            job_id = %record.job_id,
            task = %record.task_name,
            priority = record.priority,
            "Job persisted"
        );
        self.available.notify_one();
        Ok(record)
    }

    /// Claims the next job without waiting.
    pub async fn try_dequeue(&self, worker_id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.backend.claim(worker_id).await
    }

    /// Blocks until a job is claimed for `worker_id`; `None` once `cancel` fires.
    pub async fn dequeue(
        &self,
        worker_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<JobRecord>, StoreError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let woken = self.available.notified();
            if let Some(record) = self.backend.claim(worker_id).await? {
                return Ok(Some(record));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = woken => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        self.backend.get(job_id).await
    }

    pub async fn mark_finished(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: Value,
    ) -> Result<JobRecord, StoreError> {
        self.backend.mark_finished(job_id, worker_id, result).await
    }

    pub async fn mark_error(
        &self,
        job_id: Uuid,
        worker_id: Option<&str>,
        failure: &JobFailure,
    ) -> Result<JobRecord, StoreError> {
        self.backend.mark_error(job_id, worker_id, failure).await
    }

    pub async fn requeue_for_retry(&self, job_id: Uuid) -> Result<JobRecord, StoreError> {
        let record = self.backend.requeue_for_retry(job_id).await?;
        self.available.notify_one();
        Ok(record)
    }

    pub async fn move_to_dead_letter(
        &self,
        job_id: Uuid,
        reason: &str,
    ) -> Result<JobRecord, StoreError> {
        self.backend.move_to_dead_letter(job_id, reason).await
    }

    pub async fn replay_dead_letter(
        &self,
        job_id: Uuid,
        reset_retries: bool,
    ) -> Result<JobRecord, StoreError> {
        let record = self.backend.replay_dead_letter(job_id, reset_retries).await?;
        info!(
            job_id = %job_id,
            reset_retries,
            retry_count = record.retry_count,
            "Replayed dead-letter job"
        );
        self.available.notify_one();
        Ok(record)
    }

    pub async fn request_cancel(&self, job_id: Uuid) -> Result<bool, StoreError> {
        self.backend.request_cancel(job_id).await
    }

    pub async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        self.backend.heartbeat(job_id, worker_id).await
    }

    /// Requeues jobs left `running` by a previous process. Only the first call
    /// per store does anything.
    pub async fn recover_running(&self) -> Result<Vec<Uuid>, StoreError> {
        if self.recovered.swap(true, Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let recovered = self.backend.recover_running().await?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovered jobs left running by a previous process");
            self.available.notify_waiters();
        }
        Ok(recovered)
    }

    pub async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        self.backend.list_by_status(status, limit).await
    }

    pub async fn get_dead_letter_jobs(
        &self,
        start: usize,
        count: usize,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let records = self.backend.dead_letter_page(start, count).await?;
        Ok(records.iter().map(JobRecord::to_dead_letter_entry).collect())
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        self.backend.queue_stats().await
    }

    pub async fn dlq_stats(&self) -> Result<DlqStats, StoreError> {
        self.backend.dlq_stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn sqlite_store(dir: &tempfile::TempDir) -> JobStore {
        let backend = SqliteJobBackend::open(&dir.path().join("jobs.db"))
            .await
            .unwrap();
        JobStore::new(Arc::new(backend)).with_poll_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_unsupported_url() {
        let err = JobStore::connect("postgres://localhost/jobs").await.err().unwrap();
        assert!(matches!(err, StoreError::UnsupportedUrl(_)));
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_submit() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(sqlite_store(&dir).await);
        let cancel = CancellationToken::new();

        let waiter = {
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            tokio::spawn(async move { store.dequeue("w-1", &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let submitted = store
            .submit(NewJob::new("echo").with_params(json!({"n": 1})))
            .await
            .unwrap();

        let claimed = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(claimed.job_id, submitted.job_id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.worker_id.as_deref(), Some("w-1"));
    }

    #[tokio::test]
    async fn test_dequeue_returns_none_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(store.dequeue("w-1", &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_running_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir).await;
        let job = store.submit(NewJob::new("echo")).await.unwrap();
        store.try_dequeue("w-1").await.unwrap().unwrap();

        assert_eq!(store.recover_running().await.unwrap(), vec![job.job_id]);
        let record = store.get(job.job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert!(record.worker_id.is_none());

        store.try_dequeue("w-2").await.unwrap().unwrap();
        assert!(store.recover_running().await.unwrap().is_empty());
        let record = store.get(job.job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_dead_letter_entries_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = sqlite_store(&dir).await;

        let mut ids = Vec::new();
        for n in 0..3 {
            let job = store
                .submit(NewJob::new("fail").with_params(json!({ "n": n })))
                .await
                .unwrap();
            store.try_dequeue("w-1").await.unwrap().unwrap();
            store
                .mark_error(job.job_id, Some("w-1"), &JobFailure::timed_out())
                .await
                .unwrap();
            store
                .move_to_dead_letter(job.job_id, "max_retries_exceeded")
                .await
                .unwrap();
            ids.push(job.job_id);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let page = store.get_dead_letter_jobs(0, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].job_id, ids[2]);
        assert_eq!(page[1].job_id, ids[1]);
        assert_eq!(page[0].reason.as_deref(), Some("max_retries_exceeded"));
        assert_eq!(page[0].error.as_deref(), Some(TIMED_OUT_REASON));
        assert_eq!(page[0].worker_id.as_deref(), Some("w-1"));

        let rest = store.get_dead_letter_jobs(2, 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].job_id, ids[0]);
    }
}
