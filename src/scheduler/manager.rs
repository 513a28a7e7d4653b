//! Job lifecycle policy.
//!
//! The [`JobManager`] validates submissions, answers status queries, routes
//! cancellation and runs the reconciliation loop that reclaims timed-out jobs,
//! requeues failures with exponential backoff and dead-letters exhausted ones.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{
    backoff_delay, DeadLetterEntry, DlqStats, JobRecord, JobStatus, NewJob, QueueStats,
    CANCELLED_REASON, MAX_PRIORITY, REASON_MAX_RETRIES, REASON_NON_RETRYABLE,
};
use super::store::{JobFailure, JobStore, StoreError};
use crate::config::EngineConfig;
use crate::metrics::MetricsCollector;
use crate::tasks::TaskRegistry;

/// Most records one reconciliation pass inspects per status.
const SCAN_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Job {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ManagerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::JobNotFound(id) => ManagerError::NotFound(id),
            other => ManagerError::Store(other),
        }
    }
}

/// Reconciliation and retry settings.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub reconcile_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Extra time a running job gets past its own timeout before it is reclaimed.
    pub timeout_grace: Duration,
    /// Running jobs without a heartbeat for this long are reclaimed.
    pub heartbeat_stale: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for ManagerConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            reconcile_interval: config.reconcile_interval,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
            timeout_grace: config.timeout_grace,
            heartbeat_stale: config.heartbeat_stale,
        }
    }
}

/// Cancellation tokens of the jobs running in this process.
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or returns) the token for `job_id`.
    pub fn register(&self, job_id: Uuid) -> CancellationToken {
        self.tokens.lock().entry(job_id).or_default().clone()
    }

    pub fn unregister(&self, job_id: Uuid) {
        self.tokens.lock().remove(&job_id);
    }

    /// Fires the token of `job_id`; false when the job is not running here.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.tokens.lock().get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.tokens.lock().contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

/// A job record plus how long it has been running.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub record: JobRecord,
    pub elapsed_seconds: Option<u64>,
    /// e.g. `queued` or `running 3m 5s`.
    pub status_display: String,
}

impl JobView {
    pub fn new(record: JobRecord, now: DateTime<Utc>) -> Self {
        Self {
            elapsed_seconds: record.elapsed_seconds(now),
            status_display: record.status_display(now),
            record,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunningJob {
    pub job_id: Uuid,
    pub task_name: String,
    pub worker_id: Option<String>,
    pub priority: i32,
    pub elapsed_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub queue: QueueStats,
    pub running: Vec<RunningJob>,
    /// Jobs with a live cancellation token in this process.
    pub local_jobs: usize,
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub cancel_signals: usize,
    pub timed_out: usize,
    pub requeued: usize,
    /// Includes failed jobs whose cancellation arrived after the failure.
    pub dead_lettered: usize,
}

pub struct JobManager {
    store: Arc<JobStore>,
    tasks: Arc<TaskRegistry>,
    cancellations: Arc<CancellationRegistry>,
    config: ManagerConfig,
    metrics: MetricsCollector,
}

impl JobManager {
    pub fn new(
        store: Arc<JobStore>,
        tasks: Arc<TaskRegistry>,
        cancellations: Arc<CancellationRegistry>,
        config: ManagerConfig,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            store,
            tasks,
            cancellations,
            config,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn cancellations(&self) -> &Arc<CancellationRegistry> {
        &self.cancellations
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn validate(&self, new: &NewJob) -> Result<(), ManagerError> {
        if !self.tasks.contains(&new.task_name) {
            return Err(ManagerError::UnknownTask(new.task_name.clone()));
        }
        if new.timeout_seconds == 0 {
            return Err(ManagerError::InvalidJob(
                "timeout_seconds must be positive".to_string(),
            ));
        }
        if !(0..=MAX_PRIORITY).contains(&new.priority) {
            return Err(ManagerError::InvalidJob(format!(
                "priority must be between 0 and {}, got {}",
                MAX_PRIORITY, new.priority
            )));
        }
        if !matches!(new.params, Value::Object(_)) {
            return Err(ManagerError::InvalidJob(
                "params must be a JSON object".to_string(),
            ));
        }
        Ok(())
    }

    /// Validates and persists a job; returns its id.
    pub async fn submit_job(&self, new: NewJob) -> Result<Uuid, ManagerError> {
        self.validate(&new)?;
        let record = self.store.submit(new).await?;
        info!(
            job_id = %record.job_id,
            task = %record.task_name,
            priority = record.priority,
            timeout_seconds = record.timeout_seconds,
            max_retries = record.max_retries,
            "Job submitted"
        );
        Ok(record.job_id)
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> Result<JobView, ManagerError> {
        let record = self
            .store
            .get(job_id)
            .await?
            .ok_or(ManagerError::NotFound(job_id))?;
        Ok(JobView::new(record, Utc::now()))
    }

    /// Requests cancellation. False when the job already finished or was
    /// dead-lettered.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool, ManagerError> {
        if !self.store.request_cancel(job_id).await? {
            debug!(job_id = %job_id, "Cancel refused, job already terminal");
            return Ok(false);
        }
        let signalled = self.cancellations.cancel(job_id);
        info!(job_id = %job_id, signalled, "Job cancellation requested");
        Ok(true)
    }

    pub async fn list_dead_letter(
        &self,
        start: usize,
        count: usize,
    ) -> Result<Vec<DeadLetterEntry>, ManagerError> {
        Ok(self.store.get_dead_letter_jobs(start, count).await?)
    }

    pub async fn replay_dead_letter(
        &self,
        job_id: Uuid,
        reset_retries: bool,
    ) -> Result<JobRecord, ManagerError> {
        Ok(self.store.replay_dead_letter(job_id, reset_retries).await?)
    }

    pub async fn dlq_stats(&self) -> Result<DlqStats, ManagerError> {
        Ok(self.store.dlq_stats().await?)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, ManagerError> {
        Ok(self.store.queue_stats().await?)
    }

    pub async fn get_stats(&self) -> Result<ManagerStats, ManagerError> {
        let now = Utc::now();
        let queue = self.store.queue_stats().await?;
        let running = self
            .store
            .list_by_status(JobStatus::Running, SCAN_LIMIT)
            .await?
            .into_iter()
            .map(|record| RunningJob {
                elapsed_seconds: record.elapsed_seconds(now),
                job_id: record.job_id,
                task_name: record.task_name,
                worker_id: record.worker_id,
                priority: record.priority,
            })
            .collect();
        Ok(ManagerStats {
            queue,
            running,
            local_jobs: self.cancellations.len(),
        })
    }

    /// Whether a running job has outlived its timeout or lost its heartbeat.
    fn is_overdue(&self, record: &JobRecord, now: DateTime<Utc>) -> bool {
        let since = |t: Option<DateTime<Utc>>| {
            t.and_then(|t| (now - t).to_std().ok())
                .unwrap_or(Duration::ZERO)
        };
        let limit = Duration::from_secs(record.timeout_seconds) + self.config.timeout_grace;
        since(record.started_at) > limit || since(record.last_heartbeat) > self.config.heartbeat_stale
    }

    /// One reconciliation pass.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, ManagerError> {
        let mut report = ReconcileReport::default();
        let now = Utc::now();

        for record in self
            .store
            .list_by_status(JobStatus::Running, SCAN_LIMIT)
            .await?
        {
            if record.cancel_requested && self.cancellations.cancel(record.job_id) {
                report.cancel_signals += 1;
            }
            if !self.is_overdue(&record, now) {
                continue;
            }
            match self
                .store
                .mark_error(record.job_id, None, &JobFailure::timed_out())
                .await
            {
                Ok(_) => {
                    warn!(
                        job_id = %record.job_id,
                        task = %record.task_name,
                        worker_id = record.worker_id.as_deref().unwrap_or("-"),
                        timeout_seconds = record.timeout_seconds,
                        "Reclaimed timed-out job"
                    );
                    self.cancellations.cancel(record.job_id);
                    self.metrics.record_job(&record.task_name, "timed_out", None);
                    report.timed_out += 1;
                }
                Err(StoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        for record in self.store.list_by_status(JobStatus::Error, SCAN_LIMIT).await? {
            // Cancelled by its worker; already in its final state.
            if record.was_cancelled() {
                continue;
            }

            let reason = if record.cancel_requested {
                Some(CANCELLED_REASON)
            } else if !record.retryable {
                Some(REASON_NON_RETRYABLE)
            } else if !record.has_retries_left() {
                Some(REASON_MAX_RETRIES)
            } else {
                None
            };

            let outcome = match reason {
                Some(reason) => self
                    .store
                    .move_to_dead_letter(record.job_id, reason)
                    .await
                    .map(|dead| {
                        warn!(
                            job_id = %dead.job_id,
                            task = %dead.task_name,
                            retry_count = dead.retry_count,
                            reason = reason,
                            error = dead.error.as_deref().unwrap_or(""),
                            "Job moved to dead-letter queue"
                        );
                        self.metrics.record_job(&dead.task_name, "dead_letter", None);
                        report.dead_lettered += 1;
                    }),
                None => {
                    let delay =
                        backoff_delay(record.retry_count, self.config.backoff_base, self.config.backoff_max);
                    let waited = record
                        .finished_at
                        .and_then(|t| (now - t).to_std().ok())
                        .unwrap_or(Duration::ZERO);
                    if waited < delay {
                        continue;
                    }
                    self.store.requeue_for_retry(record.job_id).await.map(|queued| {
                        info!(
                            job_id = %queued.job_id,
                            task = %queued.task_name,
                            retry_count = queued.retry_count,
                            max_retries = queued.max_retries,
                            backoff_ms = delay.as_millis() as u64,
                            "Job requeued for retry"
                        );
                        self.metrics.record_job(&queued.task_name, "retried", None);
                        report.requeued += 1;
                    })
                }
            };

            match outcome {
                Ok(()) | Err(StoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let stats = self.store.queue_stats().await?;
        for status in JobStatus::ALL {
            self.metrics.set_queue_depth(status.as_str(), stats.count(status));
        }

        if report != ReconcileReport::default() {
            debug!(?report, "Reconciliation pass");
        }
        Ok(report)
    }

    /// Runs `reconcile_once` every `reconcile_interval` until `cancel` fires.
    pub async fn run_reconciler(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            interval_ms = self.config.reconcile_interval.as_millis() as u64,
            "Reconciler started"
        );
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        error!(error = %e, "Reconciliation pass failed");
                    }
                }
            }
        }
        info!("Reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::store::SqliteJobBackend;
    use serde_json::json;

    async fn manager(dir: &tempfile::TempDir, config: ManagerConfig) -> JobManager {
        let backend = SqliteJobBackend::open(&dir.path().join("jobs.db"))
            .await
            .unwrap();
        JobManager::new(
            Arc::new(JobStore::new(Arc::new(backend))),
            Arc::new(TaskRegistry::with_builtin_tasks()),
            Arc::new(CancellationRegistry::new()),
            config,
            MetricsCollector::disabled(),
        )
    }

    fn fast_config() -> ManagerConfig {
        ManagerConfig {
            reconcile_interval: Duration::from_millis(10),
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
            timeout_grace: Duration::ZERO,
            heartbeat_stale: Duration::from_secs(120),
        }
    }

    async fn claim_and_fail(m: &JobManager, job_id: Uuid, failure: JobFailure) {
        let claimed = m.store().try_dequeue("w-1").await.unwrap().unwrap();
        assert_eq!(claimed.job_id, job_id);
        m.store()
            .mark_error(job_id, Some("w-1"), &failure)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, fast_config()).await;

        assert!(matches!(
            m.submit_job(NewJob::new("nope")).await,
            Err(ManagerError::UnknownTask(_))
        ));
        assert!(matches!(
            m.submit_job(NewJob::new("echo").with_timeout_seconds(0)).await,
            Err(ManagerError::InvalidJob(_))
        ));
        assert!(matches!(
            m.submit_job(NewJob::new("echo").with_priority(-1)).await,
            Err(ManagerError::InvalidJob(_))
        ));
        assert!(matches!(
            m.submit_job(NewJob::new("echo").with_priority(1001)).await,
            Err(ManagerError::InvalidJob(_))
        ));
        assert!(matches!(
            m.submit_job(NewJob::new("echo").with_params(json!([1, 2]))).await,
            Err(ManagerError::InvalidJob(_))
        ));

        let id = m
            .submit_job(NewJob::new("echo").with_priority(1000).with_max_retries(0))
            .await
            .unwrap();
        let view = m.get_job_status(id).await.unwrap();
        assert_eq!(view.record.status, JobStatus::Queued);
        assert_eq!(view.status_display, "queued");
        assert!(view.elapsed_seconds.is_none());
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, fast_config()).await;
        let id = Uuid::new_v4();
        assert!(matches!(m.get_job_status(id).await, Err(ManagerError::NotFound(_))));
        assert!(matches!(m.cancel_job(id).await, Err(ManagerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_signals_local_token() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, fast_config()).await;
        let id = m.submit_job(NewJob::new("sleep")).await.unwrap();
        m.store().try_dequeue("w-1").await.unwrap().unwrap();
        let token = m.cancellations().register(id);

        assert!(m.cancel_job(id).await.unwrap());
        assert!(token.is_cancelled());
        assert!(m.get_job_status(id).await.unwrap().record.cancel_requested);
    }

    #[tokio::test]
    async fn test_cancel_finished_job_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, fast_config()).await;
        let id = m.submit_job(NewJob::new("echo")).await.unwrap();
        m.store().try_dequeue("w-1").await.unwrap().unwrap();
        m.store().mark_finished(id, "w-1", json!({})).await.unwrap();
        assert!(!m.cancel_job(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_reconcile_requeues_then_dead_letters() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, fast_config()).await;
        let id = m
            .submit_job(NewJob::new("fail").with_max_retries(2))
            .await
            .unwrap();

        for attempt in 1..=2 {
            claim_and_fail(&m, id, JobFailure::timed_out()).await;
            let report = m.reconcile_once().await.unwrap();
            assert_eq!(report.requeued, 1);
            let view = m.get_job_status(id).await.unwrap();
            assert_eq!(view.record.status, JobStatus::Queued);
            assert_eq!(view.record.retry_count, attempt);
        }

        claim_and_fail(&m, id, JobFailure::timed_out()).await;
        let report = m.reconcile_once().await.unwrap();
        assert_eq!(report.dead_lettered, 1);

        let dead = m.list_dead_letter(0, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 2);
        assert_eq!(dead[0].reason.as_deref(), Some(REASON_MAX_RETRIES));

        let replayed = m.replay_dead_letter(id, true).await.unwrap();
        assert_eq!(replayed.status, JobStatus::Queued);
        assert_eq!(replayed.retry_count, 0);
    }

    #[tokio::test]
    async fn test_non_retryable_goes_straight_to_dead_letter() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, fast_config()).await;
        let id = m.submit_job(NewJob::new("fail")).await.unwrap();
        let failure = JobFailure {
            message: "bad markup".to_string(),
            kind: Some(crate::error::ErrorKind::Parsing),
            retryable: false,
        };
        claim_and_fail(&m, id, failure).await;

        let report = m.reconcile_once().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        let view = m.get_job_status(id).await.unwrap();
        assert_eq!(view.record.status, JobStatus::DeadLetter);
        assert_eq!(view.record.retry_count, 0);
        assert_eq!(
            view.record.dead_letter_reason.as_deref(),
            Some(REASON_NON_RETRYABLE)
        );
    }

    #[tokio::test]
    async fn test_cancel_after_failure_dead_letters_instead_of_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, fast_config()).await;
        let id = m
            .submit_job(NewJob::new("fail").with_max_retries(3))
            .await
            .unwrap();
        claim_and_fail(&m, id, JobFailure::timed_out()).await;
        assert!(m.cancel_job(id).await.unwrap());

        let report = m.reconcile_once().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.requeued, 0);

        let view = m.get_job_status(id).await.unwrap();
        assert_eq!(view.record.status, JobStatus::DeadLetter);
        assert_eq!(view.record.dead_letter_reason.as_deref(), Some(CANCELLED_REASON));
        assert!(!m.cancel_job(id).await.unwrap());

        // A second pass leaves it alone.
        assert_eq!(m.reconcile_once().await.unwrap(), ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_worker_cancelled_job_stays_put() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, fast_config()).await;
        let id = m.submit_job(NewJob::new("sleep")).await.unwrap();
        m.store().try_dequeue("w-1").await.unwrap().unwrap();
        assert!(m.cancel_job(id).await.unwrap());
        m.store()
            .mark_error(id, Some("w-1"), &JobFailure::cancelled())
            .await
            .unwrap();

        assert_eq!(m.reconcile_once().await.unwrap().dead_lettered, 0);
        let view = m.get_job_status(id).await.unwrap();
        assert_eq!(view.record.status, JobStatus::Error);
        assert_eq!(view.record.error.as_deref(), Some(CANCELLED_REASON));
    }

    #[tokio::test]
    async fn test_backoff_delays_requeue() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        config.backoff_base = Duration::from_secs(3600);
        config.backoff_max = Duration::from_secs(7200);
        let m = manager(&dir, config).await;
        let id = m.submit_job(NewJob::new("fail")).await.unwrap();
        claim_and_fail(&m, id, JobFailure::timed_out()).await;

        let report = m.reconcile_once().await.unwrap();
        assert_eq!(report, ReconcileReport::default());
        assert_eq!(
            m.get_job_status(id).await.unwrap().record.status,
            JobStatus::Error
        );
    }

    #[tokio::test]
    async fn test_cancelled_errors_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, fast_config()).await;
        let id = m.submit_job(NewJob::new("sleep")).await.unwrap();
        claim_and_fail(&m, id, JobFailure::cancelled()).await;

        let report = m.reconcile_once().await.unwrap();
        assert_eq!(report, ReconcileReport::default());
        let view = m.get_job_status(id).await.unwrap();
        assert!(view.record.was_cancelled());
    }

    #[tokio::test]
    async fn test_reconcile_reclaims_overdue_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fast_config();
        config.heartbeat_stale = Duration::from_millis(300);
        config.backoff_base = Duration::from_secs(3600);
        config.backoff_max = Duration::from_secs(3600);
        let m = manager(&dir, config).await;

        let id = m.submit_job(NewJob::new("sleep")).await.unwrap();
        m.store().try_dequeue("w-1").await.unwrap().unwrap();
        let token = m.cancellations().register(id);

        assert_eq!(m.reconcile_once().await.unwrap().timed_out, 0);
        tokio::time::sleep(Duration::from_millis(500)).await;

        let report = m.reconcile_once().await.unwrap();
        assert_eq!(report.timed_out, 1);
        assert!(token.is_cancelled());

        let view = m.get_job_status(id).await.unwrap();
        assert_eq!(view.record.status, JobStatus::Error);
        assert_eq!(view.record.error.as_deref(), Some(crate::scheduler::job::TIMED_OUT_REASON));
        assert_eq!(view.record.error_kind, Some(crate::error::ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_stats_list_running_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, fast_config()).await;
        let id = m.submit_job(NewJob::new("sleep")).await.unwrap();
        m.submit_job(NewJob::new("echo")).await.unwrap();
        m.store().try_dequeue("w-1").await.unwrap().unwrap();

        let stats = m.get_stats().await.unwrap();
        assert_eq!(stats.queue.running, 1);
        assert_eq!(stats.queue.queued, 1);
        assert_eq!(stats.running.len(), 1);
        assert_eq!(stats.running[0].job_id, id);
        assert_eq!(stats.running[0].worker_id.as_deref(), Some("w-1"));
    }

    #[test]
    fn test_cancellation_registry() {
        let registry = CancellationRegistry::new();
        let id = Uuid::new_v4();
        assert!(!registry.cancel(id));

        let token = registry.register(id);
        assert!(registry.contains(id));
        assert!(registry.cancel(id));
        assert!(token.is_cancelled());

        registry.unregister(id);
        assert!(registry.is_empty());
    }
}
