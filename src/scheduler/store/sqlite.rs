//! SQLite job backend.
//!
//! One `jobs` table holds every record. The pending queue is the set of
//! `queued` rows ordered by `priority DESC, queue_seq ASC`; `queue_seq` is
//! refreshed whenever a job re-enters the queue. Every transition is a single
//! `UPDATE ... WHERE <guard> RETURNING *`, so SQLite's write lock serializes
//! concurrent mutations of the same job.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{JobBackend, JobFailure, StoreError};
use crate::error::ErrorKind;
use crate::scheduler::job::{DlqStats, JobRecord, JobStatus, QueueStats};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id          TEXT    PRIMARY KEY,
    task_name       TEXT    NOT NULL,
    params          TEXT    NOT NULL,
    status          TEXT    NOT NULL,
    priority        INTEGER NOT NULL DEFAULT 0,
    queue_seq       INTEGER NOT NULL,

    created_at      TEXT    NOT NULL,
    started_at      TEXT,
    finished_at     TEXT,

    result          TEXT,
    error           TEXT,
    error_kind      TEXT,
    retryable       INTEGER NOT NULL DEFAULT 1,

    retry_count     INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER NOT NULL,
    timeout_seconds INTEGER NOT NULL,
    worker_id       TEXT,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    last_heartbeat  TEXT,

    dead_lettered_at TEXT,
    dead_letter_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_dequeue ON jobs(status, priority DESC, queue_seq ASC);
CREATE INDEX IF NOT EXISTS idx_jobs_dead_letter ON jobs(status, dead_lettered_at);
"#;

const NEXT_SEQ: &str = "(SELECT COALESCE(MAX(queue_seq), 0) + 1 FROM jobs)";

#[derive(Clone)]
pub struct SqliteJobBackend {
    pool: SqlitePool,
}

impl SqliteJobBackend {
    /// Opens (creating if needed) the database at `url`, e.g. `sqlite://./jobs.db`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        tracing::info!(url = url, "Job database opened");
        Ok(Self { pool })
    }

    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        Self::connect(&format!("sqlite://{}", path.display())).await
    }

    /// Turns the row of a guarded update into a record, or explains why the
    /// guard did not match.
    async fn guarded(
        &self,
        job_id: Uuid,
        to: JobStatus,
        row: Option<SqliteRow>,
    ) -> Result<JobRecord, StoreError> {
        match row {
            Some(row) => record_from_row(&row),
            None => match self.get(job_id).await? {
                Some(current) => Err(StoreError::InvalidTransition {
                    job_id,
                    from: current.status,
                    to,
                }),
                None => Err(StoreError::JobNotFound(job_id)),
            },
        }
    }
}

fn corrupt(job_id: &str, message: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        job_id: job_id.to_string(),
        message: message.into(),
    }
}

fn record_from_row(row: &SqliteRow) -> Result<JobRecord, StoreError> {
    let id: String = row.try_get("job_id")?;
    let job_id = Uuid::parse_str(&id).map_err(|e| corrupt(&id, e.to_string()))?;
    let status: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status).map_err(|e| corrupt(&id, e))?;
    let params: String = row.try_get("params")?;
    let result: Option<String> = row.try_get("result")?;
    let error_kind: Option<String> = row.try_get("error_kind")?;
    let error_kind = error_kind
        .map(|k| ErrorKind::from_str(&k))
        .transpose()
        .map_err(|e| corrupt(&id, e))?;

    Ok(JobRecord {
        job_id,
        task_name: row.try_get("task_name")?,
        params: serde_json::from_str(&params)?,
        status,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        error: row.try_get("error")?,
        error_kind,
        retryable: row.try_get::<i64, _>("retryable")? != 0,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        max_retries: row.try_get::<i64, _>("max_retries")? as u32,
        timeout_seconds: row.try_get::<i64, _>("timeout_seconds")? as u64,
        priority: row.try_get::<i64, _>("priority")? as i32,
        worker_id: row.try_get("worker_id")?,
        cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
        last_heartbeat: row.try_get("last_heartbeat")?,
        dead_lettered_at: row.try_get("dead_lettered_at")?,
        dead_letter_reason: row.try_get("dead_letter_reason")?,
    })
}

#[async_trait]
impl JobBackend for SqliteJobBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO jobs (
                job_id, task_name, params, status, priority, queue_seq, created_at,
                retryable, retry_count, max_retries, timeout_seconds, cancel_requested
             ) VALUES (?1, ?2, ?3, ?4, ?5, {NEXT_SEQ}, ?6, ?7, ?8, ?9, ?10, ?11)"
        );
        sqlx::query(&sql)
            .bind(record.job_id.to_string())
            .bind(&record.task_name)
            .bind(serde_json::to_string(&record.params)?)
            .bind(record.status.as_str())
            .bind(record.priority as i64)
            .bind(record.created_at)
            .bind(record.retryable as i64)
            .bind(record.retry_count as i64)
            .bind(record.max_retries as i64)
            .bind(record.timeout_seconds as i64)
            .bind(record.cancel_requested as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(
            "UPDATE jobs
             SET status = 'running', worker_id = ?1, started_at = ?2, last_heartbeat = ?2,
                 finished_at = NULL
             WHERE job_id = (
                 SELECT job_id FROM jobs WHERE status = 'queued'
                 ORDER BY priority DESC, queue_seq ASC LIMIT 1
             ) AND status = 'queued'
             RETURNING *",
        )
        .bind(worker_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn mark_finished(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: Value,
    ) -> Result<JobRecord, StoreError> {
        let row = sqlx::query(
            "UPDATE jobs
             SET status = 'finished', finished_at = ?3, result = ?4,
                 error = NULL, error_kind = NULL
             WHERE job_id = ?1 AND status = 'running' AND worker_id = ?2
             RETURNING *",
        )
        .bind(job_id.to_string())
        .bind(worker_id)
        .bind(Utc::now())
        .bind(serde_json::to_string(&result)?)
        .fetch_optional(&self.pool)
        .await?;
        self.guarded(job_id, JobStatus::Finished, row).await
    }

    async fn mark_error(
        &self,
        job_id: Uuid,
        worker_id: Option<&str>,
        failure: &JobFailure,
    ) -> Result<JobRecord, StoreError> {
        let row = sqlx::query(
            "UPDATE jobs
             SET status = 'error', finished_at = ?3, error = ?4, error_kind = ?5, retryable = ?6
             WHERE job_id = ?1 AND status = 'running' AND (?2 IS NULL OR worker_id = ?2)
             RETURNING *",
        )
        .bind(job_id.to_string())
        .bind(worker_id)
        .bind(Utc::now())
        .bind(&failure.message)
        .bind(failure.kind.map(|k| k.as_str()))
        .bind(failure.retryable as i64)
        .fetch_optional(&self.pool)
        .await?;
        self.guarded(job_id, JobStatus::Error, row).await
    }

    async fn requeue_for_retry(&self, job_id: Uuid) -> Result<JobRecord, StoreError> {
        let sql = format!(
            "UPDATE jobs
             SET status = 'queued', retry_count = retry_count + 1, queue_seq = {NEXT_SEQ},
                 started_at = NULL, finished_at = NULL, worker_id = NULL, last_heartbeat = NULL
             WHERE job_id = ?1 AND status = 'error'
               AND retry_count < max_retries AND cancel_requested = 0
             RETURNING *"
        );
        let row = sqlx::query(&sql)
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        self.guarded(job_id, JobStatus::Queued, row).await
    }

    async fn move_to_dead_letter(
        &self,
        job_id: Uuid,
        reason: &str,
    ) -> Result<JobRecord, StoreError> {
        let row = sqlx::query(
            "UPDATE jobs
             SET status = 'dead_letter', dead_lettered_at = ?2, dead_letter_reason = ?3
             WHERE job_id = ?1 AND status = 'error'
             RETURNING *",
        )
        .bind(job_id.to_string())
        .bind(Utc::now())
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;
        self.guarded(job_id, JobStatus::DeadLetter, row).await
    }

    async fn replay_dead_letter(
        &self,
        job_id: Uuid,
        reset_retries: bool,
    ) -> Result<JobRecord, StoreError> {
        let sql = format!(
            "UPDATE jobs
             SET status = 'queued', queue_seq = {NEXT_SEQ},
                 retry_count = CASE WHEN ?2 THEN 0 ELSE retry_count END,
                 started_at = NULL, finished_at = NULL, worker_id = NULL, last_heartbeat = NULL,
                 result = NULL, error = NULL, error_kind = NULL, retryable = 1,
                 cancel_requested = 0, dead_lettered_at = NULL, dead_letter_reason = NULL
             WHERE job_id = ?1 AND status = 'dead_letter'
             RETURNING *"
        );
        let row = sqlx::query(&sql)
            .bind(job_id.to_string())
            .bind(reset_retries)
            .fetch_optional(&self.pool)
            .await?;
        self.guarded(job_id, JobStatus::Queued, row).await
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            "UPDATE jobs SET cancel_requested = 1
             WHERE job_id = ?1 AND status IN ('queued', 'running', 'error')",
        )
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated > 0 {
            return Ok(true);
        }
        match self.get(job_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::JobNotFound(job_id)),
        }
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            "UPDATE jobs SET last_heartbeat = ?3
             WHERE job_id = ?1 AND status = 'running' AND worker_id = ?2",
        )
        .bind(job_id.to_string())
        .bind(worker_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn recover_running(&self) -> Result<Vec<Uuid>, StoreError> {
        let sql = format!(
            "UPDATE jobs
             SET status = 'queued', queue_seq = {NEXT_SEQ},
                 started_at = NULL, worker_id = NULL, last_heartbeat = NULL
             WHERE status = 'running'
             RETURNING job_id"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let id: String = row.try_get("job_id")?;
                Uuid::parse_str(&id).map_err(|e| corrupt(&id, e.to_string()))
            })
            .collect()
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status = ?1
             ORDER BY priority DESC, queue_seq ASC LIMIT ?2",
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn dead_letter_page(
        &self,
        start: usize,
        count: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status = 'dead_letter'
             ORDER BY dead_lettered_at DESC, queue_seq DESC LIMIT ?1 OFFSET ?2",
        )
        .bind(count as i64)
        .bind(start as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            if let Ok(status) = JobStatus::from_str(&status) {
                stats.set(status, row.try_get::<i64, _>("n")? as u64);
            }
        }
        Ok(stats)
    }

    async fn dlq_stats(&self) -> Result<DlqStats, StoreError> {
        let since = Utc::now() - ChronoDuration::hours(24);
        let row = sqlx::query(
            "SELECT
                COUNT(*) AS total,
                SUM(CASE WHEN dead_lettered_at >= ?1 THEN 1 ELSE 0 END) AS recent
             FROM jobs WHERE status = 'dead_letter'",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        let total = row.try_get::<i64, _>("total")? as u64;
        let recent = row.try_get::<Option<i64>, _>("recent")?.unwrap_or(0) as u64;

        let oldest = self.dead_lettered_edge("ASC").await?;
        let newest = self.dead_lettered_edge("DESC").await?;

        Ok(DlqStats {
            total,
            recent_failures_24h: recent,
            oldest_failure: oldest,
            newest_failure: newest,
        })
    }
}

impl SqliteJobBackend {
    async fn dead_lettered_edge(&self, order: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let sql = format!(
            "SELECT dead_lettered_at FROM jobs WHERE status = 'dead_letter'
             ORDER BY dead_lettered_at {order} LIMIT 1"
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(row.try_get("dead_lettered_at")?),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::NewJob;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    async fn backend(dir: &tempfile::TempDir) -> SqliteJobBackend {
        SqliteJobBackend::open(&dir.path().join("jobs.db"))
            .await
            .unwrap()
    }

    async fn insert(backend: &SqliteJobBackend, new: NewJob) -> JobRecord {
        let record = JobRecord::from_new(new);
        backend.insert(&record).await.unwrap();
        record
    }

    async fn claim_and_fail(backend: &SqliteJobBackend, job_id: Uuid) -> JobRecord {
        let claimed = backend.claim("w-1").await.unwrap().unwrap();
        assert_eq!(claimed.job_id, job_id);
        backend
            .mark_error(job_id, Some("w-1"), &JobFailure::timed_out())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;
        let record = insert(
            &backend,
            NewJob::new("echo")
                .with_params(json!({"message": "hi"}))
                .with_priority(3)
                .with_timeout_seconds(60),
        )
        .await;

        let got = backend.get(record.job_id).await.unwrap().unwrap();
        assert_eq!(got.task_name, "echo");
        assert_eq!(got.params, json!({"message": "hi"}));
        assert_eq!(got.status, JobStatus::Queued);
        assert_eq!(got.priority, 3);
        assert_eq!(got.timeout_seconds, 60);
        assert!(got.retryable);
        assert!(backend.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_priority_then_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;

        let mut low = Vec::new();
        for n in 0..10 {
            low.push(
                insert(&backend, NewJob::new("echo").with_priority(5).with_params(json!({"n": n})))
                    .await
                    .job_id,
            );
        }
        let mut high = Vec::new();
        for n in 0..2 {
            high.push(
                insert(&backend, NewJob::new("echo").with_priority(10).with_params(json!({"n": n})))
                    .await
                    .job_id,
            );
        }

        let mut order = Vec::new();
        while let Some(job) = backend.claim("w-1").await.unwrap() {
            order.push(job.job_id);
        }
        assert_eq!(&order[..2], &high[..]);
        assert_eq!(&order[2..], &low[..]);
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(backend(&dir).await);
        for _ in 0..40 {
            insert(&backend, NewJob::new("echo")).await;
        }

        let mut handles = Vec::new();
        for w in 0..8 {
            let backend = Arc::clone(&backend);
            handles.push(tokio::spawn(async move {
                let worker = format!("w-{}", w);
                let mut claimed = Vec::new();
                while let Some(job) = backend.claim(&worker).await.unwrap() {
                    assert_eq!(job.worker_id.as_deref(), Some(worker.as_str()));
                    claimed.push(job.job_id);
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "job {} claimed twice", id);
            }
        }
        assert_eq!(seen.len(), 40);
    }

    #[tokio::test]
    async fn test_only_owner_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;
        let job = insert(&backend, NewJob::new("echo")).await;
        backend.claim("w-1").await.unwrap().unwrap();

        let err = backend
            .mark_finished(job.job_id, "w-2", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let done = backend
            .mark_finished(job.job_id, "w-1", json!({"ok": true}))
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Finished);
        assert_eq!(done.result, Some(json!({"ok": true})));
        assert!(done.finished_at.is_some());

        let err = backend
            .mark_error(job.job_id, None, &JobFailure::timed_out())
            .await
            .unwrap_err();
        match err {
            StoreError::InvalidTransition { from, to, .. } => {
                assert_eq!(from, JobStatus::Finished);
                assert_eq!(to, JobStatus::Error);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_job_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;
        let id = Uuid::new_v4();
        assert!(matches!(
            backend.requeue_for_retry(id).await,
            Err(StoreError::JobNotFound(_))
        ));
        assert!(matches!(
            backend.request_cancel(id).await,
            Err(StoreError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_until_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;
        let job = insert(&backend, NewJob::new("fail").with_max_retries(2)).await;

        for expected in 1..=2 {
            let failed = claim_and_fail(&backend, job.job_id).await;
            assert_eq!(failed.status, JobStatus::Error);
            assert_eq!(failed.error_kind, Some(ErrorKind::Timeout));
            let requeued = backend.requeue_for_retry(job.job_id).await.unwrap();
            assert_eq!(requeued.retry_count, expected);
            assert_eq!(requeued.status, JobStatus::Queued);
            assert!(requeued.worker_id.is_none());
        }

        claim_and_fail(&backend, job.job_id).await;
        assert!(matches!(
            backend.requeue_for_retry(job.job_id).await,
            Err(StoreError::InvalidTransition { .. })
        ));
        let dead = backend
            .move_to_dead_letter(job.job_id, "max_retries_exceeded")
            .await
            .unwrap();
        assert_eq!(dead.status, JobStatus::DeadLetter);
        assert_eq!(dead.retry_count, 2);
        assert!(dead.dead_lettered_at.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_error_is_not_requeued() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;
        let job = insert(&backend, NewJob::new("sleep")).await;
        claim_and_fail(&backend, job.job_id).await;

        assert!(backend.request_cancel(job.job_id).await.unwrap());
        assert!(matches!(
            backend.requeue_for_retry(job.job_id).await,
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_of_terminal_job_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;
        let job = insert(&backend, NewJob::new("echo")).await;
        backend.claim("w-1").await.unwrap().unwrap();
        backend
            .mark_finished(job.job_id, "w-1", json!({}))
            .await
            .unwrap();
        assert!(!backend.request_cancel(job.job_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_replay_resets_retries() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;
        let job = insert(&backend, NewJob::new("fail").with_max_retries(0)).await;
        claim_and_fail(&backend, job.job_id).await;
        backend
            .move_to_dead_letter(job.job_id, "max_retries_exceeded")
            .await
            .unwrap();

        assert!(matches!(
            backend.replay_dead_letter(Uuid::new_v4(), true).await,
            Err(StoreError::JobNotFound(_))
        ));

        let replayed = backend.replay_dead_letter(job.job_id, true).await.unwrap();
        assert_eq!(replayed.status, JobStatus::Queued);
        assert_eq!(replayed.retry_count, 0);
        assert!(replayed.error.is_none());
        assert!(replayed.dead_letter_reason.is_none());

        assert!(matches!(
            backend.replay_dead_letter(job.job_id, true).await,
            Err(StoreError::InvalidTransition {
                from: JobStatus::Queued,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_requires_owner() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;
        let job = insert(&backend, NewJob::new("sleep")).await;
        assert!(!backend.heartbeat(job.job_id, "w-1").await.unwrap());

        backend.claim("w-1").await.unwrap().unwrap();
        assert!(backend.heartbeat(job.job_id, "w-1").await.unwrap());
        assert!(!backend.heartbeat(job.job_id, "w-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let job_id = {
            let backend = backend(&dir).await;
            let job = insert(&backend, NewJob::new("echo")).await;
            backend.claim("w-1").await.unwrap().unwrap();
            job.job_id
        };

        let backend = backend(&dir).await;
        assert_eq!(backend.recover_running().await.unwrap(), vec![job_id]);
        let claimed = backend.claim("w-2").await.unwrap().unwrap();
        assert_eq!(claimed.job_id, job_id);
    }

    #[tokio::test]
    async fn test_stats() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(&dir).await;
        let a = insert(&backend, NewJob::new("fail")).await;
        insert(&backend, NewJob::new("echo")).await;
        insert(&backend, NewJob::new("echo")).await;

        claim_and_fail(&backend, a.job_id).await;
        backend.move_to_dead_letter(a.job_id, "non_retryable").await.unwrap();
        backend.claim("w-1").await.unwrap().unwrap();

        let stats = backend.queue_stats().await.unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(stats.total(), 3);

        let dlq = backend.dlq_stats().await.unwrap();
        assert_eq!(dlq.total, 1);
        assert_eq!(dlq.recent_failures_24h, 1);
        assert!(dlq.oldest_failure.is_some());
        assert_eq!(dlq.oldest_failure, dlq.newest_failure);

        let empty = SqliteJobBackend::open(&dir.path().join("other.db"))
            .await
            .unwrap()
            .dlq_stats()
            .await
            .unwrap();
        assert_eq!(empty, DlqStats::default());
    }
}
