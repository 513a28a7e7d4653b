//! Redis job backend.
//!
//! # Key layout
//!
//! | key                    | type | contents                                        |
//! |------------------------|------|-------------------------------------------------|
//! | `{ns}:job:{id}`        | hash | `status`, `data` (JSON record), `worker`, `started_at`, `heartbeat`, `cancel` |
//! | `{ns}:seq`             | str  | submission counter                              |
//! | `{ns}:queued`          | zset | score `-priority * 2^40 + seq`                  |
//! | `{ns}:running`         | zset | score = claim time (ms)                         |
//! | `{ns}:finished`        | zset | score = finish time (ms)                        |
//! | `{ns}:error`           | zset | score = failure time (ms)                       |
//! | `{ns}:dead_letter`     | zset | score = dead-letter time (ms)                    |
//!
//! The hash fields other than `data` are authoritative and overlay the JSON
//! record on read. Claim and every transition run as Lua scripts that
//! compare-and-set `status` and move the id between sets in one step.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde_json::Value;
use uuid::Uuid;

use super::{JobBackend, JobFailure, StoreError};
use crate::scheduler::job::{DlqStats, JobRecord, JobStatus, QueueStats};

pub const DEFAULT_NAMESPACE: &str = "job_forge";

/// Claims the lowest-scored queued id whose hash is still `queued`.
///
/// KEYS: queued, running. ARGV: job key prefix, worker, now (rfc3339), now (ms).
const CLAIM_LUA: &str = r#"
while true do
    local popped = redis.call('ZPOPMIN', KEYS[1])
    if #popped == 0 then
        return false
    end
    local id = popped[1]
    local key = ARGV[1] .. id
    if redis.call('HGET', key, 'status') == 'queued' then
        redis.call('HSET', key, 'status', 'running', 'worker', ARGV[2],
            'started_at', ARGV[3], 'heartbeat', ARGV[3])
        redis.call('ZADD', KEYS[2], ARGV[4], id)
        return id
    end
end
"#;

/// Guarded status change.
///
/// KEYS: job hash, from set, to set.
/// ARGV: expected status, new status, id, score, data, expected worker (or ''),
/// clear run fields ('1'), clear cancel ('1'), require no cancel ('1').
/// Returns 1 on success, 0 when the guard fails, -1 for an unknown job.
const TRANSITION_LUA: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
    return -1
end
if status ~= ARGV[1] then
    return 0
end
if ARGV[6] ~= '' and redis.call('HGET', KEYS[1], 'worker') ~= ARGV[6] then
    return 0
end
if ARGV[9] == '1' and redis.call('HGET', KEYS[1], 'cancel') == '1' then
    return 0
end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'data', ARGV[5])
if ARGV[7] == '1' then
    redis.call('HDEL', KEYS[1], 'worker', 'started_at', 'heartbeat')
end
if ARGV[8] == '1' then
    redis.call('HSET', KEYS[1], 'cancel', '0')
end
redis.call('ZREM', KEYS[2], ARGV[3])
redis.call('ZADD', KEYS[3], ARGV[4], ARGV[3])
return 1
"#;

/// KEYS: job hash. Returns 1 when flagged, 0 for terminal jobs, -1 if unknown.
const CANCEL_LUA: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
    return -1
end
if status == 'queued' or status == 'running' or status == 'error' then
    redis.call('HSET', KEYS[1], 'cancel', '1')
    return 1
end
return 0
"#;

/// KEYS: job hash. ARGV: worker, now (rfc3339).
const HEARTBEAT_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'status') == 'running'
    and redis.call('HGET', KEYS[1], 'worker') == ARGV[1] then
    redis.call('HSET', KEYS[1], 'heartbeat', ARGV[2])
    return 1
end
return 0
"#;

/// Arguments of one guarded transition.
struct Transition<'a> {
    from: JobStatus,
    to: JobStatus,
    score: i64,
    expected_worker: Option<&'a str>,
    clear_run: bool,
    clear_cancel: bool,
    require_no_cancel: bool,
}

impl<'a> Transition<'a> {
    fn new(from: JobStatus, to: JobStatus, score: i64) -> Self {
        Self {
            from,
            to,
            score,
            expected_worker: None,
            clear_run: false,
            clear_cancel: false,
            require_no_cancel: false,
        }
    }
}

fn flag(on: bool) -> &'static str {
    if on {
        "1"
    } else {
        "0"
    }
}

/// Pending-queue score: higher priority first, then submission order.
fn queue_score(priority: i32, seq: i64) -> i64 {
    -(priority as i64) * (1_i64 << 40) + seq
}

fn millis_to_utc(ms: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms as i64)
}

pub struct RedisJobBackend {
    redis: ConnectionManager,
    namespace: String,
    claim_script: Script,
    transition_script: Script,
    cancel_script: Script,
    heartbeat_script: Script,
}

impl RedisJobBackend {
    /// Connects to Redis and uses `namespace` as the key prefix.
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        tracing::info!(namespace = namespace, "Connected to Redis job store");
        Ok(Self::from_connection(manager, namespace))
    }

    pub fn from_connection(redis: ConnectionManager, namespace: &str) -> Self {
        Self {
            redis,
            namespace: namespace.to_string(),
            claim_script: Script::new(CLAIM_LUA),
            transition_script: Script::new(TRANSITION_LUA),
            cancel_script: Script::new(CANCEL_LUA),
            heartbeat_script: Script::new(HEARTBEAT_LUA),
        }
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.namespace)
    }

    fn job_key(&self, job_id: Uuid) -> String {
        format!("{}:job:{}", self.namespace, job_id)
    }

    fn set_key(&self, status: JobStatus) -> String {
        format!("{}:{}", self.namespace, status.as_str())
    }

    fn seq_key(&self) -> String {
        format!("{}:seq", self.namespace)
    }

    async fn next_queue_score(&self, priority: i32) -> Result<i64, StoreError> {
        let mut conn = self.redis.clone();
        let seq: i64 = conn.incr(self.seq_key(), 1).await?;
        Ok(queue_score(priority, seq))
    }

    /// Reads a record and overlays the authoritative hash fields.
    async fn load(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let corrupt = |message: String| StoreError::Corrupt {
            job_id: job_id.to_string(),
            message,
        };
        let parse_time = |field: &str| -> Result<Option<DateTime<Utc>>, StoreError> {
            fields
                .get(field)
                .map(|raw| {
                    DateTime::parse_from_rfc3339(raw)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| corrupt(format!("{}: {}", field, e)))
                })
                .transpose()
        };

        let data = fields
            .get("data")
            .ok_or_else(|| corrupt("missing data field".to_string()))?;
        let mut record: JobRecord = serde_json::from_str(data)?;
        if let Some(status) = fields.get("status") {
            record.status = status.parse().map_err(corrupt)?;
        }
        record.cancel_requested = fields.get("cancel").map(String::as_str) == Some("1");
        record.started_at = parse_time("started_at")?;
        record.last_heartbeat = parse_time("heartbeat")?;
        record.worker_id = fields.get("worker").cloned();
        Ok(Some(record))
    }

    async fn load_many(&self, ids: Vec<String>) -> Result<Vec<JobRecord>, StoreError> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(job_id) = Uuid::parse_str(&id) else {
                tracing::warn!(id = %id, "Skipping malformed job id in Redis set");
                continue;
            };
            if let Some(record) = self.load(job_id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Runs the guarded transition, writing `record` as the new data.
    async fn apply(
        &self,
        record: &JobRecord,
        t: Transition<'_>,
    ) -> Result<JobRecord, StoreError> {
        let mut conn = self.redis.clone();
        let outcome: i64 = self
            .transition_script
            .key(self.job_key(record.job_id))
            .key(self.set_key(t.from))
            .key(self.set_key(t.to))
            .arg(t.from.as_str())
            .arg(t.to.as_str())
            .arg(record.job_id.to_string())
            .arg(t.score)
            .arg(serde_json::to_string(record)?)
            .arg(t.expected_worker.unwrap_or(""))
            .arg(flag(t.clear_run))
            .arg(flag(t.clear_cancel))
            .arg(flag(t.require_no_cancel))
            .invoke_async(&mut conn)
            .await?;

        match outcome {
            1 => self
                .load(record.job_id)
                .await?
                .ok_or(StoreError::JobNotFound(record.job_id)),
            -1 => Err(StoreError::JobNotFound(record.job_id)),
            _ => Err(self.rejected(record.job_id, t.to).await),
        }
    }

    /// The error for a transition whose guard did not hold.
    async fn rejected(&self, job_id: Uuid, to: JobStatus) -> StoreError {
        match self.load(job_id).await {
            Ok(Some(current)) => StoreError::InvalidTransition {
                job_id,
                from: current.status,
                to,
            },
            Ok(None) => StoreError::JobNotFound(job_id),
            Err(e) => e,
        }
    }

    async fn require(&self, job_id: Uuid) -> Result<JobRecord, StoreError> {
        self.load(job_id).await?.ok_or(StoreError::JobNotFound(job_id))
    }

    /// Prepares `record` for re-entering the queue.
    fn reset_run(record: &mut JobRecord) {
        record.status = JobStatus::Queued;
        record.started_at = None;
        record.finished_at = None;
        record.worker_id = None;
        record.last_heartbeat = None;
    }
}

#[async_trait]
impl JobBackend for RedisJobBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn insert(&self, record: &JobRecord) -> Result<(), StoreError> {
        let score = self.next_queue_score(record.priority).await?;
        let data = serde_json::to_string(record)?;
        let mut conn = self.redis.clone();
        redis::pipe()
            .atomic()
            .hset_multiple(
                self.job_key(record.job_id),
                &[
                    ("status", record.status.as_str()),
                    ("data", data.as_str()),
                    ("cancel", flag(record.cancel_requested)),
                ],
            )
            .ignore()
            .zadd(self.set_key(record.status), record.job_id.to_string(), score)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        self.load(job_id).await
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let now = Utc::now();
        let mut conn = self.redis.clone();
        let claimed: Option<String> = self
            .claim_script
            .key(self.set_key(JobStatus::Queued))
            .key(self.set_key(JobStatus::Running))
            .arg(self.job_prefix())
            .arg(worker_id)
            .arg(now.to_rfc3339())
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        match claimed {
            Some(id) => {
                let job_id = Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt {
                    job_id: id.clone(),
                    message: e.to_string(),
                })?;
                self.load(job_id).await
            }
            None => Ok(None),
        }
    }

    async fn mark_finished(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: Value,
    ) -> Result<JobRecord, StoreError> {
        let mut record = self.require(job_id).await?;
        let now = Utc::now();
        record.status = JobStatus::Finished;
        record.finished_at = Some(now);
        record.result = Some(result);
        record.error = None;
        record.error_kind = None;

        let mut t = Transition::new(JobStatus::Running, JobStatus::Finished, now.timestamp_millis());
        t.expected_worker = Some(worker_id);
        self.apply(&record, t).await
    }

    async fn mark_error(
        &self,
        job_id: Uuid,
        worker_id: Option<&str>,
        failure: &JobFailure,
    ) -> Result<JobRecord, StoreError> {
        let mut record = self.require(job_id).await?;
        let now = Utc::now();
        record.status = JobStatus::Error;
        record.finished_at = Some(now);
        record.error = Some(failure.message.clone());
        record.error_kind = failure.kind;
        record.retryable = failure.retryable;

        let mut t = Transition::new(JobStatus::Running, JobStatus::Error, now.timestamp_millis());
        t.expected_worker = worker_id;
        self.apply(&record, t).await
    }

    async fn requeue_for_retry(&self, job_id: Uuid) -> Result<JobRecord, StoreError> {
        let mut record = self.require(job_id).await?;
        if record.status != JobStatus::Error || !record.has_retries_left() {
            return Err(StoreError::InvalidTransition {
                job_id,
                from: record.status,
                to: JobStatus::Queued,
            });
        }
        Self::reset_run(&mut record);
        record.retry_count += 1;

        let score = self.next_queue_score(record.priority).await?;
        let mut t = Transition::new(JobStatus::Error, JobStatus::Queued, score);
        t.clear_run = true;
        t.require_no_cancel = true;
        self.apply(&record, t).await
    }

    async fn move_to_dead_letter(
        &self,
        job_id: Uuid,
        reason: &str,
    ) -> Result<JobRecord, StoreError> {
        let mut record = self.require(job_id).await?;
        let now = Utc::now();
        record.status = JobStatus::DeadLetter;
        record.dead_lettered_at = Some(now);
        record.dead_letter_reason = Some(reason.to_string());

        let t = Transition::new(JobStatus::Error, JobStatus::DeadLetter, now.timestamp_millis());
        self.apply(&record, t).await
    }

    async fn replay_dead_letter(
        &self,
        job_id: Uuid,
        reset_retries: bool,
    ) -> Result<JobRecord, StoreError> {
        let mut record = self.require(job_id).await?;
        Self::reset_run(&mut record);
        if reset_retries {
            record.retry_count = 0;
        }
        record.result = None;
        record.error = None;
        record.error_kind = None;
        record.retryable = true;
        record.cancel_requested = false;
        record.dead_lettered_at = None;
        record.dead_letter_reason = None;

        let score = self.next_queue_score(record.priority).await?;
        let mut t = Transition::new(JobStatus::DeadLetter, JobStatus::Queued, score);
        t.clear_run = true;
        t.clear_cancel = true;
        self.apply(&record, t).await
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let outcome: i64 = self
            .cancel_script
            .key(self.job_key(job_id))
            .invoke_async(&mut conn)
            .await?;
        match outcome {
            -1 => Err(StoreError::JobNotFound(job_id)),
            n => Ok(n == 1),
        }
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let outcome: i64 = self
            .heartbeat_script
            .key(self.job_key(job_id))
            .arg(worker_id)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        Ok(outcome == 1)
    }

    async fn recover_running(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.zrange(self.set_key(JobStatus::Running), 0, -1).await?;

        let mut recovered = Vec::new();
        for mut record in self.load_many(ids).await? {
            if record.status != JobStatus::Running {
                continue;
            }
            Self::reset_run(&mut record);
            let score = self.next_queue_score(record.priority).await?;
            let mut t = Transition::new(JobStatus::Running, JobStatus::Queued, score);
            t.clear_run = true;
            match self.apply(&record, t).await {
                Ok(_) => recovered.push(record.job_id),
                Err(StoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrange(self.set_key(status), 0, limit as isize - 1)
            .await?;
        self.load_many(ids).await
    }

    async fn dead_letter_page(
        &self,
        start: usize,
        count: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn
            .zrevrange(
                self.set_key(JobStatus::DeadLetter),
                start as isize,
                (start + count) as isize - 1,
            )
            .await?;
        self.load_many(ids).await
    }

    async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let count = |status: JobStatus| {
            let mut conn = self.redis.clone();
            let key = self.set_key(status);
            async move {
                let n: u64 = conn.zcard(key).await?;
                Ok::<_, StoreError>(n)
            }
        };
        let (queued, running, finished, error, dead_letter) = tokio::try_join!(
            count(JobStatus::Queued),
            count(JobStatus::Running),
            count(JobStatus::Finished),
            count(JobStatus::Error),
            count(JobStatus::DeadLetter),
        )?;
        Ok(QueueStats {
            queued,
            running,
            finished,
            error,
            dead_letter,
        })
    }

    async fn dlq_stats(&self) -> Result<DlqStats, StoreError> {
        let key = self.set_key(JobStatus::DeadLetter);
        let since = (Utc::now() - ChronoDuration::hours(24)).timestamp_millis();

        let mut c1 = self.redis.clone();
        let mut c2 = self.redis.clone();
        let mut c3 = self.redis.clone();
        let mut c4 = self.redis.clone();
        let (total, recent, oldest, newest) = tokio::try_join!(
            c1.zcard::<_, u64>(&key),
            c2.zcount::<_, _, _, u64>(&key, since, "+inf"),
            c3.zrange_withscores::<_, Vec<(String, f64)>>(&key, 0, 0),
            c4.zrevrange_withscores::<_, Vec<(String, f64)>>(&key, 0, 0),
        )?;

        Ok(DlqStats {
            total,
            recent_failures_24h: recent,
            oldest_failure: oldest.first().and_then(|(_, ms)| millis_to_utc(*ms)),
            newest_failure: newest.first().and_then(|(_, ms)| millis_to_utc(*ms)),
        })
    }
}
