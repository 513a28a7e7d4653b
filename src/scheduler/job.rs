//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `JobRecord`: the persisted state of one job
//! - `JobStatus`: lifecycle position, with the allowed transitions
//! - `NewJob`: a submission request
//! - `DeadLetterEntry`, `QueueStats`, `DlqStats`: read views for operators

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorKind;

/// Default timeout for a job, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Highest accepted priority.
pub const MAX_PRIORITY: i32 = 1000;

/// Error message of a job stopped by `cancel_job`.
pub const CANCELLED_REASON: &str = "cancelled";

/// Error message of a running job reclaimed by the reconciler.
pub const TIMED_OUT_REASON: &str = "timed out, no worker heartbeat";

/// Dead-letter reason when retries ran out.
pub const REASON_MAX_RETRIES: &str = "max_retries_exceeded";

/// Dead-letter reason when the failure was not worth retrying.
pub const REASON_NON_RETRYABLE: &str = "non_retryable";

/// Lifecycle position of a job.
///
/// ```text
/// queued -> running -> finished
///              |
///              v
///            error -> queued        (retry_count < max_retries)
///              |
///              v
///          dead_letter -> queued    (manual replay)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Error,
    DeadLetter,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Finished,
        JobStatus::Error,
        JobStatus::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Error => "error",
            JobStatus::DeadLetter => "dead_letter",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `to`.
    ///
    /// `running -> queued` is not listed; only crash recovery performs it.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Finished)
                | (JobStatus::Running, JobStatus::Error)
                | (JobStatus::Error, JobStatus::Queued)
                | (JobStatus::Error, JobStatus::DeadLetter)
                | (JobStatus::DeadLetter, JobStatus::Queued)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::DeadLetter)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

/// A submission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub task_name: String,
    /// Must be a JSON object.
    pub params: Value,
    /// Higher runs first; 0..=1000.
    pub priority: i32,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

impl NewJob {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            params: Value::Object(Default::default()),
            priority: 0,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// Persisted state of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub task_name: String,
    pub params: Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    /// Cleared when the error handler decides the failure is not worth retrying.
    #[serde(default = "default_true")]
    pub retryable: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub priority: i32,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dead_lettered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dead_letter_reason: Option<String>,
}

fn default_true() -> bool {
    true
}

impl JobRecord {
    /// A fresh `queued` record for `new`.
    pub fn from_new(new: NewJob) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            task_name: new.task_name,
            params: new.params,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            error_kind: None,
            retryable: true,
            retry_count: 0,
            max_retries: new.max_retries,
            timeout_seconds: new.timeout_seconds,
            priority: new.priority,
            worker_id: None,
            cancel_requested: false,
            last_heartbeat: None,
            dead_lettered_at: None,
            dead_letter_reason: None,
        }
    }

    /// Whether the job ended because it was cancelled.
    pub fn was_cancelled(&self) -> bool {
        self.status == JobStatus::Error && self.error.as_deref() == Some(CANCELLED_REASON)
    }

    /// Whether another attempt is still allowed.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Seconds spent running so far, while the job is running.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> Option<u64> {
        match (self.status, self.started_at) {
            (JobStatus::Running, Some(started)) => {
                Some((now - started).num_seconds().max(0) as u64)
            }
            _ => None,
        }
    }

    /// Status with the running time appended, e.g. `running 3m 5s`.
    pub fn status_display(&self, now: DateTime<Utc>) -> String {
        match self.elapsed_seconds(now) {
            Some(secs) => format!("{} {}", self.status, format_elapsed(secs)),
            None => self.status.to_string(),
        }
    }

    pub fn to_dead_letter_entry(&self) -> DeadLetterEntry {
        DeadLetterEntry {
            job_id: self.job_id,
            task_name: self.task_name.clone(),
            params: self.params.clone(),
            error: self.error.clone(),
            error_kind: self.error_kind,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            failed_at: self.dead_lettered_at.or(self.finished_at),
            created_at: self.created_at,
            worker_id: self.worker_id.clone(),
            reason: self.dead_letter_reason.clone(),
        }
    }
}

/// Renders seconds as `42s`, `3m 5s` or `1h 2m`.
pub fn format_elapsed(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Delay before the next attempt: `base * 2^retry_count`, capped at `max`.
pub fn backoff_delay(retry_count: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(retry_count);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// A job parked in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job_id: Uuid,
    pub task_name: String,
    pub params: Value,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub worker_id: Option<String>,
    pub reason: Option<String>,
}

/// Number of jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub finished: u64,
    pub error: u64,
    pub dead_letter: u64,
}

impl QueueStats {
    pub fn count(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Queued => self.queued,
            JobStatus::Running => self.running,
            JobStatus::Finished => self.finished,
            JobStatus::Error => self.error,
            JobStatus::DeadLetter => self.dead_letter,
        }
    }

    pub fn set(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Queued => self.queued = count,
            JobStatus::Running => self.running = count,
            JobStatus::Finished => self.finished = count,
            JobStatus::Error => self.error = count,
            JobStatus::DeadLetter => self.dead_letter = count,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.running + self.finished + self.error + self.dead_letter
    }
}

/// Dead-letter queue summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DlqStats {
    pub total: u64,
    pub recent_failures_24h: u64,
    pub oldest_failure: Option<DateTime<Utc>>,
    pub newest_failure: Option<DateTime<Utc>>,
}
