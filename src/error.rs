//! Error taxonomy and recovery policy for task failures.
//!
//! Every task failure carries a structured [`ErrorKind`] chosen where the error
//! is raised. The kind determines a default [`Severity`] and
//! [`RecoveryStrategy`]; the [`ErrorHandler`] logs and counts failures and opens
//! a per-kind internal breaker when one kind floods in within a short window.
//!
//! | kind            | severity | strategy          |
//! |-----------------|----------|-------------------|
//! | Network         | medium   | retry-exponential |
//! | RuntimeCrash    | high     | restart-runtime   |
//! | Authentication  | high     | refresh-session   |
//! | RateLimit       | medium   | retry-exponential |
//! | Parsing         | low      | skip              |
//! | Timeout         | medium   | retry-immediate   |
//! | Resource        | critical | reduce-load       |
//! | Unknown         | medium   | retry-backoff     |

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics::MetricsCollector;

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, DNS failure, reset sockets.
    Network,
    /// The execution runtime (browser, interpreter, sandbox) died.
    RuntimeCrash,
    /// Login failed or the session expired.
    Authentication,
    /// The downstream throttled us.
    RateLimit,
    /// Extraction of the downstream payload failed.
    Parsing,
    /// An operation exceeded its deadline.
    Timeout,
    /// Memory, disk or quota exhaustion.
    Resource,
    /// Anything not classified at the raise site.
    Unknown,
}

impl ErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::Network,
        ErrorKind::RuntimeCrash,
        ErrorKind::Authentication,
        ErrorKind::RateLimit,
        ErrorKind::Parsing,
        ErrorKind::Timeout,
        ErrorKind::Resource,
        ErrorKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::RuntimeCrash => "runtime_crash",
            ErrorKind::Authentication => "authentication",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Parsing => "parsing",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Resource => "resource",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Default severity for this kind.
    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::Network | ErrorKind::RateLimit | ErrorKind::Timeout | ErrorKind::Unknown => {
                Severity::Medium
            }
            ErrorKind::RuntimeCrash | ErrorKind::Authentication => Severity::High,
            ErrorKind::Parsing => Severity::Low,
            ErrorKind::Resource => Severity::Critical,
        }
    }

    /// Default recovery strategy for this kind.
    pub fn default_strategy(&self) -> RecoveryStrategy {
        match self {
            ErrorKind::Network | ErrorKind::RateLimit => RecoveryStrategy::RetryExponential,
            ErrorKind::RuntimeCrash => RecoveryStrategy::RestartRuntime,
            ErrorKind::Authentication => RecoveryStrategy::RefreshSession,
            ErrorKind::Parsing => RecoveryStrategy::Skip,
            ErrorKind::Timeout => RecoveryStrategy::RetryImmediate,
            ErrorKind::Resource => RecoveryStrategy::ReduceLoad,
            ErrorKind::Unknown => RecoveryStrategy::RetryBackoff,
        }
    }

    /// Whether this kind points at an unhealthy downstream rather than at the task.
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::RateLimit | ErrorKind::Timeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown error kind '{}'", s))
    }
}

/// How loudly a failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// What the engine should do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RetryImmediate,
    RetryBackoff,
    RetryExponential,
    RestartRuntime,
    RefreshSession,
    ReduceLoad,
    AlertOperator,
    Skip,
    Fail,
}

impl RecoveryStrategy {
    /// Whether a job failing with this strategy may go back to the queue.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RecoveryStrategy::Skip | RecoveryStrategy::Fail | RecoveryStrategy::AlertOperator
        )
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecoveryStrategy::RetryImmediate => "retry_immediate",
            RecoveryStrategy::RetryBackoff => "retry_backoff",
            RecoveryStrategy::RetryExponential => "retry_exponential",
            RecoveryStrategy::RestartRuntime => "restart_runtime",
            RecoveryStrategy::RefreshSession => "refresh_session",
            RecoveryStrategy::ReduceLoad => "reduce_load",
            RecoveryStrategy::AlertOperator => "alert_operator",
            RecoveryStrategy::Skip => "skip",
            RecoveryStrategy::Fail => "fail",
        };
        f.write_str(s)
    }
}

/// A task failure with its kind attached at the raise site.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    /// Overrides the kind's default strategy when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RecoveryStrategy>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            strategy: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn runtime_crash(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RuntimeCrash, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    pub fn parsing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parsing, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Overrides the recovery strategy for this particular failure.
    pub fn with_strategy(mut self, strategy: RecoveryStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn strategy(&self) -> RecoveryStrategy {
        self.strategy
            .unwrap_or_else(|| self.kind.default_strategy())
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }
}

// Foreign errors carry no classification.
impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::unknown(format!("{:#}", err))
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        TaskError::unknown(err.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::parsing(err.to_string())
    }
}

/// Where a failure happened.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub job_id: Uuid,
    pub task_name: String,
    pub worker_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Configuration for the per-kind internal breaker.
#[derive(Debug, Clone)]
pub struct ErrorHandlerConfig {
    /// Errors of one kind tolerated inside `window` before the kind opens.
    pub kind_threshold: usize,
    pub window: Duration,
    /// How long an opened kind stays open.
    pub cooldown: Duration,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            kind_threshold: 10,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct KindState {
    recent: VecDeque<Instant>,
    total: u64,
    last_seen: Option<DateTime<Utc>>,
    open_until: Option<Instant>,
}

/// Snapshot of error counters.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorStats {
    pub error_counts: BTreeMap<String, u64>,
    pub open_kinds: Vec<ErrorKind>,
    pub last_seen: BTreeMap<String, DateTime<Utc>>,
}

/// Classifies, logs and counts task failures and decides their recovery.
pub struct ErrorHandler {
    config: ErrorHandlerConfig,
    kinds: Mutex<HashMap<ErrorKind, KindState>>,
    metrics: MetricsCollector,
}

impl ErrorHandler {
    pub fn new(config: ErrorHandlerConfig, metrics: MetricsCollector) -> Self {
        Self {
            config,
            kinds: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Records a failure and returns the strategy the worker should apply.
    ///
    /// Returns [`RecoveryStrategy::Fail`] while the failure's kind is open.
    pub fn handle(&self, err: &TaskError, ctx: &ErrorContext) -> RecoveryStrategy {
        let severity = err.severity();
        match severity {
            Severity::Critical | Severity::High => error!(
                job_id = %ctx.job_id,
                task = %ctx.task_name,
                worker_id = %ctx.worker_id,
                kind = %err.kind,
                severity = %severity,
                attempt = ctx.attempt,
                max_attempts = ctx.max_attempts,
                "{}", err.message
            ),
            Severity::Medium => warn!(
                job_id = %ctx.job_id,
                task = %ctx.task_name,
                worker_id = %ctx.worker_id,
                kind = %err.kind,
                severity = %severity,
                attempt = ctx.attempt,
                max_attempts = ctx.max_attempts,
                "{}", err.message
            ),
            Severity::Low | Severity::Info => info!(
                job_id = %ctx.job_id,
                task = %ctx.task_name,
                worker_id = %ctx.worker_id,
                kind = %err.kind,
                severity = %severity,
                "{}", err.message
            ),
        }
        self.metrics
            .record_task_error(err.kind.as_str(), &severity.to_string());

        if self.record(err.kind) {
            warn!(kind = %err.kind, "Internal breaker open for error kind, failing fast");
            return RecoveryStrategy::Fail;
        }

        let strategy = err.strategy();
        if strategy == RecoveryStrategy::AlertOperator {
            error!(job_id = %ctx.job_id, kind = %err.kind, "Operator intervention required");
        }
        strategy
    }

    /// Updates the counters for `kind`; returns whether the kind is open.
    fn record(&self, kind: ErrorKind) -> bool {
        let now = Instant::now();
        let mut kinds = self.kinds.lock();
        let state = kinds.entry(kind).or_default();

        state.total += 1;
        state.last_seen = Some(Utc::now());
        state.recent.push_back(now);
        while let Some(front) = state.recent.front() {
            if now.duration_since(*front) > self.config.window
                || state.recent.len() > self.config.kind_threshold + 1
            {
                state.recent.pop_front();
            } else {
                break;
            }
        }

        if let Some(until) = state.open_until {
            if now < until {
                return true;
            }
            state.open_until = None;
            info!(kind = %kind, "Internal breaker for error kind closed after cool-off");
        }

        if state.recent.len() > self.config.kind_threshold {
            state.open_until = Some(now + self.config.cooldown);
            state.recent.clear();
            error!(
                kind = %kind,
                threshold = self.config.kind_threshold,
                window_secs = self.config.window.as_secs(),
                "Too many errors of one kind, opening internal breaker"
            );
            return true;
        }
        false
    }

    /// Whether `kind` currently fails fast.
    pub fn is_kind_open(&self, kind: ErrorKind) -> bool {
        self.kinds
            .lock()
            .get(&kind)
            .and_then(|s| s.open_until)
            .is_some_and(|until| Instant::now() < until)
    }

    /// Closes the internal breaker for `kind`.
    pub fn reset_kind(&self, kind: ErrorKind) {
        if let Some(state) = self.kinds.lock().get_mut(&kind) {
            state.open_until = None;
            state.recent.clear();
            info!(kind = %kind, "Internal breaker for error kind reset");
        }
    }

    pub fn error_stats(&self) -> ErrorStats {
        let now = Instant::now();
        let kinds = self.kinds.lock();
        let mut stats = ErrorStats {
            error_counts: BTreeMap::new(),
            open_kinds: Vec::new(),
            last_seen: BTreeMap::new(),
        };
        for (kind, state) in kinds.iter() {
            stats.error_counts.insert(kind.to_string(), state.total);
            if let Some(seen) = state.last_seen {
                stats.last_seen.insert(kind.to_string(), seen);
            }
            if state.open_until.is_some_and(|until| now < until) {
                stats.open_kinds.push(*kind);
            }
        }
        stats.open_kinds.sort();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ErrorContext {
        ErrorContext {
            job_id: Uuid::new_v4(),
            task_name: "lookup".to_string(),
            worker_id: "worker-0".to_string(),
            attempt: 1,
            max_attempts: 3,
        }
    }

    #[test]
    fn test_default_strategies() {
        assert_eq!(
            ErrorKind::Network.default_strategy(),
            RecoveryStrategy::RetryExponential
        );
        assert_eq!(
            ErrorKind::RuntimeCrash.default_strategy(),
            RecoveryStrategy::RestartRuntime
        );
        assert_eq!(
            ErrorKind::Authentication.default_strategy(),
            RecoveryStrategy::RefreshSession
        );
        assert_eq!(ErrorKind::Parsing.default_strategy(), RecoveryStrategy::Skip);
        assert_eq!(
            ErrorKind::Timeout.default_strategy(),
            RecoveryStrategy::RetryImmediate
        );
        assert_eq!(
            ErrorKind::Resource.default_strategy(),
            RecoveryStrategy::ReduceLoad
        );
        assert_eq!(
            ErrorKind::Unknown.default_strategy(),
            RecoveryStrategy::RetryBackoff
        );
        assert_eq!(ErrorKind::Resource.severity(), Severity::Critical);
        assert_eq!(ErrorKind::Parsing.severity(), Severity::Low);
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in ErrorKind::ALL {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
        assert!("segfault".parse::<ErrorKind>().is_err());
    }

    #[test]
    fn test_retryable_strategies() {
        assert!(RecoveryStrategy::RetryImmediate.is_retryable());
        assert!(RecoveryStrategy::RestartRuntime.is_retryable());
        assert!(!RecoveryStrategy::Skip.is_retryable());
        assert!(!RecoveryStrategy::Fail.is_retryable());
        assert!(!RecoveryStrategy::AlertOperator.is_retryable());
    }

    #[test]
    fn test_foreign_errors_are_unknown() {
        let err: TaskError = anyhow::anyhow!("boom").into();
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert_eq!(err.message, "boom");

        let err = TaskError::timeout("slow").with_strategy(RecoveryStrategy::AlertOperator);
        assert_eq!(err.strategy(), RecoveryStrategy::AlertOperator);
        assert_eq!(err.to_string(), "timeout: slow");
    }

    #[test]
    fn test_handler_returns_kind_strategy() {
        let handler = ErrorHandler::new(ErrorHandlerConfig::default(), MetricsCollector::disabled());
        let strategy = handler.handle(&TaskError::network("refused"), &ctx());
        assert_eq!(strategy, RecoveryStrategy::RetryExponential);
        assert_eq!(handler.error_stats().error_counts["network"], 1);
    }

    #[test]
    fn test_kind_breaker_opens_after_burst() {
        let handler = ErrorHandler::new(ErrorHandlerConfig::default(), MetricsCollector::disabled());
        let err = TaskError::rate_limit("429");

        for _ in 0..10 {
            assert_eq!(
                handler.handle(&err, &ctx()),
                RecoveryStrategy::RetryExponential
            );
        }
        assert!(!handler.is_kind_open(ErrorKind::RateLimit));

        // The eleventh error inside the window opens the kind.
        assert_eq!(handler.handle(&err, &ctx()), RecoveryStrategy::Fail);
        assert!(handler.is_kind_open(ErrorKind::RateLimit));
        assert_eq!(handler.error_stats().open_kinds, vec![ErrorKind::RateLimit]);

        // Other kinds are unaffected.
        assert_eq!(
            handler.handle(&TaskError::timeout("slow"), &ctx()),
            RecoveryStrategy::RetryImmediate
        );

        handler.reset_kind(ErrorKind::RateLimit);
        assert!(!handler.is_kind_open(ErrorKind::RateLimit));
        assert_eq!(
            handler.handle(&err, &ctx()),
            RecoveryStrategy::RetryExponential
        );
    }
}
