//! Builtin tasks used for smoke tests and operational drills.

use std::time::Duration;

use async_trait::async_trait;
use rand::RngExt;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{Task, TaskInvocation};
use crate::error::{ErrorKind, TaskError};

/// Writes its params to `echo.json` in the output directory and returns them.
pub struct EchoTask;

#[async_trait]
impl Task for EchoTask {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(&self, invocation: &TaskInvocation<'_>) -> Result<Value, TaskError> {
        let path = invocation.output_dir.join("echo.json");
        tokio::fs::write(&path, serde_json::to_vec_pretty(invocation.params)?).await?;
        debug!(path = %path.display(), "Wrote echo output");
        Ok(json!({
            "echo": invocation.params,
            "attempt": invocation.attempt,
            "output": path.display().to_string(),
        }))
    }
}

/// Sleeps for `seconds` (default 1). Dropping the future cancels the sleep.
pub struct SleepTask;

#[async_trait]
impl Task for SleepTask {
    fn name(&self) -> &str {
        "sleep"
    }

    async fn run(&self, invocation: &TaskInvocation<'_>) -> Result<Value, TaskError> {
        let seconds = invocation.param_f64("seconds").unwrap_or(1.0);
        let duration = Duration::try_from_secs_f64(seconds)
            .map_err(|e| TaskError::parsing(format!("invalid 'seconds' {}: {}", seconds, e)))?;
        info!(seconds, "Sleeping");
        tokio::time::sleep(duration).await;
        Ok(json!({ "slept_seconds": seconds }))
    }
}

fn kind_param(invocation: &TaskInvocation<'_>, default: ErrorKind) -> Result<ErrorKind, TaskError> {
    match invocation.param_str("kind") {
        Some(raw) => raw.parse().map_err(TaskError::parsing),
        None => Ok(default),
    }
}

/// Always fails with the error kind named by `kind` (default `unknown`).
pub struct FailTask;

#[async_trait]
impl Task for FailTask {
    fn name(&self) -> &str {
        "fail"
    }

    async fn run(&self, invocation: &TaskInvocation<'_>) -> Result<Value, TaskError> {
        let kind = kind_param(invocation, ErrorKind::Unknown)?;
        let message = invocation
            .param_str("message")
            .unwrap_or("requested failure")
            .to_string();
        Err(TaskError::new(kind, message))
    }
}

/// Fails with probability `failure_rate` (default 0.5).
pub struct FlakyTask;

#[async_trait]
impl Task for FlakyTask {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn run(&self, invocation: &TaskInvocation<'_>) -> Result<Value, TaskError> {
        let failure_rate = invocation.param_f64("failure_rate").unwrap_or(0.5);
        let kind = kind_param(invocation, ErrorKind::Network)?;
        let roll: f64 = rand::rng().random_range(0.0..1.0);
        if roll < failure_rate {
            return Err(TaskError::new(
                kind,
                format!("flaky failure (roll {:.3} < {:.3})", roll, failure_rate),
            ));
        }
        Ok(json!({ "roll": roll }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::context::ExecutionContext;
    use uuid::Uuid;

    fn invoke<'a>(
        params: &'a Value,
        context: &'a ExecutionContext,
        output: &'a std::path::Path,
    ) -> TaskInvocation<'a> {
        TaskInvocation {
            job_id: Uuid::new_v4(),
            params,
            context,
            output_dir: output,
            attempt: 1,
        }
    }

    fn context() -> ExecutionContext {
        ExecutionContext::new("w-test", 0, tempfile::tempdir().unwrap())
    }

    #[tokio::test]
    async fn test_echo_writes_output() {
        let out = tempfile::tempdir().unwrap();
        let ctx = context();
        let params = json!({"city": "Lisbon"});
        let result = EchoTask.run(&invoke(&params, &ctx, out.path())).await.unwrap();
        assert_eq!(result["echo"], params);
        let written = std::fs::read_to_string(out.path().join("echo.json")).unwrap();
        assert!(written.contains("Lisbon"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_reports_duration() {
        let out = tempfile::tempdir().unwrap();
        let ctx = context();
        let params = json!({"seconds": 2.5});
        let result = SleepTask.run(&invoke(&params, &ctx, out.path())).await.unwrap();
        assert_eq!(result["slept_seconds"], 2.5);

        let bad = json!({"seconds": -1.0});
        let err = SleepTask.run(&invoke(&bad, &ctx, out.path())).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parsing);
    }

    #[tokio::test]
    async fn test_fail_uses_requested_kind() {
        let out = tempfile::tempdir().unwrap();
        let ctx = context();
        let params = json!({"kind": "timeout", "message": "site hung"});
        let err = FailTask.run(&invoke(&params, &ctx, out.path())).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(err.message, "site hung");

        let params = json!({"kind": "bogus"});
        let err = FailTask.run(&invoke(&params, &ctx, out.path())).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parsing);
    }

    #[tokio::test]
    async fn test_flaky_extremes() {
        let out = tempfile::tempdir().unwrap();
        let ctx = context();
        let always = json!({"failure_rate": 1.0, "kind": "rate_limit"});
        let err = FlakyTask.run(&invoke(&always, &ctx, out.path())).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimit);

        let never = json!({"failure_rate": 0.0});
        assert!(FlakyTask.run(&invoke(&never, &ctx, out.path())).await.is_ok());
    }
}
