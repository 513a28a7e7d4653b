//! Pluggable task implementations.
//!
//! A [`Task`] is a named async capability the worker pool invokes with the
//! job's params, an open execution context and a per-job output directory.
//! Tasks are stateless between invocations; timeouts, retries and isolation
//! are imposed by the engine. Logging inside a task lands in the job's
//! tracing span.

pub mod builtin;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::TaskError;
use crate::scheduler::context::ExecutionContext;

pub use builtin::{EchoTask, FailTask, FlakyTask, SleepTask};

/// Everything a task receives for one attempt.
pub struct TaskInvocation<'a> {
    pub job_id: Uuid,
    pub params: &'a Value,
    pub context: &'a ExecutionContext,
    pub output_dir: &'a Path,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl TaskInvocation<'_> {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.params.get(key).and_then(Value::as_f64)
    }
}

#[async_trait]
pub trait Task: Send + Sync {
    /// Registry key, matched against `NewJob::task_name`.
    fn name(&self) -> &str;

    /// External target this task talks to. Keys the circuit breaker,
    /// fallback and throttler.
    fn target(&self) -> &str {
        self.name()
    }

    async fn run(&self, invocation: &TaskInvocation<'_>) -> Result<Value, TaskError>;
}

/// Tasks by name, built once at startup.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the builtin `echo`, `sleep`, `fail` and `flaky` tasks.
    pub fn with_builtin_tasks() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoTask));
        registry.register(Arc::new(SleepTask));
        registry.register(Arc::new(FailTask));
        registry.register(Arc::new(FlakyTask));
        registry
    }

    pub fn register(&mut self, task: Arc<dyn Task>) {
        self.tasks.insert(task.name().to_string(), task);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
