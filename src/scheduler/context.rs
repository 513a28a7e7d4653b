//! Execution contexts.
//!
//! A worker runs every job inside an [`ExecutionContext`] (an isolated
//! session of the execution runtime) obtained from its [`ContextPool`]. The
//! pool caps how many contexts one worker may hold open; the [`ContextLease`]
//! closes the context when released or dropped, so no exit path leaks one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Worker {worker_id} already holds {max} open execution contexts")]
    Exhausted { worker_id: String, max: usize },

    #[error("Failed to create execution context: {0}")]
    Create(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One isolated runtime session.
#[derive(Debug)]
pub struct ExecutionContext {
    id: Uuid,
    worker_id: String,
    generation: u64,
    created_at: DateTime<Utc>,
    scratch_path: PathBuf,
    scratch: Option<TempDir>,
}

impl ExecutionContext {
    pub fn new(worker_id: &str, generation: u64, scratch: TempDir) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_id: worker_id.to_string(),
            generation,
            created_at: Utc::now(),
            scratch_path: scratch.path().to_path_buf(),
            scratch: Some(scratch),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runtime generation the context was created in; bumped by restarts.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Private working directory, removed when the context closes.
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_path
    }

    pub fn is_closed(&self) -> bool {
        self.scratch.is_none()
    }

    /// Releases the context's on-disk state.
    pub fn close_scratch(&mut self) {
        self.scratch = None;
    }
}

/// Creates and tears down execution contexts.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, worker_id: &str, generation: u64)
        -> Result<ExecutionContext, ContextError>;

    /// Tears the context down. Called once per created context.
    fn close(&self, context: &mut ExecutionContext);

    /// Number of contexts created and not yet closed.
    fn open_contexts(&self) -> usize;

    /// Recycles the runtime backing `worker_id`. Contexts from
    /// `old_generation` still open are closed through their leases.
    async fn restart_runtime(&self, worker_id: &str, old_generation: u64)
        -> Result<(), ContextError>;
}

/// Contexts backed by a private temporary directory each.
pub struct LocalContextProvider {
    base_dir: Option<PathBuf>,
    open: AtomicUsize,
    restarts: AtomicU64,
}

impl LocalContextProvider {
    pub fn new() -> Self {
        Self {
            base_dir: None,
            open: AtomicUsize::new(0),
            restarts: AtomicU64::new(0),
        }
    }

    /// Places scratch directories under `dir` instead of the system temp dir.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// Runtime restarts performed across all workers.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl Default for LocalContextProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContextProvider for LocalContextProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create(
        &self,
        worker_id: &str,
        generation: u64,
    ) -> Result<ExecutionContext, ContextError> {
        let prefix = format!("ctx-{}-g{}-", worker_id, generation);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let scratch = match &self.base_dir {
            Some(base) => {
                tokio::fs::create_dir_all(base).await?;
                builder.tempdir_in(base)?
            }
            None => builder.tempdir()?,
        };
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutionContext::new(worker_id, generation, scratch))
    }

    fn close(&self, context: &mut ExecutionContext) {
        if !context.is_closed() {
            context.close_scratch();
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn open_contexts(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    async fn restart_runtime(&self, worker_id: &str, old_generation: u64) -> Result<(), ContextError> {
        // Scratch directories are per context, so there is no shared state to reset.
        self.restarts.fetch_add(1, Ordering::SeqCst);
        debug!(worker_id = worker_id, old_generation, "Local runtime recycled");
        Ok(())
    }
}

/// Per-worker context pool with a hard cap on open contexts.
pub struct ContextPool {
    worker_id: String,
    provider: Arc<dyn ContextProvider>,
    permits: Arc<Semaphore>,
    max_contexts: usize,
    active: Arc<AtomicUsize>,
    generation: AtomicU64,
}

impl ContextPool {
    pub fn new(
        worker_id: impl Into<String>,
        provider: Arc<dyn ContextProvider>,
        max_contexts: usize,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            provider,
            permits: Arc::new(Semaphore::new(max_contexts)),
            max_contexts,
            active: Arc::new(AtomicUsize::new(0)),
            generation: AtomicU64::new(0),
        }
    }

    /// Opens a context, failing fast when the worker is at its cap.
    pub async fn acquire(&self) -> Result<ContextLease, ContextError> {
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| ContextError::Exhausted {
                worker_id: self.worker_id.clone(),
                max: self.max_contexts,
            })?;

        let context = self
            .provider
            .create(&self.worker_id, self.generation())
            .await?;
        self.active.fetch_add(1, Ordering::SeqCst);
        debug!(
            worker_id = %self.worker_id,
            context_id = %context.id(),
            "Execution context opened"
        );

        Ok(ContextLease {
            context,
            provider: Arc::clone(&self.provider),
            active: Arc::clone(&self.active),
            permit: Some(permit),
            released: false,
        })
    }

    pub fn active_contexts(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Restarts the worker's runtime through the provider and starts a fresh
    /// generation; contexts opened afterwards belong to it. The generation
    /// advances even when the provider fails, so no new context reuses the
    /// old runtime.
    pub async fn restart_runtime(&self, reason: &str) -> u64 {
        let old_generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let generation = old_generation + 1;
        if let Err(e) = self
            .provider
            .restart_runtime(&self.worker_id, old_generation)
            .await
        {
            warn!(
                worker_id = %self.worker_id,
                provider = self.provider.name(),
                error = %e,
                "Runtime restart hook failed"
            );
        }
        info!(
            worker_id = %self.worker_id,
            generation,
            reason = reason,
            "Restarted execution runtime"
        );
        generation
    }
}

/// An open context, closed on `release` or drop.
pub struct ContextLease {
    context: ExecutionContext,
    provider: Arc<dyn ContextProvider>,
    active: Arc<AtomicUsize>,
    permit: Option<OwnedSemaphorePermit>,
    released: bool,
}

impl ContextLease {
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.provider.close(&mut self.context);
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.permit.take();
        debug!(context_id = %self.context.id(), "Execution context released");
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max: usize) -> (Arc<LocalContextProvider>, ContextPool) {
        let provider = Arc::new(LocalContextProvider::new());
        let pool = ContextPool::new("w-1", provider.clone(), max);
        (provider, pool)
    }

    #[tokio::test]
    async fn test_cap_on_open_contexts() {
        let (provider, pool) = pool(2);
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert!(matches!(
            pool.acquire().await,
            Err(ContextError::Exhausted { max: 2, .. })
        ));
        assert_eq!(pool.active_contexts(), 2);
        assert_eq!(provider.open_contexts(), 2);

        a.release();
        assert_eq!(pool.active_contexts(), 1);
        let _c = pool.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_closes_context() {
        let (provider, pool) = pool(1);
        let lease = pool.acquire().await.unwrap();
        let scratch = lease.context().scratch_dir().to_path_buf();
        assert!(scratch.exists());
        assert_eq!(lease.context().worker_id(), "w-1");

        drop(lease);
        assert!(!scratch.exists());
        assert_eq!(pool.active_contexts(), 0);
        assert_eq!(provider.open_contexts(), 0);
    }

    #[tokio::test]
    async fn test_restart_bumps_generation() {
        let (provider, pool) = pool(1);
        let before = pool.acquire().await.unwrap();
        assert_eq!(before.context().generation(), 0);
        before.release();

        assert_eq!(pool.restart_runtime("test").await, 1);
        assert_eq!(provider.restarts(), 1);
        let after = pool.acquire().await.unwrap();
        assert_eq!(after.context().generation(), 1);
    }

    struct BrokenRuntime(LocalContextProvider);

    #[async_trait]
    impl ContextProvider for BrokenRuntime {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn create(
            &self,
            worker_id: &str,
            generation: u64,
        ) -> Result<ExecutionContext, ContextError> {
            self.0.create(worker_id, generation).await
        }

        fn close(&self, context: &mut ExecutionContext) {
            self.0.close(context)
        }

        fn open_contexts(&self) -> usize {
            self.0.open_contexts()
        }

        async fn restart_runtime(&self, _worker_id: &str, _old: u64) -> Result<(), ContextError> {
            Err(ContextError::Create("runtime did not come back".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_restart_still_moves_generation() {
        let pool = ContextPool::new("w-2", Arc::new(BrokenRuntime(LocalContextProvider::new())), 1);
        assert_eq!(pool.restart_runtime("crash").await, 1);
        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.context().generation(), 1);
    }

    #[tokio::test]
    async fn test_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(LocalContextProvider::new().with_base_dir(dir.path().join("ctx")));
        let pool = ContextPool::new("w-9", provider, 1);
        let lease = pool.acquire().await.unwrap();
        assert!(lease.context().scratch_dir().starts_with(dir.path()));
    }
}
