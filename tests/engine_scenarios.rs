//! End-to-end scenarios through the public `Engine` API.
//!
//! Each test gets its own SQLite database and data root in a temp dir and
//! runs the engine with short intervals in real time.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::time::Instant;
use uuid::Uuid;

use job_forge::error::ErrorKind;
use job_forge::resources::{FixedSampler, SystemReading};
use job_forge::scheduler::job::{CANCELLED_REASON, REASON_MAX_RETRIES};
use job_forge::scheduler::{ContextProvider, JobRecord, JobStatus, LocalContextProvider};
use job_forge::{Engine, EngineConfig};

fn config(dir: &TempDir) -> EngineConfig {
    EngineConfig::default()
        .with_database_url(format!("sqlite://{}", dir.path().join("jobs.db").display()))
        .with_data_root(dir.path().join("data"))
        .with_workers(1, 2)
        .with_autoscale(false)
        .with_reconcile_interval(Duration::from_millis(50))
        .with_backoff(Duration::from_millis(50), Duration::from_millis(400))
        .with_heartbeat(Duration::from_millis(100), Duration::from_secs(5))
}

fn quiet_sampler() -> Arc<FixedSampler> {
    Arc::new(FixedSampler::new(SystemReading {
        cpu_percent: 5.0,
        memory_percent: 5.0,
        memory_available_mb: 4096.0,
        disk_percent: 5.0,
    }))
}

async fn build(dir: &TempDir) -> Engine {
    Engine::builder(config(dir))
        .with_sampler(quiet_sampler())
        .with_poll_interval(Duration::from_millis(20))
        .without_metrics()
        .build()
        .await
        .unwrap()
}

async fn wait_for(engine: &Engine, job_id: Uuid, status: JobStatus, within: Duration) -> JobRecord {
    let deadline = Instant::now() + within;
    loop {
        let record = engine.get_job_status(job_id).await.unwrap().record;
        if record.status == status {
            return record;
        }
        assert!(
            Instant::now() < deadline,
            "job {} still {:?}, wanted {:?}",
            job_id,
            record.status,
            status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn always_timing_out_job_is_retried_then_dead_lettered() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build(&dir).await;
    engine.start().await.unwrap();

    let started = Instant::now();
    let job_id = engine
        .submit_job(
            engine
                .new_job("fail")
                .with_params(json!({"kind": "timeout", "message": "target did not answer"}))
                .with_max_retries(3),
        )
        .await
        .unwrap();

    let dead = wait_for(&engine, job_id, JobStatus::DeadLetter, Duration::from_secs(15)).await;
    assert_eq!(dead.retry_count, 3);
    assert_eq!(dead.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(dead.dead_letter_reason.as_deref(), Some(REASON_MAX_RETRIES));
    // Backoff before the three requeues: 50ms + 100ms + 200ms.
    assert!(started.elapsed() >= Duration::from_millis(350));

    let entries = engine.list_dead_letter(0, 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].job_id, job_id);
    assert_eq!(engine.dlq_stats().await.unwrap().total, 1);
    engine.shutdown().await.unwrap();

    let replayed = engine.replay_dead_letter(job_id, true).await.unwrap();
    assert_eq!(replayed.status, JobStatus::Queued);
    assert_eq!(replayed.retry_count, 0);
    assert_eq!(engine.dlq_stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn higher_priority_dequeues_first_then_fifo() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build(&dir).await;

    let mut low = Vec::new();
    for i in 0..10 {
        let id = engine
            .submit_job(engine.new_job("echo").with_params(json!({"i": i})).with_priority(5))
            .await
            .unwrap();
        low.push(id);
    }
    let mut high = Vec::new();
    for i in 0..2 {
        let id = engine
            .submit_job(engine.new_job("echo").with_params(json!({"i": i})).with_priority(10))
            .await
            .unwrap();
        high.push(id);
    }

    let mut order = Vec::new();
    while let Some(job) = engine.store().try_dequeue("drain-check").await.unwrap() {
        assert_eq!(job.status, JobStatus::Running);
        order.push(job.job_id);
    }

    assert_eq!(order.len(), 12);
    assert_eq!(&order[..2], high.as_slice());
    assert_eq!(&order[2..], low.as_slice());
}

#[tokio::test]
async fn cancelling_running_job_releases_its_context() {
    let dir = tempfile::tempdir().unwrap();
    let contexts = Arc::new(LocalContextProvider::new().with_base_dir(dir.path().join("ctx")));
    let engine = Engine::builder(config(&dir))
        .with_sampler(quiet_sampler())
        .with_context_provider(contexts.clone())
        .with_poll_interval(Duration::from_millis(20))
        .without_metrics()
        .build()
        .await
        .unwrap();
    engine.start().await.unwrap();

    let job_id = engine
        .submit_job(engine.new_job("sleep").with_params(json!({"seconds": 60})))
        .await
        .unwrap();
    wait_for(&engine, job_id, JobStatus::Running, Duration::from_secs(5)).await;
    let deadline = Instant::now() + Duration::from_secs(5);
    while contexts.open_contexts() == 0 {
        assert!(Instant::now() < deadline, "context never opened");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(engine.cancel_job(job_id).await.unwrap());
    let cancelled = wait_for(&engine, job_id, JobStatus::Error, Duration::from_secs(2)).await;
    assert_eq!(cancelled.error.as_deref(), Some(CANCELLED_REASON));
    assert_eq!(contexts.open_contexts(), 0);

    // Cancelled jobs are never retried.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let still = engine.get_job_status(job_id).await.unwrap().record;
    assert_eq!(still.status, JobStatus::Error);
    assert!(engine.cancel_job(Uuid::new_v4()).await.is_err());

    engine.shutdown().await.unwrap();
    assert_eq!(engine.pool_stats().jobs_cancelled, 1);
}

#[tokio::test]
async fn jobs_orphaned_by_a_crash_are_recovered_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let job_id = {
        let engine = build(&dir).await;
        let job_id = engine
            .submit_job(engine.new_job("echo").with_params(json!({"n": 1})))
            .await
            .unwrap();
        // Claimed by a worker of a process that then died.
        let claimed = engine.store().try_dequeue("gone-worker").await.unwrap().unwrap();
        assert_eq!(claimed.job_id, job_id);
        job_id
    };

    let engine = build(&dir).await;
    engine.start().await.unwrap();
    let done = wait_for(&engine, job_id, JobStatus::Finished, Duration::from_secs(10)).await;
    assert_ne!(done.worker_id.as_deref(), Some("gone-worker"));
    assert_eq!(done.result.unwrap()["echo"]["n"], 1);
    engine.shutdown().await.unwrap();
}
