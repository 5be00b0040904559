//! Stale-job reconciliation (spec section 4.9).
//!
//! Grounded on `examples/original_source/src/job_reconciler.{h,cpp}`:
//! `ReconcileStartup` sweeps unconditionally once at boot, then a background
//! loop repeats the sweep against a TTL at a fixed interval until shut down.
//! The periodic-sleep-interruptible-by-shutdown shape mirrors
//! `examples/adamtc007-ob-poc/rust/src/agent/learning/background.rs`'s
//! `spawn_learning_task` (`tokio::select!` between a timer and a polled
//! `AtomicBool`) rather than the original's condition variable, since tokio
//! has no direct equivalent exposed to async code here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tm_repo::{DatasetRepository, RepoError};

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    pub stale_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { stale_ttl: Duration::from_secs(600), sweep_interval: Duration::from_secs(60) }
    }
}

/// One-time unconditional sweep, run before accepting new work so that rows
/// orphaned by a prior crash don't sit RUNNING forever.
pub async fn reconcile_startup<R: DatasetRepository>(repo: &R) -> Result<u64, RepoError> {
    tracing::info!("running startup job reconciliation");
    repo.reconcile_stale_jobs(None).await
}

/// Spawns the periodic sweeper. The returned handle resolves once `shutdown`
/// is observed set to `true`; callers join it during graceful shutdown.
pub fn spawn_reconciler<R: DatasetRepository + 'static>(
    repo: Arc<R>,
    config: ReconcilerConfig,
    shutdown: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            interval_ms = config.sweep_interval.as_millis() as u64,
            ttl_secs = config.stale_ttl.as_secs(),
            "job reconciler periodic sweeper started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(config.sweep_interval) => {}
                _ = async {
                    while !shutdown.load(Ordering::Relaxed) {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                } => {
                    break;
                }
            }
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            let stale_after = chrono::Duration::from_std(config.stale_ttl).unwrap_or(chrono::Duration::zero());
            match repo.reconcile_stale_jobs(Some(stale_after)).await {
                Ok(count) if count > 0 => tracing::info!(count, "reconciled stale jobs"),
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "job reconciler sweep failed"),
            }
        }
        tracing::info!("job reconciler periodic sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tm_repo::InMemoryDatasetRepository;
    use tm_types::{JobState, RunStatus};
    use uuid::Uuid;

    #[tokio::test]
    async fn startup_sweep_fails_running_rows_unconditionally() {
        let repo = Arc::new(InMemoryDatasetRepository::new());
        let run = tm_types::GenerationRun {
            run_id: Uuid::new_v4(),
            tier: "small".to_string(),
            host_count: 1,
            start_time: chrono::Utc::now(),
            end_time: chrono::Utc::now(),
            interval_seconds: 60,
            seed: 1,
            status: RunStatus::Running,
            inserted_rows: 0,
            error: None,
            config: serde_json::Value::Null,
            request_id: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        repo.create_generation_run(&run).await.unwrap();
        let reconciled = reconcile_startup(repo.as_ref()).await.unwrap();
        assert_eq!(reconciled, 1);
        let updated = repo.get_generation_run(run.run_id).await.unwrap();
        assert_eq!(updated.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn periodic_sweeper_stops_when_shutdown_flag_is_set() {
        let repo = Arc::new(InMemoryDatasetRepository::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_reconciler(
            Arc::clone(&repo),
            ReconcilerConfig { stale_ttl: Duration::from_millis(1), sweep_interval: Duration::from_millis(20) },
            Arc::clone(&shutdown),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn periodic_sweep_reconciles_jobs_older_than_ttl() {
        let repo = Arc::new(InMemoryDatasetRepository::new());
        let dataset_id = Uuid::new_v4();
        let model_run_id = Uuid::new_v4();
        let job_id = repo.create_dataset_score_job(dataset_id, model_run_id).await.unwrap();
        repo.start_dataset_score_job(job_id, 10).await.unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_reconciler(
            Arc::clone(&repo),
            ReconcilerConfig { stale_ttl: Duration::from_millis(1), sweep_interval: Duration::from_millis(10) },
            Arc::clone(&shutdown),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        let job = repo.get_dataset_score_job(job_id).await.unwrap();
        assert_eq!(job.status, JobState::Failed);
    }
}
