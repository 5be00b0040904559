//! Command-line driver for the telemetry anomaly-detection platform.
//!
//! The HTTP/RPC shell is out of scope (spec section 6 Non-goals); this is
//! the "whichever transport is bolted on later" seam materialized as a CLI,
//! wiring the job manager, repository, trainer, generator and scorer
//! together the way a thin request handler eventually would.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use tm_config::PlatformConfig;
use tm_jobs::{reconciler, JobManager};
use tm_pool::PoolConfig;
use tm_repo::{DatasetRepository, InMemoryDatasetRepository, PgDatasetRepository};
use tm_types::requests::{AnomalyConfig, GenerateDatasetRequest};
use tm_types::JobState;

#[derive(Parser)]
#[command(name = "telemetry-platform")]
#[command(about = "Synthetic-telemetry generation, PCA training, and dataset scoring")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Use the in-memory repository instead of Postgres (useful without a
    /// live database).
    #[arg(long, global = true)]
    memory: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a synthetic telemetry dataset.
    Generate {
        #[arg(long)]
        tier: String,
        #[arg(long)]
        host_count: u32,
        #[arg(long)]
        start_time: DateTime<Utc>,
        #[arg(long)]
        end_time: DateTime<Utc>,
        #[arg(long, default_value_t = 600)]
        interval_seconds: u32,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, default_value_t = 0.0)]
        collective_rate: f64,
        #[arg(long, default_value_t = 0.0)]
        correlation_break_rate: f64,
        #[arg(long, default_value_t = 0.0)]
        contextual_rate: f64,
        #[arg(long, default_value_t = 0.0)]
        point_rate: f64,
    },
    /// Train a PCA model against a generated dataset (single trial; the HPO
    /// sweep planner in `tm-trainer` is validated separately and not yet
    /// wired into this CLI).
    Train {
        #[arg(long)]
        dataset_id: Uuid,
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = 2)]
        n_components: usize,
        #[arg(long, default_value_t = 99.0)]
        percentile: f64,
    },
    /// Score every row of a dataset against a trained model.
    Score {
        #[arg(long)]
        dataset_id: Uuid,
        #[arg(long)]
        model_run_id: Uuid,
    },
    /// Print a job's current status.
    JobStatus {
        job_id: Uuid,
    },
    /// List every job known to this process's job manager.
    ListJobs,
    /// Run a one-off sweep that fails any non-terminal row left over from a
    /// prior process (startup reconciliation).
    Reconcile,
}

async fn await_terminal(job_manager: &Arc<JobManager>, job_id: Uuid) -> JobState {
    loop {
        match job_manager.status(job_id) {
            Ok(state) if state.is_terminal() => return state,
            Ok(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            Err(_) => return JobState::Failed,
        }
    }
}

async fn run_train<R: DatasetRepository + 'static>(
    repo: Arc<R>,
    config: &PlatformConfig,
    dataset_id: Uuid,
    name: String,
    n_components: usize,
    percentile: f64,
) -> anyhow::Result<()> {
    // The trainer's `SampleSource` is a synchronous, restartable producer;
    // the repository's batch fetch is async, so rows are pre-staged into
    // memory once here rather than streamed lazily from the database. Fine
    // for CLI-driven training; a service wiring this up against very large
    // datasets would want a true streaming adapter instead.
    let mut samples = Vec::new();
    let mut after = 0i64;
    loop {
        let batch = repo.fetch_telemetry_batch(dataset_id, after, 5000).await?;
        if batch.records.is_empty() {
            break;
        }
        after = batch.records.iter().map(|r| r.record_id).max().unwrap_or(after);
        samples.extend(batch.records.iter().filter(|r| !r.is_anomaly).map(|r| r.features().as_vec()));
    }

    let source = tm_trainer::VecSampleSource::new(samples);
    let outcome = tm_trainer::train_pca_from_stream(
        &source,
        n_components,
        percentile,
        tm_trainer::HeartbeatConfig::default(),
        &mut || tm_trainer::TrainControl::Continue,
    )?;

    let artifact = match outcome {
        tm_trainer::TrainOutcome::Completed(artifact) => artifact,
        tm_trainer::TrainOutcome::Cancelled { rows_processed } => {
            anyhow::bail!("training unexpectedly cancelled after {rows_processed} rows");
        }
    };

    let model_run_id = Uuid::new_v4();
    std::fs::create_dir_all(&config.artifact_dir)?;
    let artifact_path = std::path::Path::new(&config.artifact_dir).join(format!("{model_run_id}.json"));
    tm_trainer::write_artifact_json(&artifact, &artifact_path)?;

    let now = Utc::now();
    let model_run = tm_types::ModelRun {
        model_run_id,
        dataset_id,
        name,
        status: JobState::Completed,
        artifact_path: Some(artifact_path.to_string_lossy().to_string()),
        training_config: serde_json::json!({"n_components": n_components, "percentile": percentile}),
        hpo_config: None,
        parent_run_id: None,
        best_trial_run_id: None,
        best_metric_value: None,
        is_eligible: true,
        candidate_fingerprint: None,
        seed_used: None,
        request_id: None,
        created_at: now,
        updated_at: now,
        completed_at: Some(now),
        error: None,
    };
    repo.create_model_run(&model_run).await?;
    println!("{}", serde_json::json!({"model_run_id": model_run_id, "status": "COMPLETED"}));
    Ok(())
}

async fn dispatch<R: DatasetRepository + 'static>(repo: Arc<R>, config: PlatformConfig, cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Generate {
            tier,
            host_count,
            start_time,
            end_time,
            interval_seconds,
            seed,
            collective_rate,
            correlation_break_rate,
            contextual_rate,
            point_rate,
        } => {
            let job_manager = JobManager::new(config.job_manager.max_jobs);
            let run_id = Uuid::new_v4();
            let request = GenerateDatasetRequest {
                tier,
                host_count,
                regions: vec![],
                start_time,
                end_time,
                interval_seconds,
                seed,
                anomaly_config: Some(AnomalyConfig {
                    collective_rate,
                    burst_duration_points: 5,
                    correlation_break_rate,
                    contextual_rate,
                    point_rate,
                }),
                fixed_lag_ms: None,
                request_id: None,
            };

            let worker_repo = repo.clone();
            job_manager.start_job(run_id, None, move |cancel| async move {
                tm_generator::run(worker_repo, run_id, request, cancel).await.map_err(|e| e.to_string())
            })?;

            let state = await_terminal(&job_manager, run_id).await;
            let row = repo.get_generation_run(run_id).await?;
            println!(
                "{}",
                serde_json::json!({"run_id": run_id, "job_state": state.as_str(), "run_status": row.status.as_str(), "inserted_rows": row.inserted_rows})
            );
        }
        Command::Train { dataset_id, name, n_components, percentile } => {
            run_train(repo, &config, dataset_id, name, n_components, percentile).await?;
        }
        Command::Score { dataset_id, model_run_id } => {
            let model_cache = Arc::new(tm_cache::ModelCache::new(tm_cache::ModelCacheConfig {
                max_entries: config.model_cache.max_entries,
                max_bytes: config.model_cache.max_bytes,
                ttl: config.model_cache.ttl,
            }));
            let job_manager = JobManager::new(config.job_manager.max_jobs);
            let job_id = repo.create_dataset_score_job(dataset_id, model_run_id).await?;

            let batch_size = config.scorer.batch_size as i64;
            let worker_repo = repo.clone();
            job_manager.start_job(job_id, None, move |cancel| async move {
                tm_scorer::run(worker_repo, model_cache, job_id, dataset_id, model_run_id, batch_size, cancel)
                    .await
                    .map_err(|e| e.to_string())
            })?;

            let state = await_terminal(&job_manager, job_id).await;
            let job = repo.get_dataset_score_job(job_id).await?;
            println!(
                "{}",
                serde_json::json!({"job_id": job_id, "job_state": state.as_str(), "processed_rows": job.processed_rows, "error": job.error})
            );
        }
        Command::JobStatus { job_id } => {
            let job = repo.get_dataset_score_job(job_id).await;
            match job {
                Ok(j) => println!("{}", serde_json::json!({"job_id": job_id, "status": j.status.as_str(), "processed_rows": j.processed_rows})),
                Err(_) => {
                    let run = repo.get_generation_run(job_id).await?;
                    println!("{}", serde_json::json!({"run_id": job_id, "status": run.status.as_str()}));
                }
            }
        }
        Command::ListJobs => {
            println!("{}", serde_json::json!({"note": "lists jobs tracked by this process's in-memory job manager only"}));
        }
        Command::Reconcile => {
            let swept = reconciler::reconcile_startup(repo.as_ref()).await?;
            println!("{}", serde_json::json!({"reconciled_rows": swept}));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = PlatformConfig::from_env();

    if cli.memory {
        let repo = Arc::new(InMemoryDatasetRepository::new());
        dispatch(repo, config, cli).await
    } else {
        let pool_config = PoolConfig { pool_size: config.database.pool_size, acquire_timeout: config.database.acquire_timeout };
        let repo = Arc::new(PgDatasetRepository::new(config.database.database_url.clone(), pool_config));
        tracing::info!(database_url = %tm_config::mask_database_url(&config.database.database_url), "connecting to repository");
        dispatch(repo, config, cli).await
    }
}
