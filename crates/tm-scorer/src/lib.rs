//! Dataset scorer: keyset-paginated batch scoring against a cached PCA
//! model, with progress checkpoints and cooperative cancellation (spec
//! section 4.12).
//!
//! Grounded on `examples/original_source/src/training/telemetry_iterator.h`
//! (verified: a real keyset-pagination `NextBatch()` over `last_record_id_`/
//! `batch_size_`) for the batch-fetch shape. The surrounding loop here (load
//! once, count once, loop fixed-size batches until one comes back empty,
//! checkpointing and polling cancellation after every batch) is spec-derived
//! rather than grounded in an original `Run()` implementation: the only
//! `*scorer*` file in `original_source` is `src/scorer_main.cpp`, a stub
//! `main()` that mocks one record through `Preprocessor` and returns, with
//! an explicit `// TODO: Connect IDbClient` and no loop, checkpointing, or
//! cancellation of its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use tm_cache::{CacheError, ModelCache};
use tm_pca::PcaModel;
use tm_repo::{DatasetRepository, RepoError};
use tm_types::{DatasetScore, ErrorCode, HasErrorCode, JobState};

#[derive(Debug, Error)]
pub enum ScorerError {
    #[error("model run {model_run_id} has no artifact path")]
    MissingArtifact { model_run_id: Uuid },
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl HasErrorCode for ScorerError {
    fn error_code(&self) -> ErrorCode {
        match self {
            ScorerError::MissingArtifact { .. } => ErrorCode::ArtifactLoadFailed,
            ScorerError::Repo(e) => e.error_code(),
            ScorerError::Cache(_) => ErrorCode::ArtifactLoadFailed,
        }
    }
}

/// Scores every telemetry row in `dataset_id` against `model_run_id`,
/// writing one [`DatasetScore`] per row and checkpointing `job_id` after
/// each batch. The job row is assumed already created (`PENDING`) via
/// [`DatasetRepository::create_dataset_score_job`]; this only drives it
/// through RUNNING -> {COMPLETED, CANCELLED, FAILED}.
pub async fn run<R: DatasetRepository>(
    repo: Arc<R>,
    cache: Arc<ModelCache>,
    job_id: Uuid,
    dataset_id: Uuid,
    model_run_id: Uuid,
    batch_size: i64,
    cancel: Arc<AtomicBool>,
) -> Result<(), ScorerError> {
    match run_inner(repo.clone(), cache, job_id, dataset_id, model_run_id, batch_size, cancel).await {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::error!(%job_id, %dataset_id, %model_run_id, error = %err, "dataset scoring failed");
            let _ = repo.fail_dataset_score_job(job_id, &err.to_string()).await;
            Err(err)
        }
    }
}

async fn run_inner<R: DatasetRepository>(
    repo: Arc<R>,
    cache: Arc<ModelCache>,
    job_id: Uuid,
    dataset_id: Uuid,
    model_run_id: Uuid,
    batch_size: i64,
    cancel: Arc<AtomicBool>,
) -> Result<(), ScorerError> {
    let model_run = repo.get_model_run(model_run_id).await?;
    let artifact_path =
        model_run.artifact_path.clone().ok_or(ScorerError::MissingArtifact { model_run_id })?;
    let model: Arc<PcaModel> =
        cache.get_or_create(model_run_id, &artifact_path, |path| PcaModel::load(path))?;

    let total_rows = repo.count_telemetry_rows(dataset_id).await?;
    repo.start_dataset_score_job(job_id, total_rows).await?;

    let mut last_record_id: i64 = 0;
    let mut processed_rows: i64 = 0;

    loop {
        let batch = repo.fetch_telemetry_batch(dataset_id, last_record_id, batch_size).await?;
        if batch.records.is_empty() {
            break;
        }

        let scores: Vec<DatasetScore> = batch
            .records
            .iter()
            .map(|record| {
                let score = model.score(&record.features());
                DatasetScore {
                    score_id: Uuid::new_v4(),
                    dataset_id,
                    model_run_id,
                    record_id: record.record_id,
                    reconstruction_error: score.reconstruction_error,
                    predicted_is_anomaly: score.is_anomaly,
                    scored_at: Utc::now(),
                }
            })
            .collect();

        repo.insert_dataset_scores_batch(&scores).await?;

        last_record_id = batch.records.iter().map(|r| r.record_id).max().unwrap_or(last_record_id);
        processed_rows += batch.records.len() as i64;
        repo.checkpoint_dataset_score_job(job_id, last_record_id, processed_rows).await?;

        if cancel.load(Ordering::Relaxed) {
            repo.complete_dataset_score_job(job_id, JobState::Cancelled).await?;
            return Ok(());
        }
    }

    repo.complete_dataset_score_job(job_id, JobState::Completed).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use std::collections::HashMap;
    use tm_repo::InMemoryDatasetRepository;
    use tm_types::{ModelRun, TelemetryRecord};

    const ARTIFACT_JSON: &str = r#"{
        "meta": {"version": "v1", "features": ["cpu_usage", "memory_usage", "disk_utilization", "network_rx_rate", "network_tx_rate"]},
        "preprocessing": {"mean": [0.0, 0.0, 0.0, 0.0, 0.0], "scale": [1.0, 1.0, 1.0, 1.0, 1.0]},
        "model": {"mean": [0.0, 0.0, 0.0, 0.0, 0.0], "components": [[1.0, 0.0, 0.0, 0.0, 0.0]], "explained_variance": [1.0], "n_components": 1},
        "thresholds": {"reconstruction_error": 0.5}
    }"#;

    fn write_artifact(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("model.json");
        std::fs::write(&path, ARTIFACT_JSON).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn ts(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(i)
    }

    fn sample(run_id: Uuid, record_id: i64, cpu: f64) -> TelemetryRecord {
        TelemetryRecord {
            record_id,
            run_id,
            host_id: "host-1".into(),
            project_id: "proj-1".into(),
            region: "us-east1".into(),
            metric_timestamp: ts(record_id),
            ingestion_time: ts(record_id) + chrono::Duration::seconds(2),
            cpu_usage: cpu,
            memory_usage: 0.0,
            disk_utilization: 0.0,
            network_rx_rate: 0.0,
            network_tx_rate: 0.0,
            is_anomaly: false,
            anomaly_type: None,
            labels: HashMap::new(),
        }
    }

    fn sample_model_run(model_run_id: Uuid, artifact_path: String) -> ModelRun {
        ModelRun {
            model_run_id,
            dataset_id: Uuid::new_v4(),
            name: "m".into(),
            status: JobState::Completed,
            artifact_path: Some(artifact_path),
            training_config: serde_json::Value::Null,
            hpo_config: None,
            parent_run_id: None,
            best_trial_run_id: None,
            best_metric_value: None,
            is_eligible: true,
            candidate_fingerprint: None,
            seed_used: None,
            request_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn scores_every_row_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let artifact_path = write_artifact(&dir);

        let repo = Arc::new(InMemoryDatasetRepository::new());
        let dataset_id = Uuid::new_v4();
        let model_run_id = Uuid::new_v4();
        repo.create_model_run(&sample_model_run(model_run_id, artifact_path)).await.unwrap();

        let records: Vec<TelemetryRecord> = (1..=5).map(|i| sample(dataset_id, i, i as f64)).collect();
        repo.insert_telemetry_batch(&records).await.unwrap();

        let job_id = repo.create_dataset_score_job(dataset_id, model_run_id).await.unwrap();
        let cache = Arc::new(ModelCache::new(Default::default()));
        let cancel = Arc::new(AtomicBool::new(false));

        run(repo.clone(), cache, job_id, dataset_id, model_run_id, 2000, cancel).await.unwrap();

        let job = repo.get_dataset_score_job(job_id).await.unwrap();
        assert_eq!(job.status, JobState::Completed);
        assert_eq!(job.processed_rows, 5);
        assert_eq!(job.last_record_id, 5);
    }

    #[tokio::test]
    async fn cancellation_transitions_job_to_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let artifact_path = write_artifact(&dir);

        let repo = Arc::new(InMemoryDatasetRepository::new());
        let dataset_id = Uuid::new_v4();
        let model_run_id = Uuid::new_v4();
        repo.create_model_run(&sample_model_run(model_run_id, artifact_path)).await.unwrap();

        let records: Vec<TelemetryRecord> = (1..=3).map(|i| sample(dataset_id, i, i as f64)).collect();
        repo.insert_telemetry_batch(&records).await.unwrap();

        let job_id = repo.create_dataset_score_job(dataset_id, model_run_id).await.unwrap();
        let cache = Arc::new(ModelCache::new(Default::default()));
        let cancel = Arc::new(AtomicBool::new(true));

        run(repo.clone(), cache, job_id, dataset_id, model_run_id, 2000, cancel).await.unwrap();

        let job = repo.get_dataset_score_job(job_id).await.unwrap();
        assert_eq!(job.status, JobState::Cancelled);
    }

    #[tokio::test]
    async fn missing_artifact_path_fails_the_job() {
        let repo = Arc::new(InMemoryDatasetRepository::new());
        let dataset_id = Uuid::new_v4();
        let model_run_id = Uuid::new_v4();
        let mut model_run = sample_model_run(model_run_id, "unused".into());
        model_run.artifact_path = None;
        repo.create_model_run(&model_run).await.unwrap();

        let job_id = repo.create_dataset_score_job(dataset_id, model_run_id).await.unwrap();
        let cache = Arc::new(ModelCache::new(Default::default()));
        let cancel = Arc::new(AtomicBool::new(false));

        let err = run(repo.clone(), cache, job_id, dataset_id, model_run_id, 2000, cancel).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ArtifactLoadFailed);

        let job = repo.get_dataset_score_job(job_id).await.unwrap();
        assert_eq!(job.status, JobState::Failed);
    }
}
