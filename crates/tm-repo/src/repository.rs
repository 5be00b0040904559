//! The `DatasetRepository` trait (spec section 4.13, NEW section 4.13a).
//!
//! One seam, two implementations: [`crate::postgres::PgDatasetRepository`]
//! for production, [`crate::memory::InMemoryDatasetRepository`] (grounded on
//! `examples/original_source/tests/mocks/mock_db_client.h`) for unit tests of
//! the job manager, reconciler and scorer that would otherwise need a live
//! Postgres instance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use tm_types::{DatasetScore, DatasetScoreJob, ErrorCode, GenerationRun, HasErrorCode, ModelRun, RunStatus};

use crate::types::{
    DatasetSummary, EvaluationMetrics, ErrorDistributionEntry, Histogram, MetricStats, Page, RunListFilter,
    ScoreFilter, TimeSeriesPoint, TopKResult,
};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("invalid {field}: {value}")]
    InvalidArgument { field: &'static str, value: String },
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("job already exists for this (dataset_id, model_run_id): {existing_job_id}")]
    ConflictExistingJob { existing_job_id: Uuid },
    #[error("no data available: {0}")]
    NoData(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("insert failed: {0}")]
    Insert(String),
}

impl HasErrorCode for RepoError {
    fn error_code(&self) -> ErrorCode {
        match self {
            RepoError::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            RepoError::NotFound { .. } => ErrorCode::NotFound,
            RepoError::ConflictExistingJob { .. } => ErrorCode::Conflict,
            RepoError::NoData(_) => ErrorCode::NoData,
            RepoError::Query(_) => ErrorCode::DbQueryFailed,
            RepoError::Insert(_) => ErrorCode::DbInsertFailed,
        }
    }
}

/// A batch of rows fetched by keyset pagination (spec 4.12 step 3): ordered
/// ascending by `record_id`, bounded by `batch_size`.
#[derive(Debug, Clone)]
pub struct TelemetryBatch {
    pub records: Vec<tm_types::TelemetryRecord>,
}

#[async_trait]
pub trait DatasetRepository: Send + Sync {
    // --- generation runs ---
    async fn create_generation_run(&self, run: &GenerationRun) -> Result<(), RepoError>;
    async fn update_generation_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        inserted_rows: u64,
        error: Option<&str>,
    ) -> Result<(), RepoError>;
    async fn get_generation_run(&self, run_id: Uuid) -> Result<GenerationRun, RepoError>;
    async fn list_generation_runs(&self, filter: &RunListFilter) -> Result<Page<GenerationRun>, RepoError>;

    // --- telemetry ingestion / retrieval ---
    async fn insert_telemetry_batch(&self, records: &[tm_types::TelemetryRecord]) -> Result<(), RepoError>;
    async fn count_telemetry_rows(&self, run_id: Uuid) -> Result<i64, RepoError>;
    async fn fetch_telemetry_batch(
        &self,
        run_id: Uuid,
        after_record_id: i64,
        batch_size: i64,
    ) -> Result<TelemetryBatch, RepoError>;

    // --- model runs ---
    async fn create_model_run(&self, run: &ModelRun) -> Result<(), RepoError>;
    async fn create_hpo_trial_run(&self, run: &ModelRun) -> Result<(), RepoError>;
    async fn update_model_run_status(
        &self,
        model_run_id: Uuid,
        status: tm_types::JobState,
        artifact_path: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), RepoError>;
    async fn get_model_run(&self, model_run_id: Uuid) -> Result<ModelRun, RepoError>;
    async fn list_hpo_trials(&self, parent_run_id: Uuid) -> Result<Vec<ModelRun>, RepoError>;
    async fn update_best_trial(
        &self,
        parent_run_id: Uuid,
        best_trial_run_id: Uuid,
        best_metric_value: f64,
    ) -> Result<(), RepoError>;
    async fn update_trial_eligibility(&self, model_run_id: Uuid, is_eligible: bool) -> Result<(), RepoError>;

    // --- inference runs ---
    async fn create_inference_run(&self, model_run_id: Uuid) -> Result<Uuid, RepoError>;
    async fn update_inference_run_status(
        &self,
        inference_id: Uuid,
        status: tm_types::JobState,
        anomaly_count: u32,
        latency_ms: f64,
        details: serde_json::Value,
    ) -> Result<(), RepoError>;

    // --- dataset score jobs (spec 4.12) ---
    /// Creates a new scoring job, or fails with
    /// [`RepoError::ConflictExistingJob`] carrying the id of a non-terminal
    /// job already scoring the same `(dataset_id, model_run_id)` pair — the
    /// caller treats that id as the idempotent result of this call.
    async fn create_dataset_score_job(&self, dataset_id: Uuid, model_run_id: Uuid) -> Result<Uuid, RepoError>;
    async fn get_dataset_score_job(&self, job_id: Uuid) -> Result<DatasetScoreJob, RepoError>;
    async fn start_dataset_score_job(&self, job_id: Uuid, total_rows: i64) -> Result<(), RepoError>;
    async fn checkpoint_dataset_score_job(
        &self,
        job_id: Uuid,
        last_record_id: i64,
        processed_rows: i64,
    ) -> Result<(), RepoError>;
    async fn complete_dataset_score_job(&self, job_id: Uuid, state: tm_types::JobState) -> Result<(), RepoError>;
    async fn fail_dataset_score_job(&self, job_id: Uuid, error: &str) -> Result<(), RepoError>;
    async fn insert_dataset_scores_batch(&self, scores: &[DatasetScore]) -> Result<(), RepoError>;

    // --- reconciliation (spec 4.9) ---
    /// Transitions every non-terminal row in `generation_runs`, `model_runs`
    /// and `dataset_score_jobs` older than `stale_after` to FAILED with
    /// `"System restart/recovery"`. `stale_after = None` reconciles
    /// unconditionally (startup sweep).
    async fn reconcile_stale_jobs(&self, stale_after: Option<chrono::Duration>) -> Result<u64, RepoError>;

    // --- analytics (spec 4.13) ---
    async fn dataset_summary(&self, dataset_id: Uuid) -> Result<DatasetSummary, RepoError>;
    async fn topk_by_dimension(&self, dataset_id: Uuid, dimension: &str, k: usize) -> Result<TopKResult, RepoError>;
    async fn timeseries(
        &self,
        dataset_id: Uuid,
        metric: &str,
        aggregation: &str,
        bucket: chrono::Duration,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TimeSeriesPoint>, RepoError>;
    async fn histogram(&self, dataset_id: Uuid, metric: &str, buckets: usize) -> Result<Histogram, RepoError>;
    async fn metric_stats(&self, dataset_id: Uuid, metric: &str) -> Result<MetricStats, RepoError>;
    async fn score_page(
        &self,
        dataset_id: Uuid,
        model_run_id: Uuid,
        filter: &ScoreFilter,
    ) -> Result<Page<DatasetScore>, RepoError>;
    async fn evaluation_metrics(&self, dataset_id: Uuid, model_run_id: Uuid) -> Result<EvaluationMetrics, RepoError>;
    async fn error_distribution(
        &self,
        dataset_id: Uuid,
        model_run_id: Uuid,
        dimension: &str,
    ) -> Result<Vec<ErrorDistributionEntry>, RepoError>;
}
