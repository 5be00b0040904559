//! `sqlx::Postgres`-backed `DatasetRepository`.
//!
//! Grounded on `examples/adamtc007-ob-poc/rust/src/database/service_service.rs`
//! for the query style (`sqlx::query`/`query_as`, explicit `.bind(...)`
//! chains, `Result`-returning async methods on a small service struct) and
//! on `examples/original_source/src/db_client.cpp` for which statements to
//! run and the allowlist-before-SQL discipline. Connections are acquired one
//! at a time from `tm_pool::Pool<PgConnectionFactory>` rather than
//! `sqlx::PgPool`'s own pool, mirroring the original's
//! `PooledDbConnectionManager` wrapping raw `pqxx::connection`s — this keeps
//! acquisition, timeout and queue-depth behaviour on one code path
//! (Testable Property 7) shared with every other pooled resource.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use tm_pool::{ConnectionFactory, Pool, PoolConfig};
use tm_types::{DatasetScore, DatasetScoreJob, GenerationRun, JobState, ModelRun, RunStatus, TelemetryRecord};

use crate::allowlist::{is_valid_aggregation, is_valid_dimension, is_valid_metric};
use crate::repository::{DatasetRepository, RepoError, TelemetryBatch};
use crate::types::{
    ConfusionMatrix, CountEntry, DatasetSummary, DimensionCardinality, ErrorDistributionEntry, EvaluationMetrics,
    Histogram, HistogramBucket, MetricStats, Page, RunListFilter, ScoreFilter, TimeBucketValue, TimeSeriesPoint,
    TopKResult,
};

pub struct PgConnectionFactory {
    database_url: String,
}

impl PgConnectionFactory {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self { database_url: database_url.into() }
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    type Connection = sqlx::PgConnection;
    type Error = sqlx::Error;

    async fn open(&self) -> Result<Self::Connection, Self::Error> {
        use sqlx::Connection;
        sqlx::PgConnection::connect(&self.database_url).await
    }

    fn is_healthy(&self, _conn: &Self::Connection) -> bool {
        true
    }
}

fn query_err(e: sqlx::Error) -> RepoError {
    RepoError::Query(e.to_string())
}

fn insert_err(e: sqlx::Error) -> RepoError {
    RepoError::Insert(e.to_string())
}

pub struct PgDatasetRepository {
    pool: Arc<Pool<PgConnectionFactory>>,
}

impl PgDatasetRepository {
    pub fn new(database_url: impl Into<String>, config: PoolConfig) -> Self {
        Self { pool: Pool::new(PgConnectionFactory::new(database_url), config) }
    }

    pub fn from_pool(pool: Arc<Pool<PgConnectionFactory>>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DatasetRepository for PgDatasetRepository {
    async fn create_generation_run(&self, run: &GenerationRun) -> Result<(), RepoError> {
        let mut conn =
            self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        sqlx::query(
            "INSERT INTO generation_runs (run_id, tier, host_count, start_time, end_time, interval_seconds, seed, status, inserted_rows, config, request_id, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)",
        )
        .bind(run.run_id)
        .bind(&run.tier)
        .bind(run.host_count as i64)
        .bind(run.start_time)
        .bind(run.end_time)
        .bind(run.interval_seconds as i64)
        .bind(run.seed as i64)
        .bind(run.status.as_str())
        .bind(run.inserted_rows as i64)
        .bind(&run.config)
        .bind(&run.request_id)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(insert_err)?;
        Ok(())
    }

    async fn update_generation_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        inserted_rows: u64,
        error: Option<&str>,
    ) -> Result<(), RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        sqlx::query(
            "UPDATE generation_runs SET status = $1, inserted_rows = $2, error = $3, updated_at = NOW() WHERE run_id = $4",
        )
        .bind(status.as_str())
        .bind(inserted_rows as i64)
        .bind(error)
        .bind(run_id)
        .execute(&mut *conn)
        .await
        .map_err(insert_err)?;
        Ok(())
    }

    async fn get_generation_run(&self, run_id: Uuid) -> Result<GenerationRun, RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let row = sqlx::query(
            "SELECT run_id, tier, host_count, start_time, end_time, interval_seconds, seed, status, inserted_rows, error, config, request_id, created_at, updated_at \
             FROM generation_runs WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_err)?
        .ok_or_else(|| RepoError::NotFound { what: format!("generation_run {run_id}") })?;
        Ok(generation_run_from_row(&row))
    }

    async fn list_generation_runs(&self, filter: &RunListFilter) -> Result<Page<GenerationRun>, RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let limit = if filter.limit <= 0 { 100 } else { filter.limit };
        let rows = sqlx::query(
            "SELECT run_id, tier, host_count, start_time, end_time, interval_seconds, seed, status, inserted_rows, error, config, request_id, created_at, updated_at \
             FROM generation_runs \
             WHERE ($1::text IS NULL OR status = $1) \
               AND ($2::timestamptz IS NULL OR created_at >= $2) \
               AND ($3::timestamptz IS NULL OR created_at <= $3) \
               AND ($4::text IS NULL OR request_id = $4) \
             ORDER BY created_at DESC LIMIT $5 OFFSET $6",
        )
        .bind(&filter.status)
        .bind(filter.created_from)
        .bind(filter.created_to)
        .bind(&filter.owner_request_id)
        .bind(limit)
        .bind(filter.offset)
        .fetch_all(&mut *conn)
        .await
        .map_err(query_err)?;
        let total_row = sqlx::query("SELECT COUNT(*) AS count FROM generation_runs")
            .fetch_one(&mut *conn)
            .await
            .map_err(query_err)?;
        let total: i64 = total_row.get("count");
        Ok(Page { items: rows.iter().map(generation_run_from_row).collect(), total, limit, offset: filter.offset })
    }

    async fn insert_telemetry_batch(&self, records: &[TelemetryRecord]) -> Result<(), RepoError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let mut tx = conn.begin().await.map_err(insert_err)?;
        for record in records {
            sqlx::query(
                "INSERT INTO host_telemetry_archival \
                 (record_id, run_id, host_id, project_id, region, metric_timestamp, ingestion_time, \
                  cpu_usage, memory_usage, disk_utilization, network_rx_rate, network_tx_rate, is_anomaly, anomaly_type, labels) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
            )
            .bind(record.record_id)
            .bind(record.run_id)
            .bind(&record.host_id)
            .bind(&record.project_id)
            .bind(&record.region)
            .bind(record.metric_timestamp)
            .bind(record.ingestion_time)
            .bind(record.cpu_usage)
            .bind(record.memory_usage)
            .bind(record.disk_utilization)
            .bind(record.network_rx_rate)
            .bind(record.network_tx_rate)
            .bind(record.is_anomaly)
            .bind(&record.anomaly_type)
            .bind(serde_json::to_value(&record.labels).unwrap_or(serde_json::Value::Null))
            .execute(&mut *tx)
            .await
            .map_err(insert_err)?;
        }
        tx.commit().await.map_err(insert_err)?;
        Ok(())
    }

    async fn count_telemetry_rows(&self, run_id: Uuid) -> Result<i64, RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let row = sqlx::query("SELECT COUNT(*) AS count FROM host_telemetry_archival WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(query_err)?;
        Ok(row.get("count"))
    }

    async fn fetch_telemetry_batch(
        &self,
        run_id: Uuid,
        after_record_id: i64,
        batch_size: i64,
    ) -> Result<TelemetryBatch, RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let rows = sqlx::query(
            "SELECT record_id, run_id, host_id, project_id, region, metric_timestamp, ingestion_time, \
                    cpu_usage, memory_usage, disk_utilization, network_rx_rate, network_tx_rate, is_anomaly, anomaly_type, labels \
             FROM host_telemetry_archival WHERE run_id = $1 AND record_id > $2 ORDER BY record_id ASC LIMIT $3",
        )
        .bind(run_id)
        .bind(after_record_id)
        .bind(batch_size)
        .fetch_all(&mut *conn)
        .await
        .map_err(query_err)?;
        Ok(TelemetryBatch { records: rows.iter().map(telemetry_record_from_row).collect() })
    }

    async fn create_model_run(&self, run: &ModelRun) -> Result<(), RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        sqlx::query(
            "INSERT INTO model_runs (model_run_id, dataset_id, name, status, training_config, hpo_config, candidate_fingerprint, seed_used, request_id, is_eligible, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)",
        )
        .bind(run.model_run_id)
        .bind(run.dataset_id)
        .bind(&run.name)
        .bind(run.status.as_str())
        .bind(&run.training_config)
        .bind(&run.hpo_config)
        .bind(&run.candidate_fingerprint)
        .bind(run.seed_used.map(|s| s as i64))
        .bind(&run.request_id)
        .bind(run.is_eligible)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(insert_err)?;
        Ok(())
    }

    async fn create_hpo_trial_run(&self, run: &ModelRun) -> Result<(), RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        sqlx::query(
            "INSERT INTO model_runs (model_run_id, dataset_id, name, status, training_config, parent_run_id, candidate_fingerprint, seed_used, request_id, is_eligible, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)",
        )
        .bind(run.model_run_id)
        .bind(run.dataset_id)
        .bind(&run.name)
        .bind(run.status.as_str())
        .bind(&run.training_config)
        .bind(run.parent_run_id)
        .bind(&run.candidate_fingerprint)
        .bind(run.seed_used.map(|s| s as i64))
        .bind(&run.request_id)
        .bind(run.is_eligible)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(insert_err)?;
        Ok(())
    }

    async fn update_model_run_status(
        &self,
        model_run_id: Uuid,
        status: JobState,
        artifact_path: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        sqlx::query(
            "UPDATE model_runs SET status = $1, \
                artifact_path = COALESCE($2, artifact_path), \
                error = $3, updated_at = NOW(), \
                completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END \
             WHERE model_run_id = $5",
        )
        .bind(status.as_str())
        .bind(artifact_path)
        .bind(error)
        .bind(status.is_terminal())
        .bind(model_run_id)
        .execute(&mut *conn)
        .await
        .map_err(insert_err)?;
        Ok(())
    }

    async fn get_model_run(&self, model_run_id: Uuid) -> Result<ModelRun, RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let row = sqlx::query(
            "SELECT model_run_id, dataset_id, name, status, artifact_path, training_config, hpo_config, parent_run_id, \
                    best_trial_run_id, best_metric_value, is_eligible, candidate_fingerprint, seed_used, request_id, \
                    created_at, updated_at, completed_at, error \
             FROM model_runs WHERE model_run_id = $1",
        )
        .bind(model_run_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_err)?
        .ok_or_else(|| RepoError::NotFound { what: format!("model_run {model_run_id}") })?;
        Ok(model_run_from_row(&row))
    }

    async fn list_hpo_trials(&self, parent_run_id: Uuid) -> Result<Vec<ModelRun>, RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let rows = sqlx::query(
            "SELECT model_run_id, dataset_id, name, status, artifact_path, training_config, hpo_config, parent_run_id, \
                    best_trial_run_id, best_metric_value, is_eligible, candidate_fingerprint, seed_used, request_id, \
                    created_at, updated_at, completed_at, error \
             FROM model_runs WHERE parent_run_id = $1 ORDER BY created_at ASC",
        )
        .bind(parent_run_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(query_err)?;
        Ok(rows.iter().map(model_run_from_row).collect())
    }

    async fn update_best_trial(
        &self,
        parent_run_id: Uuid,
        best_trial_run_id: Uuid,
        best_metric_value: f64,
    ) -> Result<(), RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        sqlx::query("UPDATE model_runs SET best_trial_run_id = $1, best_metric_value = $2 WHERE model_run_id = $3")
            .bind(best_trial_run_id)
            .bind(best_metric_value)
            .bind(parent_run_id)
            .execute(&mut *conn)
            .await
            .map_err(insert_err)?;
        Ok(())
    }

    async fn update_trial_eligibility(&self, model_run_id: Uuid, is_eligible: bool) -> Result<(), RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        sqlx::query("UPDATE model_runs SET is_eligible = $1 WHERE model_run_id = $2")
            .bind(is_eligible)
            .bind(model_run_id)
            .execute(&mut *conn)
            .await
            .map_err(insert_err)?;
        Ok(())
    }

    async fn create_inference_run(&self, model_run_id: Uuid) -> Result<Uuid, RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let inference_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO inference_runs (inference_id, model_run_id, status, anomaly_count, latency_ms, details, created_at) \
             VALUES ($1,$2,'RUNNING',0,0.0,'{}'::jsonb, NOW())",
        )
        .bind(inference_id)
        .bind(model_run_id)
        .execute(&mut *conn)
        .await
        .map_err(insert_err)?;
        Ok(inference_id)
    }

    async fn update_inference_run_status(
        &self,
        inference_id: Uuid,
        status: JobState,
        anomaly_count: u32,
        latency_ms: f64,
        details: serde_json::Value,
    ) -> Result<(), RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        sqlx::query("UPDATE inference_runs SET status = $1, anomaly_count = $2, latency_ms = $3, details = $4 WHERE inference_id = $5")
            .bind(status.as_str())
            .bind(anomaly_count as i64)
            .bind(latency_ms)
            .bind(details)
            .bind(inference_id)
            .execute(&mut *conn)
            .await
            .map_err(insert_err)?;
        Ok(())
    }

    async fn create_dataset_score_job(&self, dataset_id: Uuid, model_run_id: Uuid) -> Result<Uuid, RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let mut tx = conn.begin().await.map_err(insert_err)?;
        let existing = sqlx::query(
            "SELECT job_id FROM dataset_score_jobs WHERE dataset_id = $1 AND model_run_id = $2 AND status IN ('PENDING','RUNNING') FOR UPDATE",
        )
        .bind(dataset_id)
        .bind(model_run_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_err)?;
        if let Some(row) = existing {
            let existing_job_id: Uuid = row.get("job_id");
            return Err(RepoError::ConflictExistingJob { existing_job_id });
        }
        let job_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO dataset_score_jobs (job_id, dataset_id, model_run_id, status, processed_rows, last_record_id, created_at, updated_at) \
             VALUES ($1,$2,$3,'PENDING',0,0,NOW(),NOW())",
        )
        .bind(job_id)
        .bind(dataset_id)
        .bind(model_run_id)
        .execute(&mut *tx)
        .await
        .map_err(insert_err)?;
        tx.commit().await.map_err(insert_err)?;
        Ok(job_id)
    }

    async fn get_dataset_score_job(&self, job_id: Uuid) -> Result<DatasetScoreJob, RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let row = sqlx::query(
            "SELECT job_id, dataset_id, model_run_id, status, total_rows, processed_rows, last_record_id, error, request_id, created_at, updated_at, completed_at \
             FROM dataset_score_jobs WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_err)?
        .ok_or_else(|| RepoError::NotFound { what: format!("dataset_score_job {job_id}") })?;
        Ok(dataset_score_job_from_row(&row))
    }

    async fn start_dataset_score_job(&self, job_id: Uuid, total_rows: i64) -> Result<(), RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        sqlx::query("UPDATE dataset_score_jobs SET status = 'RUNNING', total_rows = $1, updated_at = NOW() WHERE job_id = $2")
            .bind(total_rows)
            .bind(job_id)
            .execute(&mut *conn)
            .await
            .map_err(insert_err)?;
        Ok(())
    }

    async fn checkpoint_dataset_score_job(
        &self,
        job_id: Uuid,
        last_record_id: i64,
        processed_rows: i64,
    ) -> Result<(), RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        sqlx::query("UPDATE dataset_score_jobs SET last_record_id = $1, processed_rows = $2, updated_at = NOW() WHERE job_id = $3")
            .bind(last_record_id)
            .bind(processed_rows)
            .bind(job_id)
            .execute(&mut *conn)
            .await
            .map_err(insert_err)?;
        Ok(())
    }

    async fn complete_dataset_score_job(&self, job_id: Uuid, state: JobState) -> Result<(), RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        sqlx::query("UPDATE dataset_score_jobs SET status = $1, completed_at = NOW(), updated_at = NOW() WHERE job_id = $2")
            .bind(state.as_str())
            .bind(job_id)
            .execute(&mut *conn)
            .await
            .map_err(insert_err)?;
        Ok(())
    }

    async fn fail_dataset_score_job(&self, job_id: Uuid, error: &str) -> Result<(), RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        sqlx::query(
            "UPDATE dataset_score_jobs SET status = 'FAILED', error = $1, completed_at = NOW(), updated_at = NOW() WHERE job_id = $2",
        )
        .bind(error)
        .bind(job_id)
        .execute(&mut *conn)
        .await
        .map_err(insert_err)?;
        Ok(())
    }

    async fn insert_dataset_scores_batch(&self, scores: &[DatasetScore]) -> Result<(), RepoError> {
        if scores.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let mut tx = conn.begin().await.map_err(insert_err)?;
        for score in scores {
            sqlx::query(
                "INSERT INTO dataset_scores (score_id, dataset_id, model_run_id, record_id, reconstruction_error, predicted_is_anomaly, scored_at) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7)",
            )
            .bind(score.score_id)
            .bind(score.dataset_id)
            .bind(score.model_run_id)
            .bind(score.record_id)
            .bind(score.reconstruction_error)
            .bind(score.predicted_is_anomaly)
            .bind(score.scored_at)
            .execute(&mut *tx)
            .await
            .map_err(insert_err)?;
        }
        tx.commit().await.map_err(insert_err)?;
        Ok(())
    }

    /// Mirrors `DbClient::ReconcileStaleJobs` verbatim, plus the TTL
    /// predicate the spec's periodic sweep adds over the original's
    /// unconditional startup-only version.
    async fn reconcile_stale_jobs(&self, stale_after: Option<chrono::Duration>) -> Result<u64, RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let mut total = 0u64;
        for table in ["dataset_score_jobs", "model_runs", "generation_runs"] {
            let sql = match stale_after {
                None => format!(
                    "UPDATE {table} SET status='FAILED', error='System restart/recovery', updated_at=NOW() WHERE status='RUNNING'"
                ),
                Some(ttl) => format!(
                    "UPDATE {table} SET status='FAILED', error='System restart/recovery', updated_at=NOW() \
                     WHERE status='RUNNING' AND updated_at <= NOW() - INTERVAL '{} seconds'",
                    ttl.num_seconds()
                ),
            };
            let result = sqlx::query(&sql).execute(&mut *conn).await.map_err(insert_err)?;
            total += result.rows_affected();
        }
        Ok(total)
    }

    async fn dataset_summary(&self, dataset_id: Uuid) -> Result<DatasetSummary, RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let row = sqlx::query(
            "SELECT COUNT(*) AS row_count, MIN(metric_timestamp) AS start_ts, MAX(metric_timestamp) AS end_ts, \
                    AVG(CASE WHEN is_anomaly THEN 1.0 ELSE 0.0 END) AS anomaly_rate, \
                    PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY EXTRACT(EPOCH FROM (ingestion_time - metric_timestamp)) * 1000) AS p50_ms, \
                    PERCENTILE_CONT(0.95) WITHIN GROUP (ORDER BY EXTRACT(EPOCH FROM (ingestion_time - metric_timestamp)) * 1000) AS p95_ms \
             FROM host_telemetry_archival WHERE run_id = $1",
        )
        .bind(dataset_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(query_err)?;
        let row_count: i64 = row.get("row_count");
        if row_count == 0 {
            return Ok(DatasetSummary {
                row_count: 0,
                time_range_start: None,
                time_range_end: None,
                anomaly_rate: 0.0,
                top_anomaly_types: Vec::new(),
                dimension_cardinalities: Vec::new(),
                ingestion_latency_p50_ms: 0.0,
                ingestion_latency_p95_ms: 0.0,
                hourly_anomaly_rate_trend: Vec::new(),
            });
        }

        let top_rows = sqlx::query(
            "SELECT anomaly_type, COUNT(*) AS count FROM host_telemetry_archival \
             WHERE run_id = $1 AND anomaly_type IS NOT NULL GROUP BY anomaly_type ORDER BY count DESC LIMIT 10",
        )
        .bind(dataset_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(query_err)?;
        let top_anomaly_types =
            top_rows.iter().map(|r| CountEntry { value: r.get("anomaly_type"), count: r.get("count") }).collect();

        let mut dimension_cardinalities = Vec::new();
        for dim in ["region", "project_id", "host_id"] {
            let r = sqlx::query(&format!(
                "SELECT COUNT(DISTINCT {dim}) AS distinct_count FROM host_telemetry_archival WHERE run_id = $1"
            ))
            .bind(dataset_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(query_err)?;
            dimension_cardinalities
                .push(DimensionCardinality { dimension: dim.to_string(), distinct_count: r.get("distinct_count") });
        }

        let hourly_rows = sqlx::query(
            "SELECT date_trunc('hour', metric_timestamp) AS bucket_start, \
                    AVG(CASE WHEN is_anomaly THEN 1.0 ELSE 0.0 END) AS rate \
             FROM host_telemetry_archival WHERE run_id = $1 GROUP BY 1 ORDER BY 1",
        )
        .bind(dataset_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(query_err)?;
        let hourly_anomaly_rate_trend = hourly_rows
            .iter()
            .map(|r| TimeBucketValue { bucket_start: r.get("bucket_start"), value: r.get("rate") })
            .collect();

        Ok(DatasetSummary {
            row_count,
            time_range_start: row.get("start_ts"),
            time_range_end: row.get("end_ts"),
            anomaly_rate: row.get("anomaly_rate"),
            top_anomaly_types,
            dimension_cardinalities,
            ingestion_latency_p50_ms: row.get("p50_ms"),
            ingestion_latency_p95_ms: row.get("p95_ms"),
            hourly_anomaly_rate_trend,
        })
    }

    async fn topk_by_dimension(&self, dataset_id: Uuid, dimension: &str, k: usize) -> Result<TopKResult, RepoError> {
        if !is_valid_dimension(dimension) {
            return Err(RepoError::InvalidArgument { field: "dimension", value: dimension.to_string() });
        }
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let rows = sqlx::query(&format!(
            "SELECT {dimension} AS value, COUNT(*) AS count FROM host_telemetry_archival AS h \
             WHERE run_id = $1 GROUP BY {dimension} ORDER BY count DESC LIMIT $2"
        ))
        .bind(dataset_id)
        .bind(k as i64 + 1)
        .fetch_all(&mut *conn)
        .await
        .map_err(query_err)?;
        let truncated = rows.len() > k;
        let entries = rows.into_iter().take(k).map(|r| CountEntry { value: r.get("value"), count: r.get("count") }).collect();
        Ok(TopKResult { entries, truncated })
    }

    async fn timeseries(
        &self,
        dataset_id: Uuid,
        metric: &str,
        aggregation: &str,
        bucket: chrono::Duration,
        from: chrono::DateTime<chrono::Utc>,
        to: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<TimeSeriesPoint>, RepoError> {
        if !is_valid_metric(metric) {
            return Err(RepoError::InvalidArgument { field: "metric", value: metric.to_string() });
        }
        if !is_valid_aggregation(aggregation) {
            return Err(RepoError::InvalidArgument { field: "aggregation", value: aggregation.to_string() });
        }
        let agg_expr = match aggregation {
            "mean" => format!("AVG({metric})"),
            "min" => format!("MIN({metric})"),
            "max" => format!("MAX({metric})"),
            "p50" => format!("PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY {metric})"),
            "p95" => format!("PERCENTILE_CONT(0.95) WITHIN GROUP (ORDER BY {metric})"),
            _ => unreachable!("validated by is_valid_aggregation"),
        };
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let rows = sqlx::query(&format!(
            "SELECT to_timestamp(floor(extract(epoch from metric_timestamp) / $1) * $1) AS bucket_start, \
                    {agg_expr} AS value \
             FROM host_telemetry_archival \
             WHERE run_id = $2 AND metric_timestamp BETWEEN $3 AND $4 \
             GROUP BY 1 ORDER BY 1"
        ))
        .bind(bucket.num_seconds() as f64)
        .bind(dataset_id)
        .bind(from)
        .bind(to)
        .fetch_all(&mut *conn)
        .await
        .map_err(query_err)?;
        Ok(rows
            .iter()
            .map(|r| TimeSeriesPoint {
                bucket_start: r.get("bucket_start"),
                aggregation: aggregation.to_string(),
                value: r.get("value"),
            })
            .collect())
    }

    async fn histogram(&self, dataset_id: Uuid, metric: &str, buckets: usize) -> Result<Histogram, RepoError> {
        if !is_valid_metric(metric) {
            return Err(RepoError::InvalidArgument { field: "metric", value: metric.to_string() });
        }
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let range_row = sqlx::query(&format!(
            "SELECT MIN({metric}) AS min, MAX({metric}) AS max FROM host_telemetry_archival WHERE run_id = $1"
        ))
        .bind(dataset_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(query_err)?;
        let min: Option<f64> = range_row.get("min");
        let max: Option<f64> = range_row.get("max");
        let (min, max) = match (min, max) {
            (Some(min), Some(max)) => (min, max),
            _ => return Err(RepoError::NoData(format!("no rows for dataset {dataset_id}"))),
        };
        let buckets = buckets.max(1);
        let rows = sqlx::query(&format!(
            "SELECT width_bucket({metric}, $1, $2, $3) AS bucket, COUNT(*) AS count \
             FROM host_telemetry_archival WHERE run_id = $4 GROUP BY 1 ORDER BY 1"
        ))
        .bind(min)
        .bind(max + 1e-9)
        .bind(buckets as i32)
        .bind(dataset_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(query_err)?;
        let width = ((max - min) / buckets as f64).max(1e-9);
        let mut counts = vec![0i64; buckets];
        for r in &rows {
            let bucket: i32 = r.get("bucket");
            let idx = (bucket - 1).clamp(0, buckets as i32 - 1) as usize;
            counts[idx] += r.get::<i64, _>("count");
        }
        let hist_buckets = counts
            .into_iter()
            .enumerate()
            .map(|(i, count)| HistogramBucket { lower: min + i as f64 * width, upper: min + (i + 1) as f64 * width, count })
            .collect();
        Ok(Histogram { metric: metric.to_string(), bucket_width: width, min, max, buckets: hist_buckets })
    }

    async fn metric_stats(&self, dataset_id: Uuid, metric: &str) -> Result<MetricStats, RepoError> {
        if !is_valid_metric(metric) {
            return Err(RepoError::InvalidArgument { field: "metric", value: metric.to_string() });
        }
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let row = sqlx::query(&format!(
            "SELECT AVG({metric}) AS mean, MIN({metric}) AS min, MAX({metric}) AS max, \
                    PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY {metric}) AS p50, \
                    PERCENTILE_CONT(0.95) WITHIN GROUP (ORDER BY {metric}) AS p95, \
                    COUNT(*) AS count \
             FROM host_telemetry_archival WHERE run_id = $1"
        ))
        .bind(dataset_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(query_err)?;
        let count: i64 = row.get("count");
        if count == 0 {
            return Err(RepoError::NoData(format!("no rows for dataset {dataset_id}")));
        }
        Ok(MetricStats {
            metric: metric.to_string(),
            mean: row.get("mean"),
            min: row.get("min"),
            max: row.get("max"),
            p50: row.get("p50"),
            p95: row.get("p95"),
            count,
        })
    }

    async fn score_page(
        &self,
        dataset_id: Uuid,
        model_run_id: Uuid,
        filter: &ScoreFilter,
    ) -> Result<Page<DatasetScore>, RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let limit = if filter.limit <= 0 { 100 } else { filter.limit };
        let rows = sqlx::query(
            "SELECT score_id, dataset_id, model_run_id, record_id, reconstruction_error, predicted_is_anomaly, scored_at \
             FROM dataset_scores \
             WHERE dataset_id = $1 AND model_run_id = $2 \
               AND ($3::double precision IS NULL OR reconstruction_error >= $3) \
               AND ($4::double precision IS NULL OR reconstruction_error <= $4) \
               AND ($5 = FALSE OR predicted_is_anomaly = TRUE) \
             ORDER BY record_id ASC LIMIT $6 OFFSET $7",
        )
        .bind(dataset_id)
        .bind(model_run_id)
        .bind(filter.min_error)
        .bind(filter.max_error)
        .bind(filter.only_anomalies)
        .bind(limit)
        .bind(filter.offset)
        .fetch_all(&mut *conn)
        .await
        .map_err(query_err)?;
        let total_row = sqlx::query("SELECT COUNT(*) AS count FROM dataset_scores WHERE dataset_id = $1 AND model_run_id = $2")
            .bind(dataset_id)
            .bind(model_run_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(query_err)?;
        Ok(Page {
            items: rows.iter().map(dataset_score_from_row).collect(),
            total: total_row.get("count"),
            limit,
            offset: filter.offset,
        })
    }

    async fn evaluation_metrics(&self, dataset_id: Uuid, model_run_id: Uuid) -> Result<EvaluationMetrics, RepoError> {
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let confusion_row = sqlx::query(
            "SELECT \
                COUNT(*) FILTER (WHERE s.predicted_is_anomaly AND h.is_anomaly) AS tp, \
                COUNT(*) FILTER (WHERE s.predicted_is_anomaly AND NOT h.is_anomaly) AS fp, \
                COUNT(*) FILTER (WHERE NOT s.predicted_is_anomaly AND NOT h.is_anomaly) AS tn, \
                COUNT(*) FILTER (WHERE NOT s.predicted_is_anomaly AND h.is_anomaly) AS fn_count \
             FROM dataset_scores s JOIN host_telemetry_archival h \
               ON h.run_id = s.dataset_id AND h.record_id = s.record_id \
             WHERE s.dataset_id = $1 AND s.model_run_id = $2",
        )
        .bind(dataset_id)
        .bind(model_run_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(query_err)?;

        // Sampled ROC/PR over decile thresholds of reconstruction_error,
        // computed with one query per decile rather than a window-function
        // pivot, to keep each statement within the allowlisted-column shape
        // the rest of this module uses.
        let thresholds_row = sqlx::query(
            "SELECT percentile_cont(ARRAY[0.0,0.1,0.2,0.3,0.4,0.5,0.6,0.7,0.8,0.9,1.0]) \
                WITHIN GROUP (ORDER BY reconstruction_error) AS thresholds \
             FROM dataset_scores WHERE dataset_id = $1 AND model_run_id = $2",
        )
        .bind(dataset_id)
        .bind(model_run_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(query_err)?;
        let thresholds: Vec<f64> = thresholds_row.try_get("thresholds").unwrap_or_default();

        let totals_row = sqlx::query(
            "SELECT COUNT(*) FILTER (WHERE h.is_anomaly) AS positives, COUNT(*) FILTER (WHERE NOT h.is_anomaly) AS negatives \
             FROM dataset_scores s JOIN host_telemetry_archival h ON h.run_id = s.dataset_id AND h.record_id = s.record_id \
             WHERE s.dataset_id = $1 AND s.model_run_id = $2",
        )
        .bind(dataset_id)
        .bind(model_run_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(query_err)?;
        let positives: i64 = totals_row.get("positives");
        let negatives: i64 = totals_row.get("negatives");

        let mut roc_points = Vec::new();
        let mut pr_points = Vec::new();
        for threshold in thresholds {
            let row = sqlx::query(
                "SELECT COUNT(*) FILTER (WHERE h.is_anomaly) AS tp, COUNT(*) FILTER (WHERE NOT h.is_anomaly) AS fp \
                 FROM dataset_scores s JOIN host_telemetry_archival h ON h.run_id = s.dataset_id AND h.record_id = s.record_id \
                 WHERE s.dataset_id = $1 AND s.model_run_id = $2 AND s.reconstruction_error >= $3",
            )
            .bind(dataset_id)
            .bind(model_run_id)
            .bind(threshold)
            .fetch_one(&mut *conn)
            .await
            .map_err(query_err)?;
            let tp: i64 = row.get("tp");
            let fp: i64 = row.get("fp");
            let tpr = if positives > 0 { tp as f64 / positives as f64 } else { 0.0 };
            let fpr = if negatives > 0 { fp as f64 / negatives as f64 } else { 0.0 };
            let precision = if tp + fp > 0 { tp as f64 / (tp + fp) as f64 } else { 0.0 };
            roc_points.push((fpr, tpr));
            pr_points.push((tpr, precision));
        }

        Ok(EvaluationMetrics {
            confusion: ConfusionMatrix {
                true_positive: confusion_row.get("tp"),
                false_positive: confusion_row.get("fp"),
                true_negative: confusion_row.get("tn"),
                false_negative: confusion_row.get("fn_count"),
            },
            roc_points,
            pr_points,
        })
    }

    async fn error_distribution(
        &self,
        dataset_id: Uuid,
        model_run_id: Uuid,
        dimension: &str,
    ) -> Result<Vec<ErrorDistributionEntry>, RepoError> {
        if !is_valid_dimension(dimension) {
            return Err(RepoError::InvalidArgument { field: "dimension", value: dimension.to_string() });
        }
        let mut conn = self.pool.get().await.map_err(|e| RepoError::Query(e.to_string()))?;
        let rows = sqlx::query(&format!(
            "SELECT h.{dimension} AS dimension_value, AVG(s.reconstruction_error) AS mean_error, COUNT(*) AS count \
             FROM dataset_scores s JOIN host_telemetry_archival h ON h.run_id = s.dataset_id AND h.record_id = s.record_id \
             WHERE s.dataset_id = $1 AND s.model_run_id = $2 GROUP BY 1 ORDER BY mean_error DESC"
        ))
        .bind(dataset_id)
        .bind(model_run_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(query_err)?;
        Ok(rows
            .iter()
            .map(|r| ErrorDistributionEntry {
                dimension_value: r.get("dimension_value"),
                mean_error: r.get("mean_error"),
                count: r.get("count"),
            })
            .collect())
    }
}

fn generation_run_from_row(row: &sqlx::postgres::PgRow) -> GenerationRun {
    let status_str: String = row.get("status");
    GenerationRun {
        run_id: row.get("run_id"),
        tier: row.get("tier"),
        host_count: row.get::<i64, _>("host_count") as u32,
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        interval_seconds: row.get::<i64, _>("interval_seconds") as u32,
        seed: row.get::<i64, _>("seed") as u64,
        status: run_status_from_str(&status_str),
        inserted_rows: row.get::<i64, _>("inserted_rows") as u64,
        error: row.try_get("error").ok(),
        config: row.try_get("config").unwrap_or(serde_json::Value::Null),
        request_id: row.try_get("request_id").ok(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn run_status_from_str(s: &str) -> RunStatus {
    match s {
        "PENDING" => RunStatus::Pending,
        "RUNNING" => RunStatus::Running,
        "SUCCEEDED" => RunStatus::Succeeded,
        _ => RunStatus::Failed,
    }
}

fn model_run_from_row(row: &sqlx::postgres::PgRow) -> ModelRun {
    let status_str: String = row.get("status");
    ModelRun {
        model_run_id: row.get("model_run_id"),
        dataset_id: row.get("dataset_id"),
        name: row.get("name"),
        status: status_str.parse().unwrap_or(JobState::Failed),
        artifact_path: row.try_get("artifact_path").ok(),
        training_config: row.try_get("training_config").unwrap_or(serde_json::Value::Null),
        hpo_config: row.try_get("hpo_config").ok(),
        parent_run_id: row.try_get("parent_run_id").ok(),
        best_trial_run_id: row.try_get("best_trial_run_id").ok(),
        best_metric_value: row.try_get("best_metric_value").ok(),
        is_eligible: row.get("is_eligible"),
        candidate_fingerprint: row.try_get("candidate_fingerprint").ok(),
        seed_used: row.try_get::<Option<i64>, _>("seed_used").ok().flatten().map(|v| v as u64),
        request_id: row.try_get("request_id").ok(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        completed_at: row.try_get("completed_at").ok(),
        error: row.try_get("error").ok(),
    }
}

fn dataset_score_job_from_row(row: &sqlx::postgres::PgRow) -> DatasetScoreJob {
    let status_str: String = row.get("status");
    DatasetScoreJob {
        job_id: row.get("job_id"),
        dataset_id: row.get("dataset_id"),
        model_run_id: row.get("model_run_id"),
        status: status_str.parse().unwrap_or(JobState::Failed),
        total_rows: row.try_get("total_rows").ok(),
        processed_rows: row.get("processed_rows"),
        last_record_id: row.get("last_record_id"),
        error: row.try_get("error").ok(),
        request_id: row.try_get("request_id").ok(),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        completed_at: row.try_get("completed_at").ok(),
    }
}

fn dataset_score_from_row(row: &sqlx::postgres::PgRow) -> DatasetScore {
    DatasetScore {
        score_id: row.get("score_id"),
        dataset_id: row.get("dataset_id"),
        model_run_id: row.get("model_run_id"),
        record_id: row.get("record_id"),
        reconstruction_error: row.get("reconstruction_error"),
        predicted_is_anomaly: row.get("predicted_is_anomaly"),
        scored_at: row.get("scored_at"),
    }
}

fn telemetry_record_from_row(row: &sqlx::postgres::PgRow) -> TelemetryRecord {
    TelemetryRecord {
        record_id: row.get("record_id"),
        run_id: row.get("run_id"),
        host_id: row.get("host_id"),
        project_id: row.get("project_id"),
        region: row.get("region"),
        metric_timestamp: row.get("metric_timestamp"),
        ingestion_time: row.get("ingestion_time"),
        cpu_usage: row.get("cpu_usage"),
        memory_usage: row.get("memory_usage"),
        disk_utilization: row.get("disk_utilization"),
        network_rx_rate: row.get("network_rx_rate"),
        network_tx_rate: row.get("network_tx_rate"),
        is_anomaly: row.get("is_anomaly"),
        anomaly_type: row.try_get("anomaly_type").ok(),
        labels: row
            .try_get::<Option<serde_json::Value>, _>("labels")
            .ok()
            .flatten()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default(),
    }
}
