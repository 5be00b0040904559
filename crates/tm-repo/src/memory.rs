//! In-memory `DatasetRepository`, grounded on
//! `examples/original_source/tests/mocks/mock_db_client.h`: the original
//! mock mostly no-ops and records the last call for inspection. This
//! implementation goes further and actually maintains consistent state
//! (rather than stubbing every method out), because the job manager,
//! reconciler and scorer tests in `tm-jobs` need a working substrate, not
//! just a call recorder, to exercise their own logic without Postgres.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Timelike, Utc};
use uuid::Uuid;

use tm_types::{DatasetScore, DatasetScoreJob, GenerationRun, JobState, ModelRun, RunStatus, TelemetryRecord};

use crate::repository::{DatasetRepository, RepoError, TelemetryBatch};
use crate::types::{
    ConfusionMatrix, CountEntry, DatasetSummary, DimensionCardinality, ErrorDistributionEntry, EvaluationMetrics,
    Histogram, HistogramBucket, MetricStats, Page, RunListFilter, ScoreFilter, TimeBucketValue, TimeSeriesPoint,
    TopKResult,
};

#[derive(Default)]
struct Inner {
    generation_runs: HashMap<Uuid, GenerationRun>,
    telemetry: HashMap<Uuid, Vec<TelemetryRecord>>,
    model_runs: HashMap<Uuid, ModelRun>,
    hpo_trials: HashMap<Uuid, Vec<Uuid>>,
    inference_runs: HashMap<Uuid, tm_types::InferenceRun>,
    score_jobs: HashMap<Uuid, DatasetScoreJob>,
    scores: HashMap<(Uuid, Uuid), Vec<DatasetScore>>,
}

/// In-process mock of the persistence backend. Cheap to construct, safe to
/// share across tasks via `Arc`.
#[derive(Default)]
pub struct InMemoryDatasetRepository {
    inner: Mutex<Inner>,
}

impl InMemoryDatasetRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("in-memory repository mutex poisoned")
    }
}

fn paginate<T: Clone>(mut items: Vec<T>, limit: i64, offset: i64) -> Page<T> {
    let total = items.len() as i64;
    let offset = offset.max(0) as usize;
    let limit = if limit <= 0 { items.len() as i64 } else { limit } as usize;
    let page = if offset >= items.len() {
        Vec::new()
    } else {
        items.drain(offset..).take(limit).collect()
    };
    Page { items: page, total, limit: limit as i64, offset: offset as i64 }
}

#[async_trait]
impl DatasetRepository for InMemoryDatasetRepository {
    async fn create_generation_run(&self, run: &GenerationRun) -> Result<(), RepoError> {
        self.lock().generation_runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn update_generation_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        inserted_rows: u64,
        error: Option<&str>,
    ) -> Result<(), RepoError> {
        let mut guard = self.lock();
        let run = guard
            .generation_runs
            .get_mut(&run_id)
            .ok_or_else(|| RepoError::NotFound { what: format!("generation_run {run_id}") })?;
        run.status = status;
        run.inserted_rows = inserted_rows;
        run.error = error.map(str::to_string);
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn get_generation_run(&self, run_id: Uuid) -> Result<GenerationRun, RepoError> {
        self.lock()
            .generation_runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| RepoError::NotFound { what: format!("generation_run {run_id}") })
    }

    async fn list_generation_runs(&self, filter: &RunListFilter) -> Result<Page<GenerationRun>, RepoError> {
        let guard = self.lock();
        let mut items: Vec<GenerationRun> = guard
            .generation_runs
            .values()
            .filter(|r| filter.status.as_deref().map(|s| s == r.status.as_str()).unwrap_or(true))
            .filter(|r| filter.created_from.map(|from| r.created_at >= from).unwrap_or(true))
            .filter(|r| filter.created_to.map(|to| r.created_at <= to).unwrap_or(true))
            .filter(|r| filter.owner_request_id.as_deref().map(|rid| r.request_id.as_deref() == Some(rid)).unwrap_or(true))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(items, filter.limit, filter.offset))
    }

    async fn insert_telemetry_batch(&self, records: &[TelemetryRecord]) -> Result<(), RepoError> {
        let mut guard = self.lock();
        for record in records {
            guard.telemetry.entry(record.run_id).or_default().push(record.clone());
        }
        Ok(())
    }

    async fn count_telemetry_rows(&self, run_id: Uuid) -> Result<i64, RepoError> {
        Ok(self.lock().telemetry.get(&run_id).map(|v| v.len() as i64).unwrap_or(0))
    }

    async fn fetch_telemetry_batch(
        &self,
        run_id: Uuid,
        after_record_id: i64,
        batch_size: i64,
    ) -> Result<TelemetryBatch, RepoError> {
        let guard = self.lock();
        let records = guard
            .telemetry
            .get(&run_id)
            .map(|rows| {
                let mut matching: Vec<TelemetryRecord> =
                    rows.iter().filter(|r| r.record_id > after_record_id).cloned().collect();
                matching.sort_by_key(|r| r.record_id);
                matching.truncate(batch_size.max(0) as usize);
                matching
            })
            .unwrap_or_default();
        Ok(TelemetryBatch { records })
    }

    async fn create_model_run(&self, run: &ModelRun) -> Result<(), RepoError> {
        self.lock().model_runs.insert(run.model_run_id, run.clone());
        Ok(())
    }

    async fn create_hpo_trial_run(&self, run: &ModelRun) -> Result<(), RepoError> {
        let mut guard = self.lock();
        if let Some(parent) = run.parent_run_id {
            guard.hpo_trials.entry(parent).or_default().push(run.model_run_id);
        }
        guard.model_runs.insert(run.model_run_id, run.clone());
        Ok(())
    }

    async fn update_model_run_status(
        &self,
        model_run_id: Uuid,
        status: JobState,
        artifact_path: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), RepoError> {
        let mut guard = self.lock();
        let run = guard
            .model_runs
            .get_mut(&model_run_id)
            .ok_or_else(|| RepoError::NotFound { what: format!("model_run {model_run_id}") })?;
        run.status = status;
        if let Some(path) = artifact_path {
            run.artifact_path = Some(path.to_string());
        }
        run.error = error.map(str::to_string);
        run.updated_at = Utc::now();
        if status.is_terminal() {
            run.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn get_model_run(&self, model_run_id: Uuid) -> Result<ModelRun, RepoError> {
        self.lock()
            .model_runs
            .get(&model_run_id)
            .cloned()
            .ok_or_else(|| RepoError::NotFound { what: format!("model_run {model_run_id}") })
    }

    async fn list_hpo_trials(&self, parent_run_id: Uuid) -> Result<Vec<ModelRun>, RepoError> {
        let guard = self.lock();
        let ids = guard.hpo_trials.get(&parent_run_id).cloned().unwrap_or_default();
        Ok(ids.into_iter().filter_map(|id| guard.model_runs.get(&id).cloned()).collect())
    }

    async fn update_best_trial(
        &self,
        parent_run_id: Uuid,
        best_trial_run_id: Uuid,
        best_metric_value: f64,
    ) -> Result<(), RepoError> {
        let mut guard = self.lock();
        let run = guard
            .model_runs
            .get_mut(&parent_run_id)
            .ok_or_else(|| RepoError::NotFound { what: format!("model_run {parent_run_id}") })?;
        run.best_trial_run_id = Some(best_trial_run_id);
        run.best_metric_value = Some(best_metric_value);
        Ok(())
    }

    async fn update_trial_eligibility(&self, model_run_id: Uuid, is_eligible: bool) -> Result<(), RepoError> {
        let mut guard = self.lock();
        let run = guard
            .model_runs
            .get_mut(&model_run_id)
            .ok_or_else(|| RepoError::NotFound { what: format!("model_run {model_run_id}") })?;
        run.is_eligible = is_eligible;
        Ok(())
    }

    async fn create_inference_run(&self, model_run_id: Uuid) -> Result<Uuid, RepoError> {
        let id = Uuid::new_v4();
        self.lock().inference_runs.insert(
            id,
            tm_types::InferenceRun {
                inference_id: id,
                model_run_id,
                status: JobState::Running,
                anomaly_count: 0,
                latency_ms: 0.0,
                details: serde_json::Value::Null,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn update_inference_run_status(
        &self,
        inference_id: Uuid,
        status: JobState,
        anomaly_count: u32,
        latency_ms: f64,
        details: serde_json::Value,
    ) -> Result<(), RepoError> {
        let mut guard = self.lock();
        let run = guard
            .inference_runs
            .get_mut(&inference_id)
            .ok_or_else(|| RepoError::NotFound { what: format!("inference_run {inference_id}") })?;
        run.status = status;
        run.anomaly_count = anomaly_count;
        run.latency_ms = latency_ms;
        run.details = details;
        Ok(())
    }

    async fn create_dataset_score_job(&self, dataset_id: Uuid, model_run_id: Uuid) -> Result<Uuid, RepoError> {
        let mut guard = self.lock();
        if let Some(existing) = guard
            .score_jobs
            .values()
            .find(|j| j.dataset_id == dataset_id && j.model_run_id == model_run_id && !j.status.is_terminal())
        {
            return Err(RepoError::ConflictExistingJob { existing_job_id: existing.job_id });
        }
        let job_id = Uuid::new_v4();
        let now = Utc::now();
        guard.score_jobs.insert(
            job_id,
            DatasetScoreJob {
                job_id,
                dataset_id,
                model_run_id,
                status: JobState::Pending,
                total_rows: None,
                processed_rows: 0,
                last_record_id: 0,
                error: None,
                request_id: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
            },
        );
        Ok(job_id)
    }

    async fn get_dataset_score_job(&self, job_id: Uuid) -> Result<DatasetScoreJob, RepoError> {
        self.lock()
            .score_jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| RepoError::NotFound { what: format!("dataset_score_job {job_id}") })
    }

    async fn start_dataset_score_job(&self, job_id: Uuid, total_rows: i64) -> Result<(), RepoError> {
        let mut guard = self.lock();
        let job = guard
            .score_jobs
            .get_mut(&job_id)
            .ok_or_else(|| RepoError::NotFound { what: format!("dataset_score_job {job_id}") })?;
        job.status = JobState::Running;
        job.total_rows = Some(total_rows);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn checkpoint_dataset_score_job(
        &self,
        job_id: Uuid,
        last_record_id: i64,
        processed_rows: i64,
    ) -> Result<(), RepoError> {
        let mut guard = self.lock();
        let job = guard
            .score_jobs
            .get_mut(&job_id)
            .ok_or_else(|| RepoError::NotFound { what: format!("dataset_score_job {job_id}") })?;
        job.last_record_id = last_record_id;
        job.processed_rows = processed_rows;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn complete_dataset_score_job(&self, job_id: Uuid, state: JobState) -> Result<(), RepoError> {
        let mut guard = self.lock();
        let job = guard
            .score_jobs
            .get_mut(&job_id)
            .ok_or_else(|| RepoError::NotFound { what: format!("dataset_score_job {job_id}") })?;
        job.status = state;
        job.updated_at = Utc::now();
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn fail_dataset_score_job(&self, job_id: Uuid, error: &str) -> Result<(), RepoError> {
        let mut guard = self.lock();
        let job = guard
            .score_jobs
            .get_mut(&job_id)
            .ok_or_else(|| RepoError::NotFound { what: format!("dataset_score_job {job_id}") })?;
        job.status = JobState::Failed;
        job.error = Some(error.to_string());
        job.updated_at = Utc::now();
        job.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn insert_dataset_scores_batch(&self, scores: &[DatasetScore]) -> Result<(), RepoError> {
        let mut guard = self.lock();
        for score in scores {
            guard.scores.entry((score.dataset_id, score.model_run_id)).or_default().push(score.clone());
        }
        Ok(())
    }

    async fn reconcile_stale_jobs(&self, stale_after: Option<chrono::Duration>) -> Result<u64, RepoError> {
        let mut guard = self.lock();
        let now = Utc::now();
        let mut reconciled = 0u64;
        let is_stale = |updated_at: chrono::DateTime<Utc>| match stale_after {
            None => true,
            Some(ttl) => now - updated_at >= ttl,
        };
        for run in guard.generation_runs.values_mut() {
            if matches!(run.status, RunStatus::Running) && is_stale(run.updated_at) {
                run.status = RunStatus::Failed;
                run.error = Some("System restart/recovery".to_string());
                run.updated_at = now;
                reconciled += 1;
            }
        }
        for run in guard.model_runs.values_mut() {
            if run.status == JobState::Running && is_stale(run.updated_at) {
                run.status = JobState::Failed;
                run.error = Some("System restart/recovery".to_string());
                run.updated_at = now;
                reconciled += 1;
            }
        }
        for job in guard.score_jobs.values_mut() {
            if job.status == JobState::Running && is_stale(job.updated_at) {
                job.status = JobState::Failed;
                job.error = Some("System restart/recovery".to_string());
                job.updated_at = now;
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }

    async fn dataset_summary(&self, dataset_id: Uuid) -> Result<DatasetSummary, RepoError> {
        let guard = self.lock();
        let rows = guard.telemetry.get(&dataset_id).cloned().unwrap_or_default();
        if rows.is_empty() {
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
        let row_count = rows.len() as i64;
        let anomalies = rows.iter().filter(|r| r.is_anomaly).count();
        let anomaly_rate = anomalies as f64 / row_count as f64;
        let time_range_start = rows.iter().map(|r| r.metric_timestamp).min();
        let time_range_end = rows.iter().map(|r| r.metric_timestamp).max();

        let mut anomaly_type_counts: HashMap<String, i64> = HashMap::new();
        for row in &rows {
            if let Some(t) = &row.anomaly_type {
                *anomaly_type_counts.entry(t.clone()).or_insert(0) += 1;
            }
        }
        let mut top_anomaly_types: Vec<CountEntry> =
            anomaly_type_counts.into_iter().map(|(value, count)| CountEntry { value, count }).collect();
        top_anomaly_types.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
        top_anomaly_types.truncate(10);

        let mut dimension_cardinalities = Vec::new();
        for (name, extractor) in [
            ("region", (|r: &TelemetryRecord| r.region.clone()) as fn(&TelemetryRecord) -> String),
            ("project_id", |r: &TelemetryRecord| r.project_id.clone()),
            ("host_id", |r: &TelemetryRecord| r.host_id.clone()),
        ] {
            let distinct: std::collections::HashSet<String> = rows.iter().map(extractor).collect();
            dimension_cardinalities
                .push(DimensionCardinality { dimension: name.to_string(), distinct_count: distinct.len() as i64 });
        }

        let mut latencies: Vec<f64> = rows
            .iter()
            .map(|r| (r.ingestion_time - r.metric_timestamp).num_milliseconds() as f64)
            .collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let p50 = percentile(&latencies, 50.0);
        let p95 = percentile(&latencies, 95.0);

        let mut hourly: HashMap<chrono::DateTime<Utc>, (i64, i64)> = HashMap::new();
        for row in &rows {
            let bucket = row.metric_timestamp.date_naive().and_hms_opt(row.metric_timestamp.hour(), 0, 0).unwrap();
            let bucket = chrono::DateTime::<Utc>::from_naive_utc_and_offset(bucket, Utc);
            let entry = hourly.entry(bucket).or_insert((0, 0));
            entry.0 += 1;
            if row.is_anomaly {
                entry.1 += 1;
            }
        }
        let mut hourly_anomaly_rate_trend: Vec<TimeBucketValue> = hourly
            .into_iter()
            .map(|(bucket_start, (total, anomalous))| TimeBucketValue {
                bucket_start,
                value: anomalous as f64 / total as f64,
            })
            .collect();
        hourly_anomaly_rate_trend.sort_by_key(|p| p.bucket_start);

        Ok(DatasetSummary {
            row_count,
            time_range_start,
            time_range_end,
            anomaly_rate,
            top_anomaly_types,
            dimension_cardinalities,
            ingestion_latency_p50_ms: p50,
            ingestion_latency_p95_ms: p95,
            hourly_anomaly_rate_trend,
        })
    }

    async fn topk_by_dimension(&self, dataset_id: Uuid, dimension: &str, k: usize) -> Result<TopKResult, RepoError> {
        if !crate::allowlist::is_valid_dimension(dimension) {
            return Err(RepoError::InvalidArgument { field: "dimension", value: dimension.to_string() });
        }
        let guard = self.lock();
        let rows = guard.telemetry.get(&dataset_id).cloned().unwrap_or_default();
        let mut counts: HashMap<String, i64> = HashMap::new();
        for row in &rows {
            let key = dimension_value(row, dimension);
            *counts.entry(key).or_insert(0) += 1;
        }
        let mut entries: Vec<CountEntry> = counts.into_iter().map(|(value, count)| CountEntry { value, count }).collect();
        entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
        let truncated = entries.len() > k;
        entries.truncate(k);
        Ok(TopKResult { entries, truncated })
    }

    async fn timeseries(
        &self,
        dataset_id: Uuid,
        metric: &str,
        aggregation: &str,
        bucket: chrono::Duration,
        from: chrono::DateTime<Utc>,
        to: chrono::DateTime<Utc>,
    ) -> Result<Vec<TimeSeriesPoint>, RepoError> {
        if !crate::allowlist::is_valid_metric(metric) {
            return Err(RepoError::InvalidArgument { field: "metric", value: metric.to_string() });
        }
        if !crate::allowlist::is_valid_aggregation(aggregation) {
            return Err(RepoError::InvalidArgument { field: "aggregation", value: aggregation.to_string() });
        }
        let bucket_ms = bucket.num_milliseconds().max(1);
        let guard = self.lock();
        let rows = guard.telemetry.get(&dataset_id).cloned().unwrap_or_default();
        let mut buckets: HashMap<i64, Vec<f64>> = HashMap::new();
        for row in &rows {
            if row.metric_timestamp < from || row.metric_timestamp > to {
                continue;
            }
            let bucket_index = row.metric_timestamp.timestamp_millis() / bucket_ms;
            buckets.entry(bucket_index).or_default().push(metric_value(row, metric));
        }
        let mut points: Vec<TimeSeriesPoint> = buckets
            .into_iter()
            .map(|(idx, mut values)| {
                let bucket_start = chrono::DateTime::<Utc>::from_timestamp_millis(idx * bucket_ms).unwrap_or(from);
                let value = aggregate(&mut values, aggregation);
                TimeSeriesPoint { bucket_start, aggregation: aggregation.to_string(), value }
            })
            .collect();
        points.sort_by_key(|p| p.bucket_start);
        Ok(points)
    }

    async fn histogram(&self, dataset_id: Uuid, metric: &str, buckets: usize) -> Result<Histogram, RepoError> {
        if !crate::allowlist::is_valid_metric(metric) {
            return Err(RepoError::InvalidArgument { field: "metric", value: metric.to_string() });
        }
        let guard = self.lock();
        let rows = guard.telemetry.get(&dataset_id).cloned().unwrap_or_default();
        let mut values: Vec<f64> = rows.iter().map(|r| metric_value(r, metric)).collect();
        if values.is_empty() {
            return Err(RepoError::NoData(format!("no rows for dataset {dataset_id}")));
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let min = values[0];
        let max = values[values.len() - 1];
        let buckets = buckets.max(1);
        let width = ((max - min) / buckets as f64).max(1e-9);
        let mut counts = vec![0i64; buckets];
        for v in &values {
            let mut idx = ((v - min) / width).floor() as usize;
            if idx >= buckets {
                idx = buckets - 1;
            }
            counts[idx] += 1;
        }
        let hist_buckets = counts
            .into_iter()
            .enumerate()
            .map(|(i, count)| HistogramBucket { lower: min + i as f64 * width, upper: min + (i + 1) as f64 * width, count })
            .collect();
        Ok(Histogram { metric: metric.to_string(), bucket_width: width, min, max, buckets: hist_buckets })
    }

    async fn metric_stats(&self, dataset_id: Uuid, metric: &str) -> Result<MetricStats, RepoError> {
        if !crate::allowlist::is_valid_metric(metric) {
            return Err(RepoError::InvalidArgument { field: "metric", value: metric.to_string() });
        }
        let guard = self.lock();
        let rows = guard.telemetry.get(&dataset_id).cloned().unwrap_or_default();
        let mut values: Vec<f64> = rows.iter().map(|r| metric_value(r, metric)).collect();
        if values.is_empty() {
            return Err(RepoError::NoData(format!("no rows for dataset {dataset_id}")));
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let count = values.len() as i64;
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        Ok(MetricStats {
            metric: metric.to_string(),
            mean,
            min: values[0],
            max: values[values.len() - 1],
            p50: percentile(&values, 50.0),
            p95: percentile(&values, 95.0),
            count,
        })
    }

    async fn score_page(
        &self,
        dataset_id: Uuid,
        model_run_id: Uuid,
        filter: &ScoreFilter,
    ) -> Result<Page<DatasetScore>, RepoError> {
        let guard = self.lock();
        let mut items: Vec<DatasetScore> = guard
            .scores
            .get(&(dataset_id, model_run_id))
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|s| filter.min_error.map(|m| s.reconstruction_error >= m).unwrap_or(true))
            .filter(|s| filter.max_error.map(|m| s.reconstruction_error <= m).unwrap_or(true))
            .filter(|s| !filter.only_anomalies || s.predicted_is_anomaly)
            .collect();
        items.sort_by_key(|s| s.record_id);
        Ok(paginate(items, filter.limit, filter.offset))
    }

    async fn evaluation_metrics(&self, dataset_id: Uuid, model_run_id: Uuid) -> Result<EvaluationMetrics, RepoError> {
        let guard = self.lock();
        let scores = guard.scores.get(&(dataset_id, model_run_id)).cloned().unwrap_or_default();
        let telemetry = guard.telemetry.get(&dataset_id).cloned().unwrap_or_default();
        let ground_truth: HashMap<i64, bool> = telemetry.iter().map(|r| (r.record_id, r.is_anomaly)).collect();

        let mut tp = 0i64;
        let mut fp = 0i64;
        let mut tn = 0i64;
        let mut fn_ = 0i64;
        for score in &scores {
            let actual = ground_truth.get(&score.record_id).copied().unwrap_or(false);
            match (score.predicted_is_anomaly, actual) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, false) => tn += 1,
                (false, true) => fn_ += 1,
            }
        }

        // Sampled ROC/PR: sweep reconstruction_error as the threshold at
        // decile cut points rather than every distinct score.
        let mut sorted = scores.clone();
        sorted.sort_by(|a, b| a.reconstruction_error.partial_cmp(&b.reconstruction_error).unwrap());
        let positives = sorted.iter().filter(|s| ground_truth.get(&s.record_id).copied().unwrap_or(false)).count();
        let negatives = sorted.len() - positives;
        let mut roc_points = Vec::new();
        let mut pr_points = Vec::new();
        for decile in 0..=10 {
            let idx = (sorted.len() * decile / 10).min(sorted.len().saturating_sub(1));
            let threshold = sorted.get(idx).map(|s| s.reconstruction_error).unwrap_or(0.0);
            let (mut dtp, mut dfp) = (0i64, 0i64);
            for s in &sorted {
                if s.reconstruction_error >= threshold {
                    if ground_truth.get(&s.record_id).copied().unwrap_or(false) {
                        dtp += 1;
                    } else {
                        dfp += 1;
                    }
                }
            }
            let tpr = if positives > 0 { dtp as f64 / positives as f64 } else { 0.0 };
            let fpr = if negatives > 0 { dfp as f64 / negatives as f64 } else { 0.0 };
            let precision = if dtp + dfp > 0 { dtp as f64 / (dtp + dfp) as f64 } else { 0.0 };
            roc_points.push((fpr, tpr));
            pr_points.push((tpr, precision));
        }

        Ok(EvaluationMetrics {
            confusion: ConfusionMatrix { true_positive: tp, false_positive: fp, true_negative: tn, false_negative: fn_ },
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
        if !crate::allowlist::is_valid_dimension(dimension) {
            return Err(RepoError::InvalidArgument { field: "dimension", value: dimension.to_string() });
        }
        let guard = self.lock();
        let scores = guard.scores.get(&(dataset_id, model_run_id)).cloned().unwrap_or_default();
        let telemetry: HashMap<i64, TelemetryRecord> =
            guard.telemetry.get(&dataset_id).cloned().unwrap_or_default().into_iter().map(|r| (r.record_id, r)).collect();
        let mut grouped: HashMap<String, (f64, i64)> = HashMap::new();
        for score in &scores {
            let Some(record) = telemetry.get(&score.record_id) else { continue };
            let key = dimension_value(record, dimension);
            let entry = grouped.entry(key).or_insert((0.0, 0));
            entry.0 += score.reconstruction_error;
            entry.1 += 1;
        }
        let mut out: Vec<ErrorDistributionEntry> = grouped
            .into_iter()
            .map(|(dimension_value, (sum, count))| ErrorDistributionEntry {
                dimension_value,
                mean_error: sum / count as f64,
                count,
            })
            .collect();
        out.sort_by(|a, b| b.mean_error.partial_cmp(&a.mean_error).unwrap());
        Ok(out)
    }
}

fn dimension_value(row: &TelemetryRecord, dimension: &str) -> String {
    match dimension.trim_start_matches("h.") {
        "region" => row.region.clone(),
        "project_id" => row.project_id.clone(),
        "host_id" => row.host_id.clone(),
        "anomaly_type" => row.anomaly_type.clone().unwrap_or_default(),
        _ => String::new(),
    }
}

fn metric_value(row: &TelemetryRecord, metric: &str) -> f64 {
    match metric {
        "cpu_usage" => row.cpu_usage,
        "memory_usage" => row.memory_usage,
        "disk_utilization" => row.disk_utilization,
        "network_rx_rate" => row.network_rx_rate,
        "network_tx_rate" => row.network_tx_rate,
        _ => f64::NAN,
    }
}

fn percentile(sorted_values: &[f64], p: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted_values.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted_values.len() - 1);
    sorted_values[idx]
}

fn aggregate(values: &mut [f64], aggregation: &str) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    match aggregation {
        "mean" => Some(values.iter().sum::<f64>() / values.len() as f64),
        "min" => values.iter().cloned().reduce(f64::min),
        "max" => values.iter().cloned().reduce(f64::max),
        "p50" => {
            values.sort_by(|a, b| a.partial_cmp(b).unwrap());
            Some(percentile(values, 50.0))
        }
        "p95" => {
            values.sort_by(|a, b| a.partial_cmp(b).unwrap());
            Some(percentile(values, 95.0))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(run_id: Uuid, record_id: i64, host: &str, cpu: f64, is_anomaly: bool) -> TelemetryRecord {
        TelemetryRecord {
            record_id,
            run_id,
            host_id: host.to_string(),
            project_id: "proj-a".to_string(),
            region: "us-east".to_string(),
            metric_timestamp: Utc::now(),
            ingestion_time: Utc::now(),
            cpu_usage: cpu,
            memory_usage: 0.5,
            disk_utilization: 0.3,
            network_rx_rate: 10.0,
            network_tx_rate: 5.0,
            is_anomaly,
            anomaly_type: if is_anomaly { Some("spike".to_string()) } else { None },
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn create_dataset_score_job_rejects_concurrent_non_terminal_job() {
        let repo = InMemoryDatasetRepository::new();
        let dataset_id = Uuid::new_v4();
        let model_run_id = Uuid::new_v4();
        let first = repo.create_dataset_score_job(dataset_id, model_run_id).await.unwrap();
        let err = repo.create_dataset_score_job(dataset_id, model_run_id).await.unwrap_err();
        match err {
            RepoError::ConflictExistingJob { existing_job_id } => assert_eq!(existing_job_id, first),
            other => panic!("expected ConflictExistingJob, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_dataset_score_job_allows_new_job_after_completion() {
        let repo = InMemoryDatasetRepository::new();
        let dataset_id = Uuid::new_v4();
        let model_run_id = Uuid::new_v4();
        let first = repo.create_dataset_score_job(dataset_id, model_run_id).await.unwrap();
        repo.complete_dataset_score_job(first, JobState::Completed).await.unwrap();
        let second = repo.create_dataset_score_job(dataset_id, model_run_id).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn fetch_telemetry_batch_is_keyset_paginated_ascending() {
        let repo = InMemoryDatasetRepository::new();
        let run_id = Uuid::new_v4();
        let records: Vec<TelemetryRecord> =
            (1..=10).map(|i| sample_record(run_id, i, "host-1", 0.5, false)).collect();
        repo.insert_telemetry_batch(&records).await.unwrap();
        let batch = repo.fetch_telemetry_batch(run_id, 3, 4).await.unwrap();
        let ids: Vec<i64> = batch.records.iter().map(|r| r.record_id).collect();
        assert_eq!(ids, vec![4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn dataset_summary_computes_anomaly_rate_and_top_types() {
        let repo = InMemoryDatasetRepository::new();
        let run_id = Uuid::new_v4();
        let records = vec![
            sample_record(run_id, 1, "host-1", 0.5, false),
            sample_record(run_id, 2, "host-1", 0.9, true),
            sample_record(run_id, 3, "host-2", 0.9, true),
        ];
        repo.insert_telemetry_batch(&records).await.unwrap();
        let summary = repo.dataset_summary(run_id).await.unwrap();
        assert_eq!(summary.row_count, 3);
        assert!((summary.anomaly_rate - (2.0 / 3.0)).abs() < 1e-9);
        assert_eq!(summary.top_anomaly_types[0].value, "spike");
        assert_eq!(summary.top_anomaly_types[0].count, 2);
    }

    #[tokio::test]
    async fn topk_by_dimension_rejects_unknown_dimension() {
        let repo = InMemoryDatasetRepository::new();
        let err = repo.topk_by_dimension(Uuid::new_v4(), "not_a_real_column", 5).await.unwrap_err();
        assert!(matches!(err, RepoError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn topk_by_dimension_marks_truncation() {
        let repo = InMemoryDatasetRepository::new();
        let run_id = Uuid::new_v4();
        let records = vec![
            sample_record(run_id, 1, "host-1", 0.1, false),
            sample_record(run_id, 2, "host-2", 0.1, false),
            sample_record(run_id, 3, "host-3", 0.1, false),
        ];
        repo.insert_telemetry_batch(&records).await.unwrap();
        let result = repo.topk_by_dimension(run_id, "host_id", 2).await.unwrap();
        assert_eq!(result.entries.len(), 2);
        assert!(result.truncated);
    }

    #[tokio::test]
    async fn reconcile_stale_jobs_marks_running_rows_failed() {
        let repo = InMemoryDatasetRepository::new();
        let dataset_id = Uuid::new_v4();
        let model_run_id = Uuid::new_v4();
        let job_id = repo.create_dataset_score_job(dataset_id, model_run_id).await.unwrap();
        repo.start_dataset_score_job(job_id, 100).await.unwrap();
        let reconciled = repo.reconcile_stale_jobs(None).await.unwrap();
        assert_eq!(reconciled, 1);
        let job = repo.get_dataset_score_job(job_id).await.unwrap();
        assert_eq!(job.status, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("System restart/recovery"));
    }
}
