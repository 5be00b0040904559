//! Analytic and pagination result shapes for the dataset repository (spec
//! section 4.13). These are read models only; the persisted entities live in
//! `tm_types::domain`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunListFilter {
    pub status: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub owner_request_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl RunListFilter {
    pub fn paged(limit: i64, offset: i64) -> Self {
        Self { limit, offset, ..Default::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub row_count: i64,
    pub time_range_start: Option<DateTime<Utc>>,
    pub time_range_end: Option<DateTime<Utc>>,
    pub anomaly_rate: f64,
    pub top_anomaly_types: Vec<CountEntry>,
    pub dimension_cardinalities: Vec<DimensionCardinality>,
    pub ingestion_latency_p50_ms: f64,
    pub ingestion_latency_p95_ms: f64,
    pub hourly_anomaly_rate_trend: Vec<TimeBucketValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountEntry {
    pub value: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionCardinality {
    pub dimension: String,
    pub distinct_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeBucketValue {
    pub bucket_start: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopKResult {
    pub entries: Vec<CountEntry>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub bucket_start: DateTime<Utc>,
    pub aggregation: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub lower: f64,
    pub upper: f64,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histogram {
    pub metric: String,
    pub bucket_width: f64,
    pub min: f64,
    pub max: f64,
    pub buckets: Vec<HistogramBucket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricStats {
    pub metric: String,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub count: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreFilter {
    pub min_error: Option<f64>,
    pub max_error: Option<f64>,
    pub only_anomalies: bool,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_positive: i64,
    pub false_positive: i64,
    pub true_negative: i64,
    pub false_negative: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub confusion: ConfusionMatrix,
    pub roc_points: Vec<(f64, f64)>,
    pub pr_points: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDistributionEntry {
    pub dimension_value: String,
    pub mean_error: f64,
    pub count: i64,
}

