//! Request/response contracts for the HTTP boundary named in spec section 6.
//!
//! The transport shell itself is out of scope, but these are the structs it
//! would (de)serialize, so the seam is typed even though nothing routes to
//! it yet.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateDatasetRequest {
    pub tier: String,
    pub host_count: u32,
    pub regions: Vec<String>,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: chrono::DateTime<chrono::Utc>,
    pub interval_seconds: u32,
    pub seed: Option<u64>,
    pub anomaly_config: Option<AnomalyConfig>,
    pub fixed_lag_ms: Option<u32>,
    pub request_id: Option<String>,
}

/// Injection rates for the synthetic generator (NEW spec section 4.14).
/// `spec.md` scopes out the exact formulas but keeps the structural contract
/// of a per-host stateful generator; rates recovered from
/// `examples/original_source/src/generator.cpp`'s `AnomalyConfig` usage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AnomalyConfig {
    pub collective_rate: f64,
    pub burst_duration_points: u32,
    pub correlation_break_rate: f64,
    pub contextual_rate: f64,
    pub point_rate: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            collective_rate: 0.0,
            burst_duration_points: 5,
            correlation_break_rate: 0.0,
            contextual_rate: 0.0,
            point_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateDatasetAccepted {
    pub run_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainRequest {
    pub dataset_id: Uuid,
    pub name: String,
    pub n_components: Option<usize>,
    pub percentile: Option<f64>,
    pub hpo: Option<crate::hpo::HpoConfig>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainAccepted {
    pub model_run_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreDatasetRequest {
    pub dataset_id: Uuid,
    pub model_run_id: Uuid,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreDatasetAccepted {
    pub job_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub status: crate::state_machine::JobState,
    pub processed_rows: i64,
    pub total_rows: Option<i64>,
    pub last_record_id: i64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
}
