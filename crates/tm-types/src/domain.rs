//! Persisted entities (spec section 3). All ids are UUIDs, all timestamps UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Status shared by every job-owning entity; see [`crate::state_machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRun {
    pub run_id: Uuid,
    pub tier: String,
    pub host_count: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub interval_seconds: u32,
    pub seed: u64,
    pub status: RunStatus,
    pub inserted_rows: u64,
    pub error: Option<String>,
    pub config: serde_json::Value,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub record_id: i64,
    pub run_id: Uuid,
    pub host_id: String,
    pub project_id: String,
    pub region: String,
    pub metric_timestamp: DateTime<Utc>,
    pub ingestion_time: DateTime<Utc>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_utilization: f64,
    pub network_rx_rate: f64,
    pub network_tx_rate: f64,
    pub is_anomaly: bool,
    pub anomaly_type: Option<String>,
    pub labels: HashMap<String, String>,
}

impl TelemetryRecord {
    pub fn features(&self) -> crate::feature::FeatureVector {
        crate::feature::FeatureVector::new(
            self.cpu_usage,
            self.memory_usage,
            self.disk_utilization,
            self.network_rx_rate,
            self.network_tx_rate,
        )
    }
}

/// Using the job-state-machine states directly (spec 4.7) rather than the
/// narrower PENDING/RUNNING/SUCCEEDED/FAILED of [`RunStatus`]; model/score
/// runs can be cancelled, generation runs cannot.
use crate::state_machine::JobState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRun {
    pub model_run_id: Uuid,
    pub dataset_id: Uuid,
    pub name: String,
    pub status: JobState,
    pub artifact_path: Option<String>,
    pub training_config: serde_json::Value,
    pub hpo_config: Option<serde_json::Value>,
    pub parent_run_id: Option<Uuid>,
    pub best_trial_run_id: Option<Uuid>,
    pub best_metric_value: Option<f64>,
    pub is_eligible: bool,
    pub candidate_fingerprint: Option<String>,
    pub seed_used: Option<u64>,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRun {
    pub inference_id: Uuid,
    pub model_run_id: Uuid,
    pub status: JobState,
    pub anomaly_count: u32,
    pub latency_ms: f64,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetScoreJob {
    pub job_id: Uuid,
    pub dataset_id: Uuid,
    pub model_run_id: Uuid,
    pub status: JobState,
    pub total_rows: Option<i64>,
    pub processed_rows: i64,
    pub last_record_id: i64,
    pub error: Option<String>,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetScore {
    pub score_id: Uuid,
    pub dataset_id: Uuid,
    pub model_run_id: Uuid,
    pub record_id: i64,
    pub reconstruction_error: f64,
    pub predicted_is_anomaly: bool,
    pub scored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSource {
    #[serde(rename = "DETECTOR_A_STATS")]
    DetectorAStats,
    #[serde(rename = "DETECTOR_B_PCA")]
    DetectorBPca,
    #[serde(rename = "FUSION_A_B")]
    FusionAB,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub host_id: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub source: AlertSource,
    pub score: f64,
    pub details: String,
}
