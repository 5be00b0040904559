//! Synthetic telemetry generation loop (NEW spec section 4.14).
//!
//! Grounded on `examples/original_source/src/generator.cpp`'s `GenerateRecord`
//! and `Run`: per-tick seasonality (daily + weekly sine components) plus four
//! independent, partially-stateful anomaly injectors (collective burst,
//! correlation break, contextual window, point spike), streamed to the
//! repository in fixed-size batches with a status update after each one.

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use uuid::Uuid;

use tm_repo::{DatasetRepository, RepoError};
use tm_types::requests::{AnomalyConfig, GenerateDatasetRequest};
use tm_types::{ErrorCode, GenerationRun, HasErrorCode, RunStatus, TelemetryRecord};

use crate::profile::{initialize_hosts, HostProfile};

const BATCH_SIZE: usize = 5000;
const DEFAULT_INTERVAL_SECONDS: i64 = 600;
const DEFAULT_LAG_MS: i64 = 2000;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("invalid {field}: {message}")]
    InvalidArgument { field: &'static str, message: String },
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl HasErrorCode for GeneratorError {
    fn error_code(&self) -> ErrorCode {
        match self {
            GeneratorError::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            GeneratorError::Repo(e) => e.error_code(),
        }
    }
}

fn build_run(run_id: Uuid, request: &GenerateDatasetRequest) -> GenerationRun {
    let now = Utc::now();
    GenerationRun {
        run_id,
        tier: request.tier.clone(),
        host_count: request.host_count,
        start_time: request.start_time,
        end_time: request.end_time,
        interval_seconds: request.interval_seconds,
        seed: request.seed.unwrap_or(0),
        status: RunStatus::Pending,
        inserted_rows: 0,
        error: None,
        config: serde_json::to_value(request).unwrap_or(serde_json::Value::Null),
        request_id: request.request_id.clone(),
        created_at: now,
        updated_at: now,
    }
}

/// Generates one host's record for `timestamp`, mutating its anomaly state
/// in place.
#[allow(clippy::too_many_arguments)]
fn generate_record(
    host: &mut HostProfile,
    run_id: Uuid,
    record_id: i64,
    timestamp: DateTime<Utc>,
    anomaly: &AnomalyConfig,
    fixed_lag_ms: i64,
    rng: &mut StdRng,
) -> TelemetryRecord {
    let hours = timestamp.timestamp() as f64 / 3600.0;
    let daily = 10.0 * (TAU * hours / 24.0 + host.phase_shift).sin();
    let weekly = 5.0 * (TAU * hours / 168.0).sin();
    let noise = rng.gen_range(-10.0..=10.0);

    let mut cpu = host.cpu_base + daily + weekly + noise;
    let p = rng.gen_range(0.0..1.0);
    let mut anomaly_types: Vec<&'static str> = Vec::new();

    // 1. Collective burst: sustained load, stateful countdown.
    if host.burst_remaining > 0 {
        host.burst_remaining -= 1;
        cpu += 40.0;
        anomaly_types.push("COLLECTIVE_BURST");
    } else if anomaly.collective_rate > 0.0 && p < anomaly.collective_rate {
        host.burst_remaining = if anomaly.burst_duration_points == 0 { 5 } else { anomaly.burst_duration_points };
        cpu += 40.0;
        anomaly_types.push("COLLECTIVE_BURST");
    }

    // 2. Correlation break: memory/network decouple from CPU while active.
    if host.correlation_break_remaining > 0 {
        host.correlation_break_remaining -= 1;
        host.correlation_broken = true;
        anomaly_types.push("CORRELATION_BREAK");
    } else if anomaly.correlation_break_rate > 0.0 && p < anomaly.correlation_break_rate {
        host.correlation_break_remaining = 5;
        host.correlation_broken = true;
        anomaly_types.push("CORRELATION_BREAK");
    } else {
        host.correlation_broken = false;
    }

    // 3. Contextual: pinned high during the 1-5am UTC window only.
    if anomaly.contextual_rate > 0.0 {
        let hour_of_day = (hours as i64).rem_euclid(24);
        let p_ctx = rng.gen_range(0.0..1.0);
        if (1..=5).contains(&hour_of_day) && p_ctx < anomaly.contextual_rate {
            cpu = 90.0 + rng.gen_range(0.0..10.0);
            anomaly_types.push("CONTEXTUAL");
        }
    }

    // 4. Point spike: transient, independent of the other three.
    if anomaly.point_rate > 0.0 && p < anomaly.point_rate {
        cpu += 50.0;
        anomaly_types.push("POINT_SPIKE");
    }

    let cpu_usage = cpu.clamp(0.0, 100.0);

    let memory_usage = if host.correlation_broken {
        (100.0 - cpu_usage + noise).clamp(0.0, 100.0)
    } else {
        (cpu_usage * 0.7 + 20.0 + rng.gen_range(-2.5..=2.5)).clamp(0.0, 100.0)
    };

    let disk_utilization = 30.0 + rng.gen_range(-5.0..=5.0);

    let mut network_rx_rate = (10.0 + daily / 2.0 + rng.gen_range(0.0..10.0)).max(0.0);
    let network_tx_rate = if host.correlation_broken {
        network_rx_rate += 50.0; // simulated inbound flood
        1.0
    } else {
        network_rx_rate * 0.8 + rng.gen_range(0.0..5.0)
    };

    let lag_ms = if fixed_lag_ms == 0 { DEFAULT_LAG_MS } else { fixed_lag_ms };
    let jitter_ms: i64 = rng.gen_range(0..500);
    let ingestion_time = timestamp + Duration::milliseconds(lag_ms + jitter_ms);

    TelemetryRecord {
        record_id,
        run_id,
        host_id: host.host_id.clone(),
        project_id: host.project_id.clone(),
        region: host.region.clone(),
        metric_timestamp: timestamp,
        ingestion_time,
        cpu_usage,
        memory_usage,
        disk_utilization,
        network_rx_rate,
        network_tx_rate,
        is_anomaly: !anomaly_types.is_empty(),
        anomaly_type: if anomaly_types.is_empty() { None } else { Some(anomaly_types.join(",")) },
        labels: host.labels.clone(),
    }
}

/// Runs one generation job end to end: creates the run row, streams batches
/// of telemetry, and marks the run `SUCCEEDED`/`FAILED`.
///
/// `cancel` is polled once per batch; on a cooperative cancellation the run
/// is left at whatever row count it reached and marked `FAILED` with a
/// `"cancelled"` message, matching the job manager's convention that an
/// `Ok` return with the flag set is treated as a cancelled job, not a
/// failed one (spec 4.7/4.8).
pub async fn run<R: DatasetRepository>(
    repo: Arc<R>,
    run_id: Uuid,
    request: GenerateDatasetRequest,
    cancel: Arc<AtomicBool>,
) -> Result<(), GeneratorError> {
    if request.host_count == 0 {
        return Err(GeneratorError::InvalidArgument { field: "host_count", message: "must be > 0".into() });
    }
    if request.end_time <= request.start_time {
        return Err(GeneratorError::InvalidArgument { field: "end_time", message: "must be after start_time".into() });
    }

    let run_row = build_run(run_id, &request);
    repo.create_generation_run(&run_row).await?;
    repo.update_generation_run_status(run_id, RunStatus::Running, 0, None).await?;

    let mut rng = StdRng::seed_from_u64(request.seed.unwrap_or(0));
    let mut hosts = initialize_hosts(&request.tier, request.host_count, &request.regions, &mut rng);

    let anomaly_config = request.anomaly_config.unwrap_or_default();
    let fixed_lag_ms = request.fixed_lag_ms.unwrap_or(0) as i64;
    let interval = if request.interval_seconds == 0 {
        Duration::seconds(DEFAULT_INTERVAL_SECONDS)
    } else {
        Duration::seconds(request.interval_seconds as i64)
    };

    let mut batch: Vec<TelemetryRecord> = Vec::with_capacity(BATCH_SIZE);
    let mut total_rows: i64 = 0;
    let mut record_id: i64 = 1;
    let mut t = request.start_time;
    let mut cancelled = false;

    'outer: while t < request.end_time {
        for host in hosts.iter_mut() {
            let record = generate_record(host, run_id, record_id, t, &anomaly_config, fixed_lag_ms, &mut rng);
            record_id += 1;
            batch.push(record);

            if batch.len() >= BATCH_SIZE {
                repo.insert_telemetry_batch(&batch).await?;
                total_rows += batch.len() as i64;
                batch.clear();
                repo.update_generation_run_status(run_id, RunStatus::Running, total_rows as u64, None).await?;

                if cancel.load(Ordering::Relaxed) {
                    cancelled = true;
                    break 'outer;
                }
            }
        }
        t += interval;
    }

    if !batch.is_empty() {
        repo.insert_telemetry_batch(&batch).await?;
        total_rows += batch.len() as i64;
    }

    if cancelled {
        repo.update_generation_run_status(run_id, RunStatus::Failed, total_rows as u64, Some("cancelled")).await?;
    } else {
        tracing::info!(%run_id, total_rows, "generation run complete");
        repo.update_generation_run_status(run_id, RunStatus::Succeeded, total_rows as u64, None).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc as StdArc;
    use tm_repo::InMemoryDatasetRepository;

    fn req(seed: u64) -> GenerateDatasetRequest {
        GenerateDatasetRequest {
            tier: "gold".into(),
            host_count: 3,
            regions: vec![],
            start_time: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap(),
            interval_seconds: 600,
            seed: Some(seed),
            anomaly_config: None,
            fixed_lag_ms: None,
            request_id: None,
        }
    }

    #[tokio::test]
    async fn generates_expected_row_count_and_succeeds() {
        let repo = StdArc::new(InMemoryDatasetRepository::new());
        let run_id = Uuid::new_v4();
        let cancel = Arc::new(AtomicBool::new(false));
        run(repo.clone(), run_id, req(7), cancel).await.unwrap();

        let generation_run = repo.get_generation_run(run_id).await.unwrap();
        assert_eq!(generation_run.status, RunStatus::Succeeded);
        // 6 ticks (10-minute interval over 1 hour) * 3 hosts.
        assert_eq!(generation_run.inserted_rows, 18);
        assert_eq!(repo.count_telemetry_rows(run_id).await.unwrap(), 18);
    }

    #[tokio::test]
    async fn rejects_zero_hosts() {
        let repo = StdArc::new(InMemoryDatasetRepository::new());
        let mut bad = req(1);
        bad.host_count = 0;
        let err = run(repo, Uuid::new_v4(), bad, Arc::new(AtomicBool::new(false))).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn collective_burst_sustains_across_points_once_triggered() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut hosts = initialize_hosts("gold", 1, &[], &mut rng);
        let anomaly = AnomalyConfig { collective_rate: 1.0, ..AnomalyConfig::default() };
        let run_id = Uuid::new_v4();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        let first = generate_record(&mut hosts[0], run_id, 1, t0, &anomaly, 0, &mut rng);
        assert!(first.is_anomaly);
        assert_eq!(first.anomaly_type.as_deref(), Some("COLLECTIVE_BURST"));
        assert_eq!(hosts[0].burst_remaining, 4);

        let second = generate_record(&mut hosts[0], run_id, 2, t0, &AnomalyConfig::default(), 0, &mut rng);
        assert!(second.is_anomaly);
        assert_eq!(hosts[0].burst_remaining, 3);
    }

    #[tokio::test]
    async fn correlation_break_decouples_network_and_memory() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut hosts = initialize_hosts("gold", 1, &[], &mut rng);
        hosts[0].correlation_break_remaining = 3;
        let run_id = Uuid::new_v4();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

        let record = generate_record(&mut hosts[0], run_id, 1, t0, &AnomalyConfig::default(), 0, &mut rng);
        assert!(record.is_anomaly);
        assert_eq!(record.anomaly_type.as_deref(), Some("CORRELATION_BREAK"));
        assert_eq!(record.network_tx_rate, 1.0);
        assert!(hosts[0].correlation_broken);
        assert_eq!(hosts[0].correlation_break_remaining, 2);
    }

    #[tokio::test]
    async fn ingestion_time_is_always_after_metric_timestamp() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut hosts = initialize_hosts("gold", 1, &[], &mut rng);
        let run_id = Uuid::new_v4();
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let record = generate_record(&mut hosts[0], run_id, 1, t0, &AnomalyConfig::default(), 2000, &mut rng);
        assert!(record.ingestion_time >= record.metric_timestamp);
    }
}
