//! Three-pass streaming PCA trainer (spec section 4.3).
//!
//! Grounded on `examples/original_source/src/training/pca_trainer.cpp`'s
//! `TrainPcaFromStream`: first pass accumulates mean/covariance and fixes
//! the components, second pass computes `pca_mean` over standardized
//! samples, third pass computes the reconstruction-error threshold. The
//! producer is replayed three times rather than buffered, so memory use is
//! bounded by `dim` and `n_components`, not by dataset size.

use thiserror::Error;
use tm_math::{argsort_desc, eigen_sym_jacobi, l2_norm, Matrix};
use tm_types::{ErrorCode, FEATURE_DIM, FEATURE_NAMES, HasErrorCode};

use crate::stats::RunningStats;

const JACOBI_MAX_ITER: usize = 200;
const JACOBI_EPS: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("n_components must be in [1, {FEATURE_DIM}], got {0}")]
    InvalidComponentCount(usize),
    #[error("not enough samples to train PCA: need at least 2, got {0}")]
    NoData(usize),
    #[error("sample source produced a vector of dimension {actual}, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("failed to write artifact {path}: {source}")]
    ArtifactWriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl HasErrorCode for TrainerError {
    fn error_code(&self) -> ErrorCode {
        match self {
            TrainerError::InvalidComponentCount(_) => ErrorCode::InvalidArgument,
            TrainerError::NoData(_) => ErrorCode::NoData,
            TrainerError::DimensionMismatch { .. } => ErrorCode::DimensionMismatch,
            TrainerError::ArtifactWriteFailed { .. } => ErrorCode::ArtifactWriteFailed,
        }
    }
}

/// A restartable, lazily-iterated source of fixed-dimension samples. Must
/// tolerate being driven through `for_each_sample` multiple times (the
/// trainer makes three passes); ground-truth anomaly filtering (if any)
/// happens before samples reach this trait.
pub trait SampleSource {
    fn dim(&self) -> usize;
    fn for_each_sample(&self, f: &mut dyn FnMut(&[f64])) -> Result<(), TrainerError>;
}

/// In-memory sample source, primarily for tests and small HPO trials.
pub struct VecSampleSource {
    dim: usize,
    samples: Vec<Vec<f64>>,
}

impl VecSampleSource {
    pub fn new(samples: Vec<Vec<f64>>) -> Self {
        let dim = samples.first().map(|s| s.len()).unwrap_or(FEATURE_DIM);
        Self { dim, samples }
    }
}

impl SampleSource for VecSampleSource {
    fn dim(&self) -> usize {
        self.dim
    }

    fn for_each_sample(&self, f: &mut dyn FnMut(&[f64])) -> Result<(), TrainerError> {
        for s in &self.samples {
            if s.len() != self.dim {
                return Err(TrainerError::DimensionMismatch {
                    expected: self.dim,
                    actual: s.len(),
                });
            }
            f(s);
        }
        Ok(())
    }
}

/// Returned by the heartbeat callback invoked between samples; lets the
/// caller (job manager) observe cooperative cancellation without the
/// trainer depending on any particular concurrency runtime (design note 9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainControl {
    Continue,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartbeatConfig {
    /// Invoke the heartbeat every this many samples within a pass. 0 means
    /// "only at pass boundaries".
    pub every_n_samples: usize,
}

pub enum TrainOutcome {
    Completed(tm_pca::PcaArtifact),
    Cancelled { rows_processed: usize },
}

enum PassOutcome {
    Cancelled,
    Failed(TrainerError),
}

impl From<TrainerError> for PassOutcome {
    fn from(e: TrainerError) -> Self {
        PassOutcome::Failed(e)
    }
}

/// Runs the trainer against `source`. `heartbeat` is polled periodically
/// (per `HeartbeatConfig`) and at each pass boundary; returning
/// [`TrainControl::Cancel`] stops the current pass and yields
/// [`TrainOutcome::Cancelled`] without raising an error.
pub fn train_pca_from_stream(
    source: &dyn SampleSource,
    n_components: usize,
    percentile: f64,
    heartbeat_config: HeartbeatConfig,
    heartbeat: &mut dyn FnMut() -> TrainControl,
) -> Result<TrainOutcome, TrainerError> {
    let dim = source.dim();
    if n_components == 0 || n_components > dim {
        return Err(TrainerError::InvalidComponentCount(n_components));
    }

    let mut rows_seen = 0usize;
    let mut stats = RunningStats::new(dim);
    let first_pass = run_pass(source, heartbeat_config, heartbeat, |x| {
        stats.update(x);
        rows_seen += 1;
    });
    match first_pass {
        Ok(()) => {}
        Err(PassOutcome::Cancelled) => return Ok(TrainOutcome::Cancelled { rows_processed: rows_seen }),
        Err(PassOutcome::Failed(e)) => return Err(e),
    }

    if stats.n < 2 {
        return Err(TrainerError::NoData(stats.n));
    }

    let mut scale = vec![0.0; dim];
    for i in 0..dim {
        let var_pop = stats.m2.get(i, i) / stats.n as f64;
        let s = var_pop.sqrt();
        scale[i] = if s == 0.0 { 1.0 } else { s };
    }

    let denom = (stats.n - 1) as f64;
    let mut cov = Matrix::zeros(dim, dim);
    for i in 0..dim {
        for j in 0..dim {
            let v = stats.m2.get(i, j) / denom / (scale[i] * scale[j]);
            cov.set(i, j, v);
        }
    }

    let eig = eigen_sym_jacobi(&cov, JACOBI_MAX_ITER, JACOBI_EPS).expect("cov is square by construction");
    let order = argsort_desc(&eig.eigenvalues);

    let k = n_components.min(dim);
    let mut components = Matrix::zeros(k, dim);
    let mut explained_variance = vec![0.0; k];
    for i in 0..k {
        let idx = order[i];
        explained_variance[i] = eig.eigenvalues[idx];
        let mut comp: Vec<f64> = (0..dim).map(|r| eig.eigenvectors.get(r, idx)).collect();
        enforce_component_sign(&mut comp);
        for c in 0..dim {
            components.set(i, c, comp[c]);
        }
    }
    let components_t = components.transpose();

    let mut pca_mean = vec![0.0; dim];
    let mut count = 0usize;
    let second_pass = run_pass(source, heartbeat_config, heartbeat, |x| {
        let x_scaled = standardize(x, &stats.mean, &scale);
        for i in 0..dim {
            pca_mean[i] += x_scaled[i];
        }
        count += 1;
    });
    match second_pass {
        Ok(()) => {}
        Err(PassOutcome::Cancelled) => return Ok(TrainOutcome::Cancelled { rows_processed: rows_seen + count }),
        Err(PassOutcome::Failed(e)) => return Err(e),
    }
    if count == 0 {
        return Err(TrainerError::NoData(0));
    }
    for v in pca_mean.iter_mut() {
        *v /= count as f64;
    }

    let mut errors = Vec::with_capacity(count);
    let third_pass = run_pass(source, heartbeat_config, heartbeat, |x| {
        let x_scaled = standardize(x, &stats.mean, &scale);
        let x_centered: Vec<f64> = x_scaled.iter().zip(&pca_mean).map(|(a, b)| a - b).collect();
        let proj = components.matvec(&x_centered).expect("dimension checked above");
        let recon_centered = components_t.matvec(&proj).expect("dimension checked above");
        let diff: Vec<f64> = x_scaled
            .iter()
            .zip(&recon_centered)
            .zip(&pca_mean)
            .map(|((xs, rc), m)| xs - (rc + m))
            .collect();
        errors.push(l2_norm(&diff));
    });
    match third_pass {
        Ok(()) => {}
        Err(PassOutcome::Cancelled) => {
            return Ok(TrainOutcome::Cancelled {
                rows_processed: rows_seen + errors.len(),
            })
        }
        Err(PassOutcome::Failed(e)) => return Err(e),
    }

    let threshold = percentile_value(errors, percentile);

    let artifact = tm_pca::PcaArtifact {
        meta: tm_pca::ArtifactMeta {
            version: tm_pca::ARTIFACT_SCHEMA_VERSION.to_string(),
            features: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
        },
        preprocessing: tm_pca::Preprocessing {
            mean: stats.mean.clone(),
            scale,
        },
        model: tm_pca::ModelBlock {
            components: (0..k).map(|i| components.row_vec(i)).collect(),
            mean: pca_mean,
            explained_variance,
            n_components: k,
        },
        thresholds: tm_pca::Thresholds {
            reconstruction_error: threshold,
        },
    };

    Ok(TrainOutcome::Completed(artifact))
}

fn standardize(x: &[f64], mean: &[f64], scale: &[f64]) -> Vec<f64> {
    x.iter()
        .zip(mean)
        .zip(scale)
        .map(|((xi, mu), s)| (xi - mu) / s)
        .collect()
}

fn run_pass(
    source: &dyn SampleSource,
    heartbeat_config: HeartbeatConfig,
    heartbeat: &mut dyn FnMut() -> TrainControl,
    mut on_sample: impl FnMut(&[f64]),
) -> Result<(), PassOutcome> {
    if heartbeat() == TrainControl::Cancel {
        return Err(PassOutcome::Cancelled);
    }
    let mut cancelled = false;
    let mut seen = 0usize;
    source.for_each_sample(&mut |x| {
        if cancelled {
            return;
        }
        on_sample(x);
        seen += 1;
        if heartbeat_config.every_n_samples > 0
            && seen % heartbeat_config.every_n_samples == 0
            && heartbeat() == TrainControl::Cancel
        {
            cancelled = true;
        }
    })?;
    if cancelled {
        return Err(PassOutcome::Cancelled);
    }
    Ok(())
}

/// Nearest-rank percentile (spec section 4.3, step 7): `idx = ceil(p/100 * n) - 1`, clamped to `[0, n-1]`.
fn percentile_value(mut values: Vec<f64>, percentile: f64) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = values.len();
    let rank = (percentile / 100.0) * n as f64;
    let idx = (rank.ceil() as isize - 1).clamp(0, n as isize - 1) as usize;
    values[idx]
}

/// The entry of largest magnitude in each component must be positive (spec
/// section 3 artifact invariant).
fn enforce_component_sign(v: &mut [f64]) {
    let mut idx = 0;
    let mut max_abs = 0.0;
    for (i, val) in v.iter().enumerate() {
        let abs_val = val.abs();
        if abs_val > max_abs {
            max_abs = abs_val;
            idx = i;
        }
    }
    if v[idx] < 0.0 {
        for val in v.iter_mut() {
            *val *= -1.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlated_samples(n: usize) -> Vec<Vec<f64>> {
        // Five perfectly linearly-correlated channels: channel i = base * (i+1).
        (0..n)
            .map(|i| {
                let base = (i as f64) * 0.01;
                vec![base, base * 2.0, base * 3.0, base * 4.0, base * 5.0]
            })
            .collect()
    }

    #[test]
    fn round_trip_with_full_components_has_near_zero_error() {
        let samples = correlated_samples(200);
        let source = VecSampleSource::new(samples);
        let outcome = train_pca_from_stream(
            &source,
            FEATURE_DIM,
            99.5,
            HeartbeatConfig::default(),
            &mut || TrainControl::Continue,
        )
        .unwrap();
        match outcome {
            TrainOutcome::Completed(artifact) => {
                assert!(artifact.thresholds.reconstruction_error < 1e-6);
                assert_eq!(artifact.model.n_components, FEATURE_DIM);
            }
            TrainOutcome::Cancelled { .. } => panic!("unexpected cancellation"),
        }
    }

    #[test]
    fn rejects_fewer_than_two_samples() {
        let source = VecSampleSource::new(vec![vec![1.0; FEATURE_DIM]]);
        let err = train_pca_from_stream(&source, 2, 90.0, HeartbeatConfig::default(), &mut || TrainControl::Continue)
            .unwrap_err();
        assert!(matches!(err, TrainerError::NoData(1)));
    }

    #[test]
    fn rejects_out_of_range_component_count() {
        let source = VecSampleSource::new(correlated_samples(10));
        let err =
            train_pca_from_stream(&source, 0, 90.0, HeartbeatConfig::default(), &mut || TrainControl::Continue)
                .unwrap_err();
        assert!(matches!(err, TrainerError::InvalidComponentCount(0)));
    }

    #[test]
    fn cancellation_during_first_pass_short_circuits() {
        let source = VecSampleSource::new(correlated_samples(50));
        let mut calls = 0;
        let outcome = train_pca_from_stream(&source, 2, 90.0, HeartbeatConfig::default(), &mut || {
            calls += 1;
            TrainControl::Cancel
        })
        .unwrap();
        assert!(matches!(outcome, TrainOutcome::Cancelled { rows_processed: 0 }));
        assert_eq!(calls, 1);
    }

    #[test]
    fn enforce_component_sign_flips_when_dominant_entry_is_negative() {
        let mut v = vec![0.1, -0.9, 0.2];
        enforce_component_sign(&mut v);
        assert_eq!(v, vec![-0.1, 0.9, -0.2]);
    }

    #[test]
    fn percentile_value_uses_nearest_rank_convention() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        // p=80 -> rank=4.0 -> idx=3 -> value 4.0
        assert_eq!(percentile_value(values, 80.0), 4.0);
    }
}
