//! Frozen PCA reconstruction-error model (spec sections 3, 4.2).
//!
//! Grounded on `examples/original_source/src/detectors/pca_model.{h,cpp}`:
//! same standardize -> center -> project -> reconstruct -> residual pipeline,
//! same artifact JSON shape. The artifact is written once by the trainer
//! (`tm-trainer`) and read many times here; this crate never mutates one.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tm_math::Matrix;
use tm_types::{ErrorCode, FeatureVector, HasErrorCode, FEATURE_DIM};

pub const ARTIFACT_SCHEMA_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum PcaError {
    #[error("failed to open artifact {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse artifact {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write artifact {path}: {source}")]
    WriteIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported artifact schema version: {0} (expected {ARTIFACT_SCHEMA_VERSION})")]
    UnsupportedVersion(String),
    #[error("dimension mismatch in artifact: {0}")]
    DimensionMismatch(String),
    #[error("no PCA components found in artifact")]
    NoComponents,
}

impl HasErrorCode for PcaError {
    fn error_code(&self) -> ErrorCode {
        match self {
            PcaError::Io { .. } | PcaError::Parse { .. } | PcaError::UnsupportedVersion(_) => {
                ErrorCode::ArtifactLoadFailed
            }
            PcaError::WriteIo { .. } => ErrorCode::ArtifactWriteFailed,
            PcaError::DimensionMismatch(_) => ErrorCode::DimensionMismatch,
            PcaError::NoComponents => ErrorCode::ArtifactLoadFailed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub version: String,
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preprocessing {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBlock {
    pub components: Vec<Vec<f64>>,
    pub mean: Vec<f64>,
    pub explained_variance: Vec<f64>,
    pub n_components: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    pub reconstruction_error: f64,
}

/// On-disk PCA artifact (spec section 3). Schema-versioned; readers refuse
/// anything but [`ARTIFACT_SCHEMA_VERSION`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcaArtifact {
    pub meta: ArtifactMeta,
    pub preprocessing: Preprocessing,
    pub model: ModelBlock,
    pub thresholds: Thresholds,
}

impl PcaArtifact {
    pub fn validate(&self) -> Result<(), PcaError> {
        if self.meta.version != ARTIFACT_SCHEMA_VERSION {
            return Err(PcaError::UnsupportedVersion(self.meta.version.clone()));
        }
        if self.preprocessing.mean.len() != FEATURE_DIM || self.preprocessing.scale.len() != FEATURE_DIM {
            return Err(PcaError::DimensionMismatch(
                "preprocessing mean/scale must have FEATURE_DIM entries".into(),
            ));
        }
        if self.model.components.is_empty() {
            return Err(PcaError::NoComponents);
        }
        let d = self.model.components[0].len();
        if d != FEATURE_DIM || self.model.components.iter().any(|row| row.len() != d) {
            return Err(PcaError::DimensionMismatch(
                "PCA components must be k x FEATURE_DIM".into(),
            ));
        }
        if self.model.mean.len() != FEATURE_DIM {
            return Err(PcaError::DimensionMismatch(
                "pca mean must have FEATURE_DIM entries".into(),
            ));
        }
        Ok(())
    }

    /// Sum of the byte sizes of the arrays backing this artifact, used by
    /// the model cache for byte-accounted eviction.
    pub fn estimate_memory_usage(&self) -> usize {
        let f64_size = std::mem::size_of::<f64>();
        let mut bytes = self.preprocessing.mean.len() * f64_size;
        bytes += self.preprocessing.scale.len() * f64_size;
        bytes += self.model.mean.len() * f64_size;
        bytes += self.model.explained_variance.len() * f64_size;
        bytes += self
            .model
            .components
            .iter()
            .map(|row| row.len() * f64_size)
            .sum::<usize>();
        bytes
    }

    fn components_matrix(&self) -> Matrix {
        // Validated shape guarantees from_rows cannot fail here.
        Matrix::from_rows(self.model.components.clone()).expect("validated artifact")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PcaScore {
    pub is_anomaly: bool,
    pub reconstruction_error: f64,
    /// Per-feature residual, useful for explainability.
    pub residuals: Vec<f64>,
    pub details: String,
}

/// Loaded, ready-to-score PCA model (spec section 4.2).
#[derive(Debug, Clone)]
pub struct PcaModel {
    artifact: PcaArtifact,
    components: Matrix,
}

impl PcaModel {
    pub fn load_from_str(artifact_path: &str, contents: &str) -> Result<Self, PcaError> {
        let artifact: PcaArtifact = serde_json::from_str(contents).map_err(|source| PcaError::Parse {
            path: artifact_path.to_string(),
            source,
        })?;
        artifact.validate()?;
        let components = artifact.components_matrix();
        Ok(Self { artifact, components })
    }

    pub fn load(artifact_path: &str) -> Result<Self, PcaError> {
        let contents = std::fs::read_to_string(artifact_path).map_err(|source| PcaError::Io {
            path: artifact_path.to_string(),
            source,
        })?;
        Self::load_from_str(artifact_path, &contents)
    }

    pub fn artifact(&self) -> &PcaArtifact {
        &self.artifact
    }

    pub fn threshold(&self) -> f64 {
        self.artifact.thresholds.reconstruction_error
    }

    pub fn n_components(&self) -> usize {
        self.artifact.model.n_components
    }

    pub fn estimate_memory_usage(&self) -> usize {
        self.artifact.estimate_memory_usage()
    }

    /// Standardize -> center -> project -> reconstruct -> residual (spec
    /// section 4.2). Dimension mismatch cannot occur: `FeatureVector` is
    /// fixed-width and the artifact was validated at load time.
    pub fn score(&self, x: &FeatureVector) -> PcaScore {
        let x_raw = x.as_vec();

        let x_scaled: Vec<f64> = x_raw
            .iter()
            .zip(self.artifact.preprocessing.mean.iter())
            .zip(self.artifact.preprocessing.scale.iter())
            .map(|((xi, mu), s)| (xi - mu) / s)
            .collect();

        let x_centered: Vec<f64> = x_scaled
            .iter()
            .zip(self.artifact.model.mean.iter())
            .map(|(xs, m)| xs - m)
            .collect();

        let proj = self
            .components
            .matvec(&x_centered)
            .expect("components width matches FEATURE_DIM by construction");

        let x_recon_centered = self
            .components
            .transpose()
            .matvec(&proj)
            .expect("components height matches projection length by construction");

        let x_recon: Vec<f64> = x_recon_centered
            .iter()
            .zip(self.artifact.model.mean.iter())
            .map(|(xr, m)| xr + m)
            .collect();

        let residuals: Vec<f64> = x_scaled
            .iter()
            .zip(x_recon.iter())
            .map(|(xs, xr)| xs - xr)
            .collect();

        let reconstruction_error = tm_math::l2_norm(&residuals);
        let threshold = self.threshold();
        let is_anomaly = reconstruction_error > threshold;
        let details = if is_anomaly {
            format!("PCA_RECON_ERR={reconstruction_error} > {threshold}")
        } else {
            String::new()
        };

        PcaScore {
            is_anomaly,
            reconstruction_error,
            residuals,
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_artifact_json() -> String {
        // mean=0, scale=1, single component aligned to axis 0, pca_mean=0.
        serde_json::json!({
            "meta": {"version": "v1", "features": ["cpu_usage","memory_usage","disk_utilization","network_rx_rate","network_tx_rate"]},
            "preprocessing": {"mean": [0.0,0.0,0.0,0.0,0.0], "scale": [1.0,1.0,1.0,1.0,1.0]},
            "model": {
                "components": [[1.0,0.0,0.0,0.0,0.0]],
                "mean": [0.0,0.0,0.0,0.0,0.0],
                "explained_variance": [1.0],
                "n_components": 1
            },
            "thresholds": {"reconstruction_error": 0.5}
        })
        .to_string()
    }

    #[test]
    fn rejects_unsupported_schema_version() {
        let json = serde_json::json!({
            "meta": {"version": "v2", "features": []},
            "preprocessing": {"mean": [0.0,0.0,0.0,0.0,0.0], "scale": [1.0,1.0,1.0,1.0,1.0]},
            "model": {"components": [[1.0,0.0,0.0,0.0,0.0]], "mean": [0.0,0.0,0.0,0.0,0.0], "explained_variance": [1.0], "n_components": 1},
            "thresholds": {"reconstruction_error": 0.5}
        });
        let err = PcaModel::load_from_str("x", &json.to_string()).unwrap_err();
        assert!(matches!(err, PcaError::UnsupportedVersion(_)));
        assert_eq!(err.error_code(), ErrorCode::ArtifactLoadFailed);
    }

    #[test]
    fn scores_a_vector_along_the_retained_axis() {
        let model = PcaModel::load_from_str("x", &identity_artifact_json()).unwrap();
        // Along the retained axis (cpu_usage), reconstruction is exact.
        let x = FeatureVector::new(3.0, 0.0, 0.0, 0.0, 0.0);
        let score = model.score(&x);
        assert!(score.reconstruction_error < 1e-9);
        assert!(!score.is_anomaly);
    }

    #[test]
    fn flags_anomaly_when_off_axis_component_exceeds_threshold() {
        let model = PcaModel::load_from_str("x", &identity_artifact_json()).unwrap();
        // memory_usage is entirely off the retained axis -> full residual.
        let x = FeatureVector::new(0.0, 10.0, 0.0, 0.0, 0.0);
        let score = model.score(&x);
        assert!(score.reconstruction_error > model.threshold());
        assert!(score.is_anomaly);
        assert!(score.details.contains("PCA_RECON_ERR"));
    }

    #[test]
    fn estimate_memory_usage_counts_all_arrays() {
        let model = PcaModel::load_from_str("x", &identity_artifact_json()).unwrap();
        // 5 mean + 5 scale + 5 components + 5 pca_mean + 1 explained_variance = 21 f64s.
        assert_eq!(model.estimate_memory_usage(), 21 * std::mem::size_of::<f64>());
    }
}
