//! Atomic artifact persistence (spec section 9: "write-once then
//! read-only"). Grounded on `WriteArtifactJson` in
//! `examples/original_source/src/training/pca_trainer.cpp`, adapted to
//! write to a sibling temp file and rename into place so a reader (via
//! `tm-pca`'s model cache) never observes a partially written artifact.

use std::io::Write;
use std::path::Path;

use tm_pca::PcaArtifact;

use crate::train::TrainerError;

pub fn write_artifact_json(artifact: &PcaArtifact, output_path: &Path) -> Result<(), TrainerError> {
    let tmp_path = output_path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(artifact).expect("PcaArtifact is always serializable");

    let mut file = std::fs::File::create(&tmp_path).map_err(|source| TrainerError::ArtifactWriteFailed {
        path: tmp_path.display().to_string(),
        source,
    })?;
    file.write_all(body.as_bytes())
        .map_err(|source| TrainerError::ArtifactWriteFailed {
            path: tmp_path.display().to_string(),
            source,
        })?;
    file.sync_all().map_err(|source| TrainerError::ArtifactWriteFailed {
        path: tmp_path.display().to_string(),
        source,
    })?;
    drop(file);

    std::fs::rename(&tmp_path, output_path).map_err(|source| TrainerError::ArtifactWriteFailed {
        path: output_path.display().to_string(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tm_pca::{ArtifactMeta, ModelBlock, Preprocessing, Thresholds, ARTIFACT_SCHEMA_VERSION};

    fn sample_artifact() -> PcaArtifact {
        PcaArtifact {
            meta: ArtifactMeta {
                version: ARTIFACT_SCHEMA_VERSION.to_string(),
                features: vec!["cpu_usage".into()],
            },
            preprocessing: Preprocessing {
                mean: vec![0.0; 5],
                scale: vec![1.0; 5],
            },
            model: ModelBlock {
                components: vec![vec![1.0, 0.0, 0.0, 0.0, 0.0]],
                mean: vec![0.0; 5],
                explained_variance: vec![1.0],
                n_components: 1,
            },
            thresholds: Thresholds {
                reconstruction_error: 0.5,
            },
        }
    }

    #[test]
    fn writes_and_the_result_round_trips_through_pca_model_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        write_artifact_json(&sample_artifact(), &path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        let loaded = tm_pca::PcaModel::load(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.threshold(), 0.5);
    }
}
