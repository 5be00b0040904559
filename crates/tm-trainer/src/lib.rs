//! Streaming PCA trainer and HPO sweep planner (spec sections 4.3, 4.4).

pub mod hpo;
pub mod stats;
pub mod train;
pub mod writer;

pub use hpo::{candidate_fingerprint, generate_trials, preflight_hpo_config, validate_hpo_config, HpoPreflight, HpoValidationError};
pub use stats::RunningStats;
pub use train::{train_pca_from_stream, HeartbeatConfig, SampleSource, TrainControl, TrainOutcome, TrainerError, VecSampleSource};
pub use writer::write_artifact_json;
