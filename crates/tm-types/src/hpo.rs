//! HPO configuration types shared between the request contract and the
//! planner (spec section 4.4). Kept separate from the planner logic
//! (`tm-trainer::hpo`) so the wire contract has no dependency on the
//! sampling/enumeration code.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HpoAlgorithm {
    Grid,
    Random,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchSpace {
    pub n_components: Vec<usize>,
    pub percentile: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HpoConfig {
    pub algorithm: HpoAlgorithm,
    pub max_trials: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    pub seed: Option<u64>,
    pub search_space: SearchSpace,
}

fn default_max_concurrency() -> usize {
    2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HpoCapReason {
    None,
    MaxTrials,
    GridCap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub dataset_id: uuid::Uuid,
    pub n_components: usize,
    pub percentile: f64,
}
