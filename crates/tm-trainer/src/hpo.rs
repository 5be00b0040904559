//! Hyper-parameter sweep planner (spec section 4.4).
//!
//! The original C++ header (`training/pca_trainer.h`) declares
//! `PreflightHpoConfig`/`ValidateHpoConfig`/`GenerateTrials`/
//! `ComputeCandidateFingerprint` but ships no corresponding `.cpp` in this
//! tree; the algorithm here follows the specification's description of
//! that interface directly, matching the header's struct shapes
//! (`HpoConfig`, `SearchSpace`, `HpoCapReason`, `HpoPreflight`).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use tm_types::hpo::{HpoAlgorithm, HpoCapReason, HpoConfig, TrainingConfig};
use uuid::Uuid;

const GRID_CAP: usize = 100;
const MAX_CONCURRENCY_RANGE: std::ops::RangeInclusive<usize> = 1..=10;

#[derive(Debug, Clone, PartialEq)]
pub struct HpoValidationError {
    pub field: String,
    pub message: String,
}

/// Validates an [`HpoConfig`] against the constraints in spec section 4.4.
/// Returns every violation found rather than stopping at the first.
pub fn validate_hpo_config(config: &HpoConfig) -> Vec<HpoValidationError> {
    let mut errors = Vec::new();

    if config.search_space.n_components.is_empty() {
        errors.push(HpoValidationError {
            field: "search_space.n_components".into(),
            message: "must have at least one value".into(),
        });
    }
    if config.search_space.percentile.is_empty() {
        errors.push(HpoValidationError {
            field: "search_space.percentile".into(),
            message: "must have at least one value".into(),
        });
    }
    for &n in &config.search_space.n_components {
        if !(1..=tm_types::FEATURE_DIM).contains(&n) {
            errors.push(HpoValidationError {
                field: "search_space.n_components".into(),
                message: format!("{n} is outside [1, {}]", tm_types::FEATURE_DIM),
            });
        }
    }
    for &p in &config.search_space.percentile {
        if !(p > 0.0 && p < 100.0) {
            errors.push(HpoValidationError {
                field: "search_space.percentile".into(),
                message: format!("{p} is outside (0, 100)"),
            });
        }
    }
    if config.max_trials < 1 {
        errors.push(HpoValidationError {
            field: "max_trials".into(),
            message: "must be >= 1".into(),
        });
    }
    if !MAX_CONCURRENCY_RANGE.contains(&config.max_concurrency) {
        errors.push(HpoValidationError {
            field: "max_concurrency".into(),
            message: "must be in [1, 10]".into(),
        });
    }
    if config.algorithm == HpoAlgorithm::Grid {
        let cardinality = config.search_space.n_components.len() * config.search_space.percentile.len();
        if cardinality > GRID_CAP {
            errors.push(HpoValidationError {
                field: "search_space".into(),
                message: format!("grid cardinality {cardinality} exceeds cap of {GRID_CAP}"),
            });
        }
    }

    errors
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HpoPreflight {
    pub estimated_candidates: usize,
    pub effective_trials: usize,
    pub capped_by: HpoCapReason,
}

/// Computes how many trials will actually run without enumerating them.
pub fn preflight_hpo_config(hpo: &HpoConfig) -> HpoPreflight {
    let cardinality = hpo.search_space.n_components.len() * hpo.search_space.percentile.len();

    match hpo.algorithm {
        HpoAlgorithm::Random => HpoPreflight {
            estimated_candidates: cardinality,
            effective_trials: hpo.max_trials,
            capped_by: HpoCapReason::None,
        },
        HpoAlgorithm::Grid => {
            let effective_trials = cardinality.min(hpo.max_trials).min(GRID_CAP);
            let capped_by = if effective_trials == cardinality {
                HpoCapReason::None
            } else if effective_trials == hpo.max_trials && hpo.max_trials <= GRID_CAP {
                HpoCapReason::MaxTrials
            } else {
                HpoCapReason::GridCap
            };
            HpoPreflight {
                estimated_candidates: cardinality,
                effective_trials,
                capped_by,
            }
        }
    }
}

/// Enumerates the concrete trials for an HPO sweep (spec section 4.4).
/// Grid order is the cartesian product of ascending-sorted axes; random
/// sampling draws `max_trials` independent picks from a PRNG seeded by
/// `hpo.seed` (defaulting to 0), with axes pre-sorted so permuting the
/// input search space never perturbs the sequence.
pub fn generate_trials(hpo: &HpoConfig, dataset_id: Uuid) -> Vec<TrainingConfig> {
    let mut n_components = hpo.search_space.n_components.clone();
    n_components.sort_unstable();
    let mut percentile = hpo.search_space.percentile.clone();
    percentile.sort_by(|a, b| a.partial_cmp(b).unwrap());

    match hpo.algorithm {
        HpoAlgorithm::Grid => {
            let preflight = preflight_hpo_config(hpo);
            let mut trials = Vec::with_capacity(preflight.effective_trials);
            'outer: for &n in &n_components {
                for &p in &percentile {
                    if trials.len() >= preflight.effective_trials {
                        break 'outer;
                    }
                    trials.push(TrainingConfig {
                        dataset_id,
                        n_components: n,
                        percentile: p,
                    });
                }
            }
            trials
        }
        HpoAlgorithm::Random => {
            let mut rng = StdRng::seed_from_u64(hpo.seed.unwrap_or(0));
            (0..hpo.max_trials)
                .map(|_| TrainingConfig {
                    dataset_id,
                    n_components: n_components[rng.gen_range(0..n_components.len())],
                    percentile: percentile[rng.gen_range(0..percentile.len())],
                })
                .collect()
        }
    }
}

/// A stable hash over the canonicalized (axis-sorted) configuration.
/// Identical across permutations of the axis values; changes if any other
/// field changes (spec testable property 6).
pub fn candidate_fingerprint(hpo: &HpoConfig) -> String {
    let mut n_components = hpo.search_space.n_components.clone();
    n_components.sort_unstable();
    let mut percentile = hpo.search_space.percentile.clone();
    percentile.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let mut hasher = Sha256::new();
    hasher.update(match hpo.algorithm {
        HpoAlgorithm::Grid => b"grid" as &[u8],
        HpoAlgorithm::Random => b"random" as &[u8],
    });
    hasher.update(hpo.max_trials.to_le_bytes());
    hasher.update(hpo.max_concurrency.to_le_bytes());
    hasher.update(hpo.seed.unwrap_or(0).to_le_bytes());
    for n in &n_components {
        hasher.update(n.to_le_bytes());
    }
    for p in &percentile {
        hasher.update(p.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tm_types::hpo::SearchSpace;

    fn base_config() -> HpoConfig {
        HpoConfig {
            algorithm: HpoAlgorithm::Grid,
            max_trials: 10,
            max_concurrency: 2,
            seed: Some(7),
            search_space: SearchSpace {
                n_components: vec![2, 3, 5],
                percentile: vec![95.0, 99.0],
            },
        }
    }

    #[test]
    fn rejects_empty_axes() {
        let mut config = base_config();
        config.search_space.n_components.clear();
        let errors = validate_hpo_config(&config);
        assert!(errors.iter().any(|e| e.field == "search_space.n_components"));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = base_config();
        config.search_space.n_components.push(6);
        config.search_space.percentile.push(100.0);
        let errors = validate_hpo_config(&config);
        assert!(errors.iter().any(|e| e.message.contains('6')));
        assert!(errors.iter().any(|e| e.message.contains("100")));
    }

    #[test]
    fn grid_cardinality_over_cap_fails_validation() {
        let mut config = base_config();
        config.search_space.n_components = (1..=5).collect();
        config.search_space.percentile = (0..30).map(|i| 50.0 + i as f64).collect();
        let errors = validate_hpo_config(&config);
        assert!(errors.iter().any(|e| e.field == "search_space"));
    }

    #[test]
    fn grid_enumeration_is_cartesian_and_sorted() {
        let config = base_config();
        let trials = generate_trials(&config, Uuid::nil());
        assert_eq!(trials.len(), 6);
        assert_eq!(trials[0].n_components, 2);
        assert_eq!(trials[0].percentile, 95.0);
        assert_eq!(trials[5].n_components, 5);
        assert_eq!(trials[5].percentile, 99.0);
    }

    #[test]
    fn grid_truncates_to_max_trials_with_cap_reason() {
        let mut config = base_config();
        config.max_trials = 4;
        let preflight = preflight_hpo_config(&config);
        assert_eq!(preflight.effective_trials, 4);
        assert_eq!(preflight.capped_by, HpoCapReason::MaxTrials);
        assert_eq!(generate_trials(&config, Uuid::nil()).len(), 4);
    }

    #[test]
    fn random_sampling_is_deterministic_for_a_fixed_seed() {
        let config = base_config();
        let a = generate_trials(
            &HpoConfig {
                algorithm: HpoAlgorithm::Random,
                ..config.clone()
            },
            Uuid::nil(),
        );
        let b = generate_trials(
            &HpoConfig {
                algorithm: HpoAlgorithm::Random,
                ..config
            },
            Uuid::nil(),
        );
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.n_components, y.n_components);
            assert_eq!(x.percentile, y.percentile);
        }
    }

    #[test]
    fn fingerprint_is_invariant_under_axis_permutation() {
        let mut permuted = base_config();
        permuted.search_space.n_components = vec![5, 2, 3];
        permuted.search_space.percentile = vec![99.0, 95.0];
        assert_eq!(candidate_fingerprint(&base_config()), candidate_fingerprint(&permuted));
    }

    #[test]
    fn fingerprint_changes_when_other_fields_change() {
        let mut changed = base_config();
        changed.max_trials = 11;
        assert_ne!(candidate_fingerprint(&base_config()), candidate_fingerprint(&changed));
    }
}
