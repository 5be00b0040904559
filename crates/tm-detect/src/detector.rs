//! Streaming detector A: per-feature robust statistics (spec section 4.10).
//!
//! Grounded on `examples/original_source/src/detectors/detector_a.{h,cpp}`:
//! one ring buffer per feature channel, periodic median/MAD recompute, and
//! poison mitigation that flags an extreme sample without admitting it into
//! the baseline buffer.

use std::collections::VecDeque;

use tm_types::feature::{FeatureVector, FEATURE_DIM, FEATURE_NAMES};

#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    pub size: usize,
    pub recompute_interval: u64,
    pub min_history: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self { size: 60, recompute_interval: 10, min_history: 10 }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OutlierConfig {
    pub robust_z_threshold: f64,
    pub enable_poison_mitigation: bool,
    pub poison_skip_threshold: f64,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self { robust_z_threshold: 3.5, enable_poison_mitigation: true, poison_skip_threshold: 8.0 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeatureFlag {
    pub feature: &'static str,
    pub robust_z: f64,
    pub skipped: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AnomalyScore {
    pub is_anomaly: bool,
    pub max_z_score: f64,
    pub details: Vec<FeatureFlag>,
}

#[derive(Default)]
struct MetricState {
    buffer: VecDeque<f64>,
    median: f64,
    mad: f64,
}

impl MetricState {
    fn recompute(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut data: Vec<f64> = self.buffer.iter().copied().collect();
        data.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mid = data.len() / 2;
        self.median = data[mid];

        let mut abs_diffs: Vec<f64> = data.iter().map(|v| (v - self.median).abs()).collect();
        abs_diffs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        self.mad = abs_diffs[mid];
        if self.mad == 0.0 {
            self.mad = 1e-6;
        }
    }
}

/// Per-feature independent robust-statistics tracker.
pub struct DetectorA {
    window: WindowConfig,
    outliers: OutlierConfig,
    states: [MetricState; FEATURE_DIM],
    update_count: u64,
}

impl DetectorA {
    pub fn new(window: WindowConfig, outliers: OutlierConfig) -> Self {
        Self {
            window,
            outliers,
            states: std::array::from_fn(|_| MetricState::default()),
            update_count: 0,
        }
    }

    pub fn update(&mut self, vec: &FeatureVector) -> AnomalyScore {
        let needs_recompute = self.window.recompute_interval > 0 && self.update_count % self.window.recompute_interval == 0;
        let mut score = AnomalyScore::default();

        for i in 0..FEATURE_DIM {
            let state = &mut self.states[i];
            let value = vec.0[i];
            let warm = state.buffer.len() >= self.window.min_history;

            if needs_recompute && warm {
                state.recompute();
            }

            let robust_z = if warm {
                let mad = if state.mad > 0.0 { state.mad } else { 1e-6 };
                (value - state.median).abs() / mad
            } else {
                0.0
            };

            let skip_update = self.outliers.enable_poison_mitigation
                && warm
                && robust_z > self.outliers.poison_skip_threshold;

            if !skip_update {
                state.buffer.push_back(value);
                if state.buffer.len() > self.window.size {
                    state.buffer.pop_front();
                }
            }

            if warm && robust_z > self.outliers.robust_z_threshold {
                score.is_anomaly = true;
                if robust_z > score.max_z_score {
                    score.max_z_score = robust_z;
                }
                score.details.push(FeatureFlag { feature: FEATURE_NAMES[i], robust_z, skipped: skip_update });
            }
        }

        self.update_count += 1;
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warm_detector(baseline: f64) -> DetectorA {
        let window = WindowConfig { size: 20, recompute_interval: 1, min_history: 10 };
        let mut detector = DetectorA::new(window, OutlierConfig::default());
        for _ in 0..12 {
            detector.update(&FeatureVector::new(baseline, baseline, baseline, baseline, baseline));
        }
        detector
    }

    #[test]
    fn stable_input_never_flags_once_warmed() {
        let mut detector = warm_detector(50.0);
        let score = detector.update(&FeatureVector::new(50.2, 49.8, 50.1, 50.0, 49.9));
        assert!(!score.is_anomaly);
    }

    #[test]
    fn large_deviation_flags_with_max_z_across_features() {
        let mut detector = warm_detector(50.0);
        let score = detector.update(&FeatureVector::new(500.0, 50.0, 50.0, 50.0, 50.0));
        assert!(score.is_anomaly);
        assert!(score.max_z_score > OutlierConfig::default().robust_z_threshold);
        assert_eq!(score.details.len(), 1);
        assert_eq!(score.details[0].feature, "cpu_usage");
    }

    #[test]
    fn poison_mitigation_flags_but_does_not_admit_extreme_sample() {
        let window = WindowConfig { size: 20, recompute_interval: 1, min_history: 10 };
        let outliers = OutlierConfig { robust_z_threshold: 3.5, enable_poison_mitigation: true, poison_skip_threshold: 8.0 };
        let mut detector = DetectorA::new(window, outliers);
        for _ in 0..12 {
            detector.update(&FeatureVector::new(50.0, 50.0, 50.0, 50.0, 50.0));
        }
        let before_len = detector.states[0].buffer.len();
        let score = detector.update(&FeatureVector::new(10_000.0, 50.0, 50.0, 50.0, 50.0));
        assert!(score.is_anomaly);
        assert!(score.details[0].skipped);
        assert_eq!(detector.states[0].buffer.len(), before_len);
    }
}
