//! Online preprocessing stage (NEW spec section 4.15).
//!
//! Grounded on `examples/original_source/src/preprocessing.{h,cpp}`: a thin,
//! stateless transform applied ahead of the streaming detector and the PCA
//! model. Non-negative clamping always runs; `log1p` on the network rates is
//! config-gated.

use tm_types::feature::FeatureVector;

#[derive(Debug, Clone, Copy, Default)]
pub struct PreprocessingConfig {
    pub log1p_network: bool,
}

pub struct Preprocessor {
    config: PreprocessingConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessingConfig) -> Self {
        Self { config }
    }

    /// Clamps every channel to non-negative, then optionally applies
    /// `log1p` to the two network-rate channels.
    pub fn apply(&self, vec: FeatureVector) -> FeatureVector {
        let mut data = vec.0;
        for v in data.iter_mut() {
            if *v < 0.0 {
                *v = 0.0;
            }
        }
        if self.config.log1p_network {
            data[3] = data[3].ln_1p();
            data[4] = data[4].ln_1p();
        }
        FeatureVector(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_negative_values_to_zero() {
        let pre = Preprocessor::new(PreprocessingConfig::default());
        let out = pre.apply(FeatureVector::new(-1.0, 50.0, -0.5, 10.0, 20.0));
        assert_eq!(out.cpu_usage(), 0.0);
        assert_eq!(out.disk_utilization(), 0.0);
        assert_eq!(out.memory_usage(), 50.0);
    }

    #[test]
    fn log1p_network_is_gated_by_config() {
        let raw = FeatureVector::new(10.0, 20.0, 30.0, 100.0, 200.0);
        let off = Preprocessor::new(PreprocessingConfig { log1p_network: false }).apply(raw);
        assert_eq!(off.network_rx_rate(), 100.0);

        let on = Preprocessor::new(PreprocessingConfig { log1p_network: true }).apply(raw);
        assert!((on.network_rx_rate() - 100.0f64.ln_1p()).abs() < 1e-9);
        assert!((on.network_tx_rate() - 200.0f64.ln_1p()).abs() < 1e-9);
        assert_eq!(on.cpu_usage(), 10.0);
    }
}
