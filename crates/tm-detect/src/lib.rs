//! Online detection pipeline: preprocessing, robust streaming statistics,
//! and fusion alerting (spec sections 4.10, 4.11, NEW 4.15).

pub mod alerts;
pub mod detector;
pub mod preprocessing;

pub use alerts::{AlertManager, AlertManagerConfig};
pub use detector::{AnomalyScore, DetectorA, FeatureFlag, OutlierConfig, WindowConfig};
pub use preprocessing::{PreprocessingConfig, Preprocessor};
