//! Shared domain types and error taxonomy for the telemetry anomaly-detection
//! platform. No other crate in the workspace depends on the transport shell;
//! everything here is transport-agnostic.

pub mod domain;
pub mod error;
pub mod feature;
pub mod hpo;
pub mod requests;
pub mod state_machine;

pub use domain::*;
pub use error::{ErrorCode, HasErrorCode};
pub use feature::{FeatureVector, FEATURE_DIM, FEATURE_NAMES};
pub use state_machine::JobState;
