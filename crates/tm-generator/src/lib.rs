//! Synthetic telemetry generator: per-host profiles and the batch-streaming
//! generation loop wired as the work function for `generation_run` jobs
//! (NEW spec section 4.14).

pub mod generator;
pub mod profile;

pub use generator::{run, GeneratorError};
pub use profile::{initialize_hosts, HostProfile};
