//! Fixed-size feature vector for the v1 telemetry contract.
//!
//! Order is load-bearing: cpu, memory, disk, network rx, network tx. Every
//! consumer (detector, PCA model/trainer, generator) indexes by this order
//! rather than by name.

use serde::{Deserialize, Serialize};

pub const FEATURE_DIM: usize = 5;

pub const FEATURE_NAMES: [&str; FEATURE_DIM] = [
    "cpu_usage",
    "memory_usage",
    "disk_utilization",
    "network_rx_rate",
    "network_tx_rate",
];

/// Five numeric feature channels sampled from one telemetry record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub [f64; FEATURE_DIM]);

impl FeatureVector {
    pub fn new(
        cpu_usage: f64,
        memory_usage: f64,
        disk_utilization: f64,
        network_rx_rate: f64,
        network_tx_rate: f64,
    ) -> Self {
        Self([
            cpu_usage,
            memory_usage,
            disk_utilization,
            network_rx_rate,
            network_tx_rate,
        ])
    }

    pub fn cpu_usage(&self) -> f64 {
        self.0[0]
    }
    pub fn memory_usage(&self) -> f64 {
        self.0[1]
    }
    pub fn disk_utilization(&self) -> f64 {
        self.0[2]
    }
    pub fn network_rx_rate(&self) -> f64 {
        self.0[3]
    }
    pub fn network_tx_rate(&self) -> f64 {
        self.0[4]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn as_vec(&self) -> Vec<f64> {
        self.0.to_vec()
    }
}

impl From<[f64; FEATURE_DIM]> for FeatureVector {
    fn from(data: [f64; FEATURE_DIM]) -> Self {
        Self(data)
    }
}
