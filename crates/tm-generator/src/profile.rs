//! Per-host generator state (NEW spec section 4.14).
//!
//! Grounded on `examples/original_source/src/types.h`'s `HostProfile`: a
//! baseline (cpu/mem/phase) plus anomaly state (burst countdown,
//! correlation-break countdown/flag) mutated only by the generator task that
//! owns it — never shared across tasks.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::Rng;

#[derive(Debug, Clone)]
pub struct HostProfile {
    pub host_id: String,
    pub project_id: String,
    pub region: String,
    pub labels: HashMap<String, String>,

    pub cpu_base: f64,
    pub mem_base: f64,
    pub phase_shift: f64,

    pub burst_remaining: u32,
    pub correlation_broken: bool,
    pub correlation_break_remaining: u32,
}

const DEFAULT_REGIONS: [&str; 3] = ["us-east1", "us-west1", "eu-west1"];

/// Builds one [`HostProfile`] per host, deterministically from `seed`
/// (spec 4.14: "per-host mutable profile owned by the generator task").
pub fn initialize_hosts(tier: &str, host_count: u32, regions: &[String], rng: &mut StdRng) -> Vec<HostProfile> {
    let fallback: Vec<String> = DEFAULT_REGIONS.iter().map(|s| s.to_string()).collect();
    let regions = if regions.is_empty() { &fallback } else { regions };

    (0..host_count)
        .map(|i| {
            let cpu_base = rng.gen_range(10.0..60.0);
            let mut labels = HashMap::new();
            labels.insert("service".to_string(), "backend".to_string());
            labels.insert("tier".to_string(), tier.to_string());

            HostProfile {
                host_id: format!("host-{tier}-{i}"),
                project_id: format!("proj-{tier}"),
                region: regions[i as usize % regions.len()].clone(),
                labels,
                cpu_base,
                mem_base: cpu_base * 0.8 + 10.0,
                phase_shift: rng.gen_range(0.0..std::f64::consts::TAU),
                burst_remaining: 0,
                correlation_broken: false,
                correlation_break_remaining: 0,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn assigns_round_robin_regions_and_correlated_baselines() {
        let mut rng = StdRng::seed_from_u64(42);
        let regions = vec!["r1".to_string(), "r2".to_string()];
        let hosts = initialize_hosts("gold", 4, &regions, &mut rng);
        assert_eq!(hosts.len(), 4);
        assert_eq!(hosts[0].region, "r1");
        assert_eq!(hosts[1].region, "r2");
        assert_eq!(hosts[2].region, "r1");
        for h in &hosts {
            assert!((10.0..60.0).contains(&h.cpu_base));
            assert_eq!(h.mem_base, h.cpu_base * 0.8 + 10.0);
            assert_eq!(h.burst_remaining, 0);
        }
    }

    #[test]
    fn falls_back_to_default_regions_when_none_given() {
        let mut rng = StdRng::seed_from_u64(1);
        let hosts = initialize_hosts("free", 3, &[], &mut rng);
        assert_eq!(hosts[0].region, "us-east1");
        assert_eq!(hosts[1].region, "us-west1");
        assert_eq!(hosts[2].region, "eu-west1");
    }
}
