//! Column/dimension/aggregation allowlists for analytic queries (spec section 4.13).
//!
//! Grounded on `examples/original_source/src/db_client.cpp`'s
//! `IsValidMetric`/`IsValidDimension`/`IsValidAggregation`: every analytic
//! operation that would otherwise splice a caller-supplied identifier into
//! SQL checks it against one of these allowlists first, so a rejected call
//! never reaches a query builder.

pub const ALLOWED_METRICS: &[&str] = &[
    "cpu_usage",
    "memory_usage",
    "disk_utilization",
    "network_rx_rate",
    "network_tx_rate",
];

pub const ALLOWED_DIMENSIONS: &[&str] = &[
    "region",
    "project_id",
    "host_id",
    "anomaly_type",
    "h.region",
    "h.project_id",
    "h.host_id",
    "h.anomaly_type",
];

pub const ALLOWED_AGGREGATIONS: &[&str] = &["mean", "min", "max", "p50", "p95"];

pub fn is_valid_metric(metric: &str) -> bool {
    ALLOWED_METRICS.contains(&metric)
}

pub fn is_valid_dimension(dim: &str) -> bool {
    ALLOWED_DIMENSIONS.contains(&dim)
}

pub fn is_valid_aggregation(agg: &str) -> bool {
    ALLOWED_AGGREGATIONS.contains(&agg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_known_metrics_rejects_others() {
        assert!(is_valid_metric("cpu_usage"));
        assert!(!is_valid_metric("cpu_usage; DROP TABLE telemetry"));
    }

    #[test]
    fn accepts_table_qualified_dimensions() {
        assert!(is_valid_dimension("host_id"));
        assert!(is_valid_dimension("h.host_id"));
        assert!(!is_valid_dimension("h.password"));
    }

    #[test]
    fn accepts_known_aggregations_rejects_others() {
        assert!(is_valid_aggregation("p95"));
        assert!(!is_valid_aggregation("stddev"));
    }
}
