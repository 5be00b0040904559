//! Online fusion/alert manager (spec section 4.11).
//!
//! Grounded on `examples/original_source/src/alert_manager.{h,cpp}`:
//! per-host `FusionState` tracking consecutive flagged samples and the last
//! alert time, with hysteresis gating emission and cooldown rate-limiting
//! it. Severity follows the fusion table exactly (both flags → CRITICAL,
//! detector B alone → HIGH, detector A alone → HIGH above 10.0 else
//! MEDIUM).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use tm_types::domain::{Alert, AlertSeverity, AlertSource};

#[derive(Debug, Clone, Copy)]
pub struct AlertManagerConfig {
    pub hysteresis_threshold: u32,
    pub cooldown_seconds: i64,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self { hysteresis_threshold: 2, cooldown_seconds: 600 }
    }
}

#[derive(Debug, Default)]
struct FusionState {
    consecutive_anomalies: u32,
    last_alert_time: Option<DateTime<Utc>>,
}

/// Per-host fusion state, guarded by an exclusive lock at the call site
/// (spec 5: "per-host fusion state is exclusive").
pub struct AlertManager {
    config: AlertManagerConfig,
    states: HashMap<String, FusionState>,
}

impl AlertManager {
    pub fn new(config: AlertManagerConfig) -> Self {
        Self { config, states: HashMap::new() }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &mut self,
        host_id: &str,
        run_id: &str,
        ts: DateTime<Utc>,
        detector_a_flag: bool,
        score_a: f64,
        detector_b_flag: bool,
        score_b: f64,
        details: &str,
    ) -> Option<Alert> {
        let state = self.states.entry(host_id.to_string()).or_default();

        if !(detector_a_flag || detector_b_flag) {
            state.consecutive_anomalies = 0;
            return None;
        }
        state.consecutive_anomalies += 1;

        if state.consecutive_anomalies < self.config.hysteresis_threshold {
            return None;
        }

        if let Some(last) = state.last_alert_time {
            if (ts - last).num_seconds() < self.config.cooldown_seconds {
                return None;
            }
        }

        let (severity, source, score) = if detector_a_flag && detector_b_flag {
            (AlertSeverity::Critical, AlertSource::FusionAB, score_a.max(score_b))
        } else if detector_b_flag {
            (AlertSeverity::High, AlertSource::DetectorBPca, score_b)
        } else {
            let severity = if score_a > 10.0 { AlertSeverity::High } else { AlertSeverity::Medium };
            (severity, AlertSource::DetectorAStats, score_a)
        };

        state.last_alert_time = Some(ts);
        state.consecutive_anomalies = 0;

        Some(Alert {
            host_id: host_id.to_string(),
            run_id: run_id.to_string(),
            timestamp: ts,
            severity,
            source,
            score,
            details: details.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(offset_seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(offset_seconds)
    }

    /// Scenario B (spec section 8): both flags true at t0 and t0+1s; second
    /// sample meets hysteresis with no prior cooldown and emits CRITICAL.
    #[test]
    fn scenario_b_fusion_severity() {
        let mut mgr = AlertManager::new(AlertManagerConfig::default());
        let first = mgr.evaluate("host-1", "run-1", ts(0), true, 4.0, true, 0.5, "");
        assert!(first.is_none());
        let second = mgr.evaluate("host-1", "run-1", ts(1), true, 4.0, true, 0.5, "").unwrap();
        assert_eq!(second.severity, AlertSeverity::Critical);
        assert_eq!(second.source, AlertSource::FusionAB);
        assert_eq!(second.score, 4.0);
    }

    /// Hysteresis gates the first confirming sample of each cycle; cooldown
    /// then rate-limits further emission until it elapses, at which point a
    /// second confirming sample re-emits (spec section 8, property 9).
    #[test]
    fn hysteresis_and_cooldown_gate_repeated_emission() {
        let mut mgr = AlertManager::new(AlertManagerConfig { hysteresis_threshold: 2, cooldown_seconds: 10 });
        assert!(mgr.evaluate("host-1", "run-1", ts(0), true, 5.0, false, 0.0, "").is_none());
        let first = mgr.evaluate("host-1", "run-1", ts(1), true, 5.0, false, 0.0, "").unwrap();
        assert_eq!(first.severity, AlertSeverity::Medium);
        assert_eq!(first.source, AlertSource::DetectorAStats);

        // Hysteresis resets after an emission; a lone sample doesn't re-trigger.
        assert!(mgr.evaluate("host-1", "run-1", ts(2), true, 5.0, false, 0.0, "").is_none());

        // A confirming sample after cooldown elapses (12s since t+1) emits again.
        let second = mgr.evaluate("host-1", "run-1", ts(13), true, 5.0, false, 0.0, "").unwrap();
        assert_eq!(second.severity, AlertSeverity::Medium);
    }

    #[test]
    fn no_flag_resets_consecutive_count() {
        let mut mgr = AlertManager::new(AlertManagerConfig { hysteresis_threshold: 2, cooldown_seconds: 10 });
        assert!(mgr.evaluate("host-1", "run-1", ts(0), true, 5.0, false, 0.0, "").is_none());
        assert!(mgr.evaluate("host-1", "run-1", ts(1), false, 0.0, false, 0.0, "").is_none());
        assert!(mgr.evaluate("host-1", "run-1", ts(2), true, 5.0, false, 0.0, "").is_none());
    }

    #[test]
    fn a_score_above_ten_escalates_to_high() {
        let mut mgr = AlertManager::new(AlertManagerConfig { hysteresis_threshold: 1, cooldown_seconds: 10 });
        let alert = mgr.evaluate("host-1", "run-1", ts(0), true, 15.0, false, 0.0, "").unwrap();
        assert_eq!(alert.severity, AlertSeverity::High);
        assert_eq!(alert.source, AlertSource::DetectorAStats);
    }

    #[test]
    fn detector_b_alone_is_high_severity() {
        let mut mgr = AlertManager::new(AlertManagerConfig { hysteresis_threshold: 1, cooldown_seconds: 10 });
        let alert = mgr.evaluate("host-1", "run-1", ts(0), false, 0.0, true, 2.5, "").unwrap();
        assert_eq!(alert.severity, AlertSeverity::High);
        assert_eq!(alert.source, AlertSource::DetectorBPca);
        assert_eq!(alert.score, 2.5);
    }
}
