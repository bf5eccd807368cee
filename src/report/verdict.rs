//! Verdict Policy
//!
//! Thresholds are baseline-relative when a baseline snapshot exists and
//! absolute otherwise. Any failed experiment phase fails the verdict on its
//! own; the Report and Cleanup phases never influence it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::RecoveryStatus;
use crate::experiment::duration_ms;
use crate::model::{MetricsSnapshot, PhaseName, PhaseOutcome, PhaseResult, Verdict};

/// Pass/fail thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerdictPolicy {
    /// Maximum error-rate increase over baseline, in percentage points
    pub max_error_rate_delta: f64,

    /// Maximum p99 latency increase over baseline in milliseconds
    pub max_p99_delta_ms: Option<f64>,

    /// Maximum fault-phase error rate when there is no baseline
    pub absolute_max_error_rate: f64,

    /// Maximum fault-phase p99 latency when there is no baseline
    pub absolute_max_p99_ms: Option<f64>,

    /// Longest acceptable recovery
    #[serde(with = "duration_ms")]
    pub max_recovery: Duration,
}

impl Default for VerdictPolicy {
    fn default() -> Self {
        Self {
            max_error_rate_delta: 5.0,
            max_p99_delta_ms: None,
            absolute_max_error_rate: 5.0,
            absolute_max_p99_ms: None,
            max_recovery: Duration::from_secs(300),
        }
    }
}

impl VerdictPolicy {
    /// Judge an experiment from its audit trail and measurements
    pub fn evaluate(
        &self,
        phases: &[PhaseResult],
        baseline: Option<&MetricsSnapshot>,
        under_fault: Option<&MetricsSnapshot>,
        recovery: &RecoveryStatus,
    ) -> Verdict {
        let mut reasons = Vec::new();

        for result in phases {
            if matches!(result.phase, PhaseName::Report | PhaseName::Cleanup) {
                continue;
            }
            if let PhaseOutcome::Failed(reason) = &result.outcome {
                reasons.push(format!("{} failed: {}", result.phase, reason));
            }
        }

        let preflight_ok = phases
            .iter()
            .any(|r| r.phase == PhaseName::Preflight && r.outcome == PhaseOutcome::Success);
        if !preflight_ok && reasons.is_empty() {
            reasons.push("preflight did not succeed".to_string());
        }

        match (baseline, under_fault) {
            (_, None) => {
                if reasons.is_empty() {
                    reasons.push("no fault-phase metrics".to_string());
                }
            }
            (Some(baseline), Some(fault)) => {
                let error_delta = fault.error_rate - baseline.error_rate;
                if error_delta > self.max_error_rate_delta {
                    reasons.push(format!(
                        "error-rate regression {:.1} > {:.1}",
                        error_delta, self.max_error_rate_delta
                    ));
                }
                if let Some(limit) = self.max_p99_delta_ms {
                    let p99_delta = fault.p99_latency_ms - baseline.p99_latency_ms;
                    if p99_delta > limit {
                        reasons.push(format!("p99 regression {:.1}ms > {:.1}ms", p99_delta, limit));
                    }
                }
            }
            (None, Some(fault)) => {
                if fault.error_rate > self.absolute_max_error_rate {
                    reasons.push(format!(
                        "error rate {:.1} > {:.1}",
                        fault.error_rate, self.absolute_max_error_rate
                    ));
                }
                if let Some(limit) = self.absolute_max_p99_ms {
                    if fault.p99_latency_ms > limit {
                        reasons.push(format!(
                            "p99 latency {:.1}ms > {:.1}ms",
                            fault.p99_latency_ms, limit
                        ));
                    }
                }
            }
        }

        match recovery {
            RecoveryStatus::Recovered(elapsed) if *elapsed > self.max_recovery => {
                reasons.push(format!(
                    "recovery took {:.1}s > {:.1}s",
                    elapsed.as_secs_f64(),
                    self.max_recovery.as_secs_f64()
                ));
            }
            RecoveryStatus::Recovered(_) => {}
            RecoveryStatus::TimedOut(_) => reasons.push("recovery timeout".to_string()),
            RecoveryStatus::NotMeasured => {
                if reasons.is_empty() {
                    reasons.push("recovery not measured".to_string());
                }
            }
        }

        if reasons.is_empty() {
            Verdict::Pass
        } else {
            Verdict::Fail(reasons)
        }
    }
}
