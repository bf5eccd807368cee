//! Experiment Reporting
//!
//! `ReportBuilder` turns the audit trail and measurements of a run into an
//! immutable `ExperimentReport` carrying the verdict. Rendering the report
//! to a file is a separate step (`render.rs`) that can fail without ever
//! changing the verdict.

mod render;
mod verdict;

pub use render::{ArtifactStatus, ReportRenderer};
pub use verdict::VerdictPolicy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{CleanupWarning, ExperimentError};
use crate::experiment::{option_duration_ms, ExperimentSpec};
use crate::model::{MetricsSnapshot, PhaseLog, PhaseOutcome, PhaseResult, Verdict};

/// How the recovery phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    /// Target reached steady state after the given time
    Recovered(Duration),

    /// Target was still degraded when the timeout elapsed
    TimedOut(Duration),

    /// Recovery was never measured (earlier abort or query failure)
    NotMeasured,
}

impl RecoveryStatus {
    pub fn duration(&self) -> Option<Duration> {
        match self {
            RecoveryStatus::Recovered(elapsed) => Some(*elapsed),
            _ => None,
        }
    }
}

/// Fault-phase metrics minus baseline metrics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricDeltas {
    /// Percentage points
    pub error_rate: f64,
    pub p99_latency_ms: f64,
    pub throughput: f64,
}

impl MetricDeltas {
    pub fn between(baseline: &MetricsSnapshot, under_fault: &MetricsSnapshot) -> Self {
        Self {
            error_rate: under_fault.error_rate - baseline.error_rate,
            p99_latency_ms: under_fault.p99_latency_ms - baseline.p99_latency_ms,
            throughput: under_fault.throughput - baseline.throughput,
        }
    }
}

/// Complete record of one experiment run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub id: Uuid,
    pub spec: ExperimentSpec,
    pub phases: Vec<PhaseResult>,
    pub baseline: Option<MetricsSnapshot>,
    pub under_fault: Option<MetricsSnapshot>,
    #[serde(with = "option_duration_ms")]
    pub recovery_duration: Option<Duration>,
    pub deltas: Option<MetricDeltas>,
    pub verdict: Verdict,
    pub cleanup_warnings: Vec<CleanupWarning>,
    pub generated_at: DateTime<Utc>,

    /// Outcome of rendering this report to a file
    #[serde(skip)]
    pub artifact: ArtifactStatus,
}

impl ExperimentReport {
    /// Attach the result of rendering the report
    pub fn with_artifact(mut self, artifact: ArtifactStatus) -> Self {
        self.artifact = artifact;
        self
    }

    /// Phase the run ended in (always Cleanup for a completed run)
    pub fn final_phase(&self) -> Option<&PhaseResult> {
        self.phases.last()
    }

    /// Export to JSON
    pub fn to_json(&self) -> Result<String, ExperimentError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ExperimentError::Report(format!("failed to serialize report: {}", e)))
    }

    /// Generate a console summary
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str("Chaos Experiment Summary\n");
        out.push_str("========================\n");
        out.push_str(&format!("Experiment: {}\n", self.id));
        out.push_str(&format!("Target: {}\n", self.spec.target()));
        out.push_str(&format!(
            "Chaos Type: {} for {}s\n",
            self.spec.fault(),
            self.spec.fault_duration().as_secs()
        ));
        out.push_str(&format!(
            "Load Test: {} VUs for {}s\n\n",
            self.spec.load().concurrency,
            self.spec.load().duration.as_secs()
        ));

        for phase in &self.phases {
            let detail = match &phase.outcome {
                PhaseOutcome::Failed(reason) => format!(" ({})", reason),
                _ => String::new(),
            };
            out.push_str(&format!(
                "  {:<15} {:<8} {:>6}ms{}\n",
                phase.phase.as_str(),
                phase.outcome.label(),
                phase.duration().num_milliseconds(),
                detail
            ));
        }
        out.push('\n');

        match &self.baseline {
            Some(b) => out.push_str(&format!(
                "Baseline - Error Rate: {:.2}%, P99: {:.0}ms\n",
                b.error_rate, b.p99_latency_ms
            )),
            None => out.push_str("Baseline - not measured\n"),
        }
        match &self.under_fault {
            Some(f) => out.push_str(&format!(
                "Chaos    - Error Rate: {:.2}%, P99: {:.0}ms\n",
                f.error_rate, f.p99_latency_ms
            )),
            None => out.push_str("Chaos    - not measured\n"),
        }
        match self.recovery_duration {
            Some(d) => out.push_str(&format!("Recovery Time: {:.1}s\n", d.as_secs_f64())),
            None => out.push_str("Recovery Time: n/a\n"),
        }
        for warning in &self.cleanup_warnings {
            out.push_str(&format!("Cleanup warning: {}\n", warning));
        }

        out.push('\n');
        match &self.verdict {
            Verdict::Pass => out.push_str("✅ PASS"),
            Verdict::Fail(reasons) => {
                out.push_str(&format!("❌ FAIL: {}", reasons.join("; ")));
            }
        }
        out
    }
}

/// Measurements gathered by one run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurements {
    pub baseline: Option<MetricsSnapshot>,
    pub under_fault: Option<MetricsSnapshot>,
    pub recovery: RecoveryStatus,
}

impl Default for Measurements {
    fn default() -> Self {
        Self {
            baseline: None,
            under_fault: None,
            recovery: RecoveryStatus::NotMeasured,
        }
    }
}

/// Combines an experiment's measurements into a report
#[derive(Debug, Clone, Default)]
pub struct ReportBuilder {
    policy: VerdictPolicy,
}

impl ReportBuilder {
    pub fn new(policy: VerdictPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &VerdictPolicy {
        &self.policy
    }

    /// Compute the verdict without building a report
    pub fn evaluate(&self, phases: &PhaseLog, measurements: &Measurements) -> Verdict {
        self.policy.evaluate(
            phases.entries(),
            measurements.baseline.as_ref(),
            measurements.under_fault.as_ref(),
            &measurements.recovery,
        )
    }

    /// Build the final, immutable report for run `id`
    pub fn build_report(
        &self,
        id: Uuid,
        spec: &ExperimentSpec,
        phases: PhaseLog,
        measurements: Measurements,
        cleanup_warnings: Vec<CleanupWarning>,
    ) -> ExperimentReport {
        let verdict = self.evaluate(&phases, &measurements);
        let deltas = match (&measurements.baseline, &measurements.under_fault) {
            (Some(b), Some(f)) => Some(MetricDeltas::between(b, f)),
            _ => None,
        };

        ExperimentReport {
            id,
            spec: spec.clone(),
            phases: phases.into_entries(),
            baseline: measurements.baseline,
            under_fault: measurements.under_fault,
            recovery_duration: measurements.recovery.duration(),
            deltas,
            verdict,
            cleanup_warnings,
            generated_at: Utc::now(),
            artifact: ArtifactStatus::NotRendered,
        }
    }
}
