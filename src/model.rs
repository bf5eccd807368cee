//! Experiment Data Model
//!
//! Value types shared by every phase of an experiment: the performance
//! snapshot produced by a load run, the per-phase audit record, and the
//! final verdict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ExperimentError;

/// Performance snapshot produced at the end of one load run
///
/// Rates are percentages in `[0, 100]`; latency and throughput are
/// non-negative. Snapshots are never mutated after construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Failed requests as a percentage of all requests
    pub error_rate: f64,

    /// 99th percentile request latency in milliseconds
    pub p99_latency_ms: f64,

    /// Requests per second
    pub throughput: f64,

    /// Successful requests as a percentage of all requests
    pub success_rate: f64,
}

impl MetricsSnapshot {
    /// Create a validated snapshot
    ///
    /// # Errors
    ///
    /// Returns `ExperimentError::LoadRun` if any field is out of range or
    /// not a finite number. A snapshot that cannot be trusted must never
    /// reach verdict logic.
    pub fn new(
        error_rate: f64,
        p99_latency_ms: f64,
        throughput: f64,
        success_rate: f64,
    ) -> Result<Self, ExperimentError> {
        check_percentage("error_rate", error_rate)?;
        check_percentage("success_rate", success_rate)?;
        check_non_negative("p99_latency_ms", p99_latency_ms)?;
        check_non_negative("throughput", throughput)?;

        Ok(Self {
            error_rate,
            p99_latency_ms,
            throughput,
            success_rate,
        })
    }

    /// Build a snapshot from an error rate, deriving the success rate
    pub fn from_error_rate(
        error_rate: f64,
        p99_latency_ms: f64,
        throughput: f64,
    ) -> Result<Self, ExperimentError> {
        Self::new(error_rate, p99_latency_ms, throughput, 100.0 - error_rate)
    }
}

fn check_percentage(field: &str, value: f64) -> Result<(), ExperimentError> {
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(ExperimentError::LoadRun(format!(
            "{} must be within [0, 100], got {}",
            field, value
        )));
    }
    Ok(())
}

fn check_non_negative(field: &str, value: f64) -> Result<(), ExperimentError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ExperimentError::LoadRun(format!(
            "{} must be a non-negative number, got {}",
            field, value
        )));
    }
    Ok(())
}

/// Phases of an experiment run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Preflight,
    Baseline,
    FaultAndLoad,
    Recovery,
    Report,
    Cleanup,
}

impl PhaseName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Preflight => "preflight",
            PhaseName::Baseline => "baseline",
            PhaseName::FaultAndLoad => "fault_and_load",
            PhaseName::Recovery => "recovery",
            PhaseName::Report => "report",
            PhaseName::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Success,
    Failed(String),
    Skipped,
}

impl PhaseOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, PhaseOutcome::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            PhaseOutcome::Success => "success",
            PhaseOutcome::Failed(_) => "failed",
            PhaseOutcome::Skipped => "skipped",
        }
    }
}

/// Audit record for one phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: PhaseName,
    pub outcome: PhaseOutcome,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl PhaseResult {
    /// Wall-clock time spent in the phase
    pub fn duration(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }
}

/// Append-only, time-ordered sequence of phase results
///
/// Every phase that is entered produces exactly one result. Timestamps
/// are clamped so that a result never starts before its predecessor
/// ended, even if the wall clock steps backwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseLog {
    entries: Vec<PhaseResult>,
}

impl PhaseLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a result for a phase that started at `started_at` and ends now
    pub fn record(&mut self, phase: PhaseName, outcome: PhaseOutcome, started_at: DateTime<Utc>) {
        let floor = self.entries.last().map(|last| last.ended_at);
        let started_at = match floor {
            Some(floor) if started_at < floor => floor,
            _ => started_at,
        };
        let ended_at = Utc::now().max(started_at);

        self.entries.push(PhaseResult {
            phase,
            outcome,
            started_at,
            ended_at,
        });
    }

    pub fn entries(&self) -> &[PhaseResult] {
        &self.entries
    }

    pub fn last(&self) -> Option<&PhaseResult> {
        self.entries.last()
    }

    pub fn get(&self, phase: PhaseName) -> Option<&PhaseResult> {
        self.entries.iter().find(|r| r.phase == phase)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<PhaseResult> {
        self.entries
    }
}

/// Pass/fail determination for an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "reasons", rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail(Vec<String>),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    pub fn reasons(&self) -> &[String] {
        match self {
            Verdict::Pass => &[],
            Verdict::Fail(reasons) => reasons,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Fail(_) => "fail",
        }
    }
}
