//! Experiment Error Types
//!
//! This module defines the error taxonomy for experiment runs. Errors are
//! captured as failed phase results by the orchestrator; only configuration
//! errors ever surface before a run starts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::model::PhaseName;

/// Error types for experiment operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExperimentError {
    /// Invalid fault kind or malformed experiment definition
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Target missing or not ready
    #[error("Preflight failed: {0}")]
    Preflight(String),

    /// Fault mechanism failed to start or stop
    #[error("Fault injection failed: {0}")]
    FaultInjection(String),

    /// Load engine failed or produced unusable output
    #[error("Load run failed: {0}")]
    LoadRun(String),

    /// Run was cancelled before it completed
    #[error("Cancelled")]
    Cancelled,

    /// Target did not reach steady state in time
    #[error("Recovery timeout after {0:?}")]
    RecoveryTimeout(Duration),

    /// A phase exceeded its time budget
    #[error("Phase {phase} timed out after {timeout:?}")]
    PhaseTimeout { phase: PhaseName, timeout: Duration },

    /// Cluster control-plane query failed
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// Command could not be executed in the sandbox
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Report artifact could not be rendered
    #[error("Report error: {0}")]
    Report(String),
}

impl ExperimentError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExperimentError::Cancelled)
    }
}

impl From<std::io::Error> for ExperimentError {
    fn from(err: std::io::Error) -> Self {
        ExperimentError::Sandbox(err.to_string())
    }
}

/// Non-fatal problem found while releasing experiment resources
///
/// Warnings are attached to the report and never propagated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupWarning {
    /// Resource that could not be released
    pub resource: String,

    /// What went wrong
    pub message: String,
}

impl CleanupWarning {
    pub fn new(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ExperimentError::PhaseTimeout {
            phase: PhaseName::Baseline,
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.to_string(), "Phase baseline timed out after 5s");

        let err = ExperimentError::Configuration("unknown chaos type 'x'".into());
        assert!(err.to_string().contains("unknown chaos type"));
    }

    #[test]
    fn test_cancelled() {
        assert!(ExperimentError::Cancelled.is_cancelled());
        assert!(!ExperimentError::LoadRun("x".into()).is_cancelled());
    }

    #[test]
    fn test_cleanup_warning_display() {
        let warning = CleanupWarning::new("fault pod-delete", "kubectl exited 1");
        assert_eq!(warning.to_string(), "fault pod-delete: kubectl exited 1");
    }
}
