//! Phase Timeout Management
//!
//! Every experiment phase runs under a time budget. A phase that exceeds
//! its budget is reported as a failed phase, never as a crash.

use std::future::Future;
use std::time::Duration;
use tokio::time;

use crate::error::ExperimentError;
use crate::model::PhaseName;

/// Time budget for one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTimeout {
    phase: PhaseName,
    duration: Duration,
}

impl PhaseTimeout {
    /// Create a new phase timeout
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use chaos_orchestrator::model::PhaseName;
    /// use chaos_orchestrator::sandbox::PhaseTimeout;
    ///
    /// let timeout = PhaseTimeout::new(PhaseName::Preflight, Duration::from_secs(30));
    /// assert_eq!(timeout.duration(), Duration::from_secs(30));
    /// ```
    pub fn new(phase: PhaseName, duration: Duration) -> Self {
        Self { phase, duration }
    }

    pub fn phase(&self) -> PhaseName {
        self.phase
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Shrink the budget so it never exceeds `remaining`
    pub fn capped_at(self, remaining: Duration) -> Self {
        Self {
            phase: self.phase,
            duration: self.duration.min(remaining),
        }
    }

    /// Execute a future within the budget
    ///
    /// Returns the future's own result if it completes in time, or
    /// `ExperimentError::PhaseTimeout` if the budget expires first. The
    /// future is dropped on expiry.
    pub async fn run<F, T>(&self, future: F) -> Result<T, ExperimentError>
    where
        F: Future<Output = Result<T, ExperimentError>>,
    {
        match time::timeout(self.duration, future).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    phase = %self.phase,
                    "Phase timed out after {:?}",
                    self.duration
                );
                Err(ExperimentError::PhaseTimeout {
                    phase: self.phase,
                    timeout: self.duration,
                })
            }
        }
    }
}
