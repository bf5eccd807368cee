use async_trait::async_trait;
use std::time::Duration;

use crate::error::{CleanupWarning, ExperimentError};
use crate::experiment::TargetRef;

/// Resource-level fault applied through a chaos backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaosAction {
    NetworkLatency { latency: Duration },
    CpuHog { cores: u32 },
    MemoryHog { megabytes: u64 },
}

impl ChaosAction {
    pub fn label(&self) -> &'static str {
        match self {
            ChaosAction::NetworkLatency { .. } => "network-latency",
            ChaosAction::CpuHog { .. } => "cpu-hog",
            ChaosAction::MemoryHog { .. } => "memory-hog",
        }
    }
}

/// What a backend actually applied
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedChaos {
    /// Backend resources to delete on revert
    pub resources: Vec<String>,

    /// Problems that left the action partially applied
    pub failures: Vec<String>,
}

impl AppliedChaos {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Mechanism that actually degrades the target
#[async_trait]
pub trait ChaosBackend: Send + Sync {
    async fn apply(
        &self,
        target: &TargetRef,
        action: ChaosAction,
        duration: Duration,
    ) -> Result<AppliedChaos, ExperimentError>;

    async fn revert(&self, target: &TargetRef, resources: &[String]) -> Result<(), ExperimentError>;

    /// Release temporary artifacts created while applying faults
    async fn release_temporary(&self) -> Vec<CleanupWarning> {
        Vec::new()
    }
}
