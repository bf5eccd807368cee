//! Cluster Control-Plane Collaborator
//!
//! The orchestrator consumes exactly four cluster operations: connectivity,
//! existence checks, a readiness query, and instance termination. Any
//! failure is returned as a typed `ExperimentError::Cluster`; retry policy,
//! if any, belongs to the implementation, never to the orchestrator.

mod kubectl;

pub use kubectl::KubectlClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExperimentError;
use crate::experiment::TargetRef;

/// Desired versus ready instance counts for a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    pub desired: u32,
    pub ready: u32,
}

impl Readiness {
    pub fn new(desired: u32, ready: u32) -> Self {
        Self { desired, ready }
    }

    /// Every desired instance is ready
    pub fn at_parity(&self) -> bool {
        self.ready == self.desired
    }

    /// At parity with at least one instance serving
    pub fn is_serving(&self) -> bool {
        self.at_parity() && self.ready > 0
    }
}

/// Result of terminating a workload's instances
///
/// Termination may partially apply; callers decide whether a partial
/// outcome is usable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationOutcome {
    /// Instances that were terminated
    pub terminated: Vec<String>,

    /// Instances that could not be terminated, with the reason
    pub failed: Vec<(String, String)>,
}

impl TerminationOutcome {
    pub fn is_partial(&self) -> bool {
        !self.terminated.is_empty() && !self.failed.is_empty()
    }
}

/// Operations consumed from the cluster control plane
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fail unless the control plane answers
    async fn check_connectivity(&self) -> Result<(), ExperimentError>;

    async fn namespace_exists(&self, namespace: &str) -> Result<bool, ExperimentError>;

    async fn workload_exists(&self, target: &TargetRef) -> Result<bool, ExperimentError>;

    async fn readiness(&self, target: &TargetRef) -> Result<Readiness, ExperimentError>;

    /// Terminate every running instance of the workload
    async fn terminate_instances(
        &self,
        target: &TargetRef,
    ) -> Result<TerminationOutcome, ExperimentError>;
}
