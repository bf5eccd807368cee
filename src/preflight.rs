//! Preflight Validation
//!
//! No disruptive action is ever taken against a target that preflight has
//! not confirmed: the control plane must answer, the namespace and workload
//! must exist, and every desired instance must be ready.

use std::sync::Arc;
use tracing::{debug, info};

use crate::cluster::{ClusterClient, Readiness};
use crate::error::ExperimentError;
use crate::experiment::TargetRef;

/// Confirms a target exists and is healthy
#[derive(Clone)]
pub struct PreflightValidator {
    cluster: Arc<dyn ClusterClient>,
}

impl PreflightValidator {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    /// Run every check in order, stopping at the first failure
    ///
    /// Every failure, including a failed cluster query, is reported as
    /// `ExperimentError::Preflight`. Cancellation passes through unchanged.
    pub async fn validate(&self, target: &TargetRef) -> Result<Readiness, ExperimentError> {
        self.cluster
            .check_connectivity()
            .await
            .map_err(|e| preflight_error("cluster unreachable", e))?;
        debug!("Cluster connectivity confirmed");

        let namespace_found = self
            .cluster
            .namespace_exists(&target.namespace)
            .await
            .map_err(|e| preflight_error("namespace check failed", e))?;
        if !namespace_found {
            return Err(ExperimentError::Preflight(format!(
                "namespace '{}' does not exist",
                target.namespace
            )));
        }

        let workload_found = self
            .cluster
            .workload_exists(target)
            .await
            .map_err(|e| preflight_error("workload check failed", e))?;
        if !workload_found {
            return Err(ExperimentError::Preflight(format!(
                "deployment '{}' does not exist in namespace '{}'",
                target.workload, target.namespace
            )));
        }

        let readiness = self
            .cluster
            .readiness(target)
            .await
            .map_err(|e| preflight_error("readiness query failed", e))?;
        if !readiness.is_serving() {
            return Err(ExperimentError::Preflight(format!(
                "deployment {} is not ready ({}/{} replicas ready)",
                target, readiness.ready, readiness.desired
            )));
        }

        info!(
            "Preflight passed for {} ({}/{} ready)",
            target, readiness.ready, readiness.desired
        );
        Ok(readiness)
    }
}

fn preflight_error(context: &str, err: ExperimentError) -> ExperimentError {
    match err {
        ExperimentError::Cancelled => ExperimentError::Cancelled,
        ExperimentError::Preflight(_) => err,
        other => ExperimentError::Preflight(format!("{}: {}", context, other)),
    }
}
