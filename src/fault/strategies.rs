use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{ChaosAction, ChaosBackend, FaultHandle, FaultInjector};
use crate::cluster::ClusterClient;
use crate::error::ExperimentError;
use crate::experiment::{FaultKind, TargetRef};

/// Terminates every instance of the target
///
/// Terminated instances are replaced by the workload controller, so there
/// is nothing to reverse on stop; recovery is what the experiment measures.
pub struct InstanceKillFault {
    cluster: Arc<dyn ClusterClient>,
    kind: FaultKind,
}

impl InstanceKillFault {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            cluster,
            kind: FaultKind::InstanceKill,
        }
    }
}

#[async_trait]
impl FaultInjector for InstanceKillFault {
    fn kind(&self) -> &FaultKind {
        &self.kind
    }

    async fn start(
        &self,
        target: &TargetRef,
        _duration: Duration,
    ) -> Result<FaultHandle, ExperimentError> {
        let outcome = self
            .cluster
            .terminate_instances(target)
            .await
            .map_err(|e| ExperimentError::FaultInjection(e.to_string()))?;

        if outcome.terminated.is_empty() {
            let reason = match outcome.failed.first() {
                Some((pod, why)) => format!("could not terminate {}: {}", pod, why),
                None => format!("no running instances of {}", target),
            };
            return Err(ExperimentError::FaultInjection(reason));
        }

        if outcome.is_partial() {
            warn!(
                "Instance kill partially applied to {}: {} terminated, {} failed",
                target,
                outcome.terminated.len(),
                outcome.failed.len()
            );
        }

        let partial = outcome.is_partial();
        Ok(FaultHandle::new(
            self.kind.clone(),
            target.clone(),
            outcome.terminated,
            partial,
        ))
    }

    async fn stop(&self, handle: &FaultHandle) -> Result<(), ExperimentError> {
        handle
            .stop_once(|| async {
                info!("Instance kill on {} released", handle.target());
                Ok(())
            })
            .await
    }
}

/// Shared start/stop path for backend-driven faults
async fn start_backend_fault(
    backend: &dyn ChaosBackend,
    kind: &FaultKind,
    action: ChaosAction,
    target: &TargetRef,
    duration: Duration,
) -> Result<FaultHandle, ExperimentError> {
    let applied = backend
        .apply(target, action, duration)
        .await
        .map_err(|e| match e {
            ExperimentError::FaultInjection(_) => e,
            other => ExperimentError::FaultInjection(other.to_string()),
        })?;

    if applied.resources.is_empty() {
        return Err(ExperimentError::FaultInjection(format!(
            "{} produced no resources for {}",
            action.label(),
            target
        )));
    }
    if applied.is_partial() {
        warn!(
            "{} partially applied to {}: {}",
            action.label(),
            target,
            applied.failures.join("; ")
        );
    }

    info!("{} started on {} for {:?}", kind, target, duration);
    let partial = applied.is_partial();
    Ok(FaultHandle::new(
        kind.clone(),
        target.clone(),
        applied.resources,
        partial,
    ))
}

async fn stop_backend_fault(
    backend: &dyn ChaosBackend,
    handle: &FaultHandle,
) -> Result<(), ExperimentError> {
    handle
        .stop_once(|| async {
            backend
                .revert(handle.target(), handle.resources())
                .await
                .map_err(|e| match e {
                    ExperimentError::FaultInjection(_) => e,
                    other => ExperimentError::FaultInjection(other.to_string()),
                })?;
            info!("{} on {} stopped", handle.kind(), handle.target());
            Ok::<(), ExperimentError>(())
        })
        .await
}

macro_rules! backend_fault {
    ($(#[$doc:meta])* $name:ident, $field:ident: $ty:ty, $kind:ident, $action:ident) => {
        $(#[$doc])*
        pub struct $name {
            backend: Arc<dyn ChaosBackend>,
            kind: FaultKind,
            $field: $ty,
        }

        impl $name {
            pub fn new(backend: Arc<dyn ChaosBackend>, $field: $ty) -> Self {
                Self {
                    backend,
                    kind: FaultKind::$kind { $field },
                    $field,
                }
            }
        }

        #[async_trait]
        impl FaultInjector for $name {
            fn kind(&self) -> &FaultKind {
                &self.kind
            }

            async fn start(
                &self,
                target: &TargetRef,
                duration: Duration,
            ) -> Result<FaultHandle, ExperimentError> {
                let action = ChaosAction::$action { $field: self.$field };
                start_backend_fault(self.backend.as_ref(), &self.kind, action, target, duration).await
            }

            async fn stop(&self, handle: &FaultHandle) -> Result<(), ExperimentError> {
                stop_backend_fault(self.backend.as_ref(), handle).await
            }
        }
    };
}

backend_fault!(
    /// Adds network latency to the target's traffic
    NetworkLatencyFault, latency: Duration, NetworkLatency, NetworkLatency
);
backend_fault!(
    /// Saturates CPU cores in each target instance
    CpuHogFault, cores: u32, CpuHog, CpuHog
);
backend_fault!(
    /// Consumes memory in each target instance
    MemoryHogFault, megabytes: u64, MemoryHog, MemoryHog
);
