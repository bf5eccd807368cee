//! Fault Injection
//!
//! A `FaultInjector` starts one kind of fault against a target and returns
//! a `FaultHandle` representing the running fault. The handle is the only
//! way to stop it again, and stopping is idempotent: the first successful
//! stop reverses the fault, every later stop is a no-op.
//!
//! # Architecture
//!
//! - `strategies.rs`: one injector per `FaultKind` variant
//! - `backend.rs`: the `ChaosBackend` seam used by resource-level faults
//! - `litmus.rs`: backend that drives Litmus `ChaosEngine` resources
//!
//! `StrategyFactory` resolves a `FaultKind` to its injector with an
//! exhaustive match, so every kind that can be constructed has an injector.

mod backend;
mod litmus;
mod strategies;

pub use backend::{AppliedChaos, ChaosAction, ChaosBackend};
pub use litmus::{LitmusBackend, LitmusConfig};
pub use strategies::{CpuHogFault, InstanceKillFault, MemoryHogFault, NetworkLatencyFault};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cluster::ClusterClient;
use crate::error::ExperimentError;
use crate::experiment::{FaultKind, TargetRef};

const ACTIVE: u8 = 0;
const STOPPING: u8 = 1;
const STOPPED: u8 = 2;

/// Token for a running fault
///
/// Clones share state: stopping through any clone stops them all.
#[derive(Debug, Clone)]
pub struct FaultHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    id: Uuid,
    kind: FaultKind,
    target: TargetRef,
    started_at: DateTime<Utc>,
    resources: Vec<String>,
    partial: bool,
    state: AtomicU8,
}

impl FaultHandle {
    /// Create a handle for a fault that has been (at least partly) applied
    ///
    /// `resources` identifies whatever must be reversed on stop;
    /// `partial` records that the fault applied to only some instances.
    pub fn new(kind: FaultKind, target: TargetRef, resources: Vec<String>, partial: bool) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: Uuid::new_v4(),
                kind,
                target,
                started_at: Utc::now(),
                resources,
                partial,
                state: AtomicU8::new(ACTIVE),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn kind(&self) -> &FaultKind {
        &self.inner.kind
    }

    pub fn target(&self) -> &TargetRef {
        &self.inner.target
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn resources(&self) -> &[String] {
        &self.inner.resources
    }

    pub fn is_partial(&self) -> bool {
        self.inner.partial
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == STOPPED
    }

    /// Run `revert` at most once to completion
    ///
    /// Returns `Ok(())` without calling `revert` if the handle is already
    /// stopped or another stop is in flight. If `revert` fails the handle
    /// stays active so a later stop (e.g. cleanup) can retry.
    pub async fn stop_once<F, Fut>(&self, revert: F) -> Result<(), ExperimentError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), ExperimentError>>,
    {
        if self
            .inner
            .state
            .compare_exchange(ACTIVE, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Fault {} already stopped", self.inner.id);
            return Ok(());
        }

        match revert().await {
            Ok(()) => {
                self.inner.state.store(STOPPED, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.inner.state.store(ACTIVE, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

/// Strategy interface over fault kinds
#[async_trait]
pub trait FaultInjector: Send + Sync {
    fn kind(&self) -> &FaultKind;

    /// Start the fault for at most `duration`
    ///
    /// If the fault applies only partially the call still returns a
    /// handle, so the applied part can be reversed.
    async fn start(
        &self,
        target: &TargetRef,
        duration: Duration,
    ) -> Result<FaultHandle, ExperimentError>;

    /// Reverse the fault; a no-op on an already stopped handle
    async fn stop(&self, handle: &FaultHandle) -> Result<(), ExperimentError>;
}

/// Resolves a fault kind to its injector
pub trait FaultInjectorFactory: Send + Sync {
    fn create(&self, kind: &FaultKind) -> Arc<dyn FaultInjector>;
}

/// Default factory building the strategies in this module
#[derive(Clone)]
pub struct StrategyFactory {
    cluster: Arc<dyn ClusterClient>,
    backend: Arc<dyn ChaosBackend>,
}

impl StrategyFactory {
    pub fn new(cluster: Arc<dyn ClusterClient>, backend: Arc<dyn ChaosBackend>) -> Self {
        Self { cluster, backend }
    }
}

impl FaultInjectorFactory for StrategyFactory {
    fn create(&self, kind: &FaultKind) -> Arc<dyn FaultInjector> {
        match kind {
            FaultKind::InstanceKill => Arc::new(InstanceKillFault::new(self.cluster.clone())),
            FaultKind::NetworkLatency { latency } => {
                Arc::new(NetworkLatencyFault::new(self.backend.clone(), *latency))
            }
            FaultKind::CpuHog { cores } => Arc::new(CpuHogFault::new(self.backend.clone(), *cores)),
            FaultKind::MemoryHog { megabytes } => {
                Arc::new(MemoryHogFault::new(self.backend.clone(), *megabytes))
            }
        }
    }
}
