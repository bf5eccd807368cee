//! Cleanup Coordination
//!
//! The coordinator owns the release side of an experiment: the outstanding
//! fault (if any) and the temporary resources created by the chaos
//! backend. Cleanup runs at most once per coordinator and never fails;
//! problems come back as `CleanupWarning`s.
//!
//! `CleanupGuard` scopes a coordinator to the orchestrator's run. If the
//! run is abandoned before the guard is finished (the run future dropped,
//! a panic unwinding through it) the guard schedules cleanup on drop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::CleanupWarning;
use crate::fault::{ChaosBackend, FaultHandle, FaultInjector};

struct Outstanding {
    handle: FaultHandle,
    injector: Arc<dyn FaultInjector>,
}

/// Best-effort, run-once release of experiment resources
pub struct CleanupCoordinator {
    outstanding: Mutex<Option<Outstanding>>,
    backend: Option<Arc<dyn ChaosBackend>>,
    release_temporary: bool,
    ran: AtomicBool,
}

impl CleanupCoordinator {
    /// Create a coordinator
    ///
    /// `release_temporary` controls whether backend temporary resources are
    /// removed. An outstanding fault is always stopped.
    pub fn new(backend: Option<Arc<dyn ChaosBackend>>, release_temporary: bool) -> Self {
        Self {
            outstanding: Mutex::new(None),
            backend,
            release_temporary,
            ran: AtomicBool::new(false),
        }
    }

    /// Take responsibility for stopping a started fault
    ///
    /// A fault tracked after cleanup already ran is stopped in the
    /// background right away.
    pub fn track(&self, handle: FaultHandle, injector: Arc<dyn FaultInjector>) {
        let mut outstanding = self
            .outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Checked under the lock: cleanup sets the flag before taking the slot
        if self.has_run() {
            drop(outstanding);
            stop_late(handle, injector);
            return;
        }
        if let Some(previous) = outstanding.as_ref() {
            if !previous.handle.is_stopped() {
                warn!(
                    "Fault {} replaced while still active; only one fault is tracked",
                    previous.handle.id()
                );
            }
        }
        debug!("Tracking fault {} ({})", handle.id(), handle.kind());
        *outstanding = Some(Outstanding { handle, injector });
    }

    /// Handle of the fault currently tracked
    pub fn outstanding(&self) -> Option<FaultHandle> {
        self.outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|o| o.handle.clone())
    }

    pub fn has_run(&self) -> bool {
        self.ran.load(Ordering::SeqCst)
    }

    /// Release everything; a no-op after the first call
    pub async fn cleanup(&self) -> Vec<CleanupWarning> {
        if self.ran.swap(true, Ordering::SeqCst) {
            debug!("Cleanup already ran");
            return Vec::new();
        }

        let mut warnings = Vec::new();
        let outstanding = self
            .outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(Outstanding { handle, injector }) = outstanding {
            if handle.is_stopped() {
                debug!("Fault {} already stopped", handle.id());
            } else {
                info!("Stopping outstanding fault {} on {}", handle.kind(), handle.target());
                if let Err(e) = injector.stop(&handle).await {
                    warnings.push(CleanupWarning::new(
                        format!("fault {} on {}", handle.kind(), handle.target()),
                        e.to_string(),
                    ));
                }
            }
        }

        if self.release_temporary {
            if let Some(backend) = &self.backend {
                warnings.extend(backend.release_temporary().await);
            }
        } else {
            debug!("Keeping temporary resources (cleanup disabled)");
        }

        for warning in &warnings {
            warn!("Cleanup warning: {}", warning);
        }
        warnings
    }
}

fn stop_late(handle: FaultHandle, injector: Arc<dyn FaultInjector>) {
    if handle.is_stopped() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            warn!("Fault {} started after cleanup; stopping it now", handle.id());
            runtime.spawn(async move {
                if let Err(e) = injector.stop(&handle).await {
                    warn!(
                        "Cleanup warning: fault {} on {}: {}",
                        handle.kind(),
                        handle.target(),
                        e
                    );
                }
            });
        }
        Err(_) => {
            warn!(
                "Fault {} started after cleanup outside a runtime; it may remain active",
                handle.id()
            );
        }
    }
}

/// Runs cleanup when an experiment scope ends
pub struct CleanupGuard {
    coordinator: Arc<CleanupCoordinator>,
    armed: bool,
}

impl CleanupGuard {
    pub fn new(coordinator: Arc<CleanupCoordinator>) -> Self {
        Self {
            coordinator,
            armed: true,
        }
    }

    pub fn coordinator(&self) -> &Arc<CleanupCoordinator> {
        &self.coordinator
    }

    /// Run cleanup in place and disarm the drop fallback
    pub async fn finish(mut self) -> Vec<CleanupWarning> {
        self.armed = false;
        self.coordinator.cleanup().await
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed || self.coordinator.has_run() {
            return;
        }

        let coordinator = self.coordinator.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!("Experiment scope abandoned; cleaning up in the background");
                runtime.spawn(async move {
                    coordinator.cleanup().await;
                });
            }
            Err(_) => {
                warn!("Experiment scope abandoned outside a runtime; resources may remain");
            }
        }
    }
}
