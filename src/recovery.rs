//! Recovery Monitoring
//!
//! After the fault is removed the target is polled at a fixed interval
//! until desired and ready instance counts agree on several consecutive
//! polls. Not recovering in time is an expected experiment outcome and is
//! reported as `ExperimentError::RecoveryTimeout`.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::cluster::ClusterClient;
use crate::error::ExperimentError;
use crate::experiment::TargetRef;

/// Default interval between readiness polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of consecutive healthy polls required
pub const DEFAULT_CONSECUTIVE_POLLS: u32 = 2;

/// Polls target readiness until steady state or timeout
#[derive(Clone)]
pub struct RecoveryMonitor {
    cluster: Arc<dyn ClusterClient>,
    poll_interval: Duration,
    consecutive: u32,
}

impl RecoveryMonitor {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            cluster,
            poll_interval: DEFAULT_POLL_INTERVAL,
            consecutive: DEFAULT_CONSECUTIVE_POLLS,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Number of consecutive healthy polls required (at least one)
    pub fn with_consecutive_polls(mut self, polls: u32) -> Self {
        self.consecutive = polls.max(1);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn consecutive_polls(&self) -> u32 {
        self.consecutive
    }

    /// Wait until the target is back at readiness parity
    ///
    /// Returns the time from the call until the last confirming poll. A
    /// failed readiness query is returned as-is; polling only repeats
    /// healthy queries that report the target still degraded.
    pub async fn wait_for_recovery(
        &self,
        target: &TargetRef,
        timeout: Duration,
    ) -> Result<Duration, ExperimentError> {
        let start = Instant::now();
        info!("Waiting up to {:?} for {} to recover", timeout, target);

        match time::timeout(timeout, self.poll_until_steady(target, start)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{} did not recover within {:?}", target, timeout);
                Err(ExperimentError::RecoveryTimeout(timeout))
            }
        }
    }

    async fn poll_until_steady(
        &self,
        target: &TargetRef,
        start: Instant,
    ) -> Result<Duration, ExperimentError> {
        let mut streak = 0u32;
        let mut polls = 0u64;

        loop {
            let readiness = self.cluster.readiness(target).await?;
            polls += 1;

            if readiness.is_serving() {
                streak += 1;
                debug!(
                    "Poll {}: {} at parity ({}/{}), streak {}/{}",
                    polls, target, readiness.ready, readiness.desired, streak, self.consecutive
                );
                if streak >= self.consecutive {
                    let elapsed = start.elapsed();
                    info!("{} recovered in {:?} after {} polls", target, elapsed, polls);
                    return Ok(elapsed);
                }
            } else {
                if streak > 0 {
                    debug!("{} flapped after {} healthy polls", target, streak);
                }
                streak = 0;
                debug!(
                    "Poll {}: {} degraded ({}/{} ready)",
                    polls, target, readiness.ready, readiness.desired
                );
            }

            time::sleep(self.poll_interval).await;
        }
    }
}
