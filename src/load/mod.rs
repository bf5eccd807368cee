//! Load Generation
//!
//! A `LoadDriver` runs synthetic load against a target for a fixed
//! duration and concurrency and returns one `MetricsSnapshot`. The call
//! blocks for the whole run. Cancellation terminates the in-flight run and
//! yields `ExperimentError::Cancelled`; a partial snapshot is never
//! returned.

mod k6;

pub use k6::{K6Config, K6Driver};

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::error::ExperimentError;
use crate::experiment::{LoadProfile, TargetRef};
use crate::model::MetricsSnapshot;

/// Load-generation engine consumed by the orchestrator
#[async_trait]
pub trait LoadDriver: Send + Sync {
    async fn run_load(
        &self,
        target: &TargetRef,
        profile: &LoadProfile,
        cancel: CancelToken,
    ) -> Result<MetricsSnapshot, ExperimentError>;
}
