//! Chaos Orchestrator Library
//!
//! Runs chaos engineering experiments against a cluster workload: verify
//! the target, measure a baseline under load, inject a fault while load
//! runs, wait for recovery, judge the result, and always clean up.
//!
//! The cluster, load engine, fault backend and command sandbox are
//! collaborators behind traits; `orchestrator` only decides what runs, in
//! which order, with which timing, and how the results are judged.

pub mod cancel;
pub mod cleanup;
pub mod cluster;
pub mod config;
pub mod error;
pub mod experiment;
pub mod fault;
pub mod load;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod preflight;
pub mod recovery;
pub mod report;
pub mod sandbox;

pub use error::{CleanupWarning, ExperimentError};
pub use experiment::{ExperimentSpec, FaultKind, LoadProfile, TargetRef};
pub use model::{MetricsSnapshot, PhaseName, PhaseOutcome, PhaseResult, Verdict};
pub use orchestrator::{ExperimentOrchestrator, OrchestratorConfig};
pub use report::ExperimentReport;
