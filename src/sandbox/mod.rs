//! Command Execution Sandbox
//!
//! Cluster and load-engine collaborators talk to the outside world only by
//! executing commands through a `CommandRunner`. How the sandbox itself is
//! provisioned is not this crate's concern.
//!
//! # Architecture
//!
//! - `executor.rs`: the `CommandRunner` seam and the local process runner
//! - `validator.rs`: program whitelist and argument checks
//! - `timeout.rs`: per-phase time budgets

mod executor;
mod timeout;
mod validator;

pub use executor::{CommandOutput, CommandRequest, CommandRunner, LocalRunner, RunnerConfig};
pub use timeout::PhaseTimeout;
pub use validator::{CommandValidationError, CommandValidator};

#[cfg(test)]
pub(crate) mod testing;
