//! Command Executor
//!
//! Runs cluster and load-engine commands as child processes with timeout,
//! cancellation and output capture. The orchestrator only depends on the
//! `CommandRunner` trait ("execute command, capture exit code and stdout");
//! `LocalRunner` is the implementation that runs commands on this host.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as TokioCommand;
use tracing::{debug, info, warn};

use super::validator::CommandValidator;
use crate::cancel::CancelToken;
use crate::error::ExperimentError;

/// Default timeout for a single command in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Maximum captured output size in bytes (1MB)
const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// A command to run in the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,

    /// Overrides the runner's default timeout
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program and arguments joined for logging
    pub fn display(&self) -> String {
        if self.args.len() > 6 {
            format!(
                "{} {} ... ({} args)",
                self.program,
                self.args[..6].join(" "),
                self.args.len()
            )
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code (None if the process was killed)
    pub exit_code: Option<i32>,

    /// Standard output (truncated if too large)
    pub stdout: String,

    /// Standard error (truncated if too large)
    pub stderr: String,

    /// Execution duration in milliseconds
    pub duration_ms: f64,

    /// Whether the runner killed the process on timeout
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            duration_ms: 0.0,
            timed_out: false,
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
            duration_ms: 0.0,
            timed_out: false,
        }
    }

    fn timeout(duration_ms: f64) -> Self {
        Self {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms,
            timed_out: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// Get a human-readable summary
    pub fn summary(&self) -> String {
        if self.timed_out {
            format!("Timeout after {:.0}ms", self.duration_ms)
        } else if self.is_success() {
            format!(
                "Success ({:.0}ms, {} bytes output)",
                self.duration_ms,
                self.stdout.len()
            )
        } else {
            format!(
                "Failed (exit code: {:?}, {:.0}ms): {}",
                self.exit_code,
                self.duration_ms,
                self.stderr.trim()
            )
        }
    }
}

/// Command-execution sandbox
///
/// Implementations return `Err` only when the command could not be run at
/// all (rejected, failed to spawn, cancelled). A command that ran and
/// exited non-zero is an `Ok` output for the caller to judge.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn execute(
        &self,
        request: &CommandRequest,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, ExperimentError>;
}

/// Configuration for the local runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Default timeout per command
    pub timeout: Duration,

    /// Maximum captured output size in bytes
    pub max_output_size: usize,

    /// Whether to validate commands before execution
    pub validate_commands: bool,

    /// Working directory for command execution
    pub working_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_output_size: MAX_OUTPUT_SIZE,
            validate_commands: true,
            working_dir: None,
        }
    }
}

impl RunnerConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    pub fn skip_validation(mut self) -> Self {
        self.validate_commands = false;
        self
    }
}

/// Runs commands as local child processes
///
/// Commands are spawned without a shell, with `kill_on_drop` set so that a
/// timed-out or cancelled command never outlives the call.
#[derive(Debug, Clone, Default)]
pub struct LocalRunner {
    validator: CommandValidator,
    config: RunnerConfig,
}

impl LocalRunner {
    pub fn new(validator: CommandValidator, config: RunnerConfig) -> Self {
        Self { validator, config }
    }

    pub fn validator(&self) -> &CommandValidator {
        &self.validator
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn execute(
        &self,
        request: &CommandRequest,
        cancel: &CancelToken,
    ) -> Result<CommandOutput, ExperimentError> {
        let start = Instant::now();
        let cmd_str = request.display();
        debug!("Executing: {}", cmd_str);

        if self.config.validate_commands {
            self.validator
                .validate(&request.program, &request.args, &request.env)
                .map_err(|e| {
                    warn!("Command validation failed: {}", e);
                    ExperimentError::Sandbox(format!("command validation failed: {}", e))
                })?;
        }

        if cancel.is_cancelled() {
            return Err(ExperimentError::Cancelled);
        }

        let mut process = TokioCommand::new(&request.program);
        process
            .args(&request.args)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.config.working_dir {
            process.current_dir(dir);
        }

        let child = process.spawn().map_err(|e| {
            ExperimentError::Sandbox(format!("failed to spawn {}: {}", request.program, e))
        })?;

        let timeout = request.timeout.unwrap_or(self.config.timeout);

        // Dropping the wait future kills the child (kill_on_drop)
        let output = tokio::select! {
            result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
                Ok(output) => output?,
                Err(_) => {
                    warn!("Command timed out after {:?}: {}", timeout, cmd_str);
                    return Ok(CommandOutput::timeout(start.elapsed().as_millis() as f64));
                }
            },
            _ = cancel.cancelled() => {
                info!("Command cancelled: {}", cmd_str);
                return Err(ExperimentError::Cancelled);
            }
        };

        let duration_ms = start.elapsed().as_millis() as f64;
        let stdout = truncate_string(
            String::from_utf8_lossy(&output.stdout).to_string(),
            self.config.max_output_size,
        );
        let stderr = truncate_string(
            String::from_utf8_lossy(&output.stderr).to_string(),
            self.config.max_output_size,
        );

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout,
            stderr,
            duration_ms,
            timed_out: false,
        };
        debug!("{}: {}", cmd_str, result.summary());
        Ok(result)
    }
}

/// Truncate a string to a maximum length, adding ellipsis if truncated
fn truncate_string(mut s: String, max_len: usize) -> String {
    if s.len() > max_len {
        let mut cut = max_len.saturating_sub(3);
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("...");
    }
    s
}
