//! Command Validation
//!
//! Commands issued on behalf of an experiment are executed as argument
//! lists, never through a shell. The validator additionally restricts which
//! programs may run and rejects shell metacharacters in arguments, so a
//! malformed target name can never turn into an arbitrary command.

use std::path::Path;

/// Error types for command validation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandValidationError {
    #[error("Command '{0}' is not in the allowed whitelist")]
    NotAllowed(String),

    #[error("Command argument '{0}' contains shell metacharacters")]
    ShellMetacharacter(String),

    #[error("Command path contains directory traversal: '{0}'")]
    DirectoryTraversal(String),

    #[error("Environment variable name '{0}' is invalid")]
    InvalidEnvName(String),

    #[error("Empty command")]
    Empty,
}

/// Characters that change meaning when a string reaches a shell
const SHELL_METACHARACTERS: [char; 11] = [';', '|', '&', '$', '`', '\n', '\r', '(', ')', '<', '>'];

/// Command validator that enforces the program whitelist
#[derive(Debug, Clone)]
pub struct CommandValidator {
    allowed_commands: Vec<String>,
}

impl Default for CommandValidator {
    fn default() -> Self {
        Self::with_default_whitelist()
    }
}

impl CommandValidator {
    /// Whitelist containing the cluster and load-engine binaries
    pub fn with_default_whitelist() -> Self {
        Self::with_whitelist(vec!["kubectl".to_string(), "k6".to_string()])
    }

    pub fn with_whitelist(allowed: Vec<String>) -> Self {
        Self {
            allowed_commands: allowed,
        }
    }

    pub fn allow_command(&mut self, command: impl Into<String>) {
        let command = command.into();
        if !self.is_allowed(&command) {
            self.allowed_commands.push(command);
        }
    }

    /// Validate a program, its arguments and environment variable names
    ///
    /// Absolute program paths are accepted when the exact path is
    /// whitelisted (sandboxes commonly mount tools at fixed locations).
    pub fn validate(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<(), CommandValidationError> {
        if program.is_empty() {
            return Err(CommandValidationError::Empty);
        }
        if !self.is_allowed(program) {
            return Err(CommandValidationError::NotAllowed(program.to_string()));
        }
        if Path::new(program)
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(CommandValidationError::DirectoryTraversal(program.to_string()));
        }

        for arg in args {
            if arg.contains(SHELL_METACHARACTERS) {
                return Err(CommandValidationError::ShellMetacharacter(arg.clone()));
            }
        }

        for (name, _) in env {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
            if !valid {
                return Err(CommandValidationError::InvalidEnvName(name.clone()));
            }
        }

        Ok(())
    }

    pub fn whitelist(&self) -> &[String] {
        &self.allowed_commands
    }

    pub fn is_allowed(&self, command: &str) -> bool {
        self.allowed_commands.iter().any(|c| c == command)
    }
}
