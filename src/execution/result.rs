//! Execution result types.

use std::time::Duration;

use super::command::CliCommand;
use crate::error::GatewayError;
use crate::security::ValidationError;

/// Why an execution did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// An argument failed sanitization; nothing was spawned.
    Rejected(ValidationError),
    /// The tool exceeded its timeout and was killed.
    Timeout(Duration),
    /// The tool exited with a non-zero status or was killed by a signal.
    NonZeroExit,
    /// The tool could not be started.
    Spawn(String),
}

/// Result of one CLI invocation.
///
/// Failures are data, not errors: callers decide whether a non-zero exit is
/// fatal through [`into_result`](Self::into_result).
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub command: CliCommand,
    pub stdout: String,
    pub stderr: String,
    /// Exit code (if the process exited normally).
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub failure: Option<FailureKind>,
}

impl ExecutionResult {
    /// Process ran to completion.
    pub fn completed(
        command: CliCommand,
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
        duration: Duration,
    ) -> Self {
        let failure = (exit_code != Some(0)).then_some(FailureKind::NonZeroExit);
        Self {
            command,
            stdout,
            stderr,
            exit_code,
            duration,
            failure,
        }
    }

    /// Argument rejected before spawning.
    pub fn rejected(command: CliCommand, error: ValidationError) -> Self {
        Self {
            stderr: error.to_string(),
            failure: Some(FailureKind::Rejected(error)),
            ..Self::empty(command)
        }
    }

    /// Create a result indicating timeout.
    pub fn timeout(command: CliCommand, timeout: Duration, duration: Duration) -> Self {
        Self {
            stderr: format!("Command timed out after {} seconds", timeout.as_secs()),
            duration,
            failure: Some(FailureKind::Timeout(timeout)),
            ..Self::empty(command)
        }
    }

    /// Tool could not be started.
    pub fn spawn_failed(command: CliCommand, message: impl Into<String>, duration: Duration) -> Self {
        let message = message.into();
        Self {
            stderr: message.clone(),
            duration,
            failure: Some(FailureKind::Spawn(message)),
            ..Self::empty(command)
        }
    }

    fn empty(command: CliCommand) -> Self {
        Self {
            command,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration: Duration::ZERO,
            failure: None,
        }
    }

    /// Check if command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }

    /// Check if command failed (non-zero exit code, timeout or rejection).
    pub fn failed(&self) -> bool {
        !self.success()
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.failure, Some(FailureKind::Timeout(_)))
    }

    /// Get output as string, trimmed.
    pub fn output_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Non-empty output lines.
    pub fn output_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }

    /// Convert a failed execution into the matching [`GatewayError`].
    pub fn into_result(mut self) -> Result<Self, GatewayError> {
        match self.failure.take() {
            None => Ok(self),
            Some(FailureKind::Rejected(e)) => Err(e.into()),
            Some(FailureKind::Timeout(timeout)) => Err(GatewayError::SubprocessTimeout {
                command: self.command.to_string(),
                timeout,
            }),
            Some(FailureKind::NonZeroExit) => Err(GatewayError::SubprocessFailure {
                command: self.command.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr,
            }),
            Some(FailureKind::Spawn(message)) => Err(GatewayError::Internal(format!(
                "failed to start '{}': {}",
                self.command, message
            ))),
        }
    }
}
