//! Privileged CLI executor.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::process::Command;

use super::command::{CliCommand, CommandInvocation};
use super::result::ExecutionResult;
use crate::error::GatewayError;
use crate::security::events::{EventType, SecurityEvent, SecurityEventLog, Severity};
use crate::Result;

/// Default execution timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Source address recorded on command events.
pub const LOCAL_SOURCE: &str = "local";

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Path of the privileged CLI.
    pub cli_path: PathBuf,
    /// Working directory for every invocation.
    pub working_dir: PathBuf,
    /// Timeout used when an invocation sets none.
    pub default_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            cli_path: PathBuf::from("/opt/cachepilot/cli/cachepilot"),
            working_dir: PathBuf::from("/opt/cachepilot"),
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Check that `path` names an executable file.
fn ensure_executable(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path)
        .map_err(|_| GatewayError::ToolUnavailable(format!("not found: {}", path.display())))?;
    if !meta.is_file() {
        return Err(GatewayError::ToolUnavailable(format!(
            "not a file: {}",
            path.display()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(GatewayError::ToolUnavailable(format!(
                "not executable: {}",
                path.display()
            )));
        }
    }

    Ok(())
}

/// Runs whitelisted commands against the privileged CLI.
///
/// Arguments go straight to the process argument vector. No shell is ever
/// involved, so sanitization is a second line of defence rather than the
/// only one.
#[derive(Debug)]
pub struct CommandExecutor {
    config: ExecutorConfig,
    events: SecurityEventLog,
}

impl CommandExecutor {
    /// Create an executor, failing if the tool is missing or not executable.
    pub fn new(config: ExecutorConfig, events: SecurityEventLog) -> Result<Self> {
        ensure_executable(&config.cli_path)?;
        tracing::debug!(cli = %config.cli_path.display(), "Command executor ready");
        Ok(Self { config, events })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `command` with the default timeout.
    pub async fn execute<I, S>(&self, command: CliCommand, args: I) -> ExecutionResult
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        match CommandInvocation::new(command).args(args) {
            Ok(invocation) => self.run(&invocation).await,
            Err(e) => self.rejected(command, e),
        }
    }

    /// Run `command` with an explicit timeout.
    pub async fn execute_with_timeout<I, S>(
        &self,
        command: CliCommand,
        timeout: Duration,
        args: I,
    ) -> ExecutionResult
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        match CommandInvocation::new(command).args(args) {
            Ok(invocation) => self.run(&invocation.timeout(timeout)).await,
            Err(e) => self.rejected(command, e),
        }
    }

    /// Run `command --json ARGS...` and parse stdout as JSON.
    pub async fn execute_json<I, S>(&self, command: CliCommand, args: I) -> Result<Value>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let invocation = CommandInvocation::new(command).arg("--json")?.args(args)?;
        let result = self.run(&invocation).await.into_result()?;

        serde_json::from_str(result.output_trimmed()).map_err(|e| {
            tracing::error!(command = %command, "Failed to parse JSON output: {}", e);
            GatewayError::Internal(format!("invalid JSON from '{}': {}", command, e))
        })
    }

    /// Run a prepared invocation.
    pub async fn run(&self, invocation: &CommandInvocation) -> ExecutionResult {
        let command = invocation.command();
        let timeout = invocation
            .timeout_override()
            .unwrap_or(self.config.default_timeout);
        let start = Instant::now();

        let child = Command::new(&self.config.cli_path)
            .arg(command.as_str())
            .args(invocation.arguments())
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let result = match child {
            Err(e) => ExecutionResult::spawn_failed(command, e.to_string(), start.elapsed()),
            Ok(child) => match tokio::time::timeout(timeout, child.wait_with_output()).await {
                // Dropping the wait future drops the child, which kills it.
                Err(_) => ExecutionResult::timeout(command, timeout, start.elapsed()),
                Ok(Err(e)) => {
                    ExecutionResult::spawn_failed(command, e.to_string(), start.elapsed())
                }
                Ok(Ok(output)) => ExecutionResult::completed(
                    command,
                    String::from_utf8_lossy(&output.stdout).into_owned(),
                    String::from_utf8_lossy(&output.stderr).into_owned(),
                    output.status.code(),
                    start.elapsed(),
                ),
            },
        };

        self.record(invocation, &result);
        result
    }

    fn rejected(&self, command: CliCommand, error: crate::security::ValidationError) -> ExecutionResult {
        tracing::warn!(command = %command, "Rejected command argument: {}", error);
        let result = ExecutionResult::rejected(command, error);
        self.events.emit(
            SecurityEvent::new(EventType::CommandFailed, LOCAL_SOURCE, Severity::Warning)
                .with("command", command.as_str())
                .with("reason", "invalid_argument")
                .with("error", result.stderr.clone()),
        );
        result
    }

    fn record(&self, invocation: &CommandInvocation, result: &ExecutionResult) {
        let command = invocation.command();
        let args = invocation.logged_args();
        let duration_ms = result.duration.as_millis() as u64;

        if result.success() {
            tracing::info!(command = %command, duration_ms, "Command executed");
            self.events.emit(
                SecurityEvent::new(EventType::CommandExecuted, LOCAL_SOURCE, Severity::Info)
                    .with("command", command.as_str())
                    .with("args", args)
                    .with("duration_ms", duration_ms),
            );
            return;
        }

        let reason = if result.timed_out() {
            "timeout"
        } else if result.exit_code.is_some() {
            "non_zero_exit"
        } else {
            "abnormal_termination"
        };
        tracing::error!(
            command = %command,
            exit_code = ?result.exit_code,
            "Command failed ({}): {}",
            reason,
            result.stderr.trim()
        );
        self.events.emit(
            SecurityEvent::new(EventType::CommandFailed, LOCAL_SOURCE, Severity::Error)
                .with("command", command.as_str())
                .with("args", args)
                .with("reason", reason)
                .with("exit_code", result.exit_code)
                .with("stderr", result.stderr.trim())
                .with("duration_ms", duration_ms),
        );
    }
}
