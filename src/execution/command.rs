//! Whitelisted CLI commands and sanitized invocations.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::GatewayError;
use crate::security::validation::{sanitize_command_argument, ValidationError};

macro_rules! cli_commands {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Subcommand accepted by the privileged CLI.
        ///
        /// The set is closed: there is no way to construct a command that is
        /// not listed here.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum CliCommand {
            $($variant),+
        }

        impl CliCommand {
            /// Every whitelisted command.
            pub const ALL: &'static [CliCommand] = &[$(CliCommand::$variant),+];

            /// Name passed to the tool as its first argument.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(CliCommand::$variant => $name),+
                }
            }
        }

        impl FromStr for CliCommand {
            type Err = GatewayError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(CliCommand::$variant),)+
                    other => Err(GatewayError::CommandNotAllowed(other.to_string())),
                }
            }
        }
    };
}

cli_commands! {
    Tenant => "tenant",
    Create => "create",
    Delete => "delete",
    List => "list",
    Status => "status",
    Backup => "backup",
    Restore => "restore",
    ListBackups => "list-backups",
    VerifyBackup => "verify-backup",
    BackupEnable => "backup-enable",
    BackupDisable => "backup-disable",
    BackupStatus => "backup-status",
    BackupEnableAll => "backup-enable-all",
    Cert => "cert",
    Renew => "renew",
    Health => "health",
    Check => "check",
    Stats => "stats",
    Monitoring => "monitoring",
    Metrics => "metrics",
    Config => "config",
    Get => "get",
    Set => "set",
    Redis => "redis",
    Cli => "cli",
    Info => "info",
    Restart => "restart",
    Start => "start",
    Stop => "stop",
    New => "new",
    Rm => "rm",
    SetMemory => "set-memory",
    Rotate => "rotate",
    Handover => "handover",
}

impl fmt::Display for CliCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placeholder written to logs in place of secret arguments.
pub const REDACTED: &str = "***";

/// A whitelisted command with arguments that already passed sanitization.
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    command: CliCommand,
    args: Vec<String>,
    secret: BTreeSet<usize>,
    timeout: Option<Duration>,
}

impl CommandInvocation {
    /// Start an invocation with no arguments.
    pub fn new(command: CliCommand) -> Self {
        Self {
            command,
            args: Vec::new(),
            secret: BTreeSet::new(),
            timeout: None,
        }
    }

    /// Append a sanitized argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Result<Self, ValidationError> {
        self.args.push(sanitize_command_argument(arg.as_ref())?);
        Ok(self)
    }

    /// Append several sanitized arguments.
    pub fn args<I, S>(mut self, args: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self = self.arg(arg)?;
        }
        Ok(self)
    }

    /// Append an argument that must never appear in logs or events.
    pub fn secret_arg(mut self, arg: impl AsRef<str>) -> Result<Self, ValidationError> {
        self = self.arg(arg)?;
        self.secret.insert(self.args.len() - 1);
        Ok(self)
    }

    /// Override the executor's default timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn command(&self) -> CliCommand {
        self.command
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout
    }

    /// Arguments with secret positions replaced by [`REDACTED`].
    pub fn logged_args(&self) -> Vec<String> {
        self.args
            .iter()
            .enumerate()
            .map(|(i, a)| {
                if self.secret.contains(&i) {
                    REDACTED.to_string()
                } else {
                    a.clone()
                }
            })
            .collect()
    }
}
