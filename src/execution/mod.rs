//! Command execution engine.
//!
//! Every privileged operation goes through [`CommandExecutor`]:
//! - Closed whitelist of CLI subcommands ([`CliCommand`])
//! - Per-argument sanitization before anything is spawned
//! - Timeout with process kill
//! - Structured results instead of errors for tool failures
//!
//! # Example
//!
//! ```no_run
//! use cachepilot_gateway::execution::{CliCommand, CommandExecutor, ExecutorConfig};
//! use cachepilot_gateway::security::SecurityEventLog;
//!
//! # async fn demo() -> cachepilot_gateway::Result<()> {
//! let executor = CommandExecutor::new(ExecutorConfig::default(), SecurityEventLog::new())?;
//! let result = executor.execute(CliCommand::Status, ["acme"]).await;
//! println!("Output: {}", result.output_trimmed());
//! # Ok(())
//! # }
//! ```

mod command;
mod executor;
mod result;

pub use command::{CliCommand, CommandInvocation, REDACTED};
pub use executor::{CommandExecutor, ExecutorConfig, DEFAULT_TIMEOUT, LOCAL_SOURCE};
pub use result::{ExecutionResult, FailureKind};
