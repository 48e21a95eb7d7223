//! Logging initialization and configuration.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

/// Filter used when neither the config nor `RUST_LOG` supply one.
pub const DEFAULT_FILTER: &str = "cachepilot_gateway=info,tower_http=info,security=info";

/// Initialize the logging system.
///
/// Uses the `RUST_LOG` environment variable for filtering. If not set,
/// defaults to [`DEFAULT_FILTER`].
///
/// # Panics
///
/// Panics if called more than once, or if another tracing subscriber
/// has already been set.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}

/// Try to initialize the logging system.
///
/// Returns `Ok(())` if successful, or `Err` if logging has already been
/// initialized.
pub fn try_init() -> Result<(), tracing_subscriber::util::TryInitError> {
    init_with(None, LogFormat::Compact)
}

/// Initialize with an explicit level or filter directive and output format.
///
/// A bare level such as `debug` is scoped to this crate and the `security`
/// event target; anything containing `=` or `,` is used as a full
/// `EnvFilter` directive.
pub fn init_with(
    level: Option<&str>,
    format: LogFormat,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = build_filter(level);
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .try_init(),
    }
}

fn build_filter(level: Option<&str>) -> EnvFilter {
    let directive = match level.map(str::trim).filter(|l| !l.is_empty()) {
        Some(l) if l.contains('=') || l.contains(',') => l.to_string(),
        Some(l) => format!("cachepilot_gateway={l},tower_http={l},security={l}"),
        None => {
            return EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
        }
    };
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}
