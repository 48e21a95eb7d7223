//! cachepilot-gateway binary entry point.

use std::process::ExitCode;

use cachepilot_gateway::cli::{self, KeysCommand};
use cachepilot_gateway::security::{check_file_permissions, CredentialStore};
use cachepilot_gateway::{api, logging, AppState, Config};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("Try 'cachepilot-gateway --help' for more information.");
            return ExitCode::from(2);
        }
    };

    if args.help {
        cli::print_help();
        return ExitCode::SUCCESS;
    }

    if args.version {
        cli::print_version();
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(command) = args.command {
        return match run_keys(&config, command) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    if let Err(e) = logging::init_with(Some(config.log_filter()), config.logging.format) {
        eprintln!("warning: logging already initialized: {}", e);
    }

    match run_server(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Gateway stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config) -> cachepilot_gateway::Result<()> {
    info!("cachepilot-gateway v{}", env!("CARGO_PKG_VERSION"));

    let server_config = config.to_server_config()?;
    let state = AppState::from_config(&config)?;

    let store = state.auth.store();
    if store.is_empty() {
        warn!(
            "No API keys loaded from {}; every authenticated request will be rejected",
            store.path().display()
        );
    } else {
        info!("Loaded {} API keys", store.len());
    }

    if config.environment.debug {
        warn!("Debug mode enabled: internal error detail is returned to callers");
    }
    if !config.security.address_rate_limit.enabled || !config.security.key_rate_limit.enabled {
        warn!("Rate limiting is partially or fully disabled");
    }

    api::serve(server_config, state).await
}

fn run_keys(config: &Config, command: KeysCommand) -> cachepilot_gateway::Result<()> {
    let path = &config.security.api_key_file;
    let store = CredentialStore::open(path, config.key_cache_ttl());

    match command {
        KeysCommand::Issue { name, permissions } => {
            let key = store.issue(&name, &permissions)?;
            println!("Issued key '{}'. Store it now, it will not be shown again:", name);
            println!("{}", key);
        }
        KeysCommand::Revoke { key } => {
            if store.revoke(&key)? {
                println!("Key revoked");
            } else {
                println!("No matching key");
            }
        }
        KeysCommand::List => {
            let records = store.list()?;
            if records.is_empty() {
                println!("No keys in {}", path.display());
            }
            for record in records {
                println!(
                    "{:<24} {:<40} created={} last_used={} requests={}",
                    record.name,
                    record.permissions.join(","),
                    format_timestamp(Some(record.created)),
                    format_timestamp(record.last_used),
                    record.request_count,
                );
            }
        }
    }

    if path.exists() && !check_file_permissions(path) {
        eprintln!(
            "warning: {} is readable by group or others; run chmod 600",
            path.display()
        );
    }
    Ok(())
}

fn format_timestamp(ts: Option<f64>) -> String {
    ts.and_then(|t| chrono::DateTime::from_timestamp(t as i64, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string())
}
