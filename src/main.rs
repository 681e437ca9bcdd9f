// =============================================================================
// Meridian Trade Engine — Main Entry Point
// =============================================================================
//
// A single long-running process: `run` starts the HTTP control plane and
// the supervisor; `check` validates the config and vault and exits.
//
// Exit codes: 0 normal shutdown, 64 bad CLI args (clap), 65 invalid
// config, 70 unrecoverable internal error, 77 authentication failed during
// check.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod activity;
mod api;
mod app_state;
mod bars;
mod broker;
mod catalog;
mod config;
mod indicators;
mod risk;
mod session;
mod strategy;
mod supervisor;
mod types;
mod vault;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::activity::ActivityLog;
use crate::app_state::AppState;

const EXIT_OK: u8 = 0;
const EXIT_USAGE: u8 = 64;
const EXIT_CONFIG: u8 = 65;
const EXIT_INTERNAL: u8 = 70;
const EXIT_AUTH: u8 = 77;

#[derive(Parser)]
#[command(name = "meridian-bot", about = "Automated trading engine for Indian markets")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Start the HTTP server and supervisor control plane.
    Run,
    /// Validate config and vault, print a status report, exit 0/1.
    Check,
}

struct Environment {
    host: String,
    port: u16,
    data_dir: PathBuf,
    master_key: Option<String>,
}

impl Environment {
    fn from_env() -> Self {
        Self {
            host: std::env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("APP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            data_dir: std::env::var("APP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
            master_key: std::env::var("APP_MASTER_KEY").ok().filter(|k| !k.is_empty()),
        }
    }
}

fn init_tracing() {
    // APP_LOG_LEVEL wins, then RUST_LOG, then info.
    let filter = match std::env::var("APP_LOG_LEVEL") {
        Ok(level) => EnvFilter::new(level),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version are not errors.
            if e.use_stderr() {
                let _ = e.print();
                return ExitCode::from(EXIT_USAGE);
            }
            let _ = e.print();
            return ExitCode::from(EXIT_OK);
        }
    };
    init_tracing();

    let env = Environment::from_env();
    match cli.command {
        CliCommand::Run => run(env).await,
        CliCommand::Check => check(env),
    }
}

// =============================================================================
// run
// =============================================================================

async fn run(env: Environment) -> ExitCode {
    info!(
        data_dir = %env.data_dir.display(),
        "meridian trade engine starting"
    );

    // ── Shared state ─────────────────────────────────────────────────────
    let activity = Arc::new(ActivityLog::default());
    let supervisor = supervisor::spawn(activity.clone());
    let state = match AppState::new(
        &env.data_dir,
        env.master_key.as_deref(),
        supervisor,
        activity,
    ) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!(error = %e, "failed to initialise application state");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };

    // ── Background refreshers ────────────────────────────────────────────
    // Instrument catalog: hourly, when a broker is connected.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3_600));
            interval.tick().await; // skip the immediate first tick
            loop {
                interval.tick().await;
                let Some((kind, adapter)) = state.current_broker() else {
                    continue;
                };
                if !state.catalog.is_stale(3_600) {
                    continue;
                }
                match adapter.instruments().await {
                    Ok(instruments) => {
                        if let Err(e) = state.catalog.replace(kind.as_str(), instruments) {
                            warn!(error = %e, "periodic catalog refresh failed to persist");
                        }
                    }
                    Err(e) => warn!(error = %e, "periodic catalog refresh failed"),
                }
            }
        });
    }

    // Broker token lifecycle: OAuth access tokens die daily; surface the
    // expiry as a warning activity the moment it is observed.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut was_connected = false;
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let Some((kind, adapter)) = state.current_broker() else {
                    was_connected = false;
                    continue;
                };
                let connected = adapter.is_connected();
                if was_connected && !connected && kind.uses_oauth() {
                    warn!(broker = %kind, "broker access token expired");
                    state.activity.push(crate::activity::Activity::warning(format!(
                        "{kind} access token expired; re-authentication required"
                    )));
                }
                was_connected = connected;
            }
        });
    }

    // Session and rate-limit housekeeping.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                interval.tick().await;
                let purged = state.sessions.purge_expired();
                if purged > 0 {
                    info!(purged, "expired sessions purged");
                }
                state.http_limiter.cleanup();
            }
        });
    }

    // ── HTTP server ──────────────────────────────────────────────────────
    let bind_addr = format!("{}:{}", env.host, env.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "failed to bind http listener");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };
    info!(addr = %bind_addr, "control plane listening");

    let app = api::router(state.clone())
        .into_make_service_with_connect_info::<std::net::SocketAddr>();

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "http server failed");
        }
    });

    // ── Graceful shutdown ────────────────────────────────────────────────
    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to listen for shutdown signal");
        return ExitCode::from(EXIT_INTERNAL);
    }
    warn!("shutdown signal received, stopping");

    if let Err(e) = state.supervisor.stop().await {
        warn!(error = %e, "supervisor stop on shutdown failed");
    }
    if let Err(e) = state.disconnect_current().await {
        warn!(error = %e, "broker disconnect on shutdown failed");
    }
    server.abort();

    info!("meridian trade engine shut down");
    ExitCode::from(EXIT_OK)
}

// =============================================================================
// check
// =============================================================================

fn check(env: Environment) -> ExitCode {
    println!("meridian-bot configuration check");
    println!("  data dir: {}", env.data_dir.display());

    // ── Config ───────────────────────────────────────────────────────────
    let config_store = match config::ConfigStore::new(&env.data_dir) {
        Ok(store) => store,
        Err(e) => {
            println!("  config:   ERROR ({e})");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };

    match config_store.load_current() {
        Ok(Some(config)) => {
            let violations = config.validate();
            if violations.is_empty() {
                println!(
                    "  config:   ok ({} instruments, strategy {}, timeframe {})",
                    config.instruments.len(),
                    config.strategy,
                    config.timeframe
                );
            } else {
                println!("  config:   INVALID");
                for violation in &violations {
                    println!("            - {}: {}", violation.field, violation.message);
                }
                return ExitCode::from(EXIT_CONFIG);
            }
        }
        Ok(None) => println!("  config:   none saved yet (defaults will apply)"),
        Err(e) => {
            println!("  config:   UNPARSEABLE ({e})");
            return ExitCode::from(EXIT_CONFIG);
        }
    }

    // ── Vault ────────────────────────────────────────────────────────────
    match env.master_key.as_deref() {
        None => println!("  vault:    skipped (APP_MASTER_KEY not set)"),
        Some(key) => match vault::CredentialVault::open(&env.data_dir, key) {
            Ok(vault) => match vault.list() {
                Ok(brokers) => {
                    println!("  vault:    ok ({} credential(s))", brokers.len());
                    for broker in brokers {
                        match vault.load(&broker) {
                            Ok(credential) => println!(
                                "            - {broker}: decrypts ok (access token: {})",
                                credential.access_token.is_some()
                            ),
                            Err(vault::VaultError::DecryptFailed(_)) => {
                                println!("            - {broker}: DECRYPT FAILED (wrong master key?)");
                                return ExitCode::from(EXIT_AUTH);
                            }
                            Err(e) => {
                                println!("            - {broker}: ERROR ({e})");
                                return ExitCode::from(EXIT_INTERNAL);
                            }
                        }
                    }
                }
                Err(e) => {
                    println!("  vault:    ERROR ({e})");
                    return ExitCode::from(EXIT_INTERNAL);
                }
            },
            Err(e) => {
                println!("  vault:    ERROR ({e})");
                return ExitCode::from(EXIT_INTERNAL);
            }
        },
    }

    println!("  all checks passed");
    ExitCode::from(EXIT_OK)
}
