//! authstore-sql - Main entry point.
//!
//! Registers the configured tenants, bootstraps their connection pools
//! (waiting out databases that are still starting), probes each one through
//! the transaction executor and then serves until SIGINT or SIGTERM.

use authstore_sql::config::Config;
use authstore_sql::error::DbError;
use authstore_sql::storage::StorageLayer;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

fn print_usage() {
    eprintln!("Error: At least one tenant must be configured.");
    eprintln!();
    eprintln!("Usage: authstore-sql --tenant <connection_string>");
    eprintln!("       authstore-sql --tenant <id>=<connection_string>");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  authstore-sql --tenant sqlite:auth.db");
    eprintln!("  authstore-sql --tenant acme=postgres://auth:pw@localhost/auth?schema=acme");
    eprintln!("  authstore-sql --tenant t1=mysql://auth:pw@localhost/auth?table_prefix=t1_");
    eprintln!(
        "  authstore-sql --tenant a=sqlite:auth.db --tenant b=sqlite:auth.db?bootstrap_max_wait_ms=60000"
    );
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    if config.tenants.is_empty() {
        print_usage();
        std::process::exit(1);
    }

    info!("Starting authstore-sql v{}", env!("CARGO_PKG_VERSION"));

    let tenants = config.parse_tenants()?;
    let storage = StorageLayer::new();
    for tenant in &tenants {
        storage
            .register_tenant(&tenant.id, tenant.storage.clone())
            .await?;
    }

    // A signal at any point, including mid-bootstrap, cancels the shared token
    let shutdown = storage.shutdown_token();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received (send again to force exit)");
        shutdown.cancel();

        wait_for_signal().await;
        warn!("Received second signal, forcing immediate exit");
        std::process::exit(1);
    });

    for tenant in &tenants {
        match storage.bootstrap_tenant(&tenant.id).await {
            Ok(_) => info!(tenant_id = %tenant.id, "Storage ready"),
            Err(DbError::ShutdownRequested) => {
                warn!("Shutdown requested during startup");
                storage.shutdown().await;
                return Ok(());
            }
            Err(e) => {
                error!(tenant_id = %tenant.id, error = %e, "Storage bootstrap failed");
                if let Some(suggestion) = e.suggestion() {
                    error!(suggestion = %suggestion, "Suggestion");
                }
                storage.shutdown().await;
                std::process::exit(1);
            }
        }

        if config.skip_probe {
            continue;
        }
        let executor = storage.executor(&tenant.id).await?;
        let probe = executor
            .run_serializable(|session| Box::pin(async move { session.execute("SELECT 1").await }))
            .await;
        match probe {
            Ok(_) => info!(tenant_id = %tenant.id, "Probe succeeded"),
            Err(e) => warn!(tenant_id = %tenant.id, error = %e, "Probe failed"),
        }
    }

    info!(tenants = storage.tenant_count().await, "Storage layer running");
    storage.shutdown_token().cancelled().await;

    storage.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
