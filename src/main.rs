mod activation;
mod api;
mod config;
mod db;
mod deposits;
mod error;
mod models;
mod parser;
mod rpc;
mod reconcile;
mod referrals;
mod wallet;
mod withdrawals;

use std::sync::{Arc, Mutex};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stdout)
        .with_target(false)
        .init();

    info!("Custody settlement service starting...");

    // Load configuration
    let cfg = config::load()?;
    info!("Loaded config:");
    info!("  RPC URL: {}", cfg.rpc_http_url);
    info!("  DB Path: {}", cfg.db_path);
    info!("  Port: {}", cfg.port);
    info!("  Confirmations: {}", cfg.confirmations);
    info!("  Token: {} ({:?})", cfg.token_symbol, cfg.token_contract);
    info!("  Deposit network: {}", cfg.deposit_network);

    // Run DB migrations once at startup
    {
        let conn = db::connect(&cfg.db_path)?;
        db::run_migrations(&conn)?;
    }

    // Shared DB connection
    let shared_conn = Arc::new(Mutex::new(db::connect(&cfg.db_path)?));

    // Spawn API task
    let api_handle = tokio::spawn({
        let cfg = cfg.clone();
        let conn = Arc::clone(&shared_conn);
        async move { api::serve(cfg, conn).await }
    });

    // Spawn deposit scanner task
    let scanner_handle = tokio::spawn({
        let cfg = cfg.clone();
        let conn = Arc::clone(&shared_conn);
        async move { deposits::run(cfg, conn).await }
    });

    // Spawn withdrawal settlement task
    let withdrawals_handle = tokio::spawn({
        let cfg = cfg.clone();
        let conn = Arc::clone(&shared_conn);
        async move { withdrawals::run(cfg, conn).await }
    });

    // Spawn reconciliation task
    let reconcile_handle = tokio::spawn({
        let cfg = cfg.clone();
        let conn = Arc::clone(&shared_conn);
        async move { reconcile::run(cfg, conn).await }
    });

    // Graceful shutdown
    tokio::select! {
        res = api_handle => match res {
            Ok(Ok(_)) => info!("API exited cleanly"),
            Ok(Err(e)) => error!("API error: {:?}", e),
            Err(e) => error!("API task panicked: {:?}", e),
        },
        res = scanner_handle => match res {
            Ok(Ok(_)) => info!("Deposit scanner exited cleanly"),
            Ok(Err(e)) => error!("Deposit scanner error: {:?}", e),
            Err(e) => error!("Deposit scanner task panicked: {:?}", e),
        },
        res = withdrawals_handle => match res {
            Ok(Ok(_)) => info!("Withdrawal worker exited cleanly"),
            Ok(Err(e)) => error!("Withdrawal worker error: {:?}", e),
            Err(e) => error!("Withdrawal worker task panicked: {:?}", e),
        },
        res = reconcile_handle => match res {
            Ok(Ok(_)) => info!("Reconciler exited cleanly"),
            Ok(Err(e)) => error!("Reconciler error: {:?}", e),
            Err(e) => error!("Reconciler task panicked: {:?}", e),
        },
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received, stopping...");
        }
    }

    info!("Custody settlement service stopped.");
    Ok(())
}
