use axum::{
    extract::Query,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    net::SocketAddr,
    str::FromStr,
    sync::{Arc, Mutex},
};
use tokio::task;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::db;
use crate::deposits;
use crate::error::Error;
use crate::models::{Deposit, DepositStatus};
use crate::referrals;
use crate::rpc::ChainRpc;
use crate::wallet;
use crate::withdrawals;

#[derive(Deserialize)]
pub struct WalletCreateBody {
    pub user_id: String,
}

#[derive(Deserialize)]
pub struct DepositWebhookBody {
    pub tx_hash: String,
    pub amount: String,
    /// Derivation-index tag identifying the receiving wallet.
    pub tag: String,
    pub address: Option<String>,
}

#[derive(Deserialize)]
pub struct WithdrawalCreateBody {
    pub user_id: String,
    pub amount: String,
    pub network: String,
    pub address: String,
}

#[derive(Deserialize)]
pub struct ActiveQuery {
    pub user_id: String,
}

type ApiResponse = (StatusCode, Json<Value>);

fn bad_request(msg: &str) -> ApiResponse {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg })))
}

fn internal_error() -> ApiResponse {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
}

fn error_response(e: Error) -> ApiResponse {
    if e.is_validation() {
        bad_request(&e.to_string())
    } else {
        error!("request failed: {:?}", e);
        internal_error()
    }
}

pub async fn serve(cfg: Config, conn: Arc<Mutex<Connection>>) -> eyre::Result<()> {
    let rpc = Arc::new(ChainRpc::new(&cfg.rpc_http_url)?);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(|| async { "Custody settlement API running" }))
        .route(
            "/wallets",
            post({
                let cfg = cfg.clone();
                let conn = Arc::clone(&conn);
                move |Json(body): Json<WalletCreateBody>| {
                    let cfg = cfg.clone();
                    let conn = Arc::clone(&conn);
                    async move { create_wallet(cfg, conn, body).await }
                }
            }),
        )
        .route(
            "/webhooks/deposit",
            post({
                let cfg = cfg.clone();
                let conn = Arc::clone(&conn);
                let rpc = Arc::clone(&rpc);
                move |Json(body): Json<DepositWebhookBody>| {
                    let cfg = cfg.clone();
                    let conn = Arc::clone(&conn);
                    let rpc = Arc::clone(&rpc);
                    async move { deposit_webhook(cfg, rpc, conn, body).await }
                }
            }),
        )
        .route(
            "/withdrawals",
            post({
                let cfg = cfg.clone();
                let conn = Arc::clone(&conn);
                move |Json(body): Json<WithdrawalCreateBody>| {
                    let cfg = cfg.clone();
                    let conn = Arc::clone(&conn);
                    async move { create_withdrawal(cfg, conn, body).await }
                }
            }),
        )
        .route(
            "/withdrawals/active",
            get({
                let conn = Arc::clone(&conn);
                move |q: Query<ActiveQuery>| {
                    let conn = Arc::clone(&conn);
                    async move { active_withdrawal(conn, q.0).await }
                }
            }),
        )
        .layer(cors);

    let addr = SocketAddr::from(([127, 0, 0, 1], cfg.port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

// ---------- handlers ----------

async fn create_wallet(
    cfg: Config,
    conn: Arc<Mutex<Connection>>,
    body: WalletCreateBody,
) -> ApiResponse {
    let Some(xpub) = cfg.xpub.clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "deposit address derivation is not configured" })),
        );
    };
    let user_id = body.user_id.trim().to_string();
    if user_id.is_empty() {
        return bad_request("missing user_id");
    }

    let result = task::spawn_blocking(move || {
        let guard = conn.lock().unwrap();
        referrals::register_user(&guard, &user_id)?;
        wallet::create_deposit_address(&guard, &xpub, &user_id, &cfg.deposit_network)
    })
    .await;

    match result {
        Ok(Ok(wallet_row)) => (StatusCode::OK, Json(json!({ "ok": true, "wallet": wallet_row }))),
        Ok(Err(e)) => error_response(e),
        Err(e) => {
            error!("wallet creation task panicked: {:?}", e);
            internal_error()
        }
    }
}

/// Out-of-band observed transaction. Same idempotency contract as the
/// scanner: a duplicate tx_hash reports `duplicated` and mutates nothing.
async fn deposit_webhook(
    cfg: Config,
    rpc: Arc<ChainRpc>,
    conn: Arc<Mutex<Connection>>,
    body: DepositWebhookBody,
) -> ApiResponse {
    let tx_hash = body.tx_hash.trim().to_string();
    if tx_hash.is_empty() {
        return bad_request("missing tx_hash");
    }
    let Ok(index) = body.tag.trim().parse::<u32>() else {
        return bad_request("invalid tag");
    };
    let amount = match Decimal::from_str(body.amount.trim()) {
        Ok(a) if a > Decimal::ZERO => a,
        _ => return bad_request("invalid amount"),
    };

    // resolve the wallet and short-circuit duplicates before touching the chain
    let lookup = {
        let conn = Arc::clone(&conn);
        let tx_hash = tx_hash.clone();
        task::spawn_blocking(
            move || -> eyre::Result<(Option<crate::models::DepositAddress>, Option<Deposit>)> {
                let guard = conn.lock().unwrap();
                let wallet_row = db::deposit_address_by_index(&guard, index)?;
                let existing = db::deposit_by_tx_hash(&guard, &tx_hash)?;
                Ok((wallet_row, existing))
            },
        )
        .await
    };
    let (wallet_row, existing) = match lookup {
        Ok(Ok(pair)) => pair,
        _ => return internal_error(),
    };
    let Some(wallet_row) = wallet_row else {
        return bad_request("unknown tag");
    };
    if let Some(addr) = body.address.as_deref() {
        if !addr.trim().eq_ignore_ascii_case(&wallet_row.address) {
            return bad_request("address does not match the tagged wallet");
        }
    }
    if existing.is_some() {
        return (StatusCode::OK, Json(json!({ "ok": true, "duplicated": true })));
    }

    // finality probe: below depth (or chain unreachable) the deposit is
    // recorded pending and the reconciler finishes the job
    let mut confirmed = false;
    let mut confirmations = 0u64;
    if let (Ok(head), Ok(Some(receipt))) = (
        rpc.block_number().await,
        rpc.transaction_receipt(&tx_hash).await,
    ) {
        if let Some(block) = receipt.block_number() {
            if !receipt.succeeded() {
                return bad_request("transaction reverted on-chain");
            }
            confirmations = head.saturating_sub(block) + 1;
            confirmed = confirmations >= cfg.confirmations;
        }
    }

    let dep = Deposit {
        tx_hash: tx_hash.clone(),
        user_id: wallet_row.user_id.clone(),
        to_address: wallet_row.address.clone(),
        amount: amount.normalize().to_string(),
        token: cfg.token_symbol.clone(),
        status: if confirmed {
            DepositStatus::Confirmed
        } else {
            DepositStatus::Pending
        },
        confirmations,
        source: "webhook".to_string(),
    };

    let result = task::spawn_blocking(move || -> eyre::Result<deposits::CreditOutcome> {
        let mut guard = conn.lock().unwrap();
        if confirmed {
            let outcome = deposits::record_and_credit(&mut guard, &dep)?;
            if outcome == deposits::CreditOutcome::Credited {
                deposits::maybe_auto_activate(&mut guard, &cfg, &dep.user_id);
            }
            Ok(outcome)
        } else {
            match db::insert_deposit(&guard, &dep)? {
                db::Insert::Duplicate => Ok(deposits::CreditOutcome::Duplicate),
                db::Insert::Inserted => Ok(deposits::CreditOutcome::RecordedOnly),
            }
        }
    })
    .await;

    match result {
        Ok(Ok(deposits::CreditOutcome::Duplicate)) => {
            (StatusCode::OK, Json(json!({ "ok": true, "duplicated": true })))
        }
        Ok(Ok(outcome)) => (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "duplicated": false,
                "credited": outcome == deposits::CreditOutcome::Credited,
                "status": if confirmed { "confirmed" } else { "pending" },
            })),
        ),
        Ok(Err(e)) => {
            error!("webhook deposit failed (tx={}): {:?}", tx_hash, e);
            internal_error()
        }
        Err(e) => {
            error!("webhook task panicked: {:?}", e);
            internal_error()
        }
    }
}

async fn create_withdrawal(
    cfg: Config,
    conn: Arc<Mutex<Connection>>,
    body: WithdrawalCreateBody,
) -> ApiResponse {
    let result = task::spawn_blocking(move || {
        let mut guard = conn.lock().unwrap();
        withdrawals::create_request(
            &mut guard,
            &cfg,
            body.user_id.trim(),
            body.amount.trim(),
            &body.network,
            &body.address,
        )
    })
    .await;

    match result {
        Ok(Ok(w)) => (StatusCode::OK, Json(json!({ "ok": true, "withdrawal": w }))),
        Ok(Err(e)) => error_response(e),
        Err(e) => {
            error!("withdrawal creation task panicked: {:?}", e);
            internal_error()
        }
    }
}

/// The accessor the validation collaborator uses to reject a second
/// concurrent request.
async fn active_withdrawal(conn: Arc<Mutex<Connection>>, q: ActiveQuery) -> ApiResponse {
    let result = task::spawn_blocking(move || {
        let guard = conn.lock().unwrap();
        db::active_withdrawal(&guard, q.user_id.trim())
    })
    .await;

    match result {
        Ok(Ok(w)) => (StatusCode::OK, Json(json!({ "withdrawal": w }))),
        _ => internal_error(),
    }
}
