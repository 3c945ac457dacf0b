use std::sync::{Arc, Mutex};

use eyre::Result;
use rusqlite::Connection;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::deposits;
use crate::models::Deposit;
use crate::rpc::{ChainRpc, Receipt};
use crate::withdrawals;

const WITHDRAWAL_BATCH: u32 = 10;
const DEPOSIT_BATCH: u32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finality {
    /// Not yet included, or below the required confirmation depth.
    Wait,
    Confirmed,
    Reverted,
}

/// Depth-gated finality decision shared by both reconciliation passes. Raw
/// JSON-RPC receipts carry no confirmation count, so it is derived from the
/// head block.
fn judge(receipt: Option<&Receipt>, head: u64, required: u64) -> Finality {
    let Some(receipt) = receipt else {
        return Finality::Wait;
    };
    let Some(block) = receipt.block_number() else {
        return Finality::Wait;
    };
    let confirmations = head.saturating_sub(block) + 1;
    if confirmations < required {
        return Finality::Wait;
    }
    if receipt.succeeded() {
        Finality::Confirmed
    } else {
        Finality::Reverted
    }
}

/// Runs independently of the broadcast step: a request may be broadcast in
/// one tick and reconciled minutes later.
pub async fn run(cfg: Config, conn: Arc<Mutex<Connection>>) -> Result<()> {
    let rpc = ChainRpc::new(&cfg.rpc_http_url)?;
    info!("reconciler started");

    loop {
        if let Err(e) = settle(&cfg, &rpc, &conn).await {
            warn!("reconcile pass failed: {:?}", e);
        }
        sleep(cfg.reconcile_interval).await;
    }
}

async fn settle(cfg: &Config, rpc: &ChainRpc, conn: &Arc<Mutex<Connection>>) -> Result<()> {
    let head = rpc.block_number().await?;
    settle_withdrawals(cfg, rpc, conn, head).await?;
    settle_pending_deposits(cfg, rpc, conn, head).await?;
    Ok(())
}

async fn settle_withdrawals(
    cfg: &Config,
    rpc: &ChainRpc,
    conn: &Arc<Mutex<Connection>>,
    head: u64,
) -> Result<()> {
    let in_flight = {
        let guard = conn.lock().unwrap();
        db::broadcast_withdrawals(&guard, WITHDRAWAL_BATCH)?
    };

    for withdrawal in in_flight {
        let Some(tx_hash) = withdrawal.tx_hash.clone() else {
            continue;
        };
        let receipt = match rpc.transaction_receipt(&tx_hash).await {
            Ok(r) => r,
            Err(e) => {
                warn!("receipt fetch failed for withdrawal {}: {:?}", withdrawal.id, e);
                continue;
            }
        };

        match judge(receipt.as_ref(), head, cfg.confirmations) {
            Finality::Wait => {}
            Finality::Confirmed => {
                let guard = conn.lock().unwrap();
                if db::mark_withdrawal_confirmed(&guard, withdrawal.id)? {
                    info!("withdrawal {} confirmed ({})", withdrawal.id, tx_hash);
                }
            }
            Finality::Reverted => {
                let mut guard = conn.lock().unwrap();
                if withdrawals::fail_and_refund(&mut guard, &withdrawal)? {
                    info!("withdrawal {} reverted on-chain ({})", withdrawal.id, tx_hash);
                }
            }
        }
    }

    Ok(())
}

/// Webhook-observed transactions below depth sit as pending rows; finalize or
/// revert them here through the same idempotent credit path as the scanner.
async fn settle_pending_deposits(
    cfg: &Config,
    rpc: &ChainRpc,
    conn: &Arc<Mutex<Connection>>,
    head: u64,
) -> Result<()> {
    let pending = {
        let guard = conn.lock().unwrap();
        db::pending_deposits(&guard, DEPOSIT_BATCH)?
    };

    for dep in pending {
        let receipt = match rpc.transaction_receipt(&dep.tx_hash).await {
            Ok(r) => r,
            Err(e) => {
                warn!("receipt fetch failed for deposit {}: {:?}", dep.tx_hash, e);
                continue;
            }
        };

        match judge(receipt.as_ref(), head, cfg.confirmations) {
            Finality::Wait => {}
            Finality::Confirmed => {
                let mut guard = conn.lock().unwrap();
                finalize_deposit(&mut guard, cfg, &dep)?;
            }
            Finality::Reverted => {
                let guard = conn.lock().unwrap();
                if db::fail_deposit(&guard, &dep.tx_hash)? {
                    warn!("deposit {} reverted on-chain, never credited", dep.tx_hash);
                }
            }
        }
    }

    Ok(())
}

fn finalize_deposit(conn: &mut Connection, cfg: &Config, dep: &Deposit) -> Result<()> {
    // the pending -> confirmed transition gates the credit, and the movement
    // uniqueness underneath makes even a raced credit single-shot
    if db::confirm_deposit(conn, &dep.tx_hash, cfg.confirmations)? {
        deposits::credit_recorded(conn, &dep.user_id, &dep.tx_hash, &dep.amount)?;
        deposits::maybe_auto_activate(conn, cfg, &dep.user_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::models::DepositStatus;

    fn receipt(status: &str, block: u64) -> Receipt {
        Receipt {
            status: Some(status.to_string()),
            block_number_hex: Some(format!("0x{block:x}")),
        }
    }

    #[test]
    fn no_receipt_means_wait() {
        assert_eq!(judge(None, 100, 2), Finality::Wait);
    }

    #[test]
    fn below_depth_never_confirms() {
        // included at head: 1 confirmation, 2 required
        let r = receipt("0x1", 100);
        assert_eq!(judge(Some(&r), 100, 2), Finality::Wait);
        // at depth it flips
        assert_eq!(judge(Some(&r), 101, 2), Finality::Confirmed);
    }

    #[test]
    fn reverted_at_depth_fails() {
        let r = receipt("0x0", 100);
        assert_eq!(judge(Some(&r), 100, 2), Finality::Wait);
        assert_eq!(judge(Some(&r), 105, 2), Finality::Reverted);
    }

    #[test]
    fn pending_deposit_finalization_credits_once() {
        let mut conn = db::test_conn();
        let cfg = config::test_config();
        db::seed_user(&conn, "u1", "0");

        let dep = Deposit {
            tx_hash: "0x01".to_string(),
            user_id: "u1".to_string(),
            to_address: "0xabc".to_string(),
            amount: "10.5".to_string(),
            token: "USDT".to_string(),
            status: DepositStatus::Pending,
            confirmations: 0,
            source: "webhook".to_string(),
        };
        db::insert_deposit(&conn, &dep).unwrap();

        finalize_deposit(&mut conn, &cfg, &dep).unwrap();
        finalize_deposit(&mut conn, &cfg, &dep).unwrap(); // replayed poll

        assert_eq!(db::user(&conn, "u1").unwrap().unwrap().balance, "10.5");
        let row = db::deposit_by_tx_hash(&conn, "0x01").unwrap().unwrap();
        assert_eq!(row.status, DepositStatus::Confirmed);
    }

    #[test]
    fn reverted_pending_deposit_is_never_credited() {
        let conn = db::test_conn();
        db::seed_user(&conn, "u1", "0");

        let dep = Deposit {
            tx_hash: "0x02".to_string(),
            user_id: "u1".to_string(),
            to_address: "0xabc".to_string(),
            amount: "3".to_string(),
            token: "USDT".to_string(),
            status: DepositStatus::Pending,
            confirmations: 0,
            source: "webhook".to_string(),
        };
        db::insert_deposit(&conn, &dep).unwrap();

        assert!(db::fail_deposit(&conn, "0x02").unwrap());
        assert!(!db::fail_deposit(&conn, "0x02").unwrap());
        assert_eq!(db::user(&conn, "u1").unwrap().unwrap().balance, "0");
    }
}
