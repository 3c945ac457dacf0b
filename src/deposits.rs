use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use eyre::Result;
use rusqlite::Connection;
use rust_decimal::Decimal;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::activation;
use crate::config::Config;
use crate::db::{self, Insert};
use crate::models::{Deposit, DepositStatus};
use crate::parser;
use crate::rpc::ChainRpc;

/// Blocks re-scanned when no start block is configured.
const DEFAULT_LOOKBACK: u64 = 2000;

/// In-memory membership index over the deposit-address table, owned by the
/// scanner task. Staleness is bounded by the refresh interval.
#[derive(Default)]
pub struct WatchedAddresses {
    map: HashMap<String, String>, // lowercase address -> owning user
    refreshed_at: Option<Instant>,
}

impl WatchedAddresses {
    pub fn refresh(&mut self, conn: &Connection) -> Result<()> {
        let mut next = HashMap::new();
        for (address, user_id) in db::watched_addresses(conn)? {
            next.insert(address.trim().to_lowercase(), user_id);
        }
        self.map = next;
        self.refreshed_at = Some(Instant::now());
        Ok(())
    }

    pub fn stale(&self, max_age: Duration) -> bool {
        match self.refreshed_at {
            None => true,
            Some(at) => at.elapsed() >= max_age,
        }
    }

    pub fn owner_of(&self, address: &str) -> Option<&str> {
        self.map.get(&address.to_lowercase()).map(String::as_str)
    }

    /// Watched set as 32-byte destination topics, for log filtering.
    fn topics(&self) -> Vec<String> {
        self.map.keys().filter_map(|a| address_topic(a)).collect()
    }
}

fn address_topic(address: &str) -> Option<String> {
    let hexpart = address.trim().trim_start_matches("0x").to_lowercase();
    if hexpart.len() != 40 || !hexpart.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("0x000000000000000000000000{hexpart}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    Credited,
    /// tx_hash already recorded: the effect was applied earlier.
    Duplicate,
    /// Audit row written but the balance increment failed. Logged and left
    /// for out-of-band reconciliation; retrying would risk a double credit.
    RecordedOnly,
}

/// Apply the ledger side of an already-recorded deposit: movement row plus
/// atomic balance increment, idempotent on the tx_hash.
pub fn credit_recorded(
    conn: &mut Connection,
    user_id: &str,
    tx_hash: &str,
    amount_str: &str,
) -> Result<CreditOutcome> {
    let amount = Decimal::from_str(amount_str)?;
    match db::insert_movement(
        conn,
        user_id,
        "deposit",
        amount,
        "deposit",
        tx_hash,
        "Deposit credited",
    )? {
        Insert::Duplicate => return Ok(CreditOutcome::Duplicate),
        Insert::Inserted => {}
    }
    match db::increment_balance(conn, user_id, amount) {
        Ok(new_balance) => {
            info!(
                "deposit credited user={} amount={} balance={} tx={}",
                user_id, amount, new_balance, tx_hash
            );
            Ok(CreditOutcome::Credited)
        }
        Err(e) => {
            error!(
                "deposit recorded but not credited (user={}, tx={}): {:?}",
                user_id, tx_hash, e
            );
            Ok(CreditOutcome::RecordedOnly)
        }
    }
}

/// Record one observed transfer and credit it. Serialized per tx_hash by the
/// store's uniqueness constraint, so concurrent or replayed ingestion is safe.
pub fn record_and_credit(conn: &mut Connection, dep: &Deposit) -> Result<CreditOutcome> {
    match db::insert_deposit(conn, dep)? {
        Insert::Duplicate => Ok(CreditOutcome::Duplicate),
        Insert::Inserted => credit_recorded(conn, &dep.user_id, &dep.tx_hash, &dep.amount),
    }
}

/// Best-effort hand-off to the purchase flow after a credit. Failures are
/// logged only; the credit itself is never rolled back.
pub fn maybe_auto_activate(conn: &mut Connection, cfg: &Config, user_id: &str) {
    if !cfg.auto_activate_enabled {
        return;
    }
    match activation::try_auto_activate(conn, cfg, user_id) {
        Ok(activation::ActivationOutcome::Activated {
            subscription_id,
            plan_id,
        }) => info!(
            "auto-activated user={} plan={} subscription={}",
            user_id, plan_id, subscription_id
        ),
        Ok(_) => {}
        Err(e) => error!("auto-activation failed (user={}): {:?}", user_id, e),
    }
}

/// Periodic chain scan. The loop is sequential, so a tick can never overlap
/// itself; a failed pass leaves the high-water mark untouched and the same
/// range is re-scanned next tick.
pub async fn run(cfg: Config, conn: Arc<Mutex<Connection>>) -> Result<()> {
    if !cfg.deposit_scan_enabled {
        info!("deposit scanner disabled by config");
        return Ok(());
    }
    let Some(token_contract) = cfg.token_contract.clone() else {
        error!("deposit scanner not running: TOKEN_CONTRACT is not configured");
        return Ok(());
    };

    let rpc = ChainRpc::new(&cfg.rpc_http_url)?;
    let mut watched = WatchedAddresses::default();
    let mut last_processed: Option<u64> = None;
    let mut decimals: Option<u32> = cfg.token_decimals_override;

    info!(
        "deposit scanner started (batch = {} blocks, topic chunk = {})",
        cfg.scan_block_batch, cfg.address_topic_chunk
    );

    loop {
        if watched.stale(cfg.wallet_refresh_interval) {
            let guard = conn.lock().unwrap();
            if let Err(e) = watched.refresh(&guard) {
                warn!("watched-address refresh failed: {:?}", e);
            }
        }

        match scan_once(
            &cfg,
            &token_contract,
            &rpc,
            &conn,
            &watched,
            &mut last_processed,
            &mut decimals,
        )
        .await
        {
            Ok(credited) => {
                for user_id in credited {
                    let mut guard = conn.lock().unwrap();
                    maybe_auto_activate(&mut guard, &cfg, &user_id);
                }
            }
            Err(e) => warn!("deposit scan failed this round: {:?}", e),
        }

        sleep(cfg.scan_interval).await;
    }
}

/// One bounded pass: [last+1, min(last+batch, head − confirmations)], chunked
/// over the watched set. Returns the users credited this pass. Any chunk
/// failure aborts the pass before the mark advances, or a deposit in the
/// failed chunk would be silently skipped.
async fn scan_once(
    cfg: &Config,
    token_contract: &str,
    rpc: &ChainRpc,
    conn: &Arc<Mutex<Connection>>,
    watched: &WatchedAddresses,
    last_processed: &mut Option<u64>,
    decimals: &mut Option<u32>,
) -> Result<Vec<String>> {
    let token_decimals = match *decimals {
        Some(d) => d,
        None => {
            let d = match rpc.token_decimals(token_contract).await {
                Ok(d) => d,
                Err(e) => {
                    warn!("decimals() read failed, assuming 18: {:?}", e);
                    18
                }
            };
            *decimals = Some(d);
            d
        }
    };

    let head = rpc.block_number().await?;
    let target = head.saturating_sub(cfg.confirmations);

    let last = match *last_processed {
        Some(block) => block,
        None => {
            let seed = cfg
                .deposit_start_block
                .unwrap_or_else(|| target.saturating_sub(DEFAULT_LOOKBACK));
            info!("seeding scan position at block {}", seed);
            *last_processed = Some(seed);
            seed
        }
    };

    if last >= target {
        return Ok(Vec::new());
    }

    let from_block = last + 1;
    let to_block = (last + cfg.scan_block_batch).min(target);

    let topics = watched.topics();
    if topics.is_empty() {
        *last_processed = Some(to_block);
        return Ok(Vec::new());
    }

    let mut credited = Vec::new();

    for chunk in topics.chunks(cfg.address_topic_chunk.max(1)) {
        let logs = rpc
            .transfer_logs(token_contract, from_block, to_block, chunk)
            .await?;

        for log in logs {
            let Some(transfer) = parser::decode_transfer(&log) else {
                continue;
            };
            let to_address = format!("{:#x}", transfer.to);
            let Some(user_id) = watched.owner_of(&to_address) else {
                continue;
            };
            let Some(amount) = parser::format_units(transfer.value, token_decimals) else {
                warn!("transfer value out of range, skipping tx={}", transfer.tx_hash);
                continue;
            };
            if amount <= Decimal::ZERO {
                continue;
            }

            let dep = Deposit {
                tx_hash: transfer.tx_hash.clone(),
                user_id: user_id.to_string(),
                to_address: to_address.clone(),
                amount: amount.to_string(),
                token: cfg.token_symbol.clone(),
                status: DepositStatus::Confirmed,
                confirmations: cfg.confirmations,
                source: "scanner".to_string(),
            };

            let mut guard = conn.lock().unwrap();
            if record_and_credit(&mut guard, &dep)? == CreditOutcome::Credited {
                credited.push(dep.user_id.clone());
            }
        }
    }

    info!(
        "scanned blocks {} -> {} ({} credits)",
        from_block,
        to_block,
        credited.len()
    );
    *last_processed = Some(to_block);
    Ok(credited)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_deposit(tx_hash: &str, amount: &str) -> Deposit {
        Deposit {
            tx_hash: tx_hash.to_string(),
            user_id: "u1".to_string(),
            to_address: "0x2222222222222222222222222222222222222222".to_string(),
            amount: amount.to_string(),
            token: "USDT".to_string(),
            status: DepositStatus::Confirmed,
            confirmations: 2,
            source: "scanner".to_string(),
        }
    }

    #[test]
    fn duplicate_events_credit_exactly_once() {
        let mut conn = db::test_conn();
        db::seed_user(&conn, "u1", "0");

        let dep = sample_deposit("0x01", "10.5");
        assert_eq!(
            record_and_credit(&mut conn, &dep).unwrap(),
            CreditOutcome::Credited
        );
        for _ in 0..3 {
            assert_eq!(
                record_and_credit(&mut conn, &dep).unwrap(),
                CreditOutcome::Duplicate
            );
        }

        let user = db::user(&conn, "u1").unwrap().unwrap();
        assert_eq!(user.balance, "10.5");
        let row = db::deposit_by_tx_hash(&conn, "0x01").unwrap().unwrap();
        assert_eq!(row.status, DepositStatus::Confirmed);
    }

    #[test]
    fn distinct_hashes_accumulate() {
        let mut conn = db::test_conn();
        db::seed_user(&conn, "u1", "0");

        record_and_credit(&mut conn, &sample_deposit("0x01", "10.5")).unwrap();
        record_and_credit(&mut conn, &sample_deposit("0x02", "2")).unwrap();

        let user = db::user(&conn, "u1").unwrap().unwrap();
        assert_eq!(user.balance, "12.5");
    }

    #[test]
    fn address_topics_are_padded_32_bytes() {
        let topic = address_topic("0x2222222222222222222222222222222222222222").unwrap();
        assert_eq!(
            topic,
            "0x0000000000000000000000002222222222222222222222222222222222222222"
        );
        assert!(address_topic("not-an-address").is_none());
    }

    #[test]
    fn watched_cache_lookup_is_case_insensitive() {
        let conn = db::test_conn();
        db::insert_deposit_address(
            &conn,
            "u1",
            "0xAbCd222222222222222222222222222222222222",
            0,
            "BEP20-USDT",
        )
        .unwrap();

        let mut watched = WatchedAddresses::default();
        assert!(watched.stale(Duration::from_secs(30)));
        watched.refresh(&conn).unwrap();
        assert!(!watched.stale(Duration::from_secs(30)));
        assert_eq!(
            watched.owner_of("0xABCD222222222222222222222222222222222222"),
            Some("u1")
        );
        assert_eq!(watched.owner_of("0x9999999999999999999999999999999999999999"), None);
    }
}
