use std::str::FromStr;
use std::sync::{Arc, Mutex};

use alloy::consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy::eips::eip2718::Encodable2718;
use alloy::primitives::{Address, TxKind, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use eyre::{eyre, Result};
use rusqlite::Connection;
use rust_decimal::Decimal;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{self, Insert};
use crate::error::{self, Error};
use crate::models::{Withdrawal, WithdrawalStatus};
use crate::parser;
use crate::rpc::ChainRpc;
use crate::wallet;

/// ERC-20 transfers fit comfortably; anything unspent is returned.
const GAS_LIMIT: u64 = 100_000;

/// The network the settlement worker can pay out on its own. Requests on
/// other supported networks stay queued for manual processing.
const AUTOMATED_NETWORK: &str = "BEP20-USDT";

/// Static per-network fee table.
pub fn network_fee(network: &str) -> Option<Decimal> {
    match network.trim().to_uppercase().as_str() {
        "BEP20-USDT" => Some(Decimal::ONE),
        "TRC20-USDT" => Some(Decimal::ONE),
        "ETH-USDT" => Some(Decimal::from(8)),
        "POLYGON-USDT" => Some(Decimal::new(5, 1)), // 0.5
        _ => None,
    }
}

fn is_base58_char(c: char) -> bool {
    c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l')
}

/// Per-family format check. EVM addresses are normalized to lowercase hex.
pub fn validate_address(network: &str, address: &str) -> error::Result<String> {
    let net = network.trim().to_uppercase();
    let addr = address.trim();
    if addr.is_empty() {
        return Err(Error::InvalidAddress);
    }

    if net.contains("TRC20") {
        let ok = addr.len() == 34 && addr.starts_with('T') && addr.chars().all(is_base58_char);
        return if ok {
            Ok(addr.to_string())
        } else {
            Err(Error::InvalidAddress)
        };
    }

    let hexpart = addr
        .strip_prefix("0x")
        .or_else(|| addr.strip_prefix("0X"))
        .ok_or(Error::InvalidAddress)?;
    if hexpart.len() == 40 && hexpart.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(format!("0x{}", hexpart.to_lowercase()))
    } else {
        Err(Error::InvalidAddress)
    }
}

/// Validate, debit the gross amount and seed the state machine. Validation
/// failures surface synchronously with nothing mutated.
pub fn create_request(
    conn: &mut Connection,
    cfg: &Config,
    user_id: &str,
    gross_str: &str,
    network: &str,
    address: &str,
) -> error::Result<Withdrawal> {
    let gross = Decimal::from_str(gross_str).map_err(|_| Error::InvalidAmount)?;
    if gross <= Decimal::ZERO {
        return Err(Error::InvalidAmount);
    }

    let fee = network_fee(network)
        .ok_or_else(|| Error::UnsupportedNetwork(network.to_string()))?;
    let address = validate_address(network, address)?;

    let net = gross - fee;
    if net <= Decimal::ZERO {
        return Err(Error::InvalidAmount);
    }
    if net < cfg.min_net_withdrawal {
        return Err(Error::BelowMinimum {
            minimum_net: cfg.min_net_withdrawal,
            fee,
        });
    }

    if db::user(conn, user_id)?.is_none() {
        return Err(Error::UnknownUser(user_id.to_string()));
    }
    // exactly one non-terminal request per user
    if db::active_withdrawal(conn, user_id)?.is_some() {
        return Err(Error::WithdrawalPending);
    }

    db::try_debit(conn, user_id, gross)?;

    let id = match db::insert_withdrawal(conn, user_id, gross, fee, net, network, &address) {
        Ok(id) => id,
        Err(e) => {
            // best-effort rollback of the debit
            if let Err(refund_err) = db::increment_balance(conn, user_id, gross) {
                error!(
                    "withdrawal insert and debit rollback both failed (user={}): {:?}",
                    user_id, refund_err
                );
            }
            return Err(e.into());
        }
    };

    if let Err(e) = db::insert_movement(
        conn,
        user_id,
        "withdrawal",
        -gross,
        "withdrawal",
        &id.to_string(),
        "Withdrawal pending",
    ) {
        error!("withdrawal movement insert failed (id={}): {:?}", id, e);
    }

    db::withdrawal(conn, id)?
        .ok_or_else(|| Error::Internal(format!("withdrawal {id} vanished after insert")))
}

/// Transition to failed (conditioned on non-terminal) and refund the net
/// amount once. The refund movement's uniqueness key makes repeated calls,
/// including repeated reconcile polls, single-shot.
pub fn fail_and_refund(conn: &mut Connection, withdrawal: &Withdrawal) -> Result<bool> {
    if !db::mark_withdrawal_failed(conn, withdrawal.id)? {
        return Ok(false); // already terminal
    }

    let net = Decimal::from_str(&withdrawal.net)?;
    match db::insert_movement(
        conn,
        &withdrawal.user_id,
        "withdrawal_refund",
        net,
        "withdrawal",
        &withdrawal.id.to_string(),
        "Withdrawal refunded",
    )? {
        Insert::Duplicate => {}
        Insert::Inserted => {
            if let Err(e) = db::increment_balance(conn, &withdrawal.user_id, net) {
                error!(
                    "refund recorded but not credited (user={}, withdrawal={}): {:?}",
                    withdrawal.user_id, withdrawal.id, e
                );
            } else {
                info!(
                    "withdrawal {} refunded {} to user={}",
                    withdrawal.id, net, withdrawal.user_id
                );
            }
        }
    }
    Ok(true)
}

/// Settlement worker: claims at most one request per tick and executes it.
/// Missing signing material disables this task only; the rest of the process
/// keeps serving.
pub async fn run(cfg: Config, conn: Arc<Mutex<Connection>>) -> Result<()> {
    let Some(mnemonic) = cfg.mnemonic.clone() else {
        error!("withdrawal worker not running: MNEMONIC is not configured");
        return Ok(());
    };
    let Some(token_contract) = cfg.token_contract.clone() else {
        error!("withdrawal worker not running: TOKEN_CONTRACT is not configured");
        return Ok(());
    };

    let rpc = ChainRpc::new(&cfg.rpc_http_url)?;
    let mut decimals = cfg.token_decimals_override;

    info!("withdrawal worker started");

    loop {
        if let Err(e) = tick(&cfg, &rpc, &conn, &mnemonic, &token_contract, &mut decimals).await {
            warn!("withdrawal tick failed: {:?}", e);
        }
        sleep(cfg.withdraw_interval).await;
    }
}

async fn tick(
    cfg: &Config,
    rpc: &ChainRpc,
    conn: &Arc<Mutex<Connection>>,
    mnemonic: &str,
    token_contract: &str,
    decimals: &mut Option<u32>,
) -> Result<()> {
    let claimed = {
        let guard = conn.lock().unwrap();
        match db::next_eligible_withdrawal(&guard)? {
            None => return Ok(()),
            Some(w) => {
                if w.status == WithdrawalStatus::Pending {
                    // no-op when a concurrent worker already approved it
                    db::approve_withdrawal(&guard, w.id)?;
                }
                w
            }
        }
    };

    info!(
        "withdrawal claimed id={} user={} net={} network={}",
        claimed.id, claimed.user_id, claimed.net, claimed.network
    );

    if claimed.network.trim().to_uppercase() != AUTOMATED_NETWORK {
        info!(
            "withdrawal {} requires manual processing (network {})",
            claimed.id, claimed.network
        );
        return Ok(());
    }

    if let Err(e) = execute(cfg, rpc, conn, mnemonic, token_contract, decimals, &claimed).await {
        error!("withdrawal {} failed before broadcast: {:?}", claimed.id, e);
        let mut guard = conn.lock().unwrap();
        if let Some(current) = db::withdrawal(&guard, claimed.id)? {
            // a recorded hash means the transfer is in flight; reconciliation
            // owns it from there
            if current.status != WithdrawalStatus::Broadcast {
                fail_and_refund(&mut guard, &current)?;
            }
        }
    }

    Ok(())
}

async fn execute(
    cfg: &Config,
    rpc: &ChainRpc,
    conn: &Arc<Mutex<Connection>>,
    mnemonic: &str,
    token_contract: &str,
    decimals: &mut Option<u32>,
    withdrawal: &Withdrawal,
) -> Result<()> {
    let signer = derive_paying_signer(conn, mnemonic, cfg, withdrawal)?;
    let signer_address = format!("{:#x}", signer.address());

    let token_decimals = match *decimals {
        Some(d) => d,
        None => {
            let d = rpc.token_decimals(token_contract).await?;
            *decimals = Some(d);
            d
        }
    };

    let net = Decimal::from_str(&withdrawal.net)?;
    let units = parser::to_units(net, token_decimals)
        .ok_or_else(|| eyre!("net amount {net} does not convert at {token_decimals} decimals"))?;

    // funding check before any broadcast attempt
    let balance = rpc.token_balance(token_contract, &signer_address).await?;
    if balance < units {
        return Err(eyre!(
            "insufficient token balance in paying wallet {}: have {}, need {}",
            signer_address,
            parser::format_units(balance, token_decimals).unwrap_or_default(),
            net
        ));
    }

    let nonce = rpc.transaction_count(&signer_address).await?;
    let gas_price = rpc.gas_price().await?;

    let to = Address::from_str(&withdrawal.address)
        .map_err(|e| eyre!("stored address unparsable: {e}"))?;
    let contract = Address::from_str(token_contract)
        .map_err(|e| eyre!("token contract unparsable: {e}"))?;

    let tx = TxLegacy {
        chain_id: Some(cfg.chain_id),
        nonce,
        gas_price,
        gas_limit: GAS_LIMIT,
        to: TxKind::Call(contract),
        value: U256::ZERO,
        input: transfer_calldata(to, units).into(),
    };

    let signature = signer.sign_hash_sync(&tx.signature_hash())?;
    let signed = tx.into_signed(signature);
    let raw = TxEnvelope::Legacy(signed).encoded_2718();

    info!(
        "broadcasting withdrawal {}: {} {} -> {}",
        withdrawal.id, net, cfg.token_symbol, withdrawal.address
    );
    let tx_hash = rpc
        .send_raw_transaction(&format!("0x{}", hex::encode(raw)))
        .await?;

    // past this point the transfer is in flight: recording failures are made
    // loud but never returned, or the error path would refund a paid request
    let guard = conn.lock().unwrap();
    match db::mark_withdrawal_broadcast(&guard, withdrawal.id, &tx_hash) {
        Ok(true) => info!("withdrawal {} broadcast: {}", withdrawal.id, tx_hash),
        Ok(false) => error!(
            "withdrawal {} broadcast as {} but the row had already left approved",
            withdrawal.id, tx_hash
        ),
        Err(e) => error!(
            "withdrawal {} broadcast as {} but recording the hash failed: {:?}",
            withdrawal.id, tx_hash, e
        ),
    }
    Ok(())
}

/// Derive the signer controlling the requester's deposit wallet and check it
/// against the stored address. A mismatch signals a derivation-root
/// misconfiguration: it must be visible, but must not wedge the queue.
fn derive_paying_signer(
    conn: &Arc<Mutex<Connection>>,
    mnemonic: &str,
    cfg: &Config,
    withdrawal: &Withdrawal,
) -> Result<PrivateKeySigner> {
    let wallet_row = {
        let guard = conn.lock().unwrap();
        db::deposit_address_for_user(&guard, &withdrawal.user_id)?
    }
    .ok_or_else(|| eyre!("user {} has no deposit wallet to pay from", withdrawal.user_id))?;

    let signer = wallet::derive_signer(
        mnemonic,
        &cfg.derivation_path,
        wallet_row.derivation_index,
    )?;

    let derived = format!("{:#x}", signer.address());
    if !wallet_row.address.eq_ignore_ascii_case(&derived) {
        error!(
            "derived address does not match stored deposit address (user={}, index={}, stored={}, derived={})",
            withdrawal.user_id, wallet_row.derivation_index, wallet_row.address, derived
        );
    }

    Ok(signer)
}

fn transfer_calldata(to: Address, amount: U256) -> Vec<u8> {
    // transfer(address,uint256)
    const SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
    let mut data = Vec::with_capacity(68);
    data.extend_from_slice(&SELECTOR);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(to.as_slice());
    data.extend_from_slice(&amount.to_be_bytes::<32>());
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    const DEST: &str = "0x00000000000000000000000000000000000Dead1";

    fn setup() -> (Connection, Config) {
        let conn = db::test_conn();
        db::seed_user(&conn, "u1", "100");
        (conn, config::test_config())
    }

    #[test]
    fn fee_table_is_static_per_network() {
        assert_eq!(network_fee("BEP20-USDT"), Some(Decimal::ONE));
        assert_eq!(network_fee("trc20-usdt"), Some(Decimal::ONE));
        assert_eq!(network_fee("ETH-USDT"), Some(Decimal::from(8)));
        assert_eq!(network_fee("POLYGON-USDT"), Some(Decimal::new(5, 1)));
        assert_eq!(network_fee("DOGE"), None);
    }

    #[test]
    fn address_validation_per_network_family() {
        let normalized = validate_address("BEP20-USDT", DEST).unwrap();
        assert_eq!(normalized, DEST.to_lowercase());

        assert!(matches!(
            validate_address("BEP20-USDT", "0x1234"),
            Err(Error::InvalidAddress)
        ));
        assert!(validate_address("TRC20-USDT", "TJRabPrwbZy45sbavfcjinPJC18kjpRTv8").is_ok());
        assert!(matches!(
            validate_address("TRC20-USDT", "0x00000000000000000000000000000000000Dead1"),
            Err(Error::InvalidAddress)
        ));
    }

    #[test]
    fn net_is_gross_minus_fee_with_minimum_boundary() {
        let (mut conn, cfg) = setup();

        // gross 11, fee 1 -> net 10: exactly the minimum
        let w = create_request(&mut conn, &cfg, "u1", "11", "BEP20-USDT", DEST).unwrap();
        assert_eq!(w.gross, "11");
        assert_eq!(w.fee, "1");
        assert_eq!(w.net, "10");
        assert_eq!(w.status, WithdrawalStatus::Pending);
        assert_eq!(db::user(&conn, "u1").unwrap().unwrap().balance, "89");
    }

    #[test]
    fn below_minimum_is_rejected_without_mutation() {
        let (mut conn, cfg) = setup();
        let err = create_request(&mut conn, &cfg, "u1", "10.99", "BEP20-USDT", DEST).unwrap_err();
        assert!(matches!(err, Error::BelowMinimum { .. }));
        assert_eq!(db::user(&conn, "u1").unwrap().unwrap().balance, "100");
        assert!(db::active_withdrawal(&conn, "u1").unwrap().is_none());
    }

    #[test]
    fn one_non_terminal_request_per_user() {
        let (mut conn, cfg) = setup();
        create_request(&mut conn, &cfg, "u1", "11", "BEP20-USDT", DEST).unwrap();
        let err = create_request(&mut conn, &cfg, "u1", "12", "BEP20-USDT", DEST).unwrap_err();
        assert!(matches!(err, Error::WithdrawalPending));
        // the single in-flight request is what the accessor reports
        assert_eq!(
            db::active_withdrawal(&conn, "u1").unwrap().unwrap().gross,
            "11"
        );
    }

    #[test]
    fn insufficient_balance_rejected_before_any_write() {
        let (mut conn, cfg) = setup();
        let err = create_request(&mut conn, &cfg, "u1", "500", "BEP20-USDT", DEST).unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));
        assert_eq!(db::user(&conn, "u1").unwrap().unwrap().balance, "100");
    }

    #[test]
    fn unsupported_network_rejected() {
        let (mut conn, cfg) = setup();
        let err = create_request(&mut conn, &cfg, "u1", "11", "SOL-USDT", DEST).unwrap_err();
        assert!(matches!(err, Error::UnsupportedNetwork(_)));
    }

    #[test]
    fn failed_broadcast_refunds_net_exactly_once() {
        let (mut conn, cfg) = setup();
        let w = create_request(&mut conn, &cfg, "u1", "11", "BEP20-USDT", DEST).unwrap();
        assert_eq!(db::user(&conn, "u1").unwrap().unwrap().balance, "89");

        db::approve_withdrawal(&conn, w.id).unwrap();
        db::mark_withdrawal_broadcast(&conn, w.id, "0xhash").unwrap();

        // revert observed: failed + single net refund
        assert!(fail_and_refund(&mut conn, &w).unwrap());
        assert_eq!(db::user(&conn, "u1").unwrap().unwrap().balance, "99");

        // repeated polls of the same reverted receipt change nothing
        assert!(!fail_and_refund(&mut conn, &w).unwrap());
        assert_eq!(db::user(&conn, "u1").unwrap().unwrap().balance, "99");

        let row = db::withdrawal(&conn, w.id).unwrap().unwrap();
        assert_eq!(row.status, WithdrawalStatus::Failed);
    }

    #[test]
    fn transfer_calldata_layout() {
        let to = Address::from_str("0x2222222222222222222222222222222222222222").unwrap();
        let data = transfer_calldata(to, U256::from(1u64));
        assert_eq!(data.len(), 68);
        assert_eq!(&data[0..4], &[0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(&data[16..36], to.as_slice());
        assert_eq!(data[67], 1);
    }
}
