use eyre::{eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error;
use crate::models::{Deposit, DepositAddress, Plan, PurchaseIntent, User, Withdrawal};

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
  id          TEXT PRIMARY KEY,
  invite_code TEXT UNIQUE,
  referred_by TEXT,
  is_active   INTEGER NOT NULL DEFAULT 1,
  balance     TEXT NOT NULL DEFAULT '0', -- Decimal stored as string
  created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS deposit_addresses (
  id               INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id          TEXT NOT NULL UNIQUE,
  address          TEXT NOT NULL UNIQUE,
  derivation_index INTEGER NOT NULL UNIQUE,
  network          TEXT NOT NULL,
  created_at       TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS deposits (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  tx_hash       TEXT NOT NULL UNIQUE,
  user_id       TEXT NOT NULL,
  to_address    TEXT NOT NULL,
  amount        TEXT NOT NULL,
  token         TEXT NOT NULL,
  status        TEXT NOT NULL CHECK (status IN ('pending','confirmed','failed')),
  confirmations INTEGER NOT NULL DEFAULT 0,
  source        TEXT NOT NULL,
  created_at    TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS movements (
  id             INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id        TEXT NOT NULL,
  kind           TEXT NOT NULL,
  amount         TEXT NOT NULL,
  reference_type TEXT,
  reference_id   TEXT,
  description    TEXT,
  created_at     TEXT NOT NULL DEFAULT (datetime('now')),
  UNIQUE(user_id, kind, reference_type, reference_id)
);

CREATE TABLE IF NOT EXISTS withdrawals (
  id           INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id      TEXT NOT NULL,
  gross        TEXT NOT NULL,
  fee          TEXT NOT NULL,
  net          TEXT NOT NULL,
  network      TEXT NOT NULL,
  address      TEXT NOT NULL,
  status       TEXT NOT NULL CHECK (status IN ('pending','approved','broadcast','confirmed','failed')),
  tx_hash      TEXT,
  created_at   TEXT NOT NULL DEFAULT (datetime('now')),
  processed_at TEXT
);

CREATE TABLE IF NOT EXISTS commissions (
  id             TEXT PRIMARY KEY, -- deterministic, content-addressed
  referrer_id    TEXT NOT NULL,
  buyer_id       TEXT NOT NULL,
  amount         TEXT NOT NULL,
  level          INTEGER NOT NULL,
  reference_type TEXT,
  reference_id   TEXT,
  created_at     TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS referral_levels (
  user_id     TEXT NOT NULL,
  ancestor_id TEXT NOT NULL,
  level       INTEGER NOT NULL,
  UNIQUE(user_id, level)
);

CREATE TABLE IF NOT EXISTS plans (
  id            INTEGER PRIMARY KEY,
  name          TEXT NOT NULL,
  price         TEXT NOT NULL,
  duration_days INTEGER NOT NULL,
  level1_pct    TEXT NOT NULL DEFAULT '15',
  level2_pct    TEXT NOT NULL DEFAULT '1',
  level3_pct    TEXT NOT NULL DEFAULT '1'
);

CREATE TABLE IF NOT EXISTS subscriptions (
  id         INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id    TEXT NOT NULL,
  plan_id    INTEGER NOT NULL,
  expires_at TEXT,
  is_active  INTEGER NOT NULL DEFAULT 1,
  created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS purchase_intents (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id         TEXT NOT NULL,
  plan_id         INTEGER NOT NULL,
  status          TEXT NOT NULL CHECK (status IN ('pending','processing','completed','failed','canceled')),
  attempts        INTEGER NOT NULL DEFAULT 0,
  last_error      TEXT,
  subscription_id INTEGER,
  created_at      TEXT NOT NULL DEFAULT (datetime('now')),
  updated_at      TEXT
);

INSERT OR IGNORE INTO plans (id, name, price, duration_days) VALUES
  (1, 'VIP 1', '30', 30),
  (2, 'VIP 2', '100', 30),
  (3, 'VIP 3', '300', 30);
"#;

/// Outcome of an insert guarded by a uniqueness constraint. A duplicate is
/// data, not an error: it means the effect was already applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Inserted,
    Duplicate,
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn insert_outcome(res: rusqlite::Result<usize>) -> Result<Insert> {
    match res {
        Ok(_) => Ok(Insert::Inserted),
        Err(e) if is_unique_violation(&e) => Ok(Insert::Duplicate),
        Err(e) => Err(e.into()),
    }
}

/// Connect to SQLite (with WAL mode for performance)
pub fn connect(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

/// Run schema migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(INIT_SQL)?;
    Ok(())
}

// ---------- users & balances ----------

pub fn insert_user(conn: &Connection, id: &str, invite_code: Option<&str>) -> Result<Insert> {
    insert_outcome(conn.execute(
        "INSERT INTO users (id, invite_code) VALUES (?1, ?2)",
        params![id, invite_code],
    ))
}

fn map_user(r: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: r.get(0)?,
        invite_code: r.get(1)?,
        referred_by: r.get(2)?,
        is_active: r.get::<_, i64>(3)? != 0,
        balance: r.get(4)?,
    })
}

pub fn user(conn: &Connection, id: &str) -> Result<Option<User>> {
    Ok(conn
        .query_row(
            "SELECT id, invite_code, referred_by, is_active, balance FROM users WHERE id = ?1",
            [id],
            map_user,
        )
        .optional()?)
}

pub fn user_by_invite_code(conn: &Connection, code: &str) -> Result<Option<User>> {
    Ok(conn
        .query_row(
            "SELECT id, invite_code, referred_by, is_active, balance
             FROM users WHERE UPPER(invite_code) = UPPER(?1)",
            [code],
            map_user,
        )
        .optional()?)
}

pub fn set_referred_by_if_null(conn: &Connection, user_id: &str, inviter: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE users SET referred_by = ?1 WHERE id = ?2 AND referred_by IS NULL",
        params![inviter, user_id],
    )?;
    Ok(n > 0)
}

pub fn set_user_active(conn: &Connection, id: &str, active: bool) -> Result<()> {
    conn.execute(
        "UPDATE users SET is_active = ?1 WHERE id = ?2",
        params![active as i64, id],
    )?;
    Ok(())
}

/// Atomic balance mutation: read, exact decimal add, write, all inside one
/// immediate transaction. Commutative across concurrent callers.
pub fn increment_balance(conn: &mut Connection, user_id: &str, delta: Decimal) -> Result<Decimal> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let balance: Option<String> = tx
        .query_row("SELECT balance FROM users WHERE id = ?1", [user_id], |r| {
            r.get(0)
        })
        .optional()?;
    let balance = balance.ok_or_else(|| eyre!("unknown user: {user_id}"))?;
    let new_balance = Decimal::from_str(&balance)? + delta;
    tx.execute(
        "UPDATE users SET balance = ?1 WHERE id = ?2",
        params![new_balance.to_string(), user_id],
    )?;
    tx.commit()?;
    Ok(new_balance)
}

/// Guarded debit: refuses to drive a balance negative.
pub fn try_debit(conn: &mut Connection, user_id: &str, amount: Decimal) -> error::Result<Decimal> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let balance: Option<String> = tx
        .query_row("SELECT balance FROM users WHERE id = ?1", [user_id], |r| {
            r.get(0)
        })
        .optional()?;
    let balance = balance.ok_or_else(|| error::Error::UnknownUser(user_id.to_string()))?;
    let available = Decimal::from_str(&balance)?;
    if available < amount {
        return Err(error::Error::InsufficientBalance {
            available,
            required: amount,
        });
    }
    let new_balance = available - amount;
    tx.execute(
        "UPDATE users SET balance = ?1 WHERE id = ?2",
        params![new_balance.to_string(), user_id],
    )?;
    tx.commit()?;
    Ok(new_balance)
}

// ---------- deposit addresses ----------

/// Next free derivation index: max previously allocated + 1, or 0.
pub fn next_derivation_index(conn: &Connection) -> Result<u32> {
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(derivation_index), -1) + 1 FROM deposit_addresses",
        [],
        |r| r.get(0),
    )?;
    Ok(next as u32)
}

pub fn insert_deposit_address(
    conn: &Connection,
    user_id: &str,
    address: &str,
    derivation_index: u32,
    network: &str,
) -> Result<Insert> {
    insert_outcome(conn.execute(
        "INSERT INTO deposit_addresses (user_id, address, derivation_index, network)
         VALUES (?1, ?2, ?3, ?4)",
        params![user_id, address, derivation_index, network],
    ))
}

fn map_deposit_address(r: &Row) -> rusqlite::Result<DepositAddress> {
    Ok(DepositAddress {
        user_id: r.get(0)?,
        address: r.get(1)?,
        derivation_index: r.get(2)?,
        network: r.get(3)?,
    })
}

pub fn deposit_address_for_user(conn: &Connection, user_id: &str) -> Result<Option<DepositAddress>> {
    Ok(conn
        .query_row(
            "SELECT user_id, address, derivation_index, network
             FROM deposit_addresses WHERE user_id = ?1",
            [user_id],
            map_deposit_address,
        )
        .optional()?)
}

pub fn deposit_address_by_index(conn: &Connection, index: u32) -> Result<Option<DepositAddress>> {
    Ok(conn
        .query_row(
            "SELECT user_id, address, derivation_index, network
             FROM deposit_addresses WHERE derivation_index = ?1",
            [index],
            map_deposit_address,
        )
        .optional()?)
}

/// Full (address, owner) listing for the watched-address cache.
pub fn watched_addresses(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare("SELECT address, user_id FROM deposit_addresses")?;
    let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

// ---------- deposits ----------

/// Keyed by tx_hash; a duplicate means the transfer was already recorded.
pub fn insert_deposit(conn: &Connection, dep: &Deposit) -> Result<Insert> {
    insert_outcome(conn.execute(
        "INSERT INTO deposits (tx_hash, user_id, to_address, amount, token, status, confirmations, source)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            dep.tx_hash,
            dep.user_id,
            dep.to_address,
            dep.amount,
            dep.token,
            dep.status,
            dep.confirmations,
            dep.source,
        ],
    ))
}

fn map_deposit(r: &Row) -> rusqlite::Result<Deposit> {
    Ok(Deposit {
        tx_hash: r.get(0)?,
        user_id: r.get(1)?,
        to_address: r.get(2)?,
        amount: r.get(3)?,
        token: r.get(4)?,
        status: r.get(5)?,
        confirmations: r.get(6)?,
        source: r.get(7)?,
    })
}

pub fn deposit_by_tx_hash(conn: &Connection, tx_hash: &str) -> Result<Option<Deposit>> {
    Ok(conn
        .query_row(
            "SELECT tx_hash, user_id, to_address, amount, token, status, confirmations, source
             FROM deposits WHERE tx_hash = ?1",
            [tx_hash],
            map_deposit,
        )
        .optional()?)
}

pub fn pending_deposits(conn: &Connection, limit: u32) -> Result<Vec<Deposit>> {
    let mut stmt = conn.prepare(
        "SELECT tx_hash, user_id, to_address, amount, token, status, confirmations, source
         FROM deposits WHERE status = 'pending' ORDER BY id ASC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit], map_deposit)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn confirm_deposit(conn: &Connection, tx_hash: &str, confirmations: u64) -> Result<bool> {
    let n = conn.execute(
        "UPDATE deposits SET status = 'confirmed', confirmations = ?1
         WHERE tx_hash = ?2 AND status = 'pending'",
        params![confirmations, tx_hash],
    )?;
    Ok(n > 0)
}

pub fn fail_deposit(conn: &Connection, tx_hash: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE deposits SET status = 'failed' WHERE tx_hash = ?1 AND status = 'pending'",
        [tx_hash],
    )?;
    Ok(n > 0)
}

// ---------- ledger movements ----------

/// Append-only trail. The uniqueness constraint over the business key is the
/// idempotency backstop for credits, refunds and commissions.
pub fn insert_movement(
    conn: &Connection,
    user_id: &str,
    kind: &str,
    amount: Decimal,
    reference_type: &str,
    reference_id: &str,
    description: &str,
) -> Result<Insert> {
    insert_outcome(conn.execute(
        "INSERT INTO movements (user_id, kind, amount, reference_type, reference_id, description)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user_id,
            kind,
            amount.to_string(),
            reference_type,
            reference_id,
            description,
        ],
    ))
}

// ---------- withdrawals ----------

pub fn insert_withdrawal(
    conn: &Connection,
    user_id: &str,
    gross: Decimal,
    fee: Decimal,
    net: Decimal,
    network: &str,
    address: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO withdrawals (user_id, gross, fee, net, network, address, status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending')",
        params![
            user_id,
            gross.to_string(),
            fee.to_string(),
            net.to_string(),
            network,
            address,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn map_withdrawal(r: &Row) -> rusqlite::Result<Withdrawal> {
    Ok(Withdrawal {
        id: r.get(0)?,
        user_id: r.get(1)?,
        gross: r.get(2)?,
        fee: r.get(3)?,
        net: r.get(4)?,
        network: r.get(5)?,
        address: r.get(6)?,
        status: r.get(7)?,
        tx_hash: r.get(8)?,
    })
}

const WITHDRAWAL_COLS: &str =
    "id, user_id, gross, fee, net, network, address, status, tx_hash";

pub fn withdrawal(conn: &Connection, id: i64) -> Result<Option<Withdrawal>> {
    Ok(conn
        .query_row(
            &format!("SELECT {WITHDRAWAL_COLS} FROM withdrawals WHERE id = ?1"),
            [id],
            map_withdrawal,
        )
        .optional()?)
}

/// The single non-terminal request for a user, if any.
pub fn active_withdrawal(conn: &Connection, user_id: &str) -> Result<Option<Withdrawal>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {WITHDRAWAL_COLS} FROM withdrawals
                 WHERE user_id = ?1 AND status IN ('pending','approved','broadcast')
                 ORDER BY id ASC LIMIT 1"
            ),
            [user_id],
            map_withdrawal,
        )
        .optional()?)
}

/// Oldest claimable request. Claiming transitions pending → approved; the
/// transition is a no-op when already approved so concurrent workers converge.
pub fn next_eligible_withdrawal(conn: &Connection) -> Result<Option<Withdrawal>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {WITHDRAWAL_COLS} FROM withdrawals
                 WHERE status IN ('pending','approved')
                 ORDER BY id ASC LIMIT 1"
            ),
            [],
            map_withdrawal,
        )
        .optional()?)
}

pub fn approve_withdrawal(conn: &Connection, id: i64) -> Result<bool> {
    let n = conn.execute(
        "UPDATE withdrawals SET status = 'approved' WHERE id = ?1 AND status = 'pending'",
        [id],
    )?;
    Ok(n > 0)
}

/// Conditioned on still being approved, so a retry cannot double-broadcast.
pub fn mark_withdrawal_broadcast(conn: &Connection, id: i64, tx_hash: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE withdrawals
         SET status = 'broadcast', tx_hash = ?1, processed_at = datetime('now')
         WHERE id = ?2 AND status = 'approved'",
        params![tx_hash, id],
    )?;
    Ok(n > 0)
}

pub fn mark_withdrawal_confirmed(conn: &Connection, id: i64) -> Result<bool> {
    let n = conn.execute(
        "UPDATE withdrawals SET status = 'confirmed'
         WHERE id = ?1 AND status IN ('approved','broadcast')",
        [id],
    )?;
    Ok(n > 0)
}

/// Never touches a terminal row; returns whether this call made the transition.
pub fn mark_withdrawal_failed(conn: &Connection, id: i64) -> Result<bool> {
    let n = conn.execute(
        "UPDATE withdrawals
         SET status = 'failed', processed_at = datetime('now')
         WHERE id = ?1 AND status NOT IN ('failed','confirmed')",
        [id],
    )?;
    Ok(n > 0)
}

pub fn broadcast_withdrawals(conn: &Connection, limit: u32) -> Result<Vec<Withdrawal>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {WITHDRAWAL_COLS} FROM withdrawals
         WHERE status = 'broadcast' AND tx_hash IS NOT NULL
         ORDER BY processed_at ASC LIMIT ?1"
    ))?;
    let rows = stmt.query_map([limit], map_withdrawal)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

// ---------- referrals & commissions ----------

pub fn insert_referral_level(
    conn: &Connection,
    user_id: &str,
    ancestor_id: &str,
    level: u8,
) -> Result<Insert> {
    insert_outcome(conn.execute(
        "INSERT INTO referral_levels (user_id, ancestor_id, level) VALUES (?1, ?2, ?3)",
        params![user_id, ancestor_id, level],
    ))
}

pub fn referral_ancestor(conn: &Connection, user_id: &str, level: u8) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT ancestor_id FROM referral_levels WHERE user_id = ?1 AND level = ?2",
            params![user_id, level],
            |r| r.get(0),
        )
        .optional()?)
}

#[allow(clippy::too_many_arguments)]
pub fn insert_commission(
    conn: &Connection,
    id: &str,
    referrer_id: &str,
    buyer_id: &str,
    amount: Decimal,
    level: u8,
    reference_type: &str,
    reference_id: &str,
) -> Result<Insert> {
    insert_outcome(conn.execute(
        "INSERT INTO commissions (id, referrer_id, buyer_id, amount, level, reference_type, reference_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            referrer_id,
            buyer_id,
            amount.to_string(),
            level,
            reference_type,
            reference_id,
        ],
    ))
}

// ---------- plans, subscriptions, purchase intents ----------

pub fn plan(conn: &Connection, id: i64) -> Result<Option<Plan>> {
    Ok(conn
        .query_row(
            "SELECT id, name, price, duration_days, level1_pct, level2_pct, level3_pct
             FROM plans WHERE id = ?1",
            [id],
            |r| {
                Ok(Plan {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    price: r.get(2)?,
                    duration_days: r.get(3)?,
                    level1_pct: r.get(4)?,
                    level2_pct: r.get(5)?,
                    level3_pct: r.get(6)?,
                })
            },
        )
        .optional()?)
}

pub fn insert_subscription(
    conn: &Connection,
    user_id: &str,
    plan_id: i64,
    expires_at: &str,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO subscriptions (user_id, plan_id, expires_at) VALUES (?1, ?2, ?3)",
        params![user_id, plan_id, expires_at],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_purchase_intent(conn: &Connection, user_id: &str, plan_id: i64) -> Result<i64> {
    conn.execute(
        "INSERT INTO purchase_intents (user_id, plan_id, status) VALUES (?1, ?2, 'pending')",
        params![user_id, plan_id],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn cancel_pending_intents(conn: &Connection, user_id: &str) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE purchase_intents
         SET status = 'canceled', updated_at = datetime('now'),
             last_error = 'replaced by a newer intent'
         WHERE user_id = ?1 AND status = 'pending'",
        [user_id],
    )?)
}

pub fn newest_pending_intent(conn: &Connection, user_id: &str) -> Result<Option<PurchaseIntent>> {
    Ok(conn
        .query_row(
            "SELECT id, user_id, plan_id, status, attempts FROM purchase_intents
             WHERE user_id = ?1 AND status = 'pending'
             ORDER BY id DESC LIMIT 1",
            [user_id],
            |r| {
                Ok(PurchaseIntent {
                    id: r.get(0)?,
                    user_id: r.get(1)?,
                    plan_id: r.get(2)?,
                    status: r.get(3)?,
                    attempts: r.get(4)?,
                })
            },
        )
        .optional()?)
}

/// Compare-and-swap claim; the loser of a concurrent race sees `false`.
pub fn lock_intent(conn: &Connection, id: i64) -> Result<bool> {
    let n = conn.execute(
        "UPDATE purchase_intents
         SET status = 'processing', attempts = attempts + 1, updated_at = datetime('now')
         WHERE id = ?1 AND status = 'pending'",
        [id],
    )?;
    Ok(n > 0)
}

pub fn complete_intent(conn: &Connection, id: i64, subscription_id: i64) -> Result<bool> {
    let n = conn.execute(
        "UPDATE purchase_intents
         SET status = 'completed', subscription_id = ?1, last_error = NULL,
             updated_at = datetime('now')
         WHERE id = ?2 AND status = 'processing'",
        params![subscription_id, id],
    )?;
    Ok(n > 0)
}

pub fn fail_intent(conn: &Connection, id: i64, error: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE purchase_intents
         SET status = 'failed', last_error = ?1, updated_at = datetime('now')
         WHERE id = ?2 AND status = 'processing'",
        params![error, id],
    )?;
    Ok(n > 0)
}

/// Insufficient balance is not final: the intent goes back to pending so a
/// later credit can pick it up.
pub fn reopen_intent(conn: &Connection, id: i64, error: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE purchase_intents
         SET status = 'pending', last_error = ?1, updated_at = datetime('now')
         WHERE id = ?2 AND status = 'processing'",
        params![error, id],
    )?;
    Ok(n > 0)
}

#[cfg(test)]
pub(crate) fn test_conn() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    run_migrations(&conn).unwrap();
    conn
}

#[cfg(test)]
pub(crate) fn seed_user(conn: &Connection, id: &str, balance: &str) {
    insert_user(conn, id, None).unwrap();
    conn.execute(
        "UPDATE users SET balance = ?1 WHERE id = ?2",
        params![balance, id],
    )
    .unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DepositStatus, WithdrawalStatus};

    fn sample_deposit(tx_hash: &str) -> Deposit {
        Deposit {
            tx_hash: tx_hash.to_string(),
            user_id: "u1".to_string(),
            to_address: "0xabc".to_string(),
            amount: "10.5".to_string(),
            token: "USDT".to_string(),
            status: DepositStatus::Confirmed,
            confirmations: 2,
            source: "scanner".to_string(),
        }
    }

    #[test]
    fn deposit_insert_is_idempotent_on_tx_hash() {
        let conn = test_conn();
        let dep = sample_deposit("0x01");
        assert_eq!(insert_deposit(&conn, &dep).unwrap(), Insert::Inserted);
        assert_eq!(insert_deposit(&conn, &dep).unwrap(), Insert::Duplicate);
        let row = deposit_by_tx_hash(&conn, "0x01").unwrap().unwrap();
        assert_eq!(row.amount, "10.5");
        assert_eq!(row.status, DepositStatus::Confirmed);
    }

    #[test]
    fn movement_uniqueness_guards_double_credit() {
        let conn = test_conn();
        seed_user(&conn, "u1", "0");
        let amount = Decimal::from_str("10.5").unwrap();
        assert_eq!(
            insert_movement(&conn, "u1", "deposit", amount, "deposit", "0x01", "credit").unwrap(),
            Insert::Inserted
        );
        assert_eq!(
            insert_movement(&conn, "u1", "deposit", amount, "deposit", "0x01", "credit").unwrap(),
            Insert::Duplicate
        );
    }

    #[test]
    fn increment_and_debit_are_exact() {
        let mut conn = test_conn();
        seed_user(&conn, "u1", "0");
        let new = increment_balance(&mut conn, "u1", Decimal::from_str("10.5").unwrap()).unwrap();
        assert_eq!(new, Decimal::from_str("10.5").unwrap());
        let new = try_debit(&mut conn, "u1", Decimal::from_str("0.5").unwrap()).unwrap();
        assert_eq!(new, Decimal::from(10));
    }

    #[test]
    fn debit_refuses_overdraft() {
        let mut conn = test_conn();
        seed_user(&conn, "u1", "5");
        let err = try_debit(&mut conn, "u1", Decimal::from(6)).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::InsufficientBalance { .. }
        ));
        // balance untouched
        assert_eq!(user(&conn, "u1").unwrap().unwrap().balance, "5");
    }

    #[test]
    fn derivation_index_monotonic_and_unique() {
        let conn = test_conn();
        assert_eq!(next_derivation_index(&conn).unwrap(), 0);
        insert_deposit_address(&conn, "u1", "0xaaa", 0, "BEP20-USDT").unwrap();
        assert_eq!(next_derivation_index(&conn).unwrap(), 1);
        // reusing an index is a duplicate, not an error
        assert_eq!(
            insert_deposit_address(&conn, "u2", "0xbbb", 0, "BEP20-USDT").unwrap(),
            Insert::Duplicate
        );
    }

    #[test]
    fn withdrawal_transitions_are_conditioned() {
        let conn = test_conn();
        seed_user(&conn, "u1", "0");
        let id = insert_withdrawal(
            &conn,
            "u1",
            Decimal::from(11),
            Decimal::from(1),
            Decimal::from(10),
            "BEP20-USDT",
            "0x000000000000000000000000000000000000dead",
        )
        .unwrap();

        assert!(approve_withdrawal(&conn, id).unwrap());
        assert!(!approve_withdrawal(&conn, id).unwrap()); // converging no-op
        assert!(mark_withdrawal_broadcast(&conn, id, "0xhash").unwrap());
        assert!(!mark_withdrawal_broadcast(&conn, id, "0xother").unwrap());
        assert!(mark_withdrawal_confirmed(&conn, id).unwrap());
        // terminal rows never transition again
        assert!(!mark_withdrawal_failed(&conn, id).unwrap());
        assert!(!mark_withdrawal_confirmed(&conn, id).unwrap());
        let row = withdrawal(&conn, id).unwrap().unwrap();
        assert_eq!(row.status, WithdrawalStatus::Confirmed);
        assert_eq!(row.tx_hash.as_deref(), Some("0xhash"));
    }

    #[test]
    fn active_withdrawal_sees_only_non_terminal() {
        let conn = test_conn();
        seed_user(&conn, "u1", "0");
        let id = insert_withdrawal(
            &conn,
            "u1",
            Decimal::from(11),
            Decimal::from(1),
            Decimal::from(10),
            "BEP20-USDT",
            "0x000000000000000000000000000000000000dead",
        )
        .unwrap();
        assert!(active_withdrawal(&conn, "u1").unwrap().is_some());
        assert!(mark_withdrawal_failed(&conn, id).unwrap());
        assert!(active_withdrawal(&conn, "u1").unwrap().is_none());
    }

    #[test]
    fn intent_locking_is_single_winner() {
        let conn = test_conn();
        seed_user(&conn, "u1", "0");
        let id = insert_purchase_intent(&conn, "u1", 1).unwrap();
        assert!(lock_intent(&conn, id).unwrap());
        assert!(!lock_intent(&conn, id).unwrap());
        assert!(reopen_intent(&conn, id, "insufficient balance").unwrap());
        assert!(lock_intent(&conn, id).unwrap());
        assert!(complete_intent(&conn, id, 42).unwrap());
        assert!(newest_pending_intent(&conn, "u1").unwrap().is_none());
    }
}
