use chrono::{Duration, Utc};
use eyre::Result;
use rusqlite::Connection;
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::{error, info};

use crate::config::Config;
use crate::db::{self, Insert};
use crate::error::{self, Error};
use crate::referrals;

/// What happened when a credit tried to activate a pending purchase. Reported
/// as data to the caller; activation failures never roll back the credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    NoIntent,
    Raced,
    InvalidPlan,
    /// Intent restored to pending so a later credit can pick it up.
    InsufficientBalance,
    Activated {
        subscription_id: i64,
        plan_id: i64,
    },
}

/// Record what the user wants to buy once their balance allows it. Any prior
/// pending intent is replaced, not stacked.
pub fn create_purchase_intent(
    conn: &Connection,
    user_id: &str,
    plan_id: i64,
) -> error::Result<i64> {
    if db::user(conn, user_id)?.is_none() {
        return Err(Error::UnknownUser(user_id.to_string()));
    }
    if db::plan(conn, plan_id)?.is_none() {
        return Err(Error::UnknownPlan(plan_id));
    }
    db::cancel_pending_intents(conn, user_id)?;
    Ok(db::insert_purchase_intent(conn, user_id, plan_id)?)
}

/// The `onUserCredited` hook: claim the newest pending intent, debit the plan
/// price, open the subscription and cascade referral commissions.
pub fn try_auto_activate(
    conn: &mut Connection,
    cfg: &Config,
    user_id: &str,
) -> Result<ActivationOutcome> {
    let Some(intent) = db::newest_pending_intent(conn, user_id)? else {
        return Ok(ActivationOutcome::NoIntent);
    };

    // CAS claim: the loser of a concurrent race no-ops
    if !db::lock_intent(conn, intent.id)? {
        return Ok(ActivationOutcome::Raced);
    }

    let Some(plan) = db::plan(conn, intent.plan_id)? else {
        db::fail_intent(conn, intent.id, "unknown plan")?;
        return Ok(ActivationOutcome::InvalidPlan);
    };
    let price = Decimal::from_str(&plan.price)?;

    match db::try_debit(conn, user_id, price) {
        Ok(_) => {}
        Err(Error::InsufficientBalance { .. }) => {
            db::reopen_intent(conn, intent.id, "insufficient balance")?;
            return Ok(ActivationOutcome::InsufficientBalance);
        }
        Err(e) => {
            db::fail_intent(conn, intent.id, &e.to_string())?;
            return Err(e.into());
        }
    }

    let expires_at = (Utc::now() + Duration::days(plan.duration_days)).to_rfc3339();
    let subscription_id = db::insert_subscription(conn, user_id, plan.id, &expires_at)?;

    let reference = subscription_id.to_string();
    if let Insert::Duplicate = db::insert_movement(
        conn,
        user_id,
        "subscription",
        -price,
        "subscription",
        &reference,
        &format!("{} activation", plan.name),
    )? {
        // subscription ids are fresh, so this cannot normally happen
        error!("duplicate subscription movement (user={user_id}, subscription={reference})");
    }

    db::complete_intent(conn, intent.id, subscription_id)?;
    info!(
        "subscription activated user={} plan={} subscription={}",
        user_id, plan.id, subscription_id
    );

    if let Err(e) = referrals::propagate_commissions(
        conn,
        cfg,
        user_id,
        price,
        Some(&plan),
        "subscription",
        &reference,
    ) {
        error!("commission propagation failed (buyer={user_id}, subscription={reference}): {e:?}");
    }

    Ok(ActivationOutcome::Activated {
        subscription_id,
        plan_id: plan.id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    #[test]
    fn activation_debits_price_and_cascades_commissions() {
        let mut conn = db::test_conn();
        let cfg = config::test_config();
        db::seed_user(&conn, "referrer", "0");
        db::seed_user(&conn, "buyer", "100");
        db::set_referred_by_if_null(&conn, "buyer", "referrer").unwrap();

        // plan 1 is seeded at price 30
        create_purchase_intent(&conn, "buyer", 1).unwrap();
        let outcome = try_auto_activate(&mut conn, &cfg, "buyer").unwrap();
        assert!(matches!(outcome, ActivationOutcome::Activated { plan_id: 1, .. }));

        let buyer = db::user(&conn, "buyer").unwrap().unwrap();
        assert_eq!(Decimal::from_str(&buyer.balance).unwrap(), Decimal::from(70));

        // 15% of the plan price to the level-1 ancestor
        let referrer = db::user(&conn, "referrer").unwrap().unwrap();
        assert_eq!(
            Decimal::from_str(&referrer.balance).unwrap(),
            Decimal::from_str("4.5").unwrap()
        );

        // intent consumed
        assert_eq!(
            try_auto_activate(&mut conn, &cfg, "buyer").unwrap(),
            ActivationOutcome::NoIntent
        );
    }

    #[test]
    fn insufficient_balance_keeps_the_intent_pending() {
        let mut conn = db::test_conn();
        let cfg = config::test_config();
        db::seed_user(&conn, "buyer", "10");
        create_purchase_intent(&conn, "buyer", 1).unwrap();

        assert_eq!(
            try_auto_activate(&mut conn, &cfg, "buyer").unwrap(),
            ActivationOutcome::InsufficientBalance
        );
        // still there for the next credit
        assert!(db::newest_pending_intent(&conn, "buyer").unwrap().is_some());

        db::increment_balance(&mut conn, "buyer", Decimal::from(100)).unwrap();
        assert!(matches!(
            try_auto_activate(&mut conn, &cfg, "buyer").unwrap(),
            ActivationOutcome::Activated { .. }
        ));
    }

    #[test]
    fn newer_intent_replaces_the_pending_one() {
        let conn = db::test_conn();
        db::seed_user(&conn, "buyer", "0");
        let first = create_purchase_intent(&conn, "buyer", 1).unwrap();
        let second = create_purchase_intent(&conn, "buyer", 2).unwrap();
        assert_ne!(first, second);
        let pending = db::newest_pending_intent(&conn, "buyer").unwrap().unwrap();
        assert_eq!(pending.id, second);
        assert_eq!(pending.plan_id, 2);
    }
}
