use alloy::primitives::keccak256;
use eyre::Result;
use rand::Rng;
use rusqlite::Connection;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::config::Config;
use crate::db::{self, Insert};
use crate::error;
use crate::models::Plan;

const MAX_LEVEL: u8 = 3;
const CODE_ATTEMPTS: u32 = 5;

/// Per-level percentages: plan overrides win, configured defaults fill the gaps.
fn percentages(plan: Option<&Plan>, defaults: &[Decimal; 3]) -> [Decimal; 3] {
    let Some(plan) = plan else {
        return *defaults;
    };
    let parse = |raw: &str, fallback: Decimal| Decimal::from_str(raw).unwrap_or(fallback);
    [
        parse(&plan.level1_pct, defaults[0]),
        parse(&plan.level2_pct, defaults[1]),
        parse(&plan.level3_pct, defaults[2]),
    ]
}

/// Content-addressed commission id: the same (referrer, buyer, level,
/// reference) always hashes to the same row key, so re-delivery is a
/// uniqueness conflict instead of a second payout.
pub fn commission_id(
    referrer_id: &str,
    buyer_id: &str,
    level: u8,
    reference_type: &str,
    reference_id: &str,
) -> String {
    let key =
        format!("commission:{referrer_id}:{buyer_id}:{level}:{reference_type}:{reference_id}");
    hex::encode(keccak256(key.as_bytes()))
}

/// Walk the referrer chain up to three levels and credit each active
/// ancestor. Inactivity suppresses the payout, not the traversal; only a
/// missing referrer link stops the walk.
pub fn propagate_commissions(
    conn: &mut Connection,
    cfg: &Config,
    buyer_id: &str,
    amount: Decimal,
    plan: Option<&Plan>,
    reference_type: &str,
    reference_id: &str,
) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Ok(());
    }
    let Some(buyer) = db::user(conn, buyer_id)? else {
        return Ok(());
    };

    let pcts = percentages(plan, &cfg.commission_pcts);
    let mut current = buyer;

    for level in 1..=MAX_LEVEL {
        let Some(ancestor_id) = current.referred_by.clone() else {
            break;
        };
        let Some(ancestor) = db::user(conn, &ancestor_id)? else {
            break;
        };

        if ancestor.is_active {
            // a failure at one level must not block the levels above it
            if let Err(e) = grant(
                conn,
                &ancestor_id,
                buyer_id,
                amount,
                pcts[(level - 1) as usize],
                level,
                reference_type,
                reference_id,
            ) {
                tracing::error!(
                    "commission grant failed (referrer={}, level={}, ref={}:{}): {:?}",
                    ancestor_id, level, reference_type, reference_id, e
                );
            }
        }

        current = ancestor;
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn grant(
    conn: &mut Connection,
    referrer_id: &str,
    buyer_id: &str,
    base_amount: Decimal,
    pct: Decimal,
    level: u8,
    reference_type: &str,
    reference_id: &str,
) -> Result<()> {
    let commission = base_amount * pct / Decimal::from(100);
    if commission <= Decimal::ZERO {
        return Ok(());
    }

    let kind = format!("commission_level_{level}");
    let description = format!("Level {level} referral commission");
    match db::insert_movement(
        conn,
        referrer_id,
        &kind,
        commission,
        reference_type,
        reference_id,
        &description,
    )? {
        Insert::Duplicate => return Ok(()), // this exact commission was already granted
        Insert::Inserted => {}
    }

    if let Err(e) = db::increment_balance(conn, referrer_id, commission) {
        // movement recorded but balance not credited: logged for out-of-band
        // reconciliation, never auto-retried (retrying risks a double credit)
        tracing::error!(
            "commission recorded but not credited (referrer={}, level={}, ref={}:{}): {:?}",
            referrer_id, level, reference_type, reference_id, e
        );
        return Ok(());
    }

    let id = commission_id(referrer_id, buyer_id, level, reference_type, reference_id);
    db::insert_commission(
        conn,
        &id,
        referrer_id,
        buyer_id,
        commission,
        level,
        reference_type,
        reference_id,
    )?;
    Ok(())
}

// ---------- linkage ----------

pub fn generate_invite_code() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill(&mut bytes[..]);
    hex::encode(bytes).to_uppercase()
}

/// Idempotent registration with a bounded retry on invite-code collisions.
pub fn register_user(conn: &Connection, user_id: &str) -> error::Result<()> {
    if db::user(conn, user_id)?.is_some() {
        return Ok(());
    }
    for _ in 0..CODE_ATTEMPTS {
        let code = generate_invite_code();
        match db::insert_user(conn, user_id, Some(&code))? {
            Insert::Inserted => return Ok(()),
            Insert::Duplicate => {
                // id collision means someone else registered this user first
                if db::user(conn, user_id)?.is_some() {
                    return Ok(());
                }
            }
        }
    }
    Err(error::Error::InviteCodeExhausted)
}

/// Link a user to an inviter by code and precompute the depth-3 closure.
/// Re-linking is a no-op that reports the existing inviter.
pub fn link_referral(conn: &Connection, user_id: &str, code: &str) -> error::Result<String> {
    let me = db::user(conn, user_id)?
        .ok_or_else(|| error::Error::UnknownUser(user_id.to_string()))?;
    if let Some(existing) = me.referred_by {
        return Ok(existing);
    }

    let inviter =
        db::user_by_invite_code(conn, code)?.ok_or(error::Error::InvalidInviteCode)?;
    if inviter.id == user_id {
        return Err(error::Error::SelfReferral);
    }

    db::set_referred_by_if_null(conn, user_id, &inviter.id)?;

    if db::referral_ancestor(conn, user_id, 1)?.is_none() {
        db::insert_referral_level(conn, user_id, &inviter.id, 1)?;
        if let Some(level2) = db::referral_ancestor(conn, &inviter.id, 1)? {
            db::insert_referral_level(conn, user_id, &level2, 2)?;
            if let Some(level3) = db::referral_ancestor(conn, &inviter.id, 2)? {
                db::insert_referral_level(conn, user_id, &level3, 3)?;
            }
        }
    }

    Ok(inviter.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn balance_of(conn: &Connection, id: &str) -> Decimal {
        Decimal::from_str(&db::user(conn, id).unwrap().unwrap().balance).unwrap()
    }

    /// buyer -> a1 -> a2 -> a3 -> a4
    fn seed_chain(conn: &Connection) {
        for id in ["buyer", "a1", "a2", "a3", "a4"] {
            db::seed_user(conn, id, "0");
        }
        for (child, parent) in [("buyer", "a1"), ("a1", "a2"), ("a2", "a3"), ("a3", "a4")] {
            db::set_referred_by_if_null(conn, child, parent).unwrap();
        }
    }

    #[test]
    fn default_percentages_cascade_three_levels() {
        let mut conn = db::test_conn();
        let cfg = config::test_config();
        seed_chain(&conn);

        propagate_commissions(
            &mut conn,
            &cfg,
            "buyer",
            Decimal::from(100),
            None,
            "subscription",
            "7",
        )
        .unwrap();

        assert_eq!(balance_of(&conn, "a1"), Decimal::from(15));
        assert_eq!(balance_of(&conn, "a2"), Decimal::ONE);
        assert_eq!(balance_of(&conn, "a3"), Decimal::ONE);
        // nothing beyond level 3
        assert_eq!(balance_of(&conn, "a4"), Decimal::ZERO);
    }

    #[test]
    fn replay_never_pays_twice() {
        let mut conn = db::test_conn();
        let cfg = config::test_config();
        seed_chain(&conn);

        for _ in 0..3 {
            propagate_commissions(
                &mut conn,
                &cfg,
                "buyer",
                Decimal::from(100),
                None,
                "subscription",
                "7",
            )
            .unwrap();
        }

        assert_eq!(balance_of(&conn, "a1"), Decimal::from(15));
        assert_eq!(balance_of(&conn, "a2"), Decimal::ONE);
        assert_eq!(balance_of(&conn, "a3"), Decimal::ONE);
    }

    #[test]
    fn inactive_ancestor_is_skipped_but_walk_continues() {
        let mut conn = db::test_conn();
        let cfg = config::test_config();
        seed_chain(&conn);
        db::set_user_active(&conn, "a2", false).unwrap();

        propagate_commissions(
            &mut conn,
            &cfg,
            "buyer",
            Decimal::from(100),
            None,
            "subscription",
            "7",
        )
        .unwrap();

        assert_eq!(balance_of(&conn, "a1"), Decimal::from(15));
        // inactivity suppresses payment, not chain traversal
        assert_eq!(balance_of(&conn, "a2"), Decimal::ZERO);
        assert_eq!(balance_of(&conn, "a3"), Decimal::ONE);
    }

    #[test]
    fn missing_referrer_stops_the_walk() {
        let mut conn = db::test_conn();
        let cfg = config::test_config();
        db::seed_user(&conn, "loner", "0");
        db::seed_user(&conn, "a1", "0");

        propagate_commissions(
            &mut conn,
            &cfg,
            "loner",
            Decimal::from(100),
            None,
            "subscription",
            "7",
        )
        .unwrap();
        assert_eq!(balance_of(&conn, "a1"), Decimal::ZERO);
    }

    #[test]
    fn commission_ids_are_deterministic_per_business_key() {
        let a = commission_id("r", "b", 1, "subscription", "7");
        let b = commission_id("r", "b", 1, "subscription", "7");
        let c = commission_id("r", "b", 2, "subscription", "7");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn linkage_builds_the_closure() {
        let conn = db::test_conn();
        for id in ["u1", "u2", "u3", "u4"] {
            register_user(&conn, id).unwrap();
        }
        let code_of = |id: &str| db::user(&conn, id).unwrap().unwrap().invite_code.unwrap();

        link_referral(&conn, "u2", &code_of("u1")).unwrap();
        link_referral(&conn, "u3", &code_of("u2")).unwrap();
        link_referral(&conn, "u4", &code_of("u3")).unwrap();

        assert_eq!(
            db::referral_ancestor(&conn, "u4", 1).unwrap().as_deref(),
            Some("u3")
        );
        assert_eq!(
            db::referral_ancestor(&conn, "u4", 2).unwrap().as_deref(),
            Some("u2")
        );
        assert_eq!(
            db::referral_ancestor(&conn, "u4", 3).unwrap().as_deref(),
            Some("u1")
        );

        // self-referral and re-linking
        assert!(matches!(
            link_referral(&conn, "u1", &code_of("u1")),
            Err(error::Error::SelfReferral)
        ));
        assert_eq!(link_referral(&conn, "u2", &code_of("u3")).unwrap(), "u1");
    }
}
