// src/parser.rs
use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;

use crate::rpc::Log;

/// A decoded ERC20 Transfer
#[derive(Debug, Clone)]
pub struct Transfer {
    pub from: Address,
    pub to: Address,
    pub value: U256, // raw token units
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
}

fn topic_to_address(topic: &str) -> Option<Address> {
    // topics[1] and topics[2] are 32-byte (padded) hex strings; address is the last 20 bytes
    let s = topic.trim_start_matches("0x");
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let addr_bytes: [u8; 20] = bytes[12..32].try_into().ok()?;
    Some(Address::from(addr_bytes))
}

/// Decode a single log into `Transfer`
pub fn decode_transfer(log: &Log) -> Option<Transfer> {
    if log.topics.len() < 3 {
        return None;
    }

    let from = topic_to_address(&log.topics[1])?;
    let to = topic_to_address(&log.topics[2])?;

    let value = U256::from_str_radix(log.data.trim_start_matches("0x"), 16)
        .unwrap_or(U256::ZERO);

    let block_number =
        u64::from_str_radix(log.block_number_hex.trim_start_matches("0x"), 16).ok()?;

    let log_index =
        u64::from_str_radix(log.log_index_hex.trim_start_matches("0x"), 16).unwrap_or(0);

    Some(Transfer {
        from,
        to,
        value,
        block_number,
        tx_hash: log.tx_hash.clone(),
        log_index,
    })
}

// ---------- token unit conversion ----------
// Amounts stay exact decimals end-to-end; binary floating point never enters.

/// Raw base units -> exact human-readable decimal (e.g. 10_500e15 @ 18 -> 10.5).
/// None when the value does not fit the decimal range (not a realistic token
/// amount; callers skip and log such events).
pub fn format_units(value: U256, decimals: u32) -> Option<Decimal> {
    let raw = i128::try_from(u128::try_from(value).ok()?).ok()?;
    Some(
        Decimal::try_from_i128_with_scale(raw, decimals)
            .ok()?
            .normalize(),
    )
}

/// Exact human-readable decimal -> raw base units. None on negative amounts
/// or more fractional digits than the token carries.
pub fn to_units(amount: Decimal, decimals: u32) -> Option<U256> {
    if amount.is_sign_negative() {
        return None;
    }
    let amount = amount.normalize();
    let scale = amount.scale();
    if scale > decimals {
        return None;
    }
    let mantissa = u128::try_from(amount.mantissa()).ok()?;
    Some(U256::from(mantissa) * U256::from(10u8).pow(U256::from(decimals - scale)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn transfer_log(to_topic: &str, data: &str) -> Log {
        Log {
            address: "0x55d398326f99059ff775485246999027b3197955".to_string(),
            topics: vec![
                crate::rpc::TRANSFER_TOPIC.to_string(),
                "0x0000000000000000000000001111111111111111111111111111111111111111"
                    .to_string(),
                to_topic.to_string(),
            ],
            data: data.to_string(),
            block_number_hex: "0x64".to_string(),
            tx_hash: "0xdeadbeef".to_string(),
            log_index_hex: "0x2".to_string(),
        }
    }

    #[test]
    fn decodes_transfer_log() {
        let log = transfer_log(
            "0x0000000000000000000000002222222222222222222222222222222222222222",
            "0x00000000000000000000000000000000000000000000000091b77e5e5d9a0000",
        );
        let t = decode_transfer(&log).unwrap();
        assert_eq!(
            t.to,
            Address::from_str("0x2222222222222222222222222222222222222222").unwrap()
        );
        assert_eq!(t.block_number, 100);
        assert_eq!(t.log_index, 2);
        // 10.5 tokens at 18 decimals
        assert_eq!(format_units(t.value, 18).unwrap().to_string(), "10.5");
    }

    #[test]
    fn short_topic_list_is_not_a_transfer() {
        let mut log = transfer_log(
            "0x0000000000000000000000002222222222222222222222222222222222222222",
            "0x0",
        );
        log.topics.truncate(1);
        assert!(decode_transfer(&log).is_none());
    }

    #[test]
    fn unit_conversion_round_trips_exactly() {
        let amount = Decimal::from_str("10.5").unwrap();
        let units = to_units(amount, 18).unwrap();
        assert_eq!(units, U256::from(10_500_000_000_000_000_000u128));
        assert_eq!(format_units(units, 18).unwrap(), amount);

        // more fractional digits than the token carries
        assert!(to_units(Decimal::from_str("1.0000001").unwrap(), 6).is_none());
        // negative amounts never become units
        assert!(to_units(Decimal::from_str("-1").unwrap(), 18).is_none());
    }
}
