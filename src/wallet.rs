use alloy::signers::local::PrivateKeySigner;
use alloy::signers::utils::public_key_to_address;
use coins_bip32::enc::{MainnetEncoder, XKeyEncoder};
use coins_bip39::{English, Mnemonic};
use rusqlite::Connection;
use tracing::info;

use crate::db::{self, Insert};
use crate::error::{Error, Result};
use crate::models::DepositAddress;

const ALLOC_ATTEMPTS: u32 = 5;

/// Pure derivation: fixed public root + index -> lowercase hex address.
/// No network or store access; safe from any process.
pub fn derive_deposit_address(xpub: &str, index: u32) -> Result<String> {
    use coins_bip32::xkeys::Parent;

    let root = MainnetEncoder::xpub_from_base58(xpub)
        .map_err(|e| Error::Derivation(e.to_string()))?;
    let child = root
        .derive_child(index)
        .map_err(|e| Error::Derivation(e.to_string()))?;
    let key: &coins_bip32::prelude::VerifyingKey = child.as_ref();
    let address = public_key_to_address(key);
    Ok(format!("{address:#x}"))
}

/// Signing key controlling the deposit address at `index`, derived from the
/// shared mnemonic. The xpub above is this tree's public counterpart.
pub fn derive_signer(mnemonic: &str, base_path: &str, index: u32) -> Result<PrivateKeySigner> {
    let mnemonic: Mnemonic<English> =
        Mnemonic::new_from_phrase(mnemonic).map_err(|e| Error::Derivation(e.to_string()))?;
    let path = format!("{}/{index}", base_path.trim_end_matches('/'));
    let xpriv = mnemonic
        .derive_key(path.as_str(), None)
        .map_err(|e| Error::Derivation(e.to_string()))?;
    let key: &coins_bip32::prelude::SigningKey = xpriv.as_ref();
    let signer = k256::ecdsa::SigningKey::from_bytes(&key.to_bytes())
        .map_err(|e| Error::Derivation(e.to_string()))?;
    Ok(PrivateKeySigner::from_signing_key(signer))
}

/// Idempotent allocation: returns the existing row when the user already has
/// one, otherwise retries allocate -> derive -> insert against index races.
pub fn create_deposit_address(
    conn: &Connection,
    xpub: &str,
    user_id: &str,
    network: &str,
) -> Result<DepositAddress> {
    if let Some(existing) = db::deposit_address_for_user(conn, user_id)? {
        return Ok(existing);
    }

    for _ in 0..ALLOC_ATTEMPTS {
        let index = db::next_derivation_index(conn)?;
        let address = derive_deposit_address(xpub, index)?;

        match db::insert_deposit_address(conn, user_id, &address, index, network)? {
            Insert::Inserted => {
                info!("allocated deposit address {} (index {}) for {}", address, index, user_id);
                return Ok(DepositAddress {
                    user_id: user_id.to_string(),
                    address,
                    derivation_index: index,
                    network: network.to_string(),
                });
            }
            Insert::Duplicate => {
                // either a concurrent request for the same user won, or the
                // index was taken; re-check, then recompute and retry
                if let Some(existing) = db::deposit_address_for_user(conn, user_id)? {
                    return Ok(existing);
                }
            }
        }
    }

    Err(Error::AddressAllocationExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;

    // BIP-32 test vector 1, master public key.
    const XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

    const MNEMONIC: &str = "test test test test test test test test test test test junk";

    #[test]
    fn derivation_is_pure_and_index_sensitive() {
        let a0 = derive_deposit_address(XPUB, 0).unwrap();
        let a0_again = derive_deposit_address(XPUB, 0).unwrap();
        let a1 = derive_deposit_address(XPUB, 1).unwrap();

        assert_eq!(a0, a0_again);
        assert_ne!(a0, a1);
        assert!(a0.starts_with("0x") && a0.len() == 42);
        assert_eq!(a0, a0.to_lowercase());
    }

    #[test]
    fn signer_matches_known_mnemonic_account() {
        let signer = derive_signer(MNEMONIC, "m/44'/60'/0'/0", 0).unwrap();
        assert_eq!(
            format!("{:#x}", signer.address()),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[test]
    fn allocation_is_idempotent_and_monotonic() {
        let conn = db::test_conn();
        let first = create_deposit_address(&conn, XPUB, "u1", "BEP20-USDT").unwrap();
        assert_eq!(first.derivation_index, 0);

        // same user: same row back, no new index burned
        let again = create_deposit_address(&conn, XPUB, "u1", "BEP20-USDT").unwrap();
        assert_eq!(again.address, first.address);

        let second = create_deposit_address(&conn, XPUB, "u2", "BEP20-USDT").unwrap();
        assert_eq!(second.derivation_index, 1);
        assert_ne!(second.address, first.address);
    }
}
