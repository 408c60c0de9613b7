//! Wallet-signature authentication and allow-list policy.
//!
//! Clients prove control of an Ethereum address by signing a challenge
//! message with their wallet (EIP-191 `personal_sign`). The gateway recovers
//! the signing address from the signature and compares it, case-insensitively,
//! to the claimed address. No password or server-side session token exists —
//! the verified address is the whole identity.
//!
//! Malformed input (bad hex, wrong length, invalid recovery id) is a
//! verification *failure*, never a panic or error: everything here arrives
//! from an untrusted network peer.

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha3::{Digest, Keccak256};

/// Verify that `signature` over `message` was produced by the wallet that
/// owns `address`. Returns `false` for any malformed input.
pub fn verify_signature(address: &str, message: &str, signature: &str) -> bool {
    let Some(recovered) = recover_address(message, signature) else {
        return false;
    };
    match normalize_address(address) {
        Some(claimed) => recovered == claimed,
        None => false,
    }
}

/// Check an address against the configured allow-list.
///
/// An empty allow-list authorizes any address — explicit operator opt-in to
/// open mode, warned about at startup.
pub fn is_authorized(address: &str, allow_list: &[String]) -> bool {
    if allow_list.is_empty() {
        return true;
    }
    allow_list
        .iter()
        .any(|entry| entry.eq_ignore_ascii_case(address))
}

/// Recover the 0x-prefixed lowercase signer address from an EIP-191
/// personal-sign signature. `None` for any malformed input.
pub fn recover_address(message: &str, signature: &str) -> Option<String> {
    let sig_bytes = decode_hex(signature)?;
    if sig_bytes.len() != 65 {
        return None;
    }
    let sig = Signature::try_from(&sig_bytes[..64]).ok()?;
    let recovery_id = normalize_recovery_id(sig_bytes[64])?;
    let prehash = personal_message_hash(message.as_bytes());
    let key = VerifyingKey::recover_from_prehash(&prehash, &sig, recovery_id).ok()?;
    Some(address_from_key(&key))
}

/// Keccak-256 digest of the EIP-191 personal-sign envelope:
/// `"\x19Ethereum Signed Message:\n" + len(message) + message`.
pub fn personal_message_hash(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Derive the 0x-prefixed lowercase address from a verifying key: the last
/// 20 bytes of the Keccak-256 of the uncompressed public key (sans prefix).
pub fn address_from_key(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    // Uncompressed SEC1 encoding is 0x04 || X || Y — hash only the coordinates.
    let digest = Keccak256::digest(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

/// Lowercase a 0x-prefixed 20-byte hex address; `None` if it isn't one.
pub fn normalize_address(address: &str) -> Option<String> {
    let trimmed = address.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))?;
    if body.len() != 40 || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("0x{}", body.to_ascii_lowercase()))
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    let trimmed = value.trim();
    let body = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    hex::decode(body).ok()
}

/// Wallets emit the recovery id as 27/28 (legacy) or 0/1.
fn normalize_recovery_id(raw: u8) -> Option<RecoveryId> {
    let id = match raw {
        27 | 28 => raw - 27,
        0 | 1 => raw,
        _ => return None,
    };
    RecoveryId::try_from(id).ok()
}
