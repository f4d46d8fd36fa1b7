//! Signed gossip messages.
//!
//! Broadcasts, pings, and sporks all carry 65-byte recoverable ECDSA
//! signatures over a magic-prefixed double-SHA256 of the message text.

use std::fmt;
use std::sync::OnceLock;

use merged_consensus::Hash256;
use merged_primitives::encoding::Encoder;
use merged_primitives::hash::sha256d;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

/// Prefix mixed into every signed message hash.
const MESSAGE_MAGIC: &str = "Merge Signed Message:\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    InvalidSecretKey,
    InvalidPublicKey,
    InvalidSignature,
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::InvalidSecretKey => write!(f, "invalid secret key"),
            MessageError::InvalidPublicKey => write!(f, "invalid public key"),
            MessageError::InvalidSignature => write!(f, "invalid message signature"),
        }
    }
}

impl std::error::Error for MessageError {}

pub fn signed_message_hash(message: &[u8]) -> Hash256 {
    let mut encoder = Encoder::new();
    encoder.write_var_str(MESSAGE_MAGIC);
    encoder.write_var_bytes(message);
    sha256d(&encoder.into_inner())
}

/// Sign `message` with a compact recoverable signature (header byte
/// 27 + recovery id + 4 for a compressed pubkey).
pub fn sign_message(secret: &SecretKey, message: &[u8]) -> Result<Vec<u8>, MessageError> {
    let digest = signed_message_hash(message);
    let msg =
        Message::from_digest_slice(&digest).map_err(|_| MessageError::InvalidSignature)?;
    let sig = secp().sign_ecdsa_recoverable(&msg, secret);
    let (rec_id, bytes) = sig.serialize_compact();
    let mut out = [0u8; 65];
    out[0] = 27u8
        .saturating_add(rec_id.to_i32() as u8)
        .saturating_add(4);
    out[1..].copy_from_slice(&bytes);
    Ok(out.to_vec())
}

/// Recover the pubkey that produced `signature` over `message`.
pub fn recover_pubkey(signature: &[u8], message: &[u8]) -> Result<PublicKey, MessageError> {
    if signature.len() != 65 {
        return Err(MessageError::InvalidSignature);
    }
    let header = signature[0];
    if !(27..27 + 8).contains(&header) {
        return Err(MessageError::InvalidSignature);
    }
    let rec_id = RecoveryId::from_i32(((header - 27) & 0x03) as i32)
        .map_err(|_| MessageError::InvalidSignature)?;
    let sig = RecoverableSignature::from_compact(&signature[1..], rec_id)
        .map_err(|_| MessageError::InvalidSignature)?;
    let digest = signed_message_hash(message);
    let msg =
        Message::from_digest_slice(&digest).map_err(|_| MessageError::InvalidSignature)?;
    secp()
        .recover_ecdsa(&msg, &sig)
        .map_err(|_| MessageError::InvalidSignature)
}

/// Verify that `signature` over `message` recovers to `pubkey_bytes`.
pub fn verify_message(
    pubkey_bytes: &[u8],
    signature: &[u8],
    message: &[u8],
) -> Result<(), MessageError> {
    let expected =
        PublicKey::from_slice(pubkey_bytes).map_err(|_| MessageError::InvalidPublicKey)?;
    let recovered = recover_pubkey(signature, message)?;
    if recovered != expected {
        return Err(MessageError::InvalidSignature);
    }
    Ok(())
}

pub fn secret_from_slice(bytes: &[u8]) -> Result<SecretKey, MessageError> {
    SecretKey::from_slice(bytes).map_err(|_| MessageError::InvalidSecretKey)
}

pub fn pubkey_for_secret(secret: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(secp(), secret)
}

fn secp() -> &'static Secp256k1<secp256k1::All> {
    static SECP: OnceLock<Secp256k1<secp256k1::All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_secret_key(last_byte: u8) -> SecretKey {
        let mut bytes = [0u8; 32];
        bytes[31] = last_byte;
        SecretKey::from_slice(&bytes).expect("secret key")
    }

    #[test]
    fn sign_verify_roundtrip() {
        let secret = make_test_secret_key(1);
        let pubkey = pubkey_for_secret(&secret);
        let sig = sign_message(&secret, b"hello overlay").expect("sign");
        assert_eq!(sig.len(), 65);
        verify_message(&pubkey.serialize(), &sig, b"hello overlay").expect("verify");
    }

    #[test]
    fn wrong_key_and_wrong_message_fail() {
        let secret = make_test_secret_key(1);
        let other = pubkey_for_secret(&make_test_secret_key(2));
        let sig = sign_message(&secret, b"hello").expect("sign");
        assert!(verify_message(&other.serialize(), &sig, b"hello").is_err());

        let pubkey = pubkey_for_secret(&secret);
        assert!(verify_message(&pubkey.serialize(), &sig, b"tampered").is_err());
    }

    #[test]
    fn malformed_signatures_rejected() {
        let pubkey = pubkey_for_secret(&make_test_secret_key(1)).serialize();
        assert!(verify_message(&pubkey, &[0u8; 64], b"m").is_err());
        let mut sig = vec![0u8; 65];
        sig[0] = 5; // header below the compact range
        assert!(verify_message(&pubkey, &sig, b"m").is_err());
    }

    #[test]
    fn message_hash_is_magic_prefixed() {
        let direct = sha256d(b"payload");
        assert_ne!(signed_message_hash(b"payload"), direct);
    }
}
