//! Standard script templates.

use merged_primitives::hash::hash160;

/// OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
pub fn p2pkh_script(key_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(key_hash);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

/// The p2pkh script paying to the given serialized pubkey.
pub fn p2pkh_script_for_pubkey(pubkey: &[u8]) -> Vec<u8> {
    p2pkh_script(&hash160(pubkey))
}

/// Extract the key hash from a standard p2pkh script.
pub fn p2pkh_key_hash(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() != 25
        || script[..3] != [0x76, 0xa9, 0x14]
        || script[23..] != [0x88, 0xac]
    {
        return None;
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&script[3..23]);
    Some(hash)
}
