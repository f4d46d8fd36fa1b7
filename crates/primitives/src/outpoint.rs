use std::fmt;

use merged_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};

/// Reference to a transaction output: the collateral identity of a
/// masternode.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash256, index: u32) -> Self {
        Self { hash, index }
    }

    /// The sentinel used on the wire for "no outpoint" (full-list dseg).
    pub fn null() -> Self {
        Self {
            hash: [0u8; 32],
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::null()
    }

    /// Canonical display form, also used inside signed message strings.
    pub fn to_string_canonical(&self) -> String {
        format!("{}:{}", crate::hash::hash256_to_hex(&self.hash), self.index)
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_canonical())
    }
}

impl Encodable for OutPoint {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash_le(&self.hash);
        encoder.write_u32_le(self.index);
    }
}

impl Decodable for OutPoint {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let hash = decoder.read_hash_le()?;
        let index = decoder.read_u32_le()?;
        Ok(Self { hash, index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_consensus_encoding() {
        let outpoint = OutPoint::new([0x42; 32], 7);
        let mut encoder = Encoder::new();
        outpoint.consensus_encode(&mut encoder);
        let bytes = encoder.into_inner();
        assert_eq!(bytes.len(), 36);

        let mut decoder = Decoder::new(&bytes);
        let decoded = OutPoint::consensus_decode(&mut decoder).expect("decode");
        assert_eq!(decoded, outpoint);
        assert!(decoder.is_empty());
    }

    #[test]
    fn null_sentinel() {
        assert!(OutPoint::null().is_null());
        assert!(!OutPoint::new([1; 32], 0).is_null());
    }

    #[test]
    fn canonical_string_is_reversed_hex_and_index() {
        let mut hash = [0u8; 32];
        hash[31] = 0xab;
        let outpoint = OutPoint::new(hash, 3);
        let text = outpoint.to_string_canonical();
        assert!(text.starts_with("ab"));
        assert!(text.ends_with(":3"));
    }
}
