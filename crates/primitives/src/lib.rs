//! Core overlay types and consensus serialization.

pub mod encoding;
pub mod hash;
pub mod netaddress;
pub mod outpoint;

pub use encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
pub use hash::{hash160, hash256_to_hex, sha256, sha256d};
pub use netaddress::{NetworkClass, ServiceAddress};
pub use outpoint::OutPoint;
