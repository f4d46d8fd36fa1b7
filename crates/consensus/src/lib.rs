//! Chain parameters and consensus-wide constants.

pub mod constants;
pub mod params;

pub use params::{chain_params, hash256_from_hex, ChainParams, Network};

/// A 256-bit hash in internal byte order.
pub type Hash256 = [u8; 32];
