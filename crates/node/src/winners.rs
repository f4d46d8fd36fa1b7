//! Advisory payment schedule built from this node's own picks.
//!
//! The consensus-grade winner list lives in the block-validation layer; the
//! overlay keeps just enough look-ahead history to answer the scheduler's
//! "already queued?" question.

use std::collections::HashMap;
use std::sync::Mutex;

use merged_consensus::constants::MIN_PEER_PROTO_VERSION;
use merged_masternode::PaymentOracle;
use merged_primitives::OutPoint;

/// Blocks of look-ahead treated as already taken.
const SCHEDULE_LOOKAHEAD: i64 = 8;
/// How far below the highest recorded height old picks are kept.
const KEEP_DEPTH: i64 = 40;

#[derive(Default)]
pub struct WinnerBook {
    payees: Mutex<HashMap<i64, Vec<u8>>>,
}

impl WinnerBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, height: i64, payee_script: Vec<u8>) {
        let Ok(mut payees) = self.payees.lock() else {
            return;
        };
        payees.insert(height, payee_script);
        let cutoff = payees.keys().max().copied().unwrap_or(height) - KEEP_DEPTH;
        payees.retain(|recorded, _| *recorded >= cutoff);
    }

}

impl PaymentOracle for WinnerBook {
    fn is_scheduled(&self, _collateral: &OutPoint, payee_script: &[u8], height: i64) -> bool {
        let Ok(payees) = self.payees.lock() else {
            return false;
        };
        (height..height + SCHEDULE_LOOKAHEAD)
            .any(|slot| payees.get(&slot).map(Vec::as_slice) == Some(payee_script))
    }

    fn min_payment_protocol(&self) -> i32 {
        MIN_PEER_PROTO_VERSION
    }
}
