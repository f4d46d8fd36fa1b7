//! Sync gate for the overlay.
//!
//! The chain daemon does the heavy lifting; the overlay only needs to know
//! whether the tip looks current before it trusts gossip, plus a progress
//! count for list items.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use merged_consensus::Hash256;
use merged_masternode::{ChainOracle, SyncCoordinator};

/// A tip older than this is treated as still syncing.
const TIP_FRESHNESS_SECS: i64 = 60 * 60;

pub struct NodeSync {
    chain: Arc<dyn ChainOracle>,
    noted: AtomicUsize,
}

impl NodeSync {
    pub fn new(chain: Arc<dyn ChainOracle>) -> Self {
        Self {
            chain,
            noted: AtomicUsize::new(0),
        }
    }

    pub fn list_items(&self) -> usize {
        self.noted.load(Ordering::Relaxed)
    }
}

impl SyncCoordinator for NodeSync {
    fn is_blockchain_synced(&self) -> bool {
        let tip = self.chain.tip_height();
        if tip <= 0 {
            return false;
        }
        match self.chain.block_time(tip) {
            Some(time) => time > self.chain.adjusted_time() - TIP_FRESHNESS_SECS,
            None => false,
        }
    }

    fn noted_masternode_list_item(&self, _hash: &Hash256) {
        self.noted.fetch_add(1, Ordering::Relaxed);
    }
}
