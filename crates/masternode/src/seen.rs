//! Hash-indexed dedup caches for broadcasts and pings.

use std::collections::HashMap;

use merged_consensus::constants::MASTERNODE_REMOVAL_SECONDS;
use merged_consensus::Hash256;
use merged_primitives::OutPoint;

use crate::broadcast::MasternodeBroadcast;
use crate::entry::MasternodePing;

/// Upper bound per map; a flood of unique hashes evicts the stalest entry
/// instead of growing without limit.
const SEEN_CACHE_MAX: usize = 50_000;

#[derive(Default)]
pub struct SeenCaches {
    broadcasts: HashMap<Hash256, MasternodeBroadcast>,
    pings: HashMap<Hash256, MasternodePing>,
}

impl SeenCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_broadcast(&self, hash: &Hash256) -> bool {
        self.broadcasts.contains_key(hash)
    }

    pub fn has_ping(&self, hash: &Hash256) -> bool {
        self.pings.contains_key(hash)
    }

    pub fn broadcast(&self, hash: &Hash256) -> Option<&MasternodeBroadcast> {
        self.broadcasts.get(hash)
    }

    pub fn ping(&self, hash: &Hash256) -> Option<&MasternodePing> {
        self.pings.get(hash)
    }

    /// Insert unless already present. Returns whether the hash was new.
    pub fn insert_broadcast(&mut self, hash: Hash256, mnb: MasternodeBroadcast) -> bool {
        if self.broadcasts.contains_key(&hash) {
            return false;
        }
        if self.broadcasts.len() >= SEEN_CACHE_MAX {
            evict_stalest(&mut self.broadcasts, broadcast_sig_time);
        }
        self.broadcasts.insert(hash, mnb);
        true
    }

    pub fn insert_ping(&mut self, hash: Hash256, ping: MasternodePing) -> bool {
        if self.pings.contains_key(&hash) {
            return false;
        }
        if self.pings.len() >= SEEN_CACHE_MAX {
            evict_stalest(&mut self.pings, |ping| ping.sig_time);
        }
        self.pings.insert(hash, ping);
        true
    }

    /// Keep a cached broadcast's embedded ping fresh so it survives sweeps
    /// while the node keeps pinging.
    pub fn refresh_broadcast_ping(&mut self, hash: &Hash256, ping: &MasternodePing) {
        if let Some(mnb) = self.broadcasts.get_mut(hash) {
            mnb.last_ping = Some(ping.clone());
        }
    }

    /// Drop every cached broadcast for a collateral. Called when the entry is
    /// swept so a later ping can trigger a re-fetch.
    pub fn purge_broadcasts_for(&mut self, collateral: &OutPoint) {
        self.broadcasts.retain(|_, mnb| mnb.collateral != *collateral);
    }

    /// Evict entries whose embedded sig time fell behind twice the removal
    /// window.
    pub fn sweep(&mut self, now: i64) {
        let cutoff = now - MASTERNODE_REMOVAL_SECONDS * 2;
        self.broadcasts
            .retain(|_, mnb| broadcast_sig_time(mnb) >= cutoff);
        self.pings.retain(|_, ping| ping.sig_time >= cutoff);
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.len()
    }

    pub fn ping_count(&self) -> usize {
        self.pings.len()
    }
}

fn broadcast_sig_time(mnb: &MasternodeBroadcast) -> i64 {
    mnb.last_ping.as_ref().map(|ping| ping.sig_time).unwrap_or(0)
}

fn evict_stalest<V>(map: &mut HashMap<Hash256, V>, sig_time: impl Fn(&V) -> i64) {
    let stalest = map
        .iter()
        .min_by_key(|(_, value)| sig_time(value))
        .map(|(hash, _)| *hash);
    if let Some(hash) = stalest {
        map.remove(&hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merged_primitives::ServiceAddress;

    fn make_ping(byte: u8, sig_time: i64) -> MasternodePing {
        MasternodePing::new(OutPoint::new([byte; 32], 0), [0x22; 32], sig_time)
    }

    fn make_broadcast(byte: u8, ping_time: i64) -> MasternodeBroadcast {
        let collateral = OutPoint::new([byte; 32], 0);
        MasternodeBroadcast {
            collateral,
            addr: ServiceAddress::new([0u8; 16], 9647),
            collateral_pubkey: vec![0x02; 33],
            operator_pubkey: vec![0x03; 33],
            sig: Vec::new(),
            sig_time: ping_time,
            protocol_version: 70920,
            last_ping: Some(MasternodePing::new(collateral, [0x22; 32], ping_time)),
        }
    }

    #[test]
    fn duplicate_hashes_are_rejected() {
        let mut seen = SeenCaches::new();
        let mnb = make_broadcast(1, 100);
        assert!(seen.insert_broadcast(mnb.hash(), mnb.clone()));
        assert!(!seen.insert_broadcast(mnb.hash(), mnb));
        assert_eq!(seen.broadcast_count(), 1);
    }

    #[test]
    fn sweep_honors_double_removal_window() {
        let mut seen = SeenCaches::new();
        let fresh = make_broadcast(1, 10_000);
        let stale = make_broadcast(2, 10_000 - 1);
        seen.insert_broadcast(fresh.hash(), fresh.clone());
        seen.insert_broadcast(stale.hash(), stale.clone());

        let ping = make_ping(3, 10_000 - 1);
        seen.insert_ping(ping.hash(), ping.clone());

        seen.sweep(10_000 + MASTERNODE_REMOVAL_SECONDS * 2);
        assert!(seen.has_broadcast(&fresh.hash()));
        assert!(!seen.has_broadcast(&stale.hash()));
        assert!(!seen.has_ping(&ping.hash()));
    }

    #[test]
    fn purge_by_collateral_leaves_others() {
        let mut seen = SeenCaches::new();
        let target = make_broadcast(1, 100);
        let other = make_broadcast(2, 100);
        seen.insert_broadcast(target.hash(), target.clone());
        seen.insert_broadcast(other.hash(), other.clone());

        seen.purge_broadcasts_for(&target.collateral);
        assert!(!seen.has_broadcast(&target.hash()));
        assert!(seen.has_broadcast(&other.hash()));
    }

    #[test]
    fn broadcast_without_ping_sweeps_immediately() {
        let mut seen = SeenCaches::new();
        let mut mnb = make_broadcast(1, 100);
        mnb.last_ping = None;
        seen.insert_broadcast(mnb.hash(), mnb.clone());
        seen.sweep(MASTERNODE_REMOVAL_SECONDS * 2 + 1);
        assert!(!seen.has_broadcast(&mnb.hash()));
    }

    #[test]
    fn refresh_keeps_broadcast_alive_across_sweeps() {
        let mut seen = SeenCaches::new();
        let mnb = make_broadcast(1, 100);
        let hash = mnb.hash();
        seen.insert_broadcast(hash, mnb);

        let later = 100 + MASTERNODE_REMOVAL_SECONDS * 2;
        let ping = make_ping(1, later);
        seen.refresh_broadcast_ping(&hash, &ping);
        seen.sweep(later + 1);
        assert!(seen.has_broadcast(&hash));
    }
}
