//! The registry of known masternodes.
//!
//! Owns the entries vector together with the seen caches and ask throttles,
//! all guarded by one mutex at the owner. Accessors hand out clones; nothing
//! borrowed leaves the lock.

use merged_consensus::constants::{MASTERNODE_PING_BLOCK_DEPTH, MN_WINNER_MINIMUM_AGE};
use merged_consensus::Hash256;
use merged_primitives::{NetworkClass, OutPoint};
use tracing::{debug, info};

use crate::ask::AskPolicy;
use crate::broadcast::{identity_hash, MasternodeBroadcast};
use crate::context::ChainOracle;
use crate::entry::{ActiveState, Masternode, MasternodePing};
use crate::error::{GossipError, GossipErrorKind};
use crate::seen::SeenCaches;

/// What happened to an inbound ping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PingStatus {
    /// Installed on an enabled entry; relay it.
    Accepted,
    /// The entry is known but the ping changed nothing worth relaying.
    Known,
    /// No entry for this collateral; the caller should fetch it.
    Unknown,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NetworkCounts {
    pub ipv4: usize,
    pub ipv6: usize,
    pub onion: usize,
}

#[derive(Default)]
pub struct Registry {
    entries: Vec<Masternode>,
    seen: SeenCaches,
    ask: AskPolicy,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Append iff enabled and the collateral is not yet present.
    pub fn add(&mut self, entry: Masternode) -> bool {
        if !entry.is_enabled() {
            return false;
        }
        if self.find(&entry.collateral).is_some() {
            return false;
        }
        info!(
            collateral = %entry.collateral,
            count = self.entries.len() + 1,
            "adding new masternode"
        );
        self.entries.push(entry);
        true
    }

    pub fn remove(&mut self, collateral: &OutPoint) {
        if let Some(pos) = self
            .entries
            .iter()
            .position(|entry| entry.collateral == *collateral)
        {
            info!(
                collateral = %collateral,
                count = self.entries.len() - 1,
                "removing masternode"
            );
            self.entries.remove(pos);
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn find(&self, collateral: &OutPoint) -> Option<&Masternode> {
        self.entries
            .iter()
            .find(|entry| entry.collateral == *collateral)
    }

    fn find_mut(&mut self, collateral: &OutPoint) -> Option<&mut Masternode> {
        self.entries
            .iter_mut()
            .find(|entry| entry.collateral == *collateral)
    }

    pub fn get(&self, collateral: &OutPoint) -> Option<Masternode> {
        self.find(collateral).cloned()
    }

    pub fn contains(&self, collateral: &OutPoint) -> bool {
        self.find(collateral).is_some()
    }

    pub fn find_by_pubkey(&self, collateral_pubkey: &[u8]) -> Option<Masternode> {
        self.entries
            .iter()
            .find(|entry| entry.collateral_pubkey == collateral_pubkey)
            .cloned()
    }

    pub fn find_by_payee(&self, payee_script: &[u8]) -> Option<Masternode> {
        self.entries
            .iter()
            .find(|entry| entry.payee_script() == payee_script)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<Masternode> {
        self.entries.clone()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &Masternode> {
        self.entries.iter()
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = &mut Masternode> {
        self.entries.iter_mut()
    }

    pub fn seen(&self) -> &SeenCaches {
        &self.seen
    }

    pub fn seen_mut(&mut self) -> &mut SeenCaches {
        &mut self.seen
    }

    pub fn ask_mut(&mut self) -> &mut AskPolicy {
        &mut self.ask
    }

    /// Run every entry's state-machine tick.
    pub fn check(&mut self, now: i64, chain: &dyn ChainOracle) {
        for entry in &mut self.entries {
            entry.check(now, chain, false);
        }
    }

    /// Tick, sweep dead entries, then expire caches and throttles.
    pub fn check_and_remove(
        &mut self,
        now: i64,
        chain: &dyn ChainOracle,
        min_protocol: i32,
        force_expired: bool,
    ) {
        self.check(now, chain);

        let mut index = 0;
        while index < self.entries.len() {
            let entry = &self.entries[index];
            let dead = matches!(
                entry.active_state,
                ActiveState::Remove | ActiveState::VinSpent
            ) || (force_expired && entry.active_state == ActiveState::Expired)
                || entry.protocol_version < min_protocol;
            if dead {
                let collateral = entry.collateral;
                debug!(
                    collateral = %collateral,
                    state = %entry.active_state,
                    "sweeping masternode"
                );
                // Purging the cached broadcast lets a later ping re-trigger
                // the fetch without a brand-new announcement.
                self.seen.purge_broadcasts_for(&collateral);
                self.ask.forget_entry(&collateral);
                self.entries.remove(index);
            } else {
                index += 1;
            }
        }

        self.ask.sweep(now);
        self.seen.sweep(now);
    }

    pub fn count_enabled(&mut self, now: i64, chain: &dyn ChainOracle, min_protocol: i32) -> usize {
        let mut count = 0;
        for entry in &mut self.entries {
            entry.check(now, chain, false);
            if entry.protocol_version < min_protocol || !entry.is_enabled() {
                continue;
            }
            count += 1;
        }
        count
    }

    /// Enabled entries, additionally age-gated when payment enforcement is
    /// active.
    pub fn stable_size(
        &mut self,
        now: i64,
        chain: &dyn ChainOracle,
        min_protocol: i32,
        enforce_age: bool,
    ) -> usize {
        let mut count = 0;
        for entry in &mut self.entries {
            if entry.protocol_version < min_protocol {
                continue;
            }
            if enforce_age && now - entry.sig_time < MN_WINNER_MINIMUM_AGE {
                continue;
            }
            entry.check(now, chain, false);
            if !entry.is_enabled() {
                continue;
            }
            count += 1;
        }
        count
    }

    pub fn count_networks(&self) -> NetworkCounts {
        let mut counts = NetworkCounts::default();
        for entry in &self.entries {
            match entry.addr.network_class() {
                NetworkClass::IPv4 => counts.ipv4 += 1,
                NetworkClass::IPv6 => counts.ipv6 += 1,
                NetworkClass::Onion => counts.onion += 1,
            }
        }
        counts
    }

    /// The identity hash a broadcast for this entry would carry.
    pub fn broadcast_hash(entry: &Masternode) -> Hash256 {
        identity_hash(&entry.collateral, &entry.collateral_pubkey, entry.sig_time)
    }

    /// Refresh an existing entry from a newer broadcast. Returns whether an
    /// entry was updated.
    pub fn refresh_from_broadcast(&mut self, mnb: &MasternodeBroadcast, now: i64) -> bool {
        let Some(entry) = self.find_mut(&mnb.collateral) else {
            return false;
        };
        if entry.sig_time >= mnb.sig_time {
            return false;
        }
        if !entry.accepts_broadcast_at(now) {
            return false;
        }
        entry.update_from_broadcast(mnb);
        true
    }

    /// Install an inbound ping on its entry, per the liveness rules.
    pub fn apply_ping(
        &mut self,
        ping: &MasternodePing,
        now: i64,
        chain: &dyn ChainOracle,
        min_protocol: i32,
    ) -> Result<PingStatus, GossipError> {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.collateral == ping.collateral)
        else {
            return Ok(PingStatus::Unknown);
        };
        if entry.protocol_version < min_protocol {
            return Ok(PingStatus::Known);
        }
        if !entry.accepts_ping_at(ping.sig_time) {
            debug!(collateral = %ping.collateral, "ping arrived too early");
            return Ok(PingStatus::Known);
        }

        if ping.verify(&entry.operator_pubkey).is_err() {
            return Err(GossipError::with_dos(GossipErrorKind::BadSignature, 33));
        }

        // The referenced block must be known and near the tip.
        let Some(height) = chain.block_height(&ping.block_hash) else {
            debug!(collateral = %ping.collateral, "ping references unknown block");
            return Err(GossipError::new(GossipErrorKind::UnknownBlock));
        };
        if height < chain.tip_height() - MASTERNODE_PING_BLOCK_DEPTH {
            debug!(collateral = %ping.collateral, height, "ping references stale block");
            return Err(GossipError::new(GossipErrorKind::UnknownBlock));
        }

        entry.apply_ping(ping.clone());
        entry.check(now, chain, true);
        let enabled = entry.is_enabled();
        let hash = Self::broadcast_hash(entry);
        self.seen.refresh_broadcast_ping(&hash, ping);

        if enabled {
            Ok(PingStatus::Accepted)
        } else {
            Ok(PingStatus::Known)
        }
    }

    pub fn record_last_paid(&mut self, collateral: &OutPoint, paid_at: i64) {
        if let Some(entry) = self.find_mut(collateral) {
            entry.last_paid = paid_at;
        }
    }
}
