//! Per-peer and per-entry ask throttles.

use std::collections::HashMap;
use std::net::IpAddr;

use merged_consensus::constants::{MASTERNODES_DSEG_SECONDS, MASTERNODE_MIN_MNP_SECONDS};
use merged_primitives::OutPoint;

/// Each map stores the earliest time the next ask is allowed again.
#[derive(Default)]
pub struct AskPolicy {
    asked_us: HashMap<IpAddr, i64>,
    we_asked_them: HashMap<IpAddr, i64>,
    we_asked_entry: HashMap<OutPoint, i64>,
}

impl AskPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A peer wants the full list: allowed only if its previous ask expired.
    pub fn note_peer_list_request(&mut self, peer: IpAddr, now: i64) -> bool {
        if let Some(next_allowed) = self.asked_us.get(&peer) {
            if now < *next_allowed {
                return false;
            }
        }
        self.asked_us.insert(peer, now + MASTERNODES_DSEG_SECONDS);
        true
    }

    /// We want the full list from a peer.
    pub fn note_our_list_request(&mut self, peer: IpAddr, now: i64) -> bool {
        if let Some(next_allowed) = self.we_asked_them.get(&peer) {
            if now < *next_allowed {
                return false;
            }
        }
        self.we_asked_them
            .insert(peer, now + MASTERNODES_DSEG_SECONDS);
        true
    }

    /// We want one specific entry.
    pub fn note_entry_request(&mut self, collateral: OutPoint, now: i64) -> bool {
        if let Some(next_allowed) = self.we_asked_entry.get(&collateral) {
            if now < *next_allowed {
                return false;
            }
        }
        self.we_asked_entry
            .insert(collateral, now + MASTERNODE_MIN_MNP_SECONDS);
        true
    }

    /// Allow a swept entry to be fetched again right away.
    pub fn forget_entry(&mut self, collateral: &OutPoint) {
        self.we_asked_entry.remove(collateral);
    }

    /// Drop throttle keys whose window has passed.
    pub fn sweep(&mut self, now: i64) {
        self.asked_us.retain(|_, next_allowed| *next_allowed >= now);
        self.we_asked_them
            .retain(|_, next_allowed| *next_allowed >= now);
        self.we_asked_entry
            .retain(|_, next_allowed| *next_allowed >= now);
    }

    pub fn asked_us_count(&self) -> usize {
        self.asked_us.len()
    }

    pub fn we_asked_count(&self) -> usize {
        self.we_asked_them.len()
    }

    pub fn entry_request_count(&self) -> usize {
        self.we_asked_entry.len()
    }
}
