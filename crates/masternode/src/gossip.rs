//! Inbound gossip handling for the masternode overlay.
//!
//! One handler per wire command, all serialized behind a message lock so
//! concurrent peers cannot double-insert a just-seen broadcast. The registry
//! lock is taken briefly per step; outbound sends happen outside it.

use std::sync::{Arc, Mutex};

use merged_consensus::constants::{MASTERNODE_COLLATERAL, MASTERNODE_MIN_CONFIRMATIONS, SYNC_ITEM_MN_LIST};
use merged_consensus::ChainParams;
use merged_primitives::hash::hash160;
use merged_primitives::{OutPoint, ServiceAddress};
use tracing::{debug, info, warn};

use crate::broadcast::MasternodeBroadcast;
use crate::context::{
    ChainOracle, Inventory, InvKind, OutboundMessage, PaymentOracle, PeerId, PeerNetwork,
    SyncCoordinator,
};
use crate::entry::{Masternode, MasternodePing};
use crate::error::{GossipError, GossipErrorKind};
use crate::registry::{PingStatus, Registry};
use crate::spork::{SporkMessage, SporkStore};

/// A parsed overlay message.
#[derive(Clone, Debug, PartialEq)]
pub enum NetMessage {
    MasternodeBroadcast(MasternodeBroadcast),
    MasternodePing(MasternodePing),
    Dseg(OutPoint),
    Spork(SporkMessage),
    GetSporks,
}

pub struct GossipProtocol {
    registry: Arc<Mutex<Registry>>,
    sporks: Arc<SporkStore>,
    chain: Arc<dyn ChainOracle>,
    net: Arc<dyn PeerNetwork>,
    sync: Arc<dyn SyncCoordinator>,
    payments: Arc<dyn PaymentOracle>,
    params: ChainParams,
    message_lock: Mutex<()>,
}

impl GossipProtocol {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Mutex<Registry>>,
        sporks: Arc<SporkStore>,
        chain: Arc<dyn ChainOracle>,
        net: Arc<dyn PeerNetwork>,
        sync: Arc<dyn SyncCoordinator>,
        payments: Arc<dyn PaymentOracle>,
        params: ChainParams,
    ) -> Self {
        Self {
            registry,
            sporks,
            chain,
            net,
            sync,
            payments,
            params,
            message_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> Arc<Mutex<Registry>> {
        Arc::clone(&self.registry)
    }

    pub fn sporks(&self) -> Arc<SporkStore> {
        Arc::clone(&self.sporks)
    }

    /// Handle one inbound message. Everything is dropped until the chain is
    /// synced.
    pub fn process(&self, peer: PeerId, message: NetMessage) {
        if !self.sync.is_blockchain_synced() {
            return;
        }
        let Ok(_guard) = self.message_lock.lock() else {
            return;
        };
        match message {
            NetMessage::MasternodeBroadcast(mnb) => self.handle_broadcast(peer, mnb),
            NetMessage::MasternodePing(mnp) => self.handle_ping(peer, mnp),
            NetMessage::Dseg(vin) => self.handle_dseg(peer, vin),
            NetMessage::Spork(spork) => {
                let _ = self.sporks.process(peer, spork, &self.net);
            }
            NetMessage::GetSporks => self.sporks.serve_all(peer, &self.net),
        }
    }

    fn handle_broadcast(&self, peer: PeerId, mnb: MasternodeBroadcast) {
        let hash = mnb.hash();
        {
            let Ok(mut registry) = self.registry.lock() else {
                return;
            };
            if registry.seen().has_broadcast(&hash) {
                self.sync.noted_masternode_list_item(&hash);
                return;
            }
            registry.seen_mut().insert_broadcast(hash, mnb.clone());
        }

        let now = self.chain.adjusted_time();
        let min_protocol = self.payments.min_payment_protocol();
        if let Err(err) = mnb.check(now, min_protocol, &self.params) {
            debug!(collateral = %mnb.collateral, %err, "rejected masternode broadcast");
            if err.dos > 0 {
                self.net.misbehaving(peer, err.dos);
            }
            return;
        }

        // The announced key must own the collateral output. Expensive, so it
        // runs once per broadcast hash.
        if !self.vin_associated_with_pubkey(&mnb) {
            warn!(collateral = %mnb.collateral, "broadcast with mismatched pubkey and vin");
            self.net.misbehaving(peer, 33);
            return;
        }

        // A known entry only refreshes; admission is for new collaterals.
        let known = {
            let Ok(mut registry) = self.registry.lock() else {
                return;
            };
            match registry.get(&mnb.collateral) {
                Some(existing) => {
                    if existing.sig_time >= mnb.sig_time {
                        return;
                    }
                    if existing.collateral_pubkey == mnb.collateral_pubkey
                        && registry.refresh_from_broadcast(&mnb, now)
                    {
                        self.sync.noted_masternode_list_item(&hash);
                        self.net.relay_inventory(Inventory {
                            kind: InvKind::MasternodeAnnounce,
                            hash,
                        });
                    }
                    true
                }
                None => false,
            }
        };
        if known {
            return;
        }

        match self.check_inputs_and_add(&mnb) {
            Ok(()) => {
                self.sync.noted_masternode_list_item(&hash);
                self.net.relay_inventory(Inventory {
                    kind: InvKind::MasternodeAnnounce,
                    hash,
                });
            }
            Err(err) => {
                debug!(collateral = %mnb.collateral, %err, "rejected masternode entry");
                if err.dos > 0 {
                    self.net.misbehaving(peer, err.dos);
                }
            }
        }
    }

    /// Consult the chain for the collateral and admit the entry.
    fn check_inputs_and_add(&self, mnb: &MasternodeBroadcast) -> Result<(), GossipError> {
        let Some(utxo) = self.chain.collateral_utxo(&mnb.collateral) else {
            return Err(GossipError::new(GossipErrorKind::CollateralSpent));
        };

        let confirmations = self.chain.tip_height() - utxo.height + 1;
        if confirmations < i64::from(MASTERNODE_MIN_CONFIRMATIONS) {
            debug!(
                collateral = %mnb.collateral,
                confirmations,
                "collateral not mature yet"
            );
            return Err(GossipError::new(GossipErrorKind::CollateralInvalid));
        }

        // The announcement cannot predate the moment the collateral matured.
        let matured_height = utxo.height + i64::from(MASTERNODE_MIN_CONFIRMATIONS) - 1;
        if let Some(matured_time) = self.chain.block_time(matured_height) {
            if matured_time > mnb.sig_time {
                return Err(GossipError::with_dos(GossipErrorKind::BadTimestamp, 20));
            }
        }

        let entry = Masternode::from_broadcast(mnb);
        let Ok(mut registry) = self.registry.lock() else {
            return Ok(());
        };
        if registry.add(entry) {
            info!(collateral = %mnb.collateral, "masternode admitted");
            if let Some(ping) = &mnb.last_ping {
                registry.seen_mut().insert_ping(ping.hash(), ping.clone());
            }
        }
        Ok(())
    }

    fn vin_associated_with_pubkey(&self, mnb: &MasternodeBroadcast) -> bool {
        let Some(utxo) = self.chain.collateral_utxo(&mnb.collateral) else {
            return false;
        };
        if utxo.value != MASTERNODE_COLLATERAL {
            return false;
        }
        match utxo.key_hash {
            Some(key_hash) => key_hash == hash160(&mnb.collateral_pubkey),
            None => false,
        }
    }

    fn handle_ping(&self, peer: PeerId, mnp: MasternodePing) {
        let hash = mnp.hash();
        {
            let Ok(mut registry) = self.registry.lock() else {
                return;
            };
            if !registry.seen_mut().insert_ping(hash, mnp.clone()) {
                return;
            }
        }
        debug!(collateral = %mnp.collateral, "masternode ping");

        let now = self.chain.adjusted_time();
        if let Err(err) = mnp.check_times(now) {
            if err.dos > 0 {
                self.net.misbehaving(peer, err.dos);
            }
            return;
        }

        let status = {
            let Ok(mut registry) = self.registry.lock() else {
                return;
            };
            registry.apply_ping(
                &mnp,
                now,
                &self.chain,
                self.payments.min_payment_protocol(),
            )
        };
        match status {
            Ok(PingStatus::Accepted) => {
                self.net.relay_inventory(Inventory {
                    kind: InvKind::MasternodePing,
                    hash,
                });
            }
            Ok(PingStatus::Known) => {}
            Ok(PingStatus::Unknown) => {
                // Primary lazy-fetch path for entries whose broadcast we
                // missed.
                self.ask_for_entry(peer, mnp.collateral);
            }
            Err(err) => {
                debug!(collateral = %mnp.collateral, %err, "rejected masternode ping");
                if err.dos > 0 {
                    self.net.misbehaving(peer, err.dos);
                }
            }
        }
    }

    /// Ask one peer for one missing entry, throttled per collateral.
    pub fn ask_for_entry(&self, peer: PeerId, collateral: OutPoint) {
        let now = self.chain.adjusted_time();
        let allowed = {
            let Ok(mut registry) = self.registry.lock() else {
                return;
            };
            registry.ask_mut().note_entry_request(collateral, now)
        };
        if !allowed {
            return;
        }
        debug!(%collateral, "asking for missing masternode entry");
        self.net.push_message(peer, OutboundMessage::Dseg(collateral));
    }

    fn handle_dseg(&self, peer: PeerId, vin: OutPoint) {
        let now = self.chain.adjusted_time();
        let peer_addr = ServiceAddress::from(peer);

        if vin.is_null() {
            let local = peer_addr.is_rfc1918() || peer_addr.is_local();
            if !local && self.params.is_mainnet() {
                let allowed = {
                    let Ok(mut registry) = self.registry.lock() else {
                        return;
                    };
                    registry.ask_mut().note_peer_list_request(peer.ip(), now)
                };
                if !allowed {
                    warn!(%peer, "peer flooding dseg");
                    self.net.misbehaving(peer, 34);
                    return;
                }
            }
        }

        let mut inventories = Vec::new();
        let mut matched_single = false;
        {
            let Ok(mut registry) = self.registry.lock() else {
                return;
            };
            let entries = registry.snapshot();
            for entry in entries {
                if entry.addr.is_rfc1918() || !entry.is_enabled() {
                    continue;
                }
                if vin.is_null() || vin == entry.collateral {
                    let mnb = broadcast_for_entry(&entry);
                    let hash = mnb.hash();
                    inventories.push(Inventory {
                        kind: InvKind::MasternodeAnnounce,
                        hash,
                    });
                    registry.seen_mut().insert_broadcast(hash, mnb);
                    if vin == entry.collateral {
                        matched_single = true;
                        break;
                    }
                }
            }
        }

        for inv in &inventories {
            self.net.push_inventory(peer, *inv);
        }

        if vin.is_null() {
            debug!(%peer, count = inventories.len(), "served masternode list");
            self.net.push_message(
                peer,
                OutboundMessage::SyncStatusCount {
                    item: SYNC_ITEM_MN_LIST,
                    count: inventories.len() as i32,
                },
            );
        } else if matched_single {
            debug!(%peer, collateral = %vin, "served one masternode entry");
        } else {
            // We do not have it either; ask the requester in turn.
            self.ask_for_entry(peer, vin);
        }
    }

    /// Outbound list refresh toward one peer, throttled per peer address.
    pub fn dseg_update(&self, peer: PeerId) {
        let now = self.chain.adjusted_time();
        let peer_addr = ServiceAddress::from(peer);
        let local = peer_addr.is_rfc1918() || peer_addr.is_local();
        if !local {
            let allowed = {
                let Ok(mut registry) = self.registry.lock() else {
                    return;
                };
                registry.ask_mut().note_our_list_request(peer.ip(), now)
            };
            if !allowed {
                debug!(%peer, "already asked for the masternode list; skipping");
                return;
            }
        }
        debug!(%peer, "asking for the masternode list");
        self.net
            .push_message(peer, OutboundMessage::Dseg(OutPoint::null()));
    }

    /// Periodic maintenance: tick every entry and sweep the dead, then expire
    /// caches and throttles.
    pub fn maintain(&self, force_expired: bool) {
        let now = self.chain.adjusted_time();
        let min_protocol = self.payments.min_payment_protocol();
        let Ok(mut registry) = self.registry.lock() else {
            return;
        };
        registry.check_and_remove(now, &self.chain, min_protocol, force_expired);
    }
}

/// Reconstruct the announcement a registry entry was admitted from.
pub fn broadcast_for_entry(entry: &Masternode) -> MasternodeBroadcast {
    MasternodeBroadcast {
        collateral: entry.collateral,
        addr: entry.addr,
        collateral_pubkey: entry.collateral_pubkey.clone(),
        operator_pubkey: entry.operator_pubkey.clone(),
        sig: entry.sig.clone(),
        sig_time: entry.sig_time,
        protocol_version: entry.protocol_version,
        last_ping: entry.last_ping.clone(),
    }
}
