//! Seams to the rest of the node.
//!
//! The registry core never touches the chain, the socket layer, or the sync
//! state machine directly. Tests plug in in-memory fakes; the daemon plugs in
//! the real thing.

use std::net::SocketAddr;
use std::sync::Arc;

use merged_consensus::Hash256;
use merged_primitives::OutPoint;

use crate::spork::SporkMessage;

/// Peer identity at the overlay boundary.
pub type PeerId = SocketAddr;

/// Inventory type tags used on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum InvKind {
    Spork,
    MasternodeAnnounce,
    MasternodePing,
}

impl InvKind {
    pub fn wire_type(self) -> u32 {
        match self {
            InvKind::Spork => 6,
            InvKind::MasternodeAnnounce => 14,
            InvKind::MasternodePing => 15,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            6 => Some(InvKind::Spork),
            14 => Some(InvKind::MasternodeAnnounce),
            15 => Some(InvKind::MasternodePing),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Inventory {
    pub kind: InvKind,
    pub hash: Hash256,
}

/// Messages the core sends back out through the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundMessage {
    /// List/entry request; a null outpoint asks for the full list.
    Dseg(OutPoint),
    /// A full spork record (reply to `getsporks`).
    Spork(SporkMessage),
    /// Item count closing a full-list dseg walk.
    SyncStatusCount { item: i32, count: i32 },
}

/// A collateral output as seen by the chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CollateralInfo {
    pub value: i64,
    /// Height of the block the output was created in.
    pub height: i64,
    pub key_hash: Option<[u8; 20]>,
}

/// Chain access: block hashes and times by height, adjusted network time,
/// and UTXO lookup for collateral validation.
pub trait ChainOracle: Send + Sync {
    fn tip_height(&self) -> i64;
    fn block_hash(&self, height: i64) -> Option<Hash256>;
    fn block_height(&self, hash: &Hash256) -> Option<i64>;
    fn block_time(&self, height: i64) -> Option<i64>;
    fn adjusted_time(&self) -> i64;
    fn collateral_utxo(&self, outpoint: &OutPoint) -> Option<CollateralInfo>;
}

/// Per-peer sends, network-wide inventory relay, and misbehavior scoring.
pub trait PeerNetwork: Send + Sync {
    fn push_message(&self, peer: PeerId, message: OutboundMessage);
    fn push_inventory(&self, peer: PeerId, inv: Inventory);
    fn relay_inventory(&self, inv: Inventory);
    fn misbehaving(&self, peer: PeerId, score: i32);
}

/// The sync state machine's view of the world.
pub trait SyncCoordinator: Send + Sync {
    fn is_blockchain_synced(&self) -> bool;
    /// Progress callback: a masternode list item was received or re-seen.
    fn noted_masternode_list_item(&self, hash: &Hash256);
}

/// Payment-history questions the scheduler needs answered.
pub trait PaymentOracle: Send + Sync {
    /// Is this masternode already in the payment schedule near `height`
    /// (up to 8 blocks of look-ahead)?
    fn is_scheduled(&self, collateral: &OutPoint, payee_script: &[u8], height: i64) -> bool;
    /// Minimum protocol version eligible for payments.
    fn min_payment_protocol(&self) -> i32;
}

impl<T: ChainOracle + ?Sized> ChainOracle for Arc<T> {
    fn tip_height(&self) -> i64 {
        self.as_ref().tip_height()
    }

    fn block_hash(&self, height: i64) -> Option<Hash256> {
        self.as_ref().block_hash(height)
    }

    fn block_height(&self, hash: &Hash256) -> Option<i64> {
        self.as_ref().block_height(hash)
    }

    fn block_time(&self, height: i64) -> Option<i64> {
        self.as_ref().block_time(height)
    }

    fn adjusted_time(&self) -> i64 {
        self.as_ref().adjusted_time()
    }

    fn collateral_utxo(&self, outpoint: &OutPoint) -> Option<CollateralInfo> {
        self.as_ref().collateral_utxo(outpoint)
    }
}

impl<T: PeerNetwork + ?Sized> PeerNetwork for Arc<T> {
    fn push_message(&self, peer: PeerId, message: OutboundMessage) {
        self.as_ref().push_message(peer, message)
    }

    fn push_inventory(&self, peer: PeerId, inv: Inventory) {
        self.as_ref().push_inventory(peer, inv)
    }

    fn relay_inventory(&self, inv: Inventory) {
        self.as_ref().relay_inventory(inv)
    }

    fn misbehaving(&self, peer: PeerId, score: i32) {
        self.as_ref().misbehaving(peer, score)
    }
}

impl<T: SyncCoordinator + ?Sized> SyncCoordinator for Arc<T> {
    fn is_blockchain_synced(&self) -> bool {
        self.as_ref().is_blockchain_synced()
    }

    fn noted_masternode_list_item(&self, hash: &Hash256) {
        self.as_ref().noted_masternode_list_item(hash)
    }
}

impl<T: PaymentOracle + ?Sized> PaymentOracle for Arc<T> {
    fn is_scheduled(&self, collateral: &OutPoint, payee_script: &[u8], height: i64) -> bool {
        self.as_ref().is_scheduled(collateral, payee_script, height)
    }

    fn min_payment_protocol(&self) -> i32 {
        self.as_ref().min_payment_protocol()
    }
}
