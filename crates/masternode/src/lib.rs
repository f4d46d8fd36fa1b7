//! Masternode registry, spork channel, and payment scheduling.
//!
//! The overlay core: a gossiped set of collateral-backed service nodes, the
//! deterministic "who gets paid at height H" scheduler, and the signed spork
//! flag channel. Chain access, transport, and sync coordination stay behind
//! the traits in [`context`].

pub mod ask;
pub mod broadcast;
pub mod context;
pub mod entry;
pub mod error;
pub mod gossip;
pub mod payments;
pub mod registry;
pub mod score;
pub mod seen;
pub mod spork;

pub use broadcast::MasternodeBroadcast;
pub use context::{
    ChainOracle, CollateralInfo, Inventory, InvKind, OutboundMessage, PaymentOracle, PeerId,
    PeerNetwork, SyncCoordinator,
};
pub use entry::{ActiveState, Masternode, MasternodePing};
pub use error::{GossipError, GossipErrorKind};
pub use gossip::{broadcast_for_entry, GossipProtocol, NetMessage};
pub use payments::PaymentPicker;
pub use registry::{NetworkCounts, PingStatus, Registry};
pub use spork::{SporkId, SporkMessage, SporkStore};
