//! Consensus-wide constants shared across the masternode overlay.

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 70920;
/// Oldest protocol version this node will still gossip with.
pub const MIN_PEER_PROTO_VERSION: i32 = 70918;

/// One coin in base units.
pub const COIN: i64 = 100_000_000;
/// Collateral bound to a masternode entry (network rule).
pub const MASTERNODE_COLLATERAL: i64 = 10_000 * COIN;
/// Average block spacing in seconds, used by the payment-age filter.
pub const TARGET_BLOCK_SPACING: i64 = 156;

/// Expected interval between liveness pings from an active masternode.
pub const MASTERNODE_PING_SECONDS: i64 = 5 * 60;
/// Minimum age of an announcement before the entry may leave PRE_ENABLED.
/// Also the re-ask interval for a single missing entry.
pub const MASTERNODE_MIN_MNP_SECONDS: i64 = 10 * 60;
/// Minimum interval between refreshes of an entry from a repeated broadcast.
pub const MASTERNODE_MIN_MNB_SECONDS: i64 = 5 * 60;
/// Per-peer throttle for full-list dseg requests.
pub const MASTERNODES_DSEG_SECONDS: i64 = 3 * 60 * 60;
/// An entry that has not pinged for this long is EXPIRED.
pub const MASTERNODE_EXPIRATION_SECONDS: i64 = 120 * 60;
/// An entry that has not pinged for this long is swept outright.
pub const MASTERNODE_REMOVAL_SECONDS: i64 = 130 * 60;
/// Throttle for per-entry state-machine ticks.
pub const MASTERNODE_CHECK_SECONDS: i64 = 5;
/// Minimum announcement age for payment and rank eligibility under spork 8
/// (network rule).
pub const MN_WINNER_MINIMUM_AGE: i64 = 4000;
/// Confirmations required on the collateral output before admission.
pub const MASTERNODE_MIN_CONFIRMATIONS: i32 = 15;
/// Tolerated clock drift on signed gossip timestamps.
pub const MASTERNODE_FUTURE_DRIFT: i64 = 60 * 60;
/// A ping referencing a block deeper than this below the tip is stale.
pub const MASTERNODE_PING_BLOCK_DEPTH: i64 = 24;

/// Sync item id carried by `ssc` replies to a full-list dseg.
pub const SYNC_ITEM_MN_LIST: i32 = 2;
