use std::fmt;

/// Why a gossip message was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipErrorKind {
    /// Chain not caught up; message dropped before parse.
    NotSynced,
    /// Duplicate hash already in the seen caches.
    Stale,
    /// Referenced block height/hash is not in the chain.
    UnknownBlock,
    /// Signature verification failed.
    BadSignature,
    /// Signed timestamp outside the tolerated drift window.
    BadTimestamp,
    /// Entry or message below the minimum protocol version.
    ProtocolObsolete,
    /// Collateral output is not in the UTXO set.
    CollateralSpent,
    /// Collateral exists but lacks confirmations, value, or key binding.
    CollateralInvalid,
    /// Service address advertises the wrong port for this network.
    WrongPort,
    /// Peer exceeded an ask-rate limit.
    Throttled,
    /// Message arrived before the minimum refresh interval elapsed.
    TooEarly,
}

impl fmt::Display for GossipErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GossipErrorKind::NotSynced => write!(f, "blockchain not synced"),
            GossipErrorKind::Stale => write!(f, "already seen"),
            GossipErrorKind::UnknownBlock => write!(f, "unknown block"),
            GossipErrorKind::BadSignature => write!(f, "bad signature"),
            GossipErrorKind::BadTimestamp => write!(f, "timestamp outside drift window"),
            GossipErrorKind::ProtocolObsolete => write!(f, "obsolete protocol version"),
            GossipErrorKind::CollateralSpent => write!(f, "collateral spent"),
            GossipErrorKind::CollateralInvalid => write!(f, "collateral invalid"),
            GossipErrorKind::WrongPort => write!(f, "wrong port for network"),
            GossipErrorKind::Throttled => write!(f, "ask rate exceeded"),
            GossipErrorKind::TooEarly => write!(f, "arrived too early"),
        }
    }
}

/// A rejection plus the misbehavior score it carries (0 = drop only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GossipError {
    pub kind: GossipErrorKind,
    pub dos: i32,
}

impl GossipError {
    pub fn new(kind: GossipErrorKind) -> Self {
        Self { kind, dos: 0 }
    }

    pub fn with_dos(kind: GossipErrorKind, dos: i32) -> Self {
        Self { kind, dos }
    }
}

impl fmt::Display for GossipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dos > 0 {
            write!(f, "{} (misbehavior {})", self.kind, self.dos)
        } else {
            write!(f, "{}", self.kind)
        }
    }
}

impl std::error::Error for GossipError {}
