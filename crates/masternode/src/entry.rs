//! One registered masternode and its liveness state machine.

use std::fmt;

use merged_consensus::constants::{
    MASTERNODE_CHECK_SECONDS, MASTERNODE_EXPIRATION_SECONDS, MASTERNODE_FUTURE_DRIFT,
    MASTERNODE_MIN_MNB_SECONDS, MASTERNODE_MIN_MNP_SECONDS, MASTERNODE_REMOVAL_SECONDS,
};
use merged_consensus::Hash256;
use merged_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use merged_primitives::hash::{hash256_to_hex, sha256d};
use merged_primitives::{OutPoint, ServiceAddress};
use merged_script::message::{sign_message, verify_message, MessageError};
use primitive_types::U256;
use secp256k1::SecretKey;

use crate::broadcast::MasternodeBroadcast;
use crate::context::ChainOracle;
use crate::error::{GossipError, GossipErrorKind};
use crate::score::u256_to_compact;

/// Where an entry sits in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ActiveState {
    PreEnabled,
    Enabled,
    Expired,
    Remove,
    VinSpent,
    PoseBan,
}

impl ActiveState {
    pub fn as_str(self) -> &'static str {
        match self {
            ActiveState::PreEnabled => "PRE_ENABLED",
            ActiveState::Enabled => "ENABLED",
            ActiveState::Expired => "EXPIRED",
            ActiveState::Remove => "REMOVE",
            ActiveState::VinSpent => "VIN_SPENT",
            ActiveState::PoseBan => "POSE_BAN",
        }
    }
}

impl fmt::Display for ActiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A signed liveness ping from a masternode's operator key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasternodePing {
    pub collateral: OutPoint,
    /// A recent block hash, proving the operator follows the chain.
    pub block_hash: Hash256,
    pub sig_time: i64,
    pub sig: Vec<u8>,
}

impl MasternodePing {
    pub fn new(collateral: OutPoint, block_hash: Hash256, sig_time: i64) -> Self {
        Self {
            collateral,
            block_hash,
            sig_time,
            sig: Vec::new(),
        }
    }

    /// Identity hash over the signed fields.
    pub fn hash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.collateral.consensus_encode(&mut encoder);
        encoder.write_hash_le(&self.block_hash);
        encoder.write_i64_le(self.sig_time);
        sha256d(&encoder.into_inner())
    }

    fn signed_payload(&self) -> Vec<u8> {
        format!(
            "{}{}{}",
            self.collateral,
            hash256_to_hex(&self.block_hash),
            self.sig_time
        )
        .into_bytes()
    }

    pub fn sign(&mut self, secret: &SecretKey) -> Result<(), MessageError> {
        self.sig = sign_message(secret, &self.signed_payload())?;
        Ok(())
    }

    pub fn verify(&self, operator_pubkey: &[u8]) -> Result<(), MessageError> {
        verify_message(operator_pubkey, &self.sig, &self.signed_payload())
    }

    /// Reject sig times outside the tolerated drift window around `now`.
    pub fn check_times(&self, now: i64) -> Result<(), GossipError> {
        if self.sig_time > now + MASTERNODE_FUTURE_DRIFT {
            return Err(GossipError::with_dos(GossipErrorKind::BadTimestamp, 1));
        }
        if self.sig_time <= now - MASTERNODE_FUTURE_DRIFT {
            return Err(GossipError::with_dos(GossipErrorKind::BadTimestamp, 1));
        }
        Ok(())
    }
}

impl Encodable for MasternodePing {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.collateral.consensus_encode(encoder);
        encoder.write_hash_le(&self.block_hash);
        encoder.write_i64_le(self.sig_time);
        encoder.write_var_bytes(&self.sig);
    }
}

impl Decodable for MasternodePing {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            collateral: OutPoint::consensus_decode(decoder)?,
            block_hash: decoder.read_hash_le()?,
            sig_time: decoder.read_i64_le()?,
            sig: decoder.read_var_bytes()?,
        })
    }
}

/// A registered masternode.
#[derive(Clone, Debug)]
pub struct Masternode {
    pub collateral: OutPoint,
    pub addr: ServiceAddress,
    pub collateral_pubkey: Vec<u8>,
    pub operator_pubkey: Vec<u8>,
    pub sig: Vec<u8>,
    pub sig_time: i64,
    pub protocol_version: i32,
    pub last_ping: Option<MasternodePing>,
    /// Unix time of the last payout, 0 if never observed.
    pub last_paid: i64,
    pub active_state: ActiveState,
    last_checked: i64,
}

impl Masternode {
    pub fn from_broadcast(mnb: &MasternodeBroadcast) -> Self {
        Self {
            collateral: mnb.collateral,
            addr: mnb.addr,
            collateral_pubkey: mnb.collateral_pubkey.clone(),
            operator_pubkey: mnb.operator_pubkey.clone(),
            sig: mnb.sig.clone(),
            sig_time: mnb.sig_time,
            protocol_version: mnb.protocol_version,
            last_ping: mnb.last_ping.clone(),
            last_paid: 0,
            // Admitted as enabled; the first tick demotes young entries to
            // PRE_ENABLED.
            active_state: ActiveState::Enabled,
            last_checked: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.active_state == ActiveState::Enabled
    }

    /// Seconds since the freshest signed evidence of life.
    fn ping_age(&self, now: i64) -> i64 {
        match &self.last_ping {
            Some(ping) => now - ping.sig_time,
            None => now - self.sig_time,
        }
    }

    pub fn pinged_within(&self, seconds: i64, now: i64) -> bool {
        self.ping_age(now) < seconds
    }

    pub fn broadcasted_within(&self, seconds: i64, now: i64) -> bool {
        now - self.sig_time < seconds
    }

    /// Whether a ping at `sig_time` is fresh enough to replace the current
    /// one. Pings repeat faster than the update interval and are dropped.
    pub fn accepts_ping_at(&self, sig_time: i64) -> bool {
        match &self.last_ping {
            Some(ping) => sig_time - ping.sig_time >= MASTERNODE_MIN_MNP_SECONDS - 60,
            None => true,
        }
    }

    /// Whether a repeated broadcast may refresh this entry yet.
    pub fn accepts_broadcast_at(&self, now: i64) -> bool {
        !self.broadcasted_within(MASTERNODE_MIN_MNB_SECONDS, now)
    }

    /// The p2pkh script the collateral key gets paid to.
    pub fn payee_script(&self) -> Vec<u8> {
        merged_script::standard::p2pkh_script_for_pubkey(&self.collateral_pubkey)
    }

    /// Confirmations on the collateral output, 0 if it is gone.
    pub fn collateral_confirmations(&self, chain: &dyn ChainOracle) -> i64 {
        match chain.collateral_utxo(&self.collateral) {
            Some(info) => (chain.tip_height() - info.height + 1).max(0),
            None => 0,
        }
    }

    /// Seconds since the last payout, with a deterministic large value for
    /// entries never paid within a month so they order stably.
    pub fn seconds_since_payment(&self, now: i64) -> i64 {
        let seconds = now - self.last_paid;
        let month = 60 * 60 * 24 * 30;
        if seconds < month {
            return seconds;
        }
        let mut encoder = Encoder::new();
        self.collateral.consensus_encode(&mut encoder);
        encoder.write_i64_le(self.sig_time);
        let hash = sha256d(&encoder.into_inner());
        month + u256_to_compact(U256::from_big_endian(&hash)) as i64
    }

    /// Run the activity state machine. Throttled to once per
    /// `MASTERNODE_CHECK_SECONDS` unless forced.
    pub fn check(&mut self, now: i64, chain: &dyn ChainOracle, force: bool) {
        if !force && now - self.last_checked < MASTERNODE_CHECK_SECONDS {
            return;
        }
        self.last_checked = now;

        // Terminal states.
        if matches!(
            self.active_state,
            ActiveState::VinSpent | ActiveState::PoseBan
        ) {
            return;
        }

        if !self.pinged_within(MASTERNODE_REMOVAL_SECONDS, now) {
            self.active_state = ActiveState::Remove;
            return;
        }
        if !self.pinged_within(MASTERNODE_EXPIRATION_SECONDS, now) {
            self.active_state = ActiveState::Expired;
            return;
        }

        let announced_long_enough = match &self.last_ping {
            Some(ping) => ping.sig_time - self.sig_time >= MASTERNODE_MIN_MNP_SECONDS,
            None => false,
        };
        if !announced_long_enough {
            self.active_state = ActiveState::PreEnabled;
            return;
        }

        if chain.collateral_utxo(&self.collateral).is_none() {
            self.active_state = ActiveState::VinSpent;
            return;
        }

        self.active_state = ActiveState::Enabled;
    }

    /// Refresh identity fields from a newer broadcast for the same
    /// collateral.
    pub fn update_from_broadcast(&mut self, mnb: &MasternodeBroadcast) {
        self.addr = mnb.addr;
        self.collateral_pubkey = mnb.collateral_pubkey.clone();
        self.operator_pubkey = mnb.operator_pubkey.clone();
        self.sig = mnb.sig.clone();
        self.sig_time = mnb.sig_time;
        self.protocol_version = mnb.protocol_version;
        if let Some(ping) = &mnb.last_ping {
            self.last_ping = Some(ping.clone());
        }
        self.last_checked = 0;
    }

    /// Install a fresher ping.
    pub fn apply_ping(&mut self, ping: MasternodePing) {
        self.last_ping = Some(ping);
        self.last_checked = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CollateralInfo;
    use std::sync::Mutex;

    struct MockChain {
        utxo_present: Mutex<bool>,
    }

    impl MockChain {
        fn new(present: bool) -> Self {
            Self {
                utxo_present: Mutex::new(present),
            }
        }
    }

    impl ChainOracle for MockChain {
        fn tip_height(&self) -> i64 {
            1000
        }

        fn block_hash(&self, _height: i64) -> Option<Hash256> {
            None
        }

        fn block_height(&self, _hash: &Hash256) -> Option<i64> {
            None
        }

        fn block_time(&self, _height: i64) -> Option<i64> {
            None
        }

        fn adjusted_time(&self) -> i64 {
            0
        }

        fn collateral_utxo(&self, _outpoint: &OutPoint) -> Option<CollateralInfo> {
            self.utxo_present.lock().expect("lock").then_some(CollateralInfo {
                value: 0,
                height: 900,
                key_hash: None,
            })
        }
    }

    fn make_entry(sig_time: i64) -> Masternode {
        Masternode {
            collateral: OutPoint::new([0x11; 32], 0),
            addr: ServiceAddress::new([0u8; 16], 9647),
            collateral_pubkey: vec![0x02; 33],
            operator_pubkey: vec![0x03; 33],
            sig: Vec::new(),
            sig_time,
            protocol_version: 70920,
            last_ping: None,
            last_paid: 0,
            active_state: ActiveState::PreEnabled,
            last_checked: 0,
        }
    }

    fn ping_at(entry: &Masternode, sig_time: i64) -> MasternodePing {
        MasternodePing::new(entry.collateral, [0x22; 32], sig_time)
    }

    #[test]
    fn fresh_entry_without_mature_ping_stays_pre_enabled() {
        let chain = MockChain::new(true);
        let mut entry = make_entry(10_000);
        entry.apply_ping(ping_at(&entry, 10_030));
        entry.check(10_060, &chain, true);
        assert_eq!(entry.active_state, ActiveState::PreEnabled);
    }

    #[test]
    fn mature_ping_enables_entry() {
        let chain = MockChain::new(true);
        let mut entry = make_entry(10_000);
        entry.apply_ping(ping_at(&entry, 10_000 + MASTERNODE_MIN_MNP_SECONDS));
        entry.check(11_000, &chain, true);
        assert_eq!(entry.active_state, ActiveState::Enabled);
    }

    #[test]
    fn silence_expires_then_removes() {
        let chain = MockChain::new(true);
        let mut entry = make_entry(10_000);
        entry.apply_ping(ping_at(&entry, 10_600));

        entry.check(10_600 + MASTERNODE_EXPIRATION_SECONDS + 1, &chain, true);
        assert_eq!(entry.active_state, ActiveState::Expired);

        entry.check(10_600 + MASTERNODE_REMOVAL_SECONDS + 1, &chain, true);
        assert_eq!(entry.active_state, ActiveState::Remove);
    }

    #[test]
    fn spent_collateral_is_terminal() {
        let chain = MockChain::new(false);
        let mut entry = make_entry(10_000);
        entry.apply_ping(ping_at(&entry, 10_000 + MASTERNODE_MIN_MNP_SECONDS));
        entry.check(11_000, &chain, true);
        assert_eq!(entry.active_state, ActiveState::VinSpent);

        // The output coming back does not resurrect the entry.
        *chain.utxo_present.lock().expect("lock") = true;
        entry.check(11_100, &chain, true);
        assert_eq!(entry.active_state, ActiveState::VinSpent);
    }

    #[test]
    fn tick_is_throttled_without_force() {
        let chain = MockChain::new(true);
        let mut entry = make_entry(10_000);
        entry.apply_ping(ping_at(&entry, 10_600));
        entry.check(11_000, &chain, true);
        assert_eq!(entry.active_state, ActiveState::Enabled);

        // Age the ping out from under the entry: a throttled tick does not
        // notice, a forced one does.
        entry.last_ping = Some(ping_at(&entry, 100));
        entry.check(11_002, &chain, false);
        assert_eq!(entry.active_state, ActiveState::Enabled);
        entry.check(11_002, &chain, true);
        assert_eq!(entry.active_state, ActiveState::Remove);
    }

    #[test]
    fn ping_freshness_gate() {
        let mut entry = make_entry(10_000);
        assert!(entry.accepts_ping_at(10_001));
        entry.apply_ping(ping_at(&entry, 10_600));
        assert!(!entry.accepts_ping_at(10_700));
        assert!(entry.accepts_ping_at(10_600 + MASTERNODE_MIN_MNP_SECONDS - 60));
    }

    #[test]
    fn never_paid_entries_get_stable_large_age() {
        let entry = make_entry(10_000);
        let now = 100_000_000;
        let first = entry.seconds_since_payment(now);
        let month = 60 * 60 * 24 * 30;
        assert!(first > month);
        assert_eq!(first, entry.seconds_since_payment(now + 500));

        let mut paid = make_entry(10_000);
        paid.last_paid = now - 50;
        assert_eq!(paid.seconds_since_payment(now), 50);
    }

    #[test]
    fn ping_sign_verify_roundtrip() {
        let secret = {
            let mut bytes = [0u8; 32];
            bytes[31] = 9;
            SecretKey::from_slice(&bytes).expect("secret key")
        };
        let pubkey = merged_script::message::pubkey_for_secret(&secret);
        let mut ping = MasternodePing::new(OutPoint::new([0x11; 32], 1), [0x22; 32], 1234);
        ping.sign(&secret).expect("sign");
        ping.verify(&pubkey.serialize()).expect("verify");

        let mut tampered = ping.clone();
        tampered.sig_time += 1;
        assert!(tampered.verify(&pubkey.serialize()).is_err());
    }

    #[test]
    fn ping_drift_window() {
        let ping = MasternodePing::new(OutPoint::new([0x11; 32], 1), [0x22; 32], 10_000);
        assert!(ping.check_times(10_000).is_ok());
        assert!(ping.check_times(10_000 + MASTERNODE_FUTURE_DRIFT - 1).is_ok());
        // Too old once now - drift catches up to the sig time.
        assert!(ping.check_times(10_000 + MASTERNODE_FUTURE_DRIFT).is_err());
        // Too far in the future.
        assert!(ping
            .check_times(10_000 - MASTERNODE_FUTURE_DRIFT - 1)
            .is_err());
    }
}
