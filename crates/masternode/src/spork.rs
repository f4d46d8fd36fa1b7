//! The signed spork channel.
//!
//! Sporks are network-wide scalar flags keyed by a small integer id, signed
//! by the spork master key. The latest record by signed time wins; records
//! are installed or ignored, never deleted.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use merged_consensus::{ChainParams, Hash256};
use merged_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use merged_primitives::hash::sha256d;
use merged_script::message::{sign_message, verify_message, MessageError};
use secp256k1::SecretKey;
use tracing::{debug, info, warn};

use crate::context::{Inventory, InvKind, PeerId, PeerNetwork};
use crate::error::{GossipError, GossipErrorKind};

/// "Off until the far future" default for time-gated sporks (year 2099).
const TIME_GATED_DEFAULT: i64 = 4_070_908_800;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SporkId {
    MaxValue,
    MasternodeScanning,
    PaymentEnforcement,
    BudgetEnforcement,
    PayUpdatedNodes,
    EnableSuperblocks,
    ProtocolEnforcement2,
    ClientCompatMode,
}

impl SporkId {
    pub const ALL: [SporkId; 8] = [
        SporkId::MaxValue,
        SporkId::MasternodeScanning,
        SporkId::PaymentEnforcement,
        SporkId::BudgetEnforcement,
        SporkId::PayUpdatedNodes,
        SporkId::EnableSuperblocks,
        SporkId::ProtocolEnforcement2,
        SporkId::ClientCompatMode,
    ];

    pub fn id(self) -> i32 {
        match self {
            SporkId::MaxValue => 10004,
            SporkId::MasternodeScanning => 10006,
            SporkId::PaymentEnforcement => 10007,
            SporkId::BudgetEnforcement => 10008,
            SporkId::PayUpdatedNodes => 10009,
            SporkId::EnableSuperblocks => 10012,
            SporkId::ProtocolEnforcement2 => 10014,
            SporkId::ClientCompatMode => 10015,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|spork| spork.id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            SporkId::MaxValue => "SPORK_5_MAX_VALUE",
            SporkId::MasternodeScanning => "SPORK_7_MASTERNODE_SCANNING",
            SporkId::PaymentEnforcement => "SPORK_8_MASTERNODE_PAYMENT_ENFORCEMENT",
            SporkId::BudgetEnforcement => "SPORK_9_MASTERNODE_BUDGET_ENFORCEMENT",
            SporkId::PayUpdatedNodes => "SPORK_10_MASTERNODE_PAY_UPDATED_NODES",
            SporkId::EnableSuperblocks => "SPORK_13_ENABLE_SUPERBLOCKS",
            SporkId::ProtocolEnforcement2 => "SPORK_15_NEW_PROTOCOL_ENFORCEMENT_2",
            SporkId::ClientCompatMode => "SPORK_16_CLIENT_COMPAT_MODE",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|spork| spork.name() == name)
    }

    pub fn default_value(self) -> i64 {
        match self {
            SporkId::MaxValue => 1000,
            SporkId::MasternodeScanning => 978_307_200,
            _ => TIME_GATED_DEFAULT,
        }
    }
}

impl fmt::Display for SporkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SporkMessage {
    pub id: i32,
    pub value: i64,
    pub signed_time: i64,
    pub sig: Vec<u8>,
}

impl SporkMessage {
    pub fn new(id: i32, value: i64, signed_time: i64) -> Self {
        Self {
            id,
            value,
            signed_time,
            sig: Vec::new(),
        }
    }

    pub fn hash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        encoder.write_i32_le(self.id);
        encoder.write_i64_le(self.value);
        encoder.write_i64_le(self.signed_time);
        sha256d(&encoder.into_inner())
    }

    fn signed_payload(&self) -> Vec<u8> {
        format!("{}{}{}", self.id, self.value, self.signed_time).into_bytes()
    }

    pub fn sign(&mut self, secret: &SecretKey) -> Result<(), MessageError> {
        self.sig = sign_message(secret, &self.signed_payload())?;
        Ok(())
    }

    pub fn verify(&self, master_pubkey: &[u8]) -> Result<(), MessageError> {
        verify_message(master_pubkey, &self.sig, &self.signed_payload())
    }
}

impl Encodable for SporkMessage {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.id);
        encoder.write_i64_le(self.value);
        encoder.write_i64_le(self.signed_time);
        encoder.write_var_bytes(&self.sig);
    }
}

impl Decodable for SporkMessage {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            id: decoder.read_i32_le()?,
            value: decoder.read_i64_le()?,
            signed_time: decoder.read_i64_le()?,
            sig: decoder.read_var_bytes()?,
        })
    }
}

#[derive(Debug)]
pub enum SporkError {
    NoSigningKey,
    Signature(MessageError),
}

impl fmt::Display for SporkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SporkError::NoSigningKey => write!(f, "no spork signing key configured"),
            SporkError::Signature(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SporkError {}

impl From<MessageError> for SporkError {
    fn from(err: MessageError) -> Self {
        SporkError::Signature(err)
    }
}

#[derive(Default)]
struct SporkState {
    active: HashMap<i32, SporkMessage>,
    by_hash: HashMap<Hash256, SporkMessage>,
}

/// Latest authenticated value per spork id.
pub struct SporkStore {
    state: Mutex<SporkState>,
    master_pubkey: Vec<u8>,
    signing_key: Option<SecretKey>,
    /// Misbehavior applied to peers relaying sporks with bad signatures.
    /// `None` matches the long-standing network behavior of dropping without
    /// scoring, so peers forwarding obsolete sporks are not banned.
    misbehavior_score: Option<i32>,
}

impl SporkStore {
    pub fn new(params: &ChainParams) -> Self {
        let master_pubkey = hex_to_bytes(params.spork_pubkey).unwrap_or_default();
        if master_pubkey.is_empty() {
            warn!("spork master pubkey is not valid hex; all sporks will stay at defaults");
        }
        Self {
            state: Mutex::new(SporkState::default()),
            master_pubkey,
            signing_key: None,
            misbehavior_score: None,
        }
    }

    pub fn with_master_pubkey(pubkey: Vec<u8>) -> Self {
        Self {
            state: Mutex::new(SporkState::default()),
            master_pubkey: pubkey,
            signing_key: None,
            misbehavior_score: None,
        }
    }

    pub fn set_signing_key(&mut self, secret: SecretKey) {
        self.signing_key = Some(secret);
    }

    pub fn set_misbehavior_score(&mut self, score: Option<i32>) {
        self.misbehavior_score = score;
    }

    /// Handle an inbound `spork` message: install iff authenticated and
    /// strictly newer, then relay by inventory.
    pub fn process(
        &self,
        peer: PeerId,
        spork: SporkMessage,
        net: &dyn PeerNetwork,
    ) -> Result<bool, GossipError> {
        if let Ok(state) = self.state.lock() {
            if let Some(current) = state.active.get(&spork.id) {
                if current.signed_time >= spork.signed_time {
                    debug!(id = spork.id, "spork seen");
                    return Ok(false);
                }
            }
        }

        if spork.verify(&self.master_pubkey).is_err() {
            warn!(id = spork.id, %peer, "spork with invalid signature");
            if let Some(score) = self.misbehavior_score {
                net.misbehaving(peer, score);
            }
            return Err(GossipError::new(GossipErrorKind::BadSignature));
        }

        let hash = spork.hash();
        if let Ok(mut state) = self.state.lock() {
            state.by_hash.insert(hash, spork.clone());
            state.active.insert(spork.id, spork.clone());
        }
        info!(id = spork.id, value = spork.value, "spork updated");
        net.relay_inventory(Inventory {
            kind: InvKind::Spork,
            hash,
        });
        Ok(true)
    }

    /// Reply to `getsporks`: push every active record to the asking peer.
    pub fn serve_all(&self, peer: PeerId, net: &dyn PeerNetwork) {
        let records: Vec<SporkMessage> = match self.state.lock() {
            Ok(state) => state.active.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        for record in records {
            net.push_message(peer, crate::context::OutboundMessage::Spork(record));
        }
    }

    /// Sign and install a new value locally, then relay it.
    pub fn update(
        &self,
        id: SporkId,
        value: i64,
        signed_time: i64,
        net: &dyn PeerNetwork,
    ) -> Result<(), SporkError> {
        let secret = self.signing_key.as_ref().ok_or(SporkError::NoSigningKey)?;
        let mut spork = SporkMessage::new(id.id(), value, signed_time);
        spork.sign(secret)?;
        let hash = spork.hash();
        if let Ok(mut state) = self.state.lock() {
            state.by_hash.insert(hash, spork.clone());
            state.active.insert(spork.id, spork);
        }
        net.relay_inventory(Inventory {
            kind: InvKind::Spork,
            hash,
        });
        Ok(())
    }

    /// The network value for a spork, or its hard-coded default.
    pub fn value(&self, id: SporkId) -> i64 {
        match self.state.lock() {
            Ok(state) => state
                .active
                .get(&id.id())
                .map(|spork| spork.value)
                .unwrap_or_else(|| id.default_value()),
            Err(_) => id.default_value(),
        }
    }

    /// Raw lookup by wire id; unknown ids report -1 ("off").
    pub fn value_by_id(&self, id: i32) -> i64 {
        match SporkId::from_id(id) {
            Some(spork) => self.value(spork),
            None => {
                debug!(id, "unknown spork id");
                -1
            }
        }
    }

    /// A time-gated spork is active once its value falls behind the clock.
    pub fn is_active(&self, id: SporkId, now: i64) -> bool {
        self.value(id) < now
    }

    pub fn spork_by_hash(&self, hash: &Hash256) -> Option<SporkMessage> {
        match self.state.lock() {
            Ok(state) => state.by_hash.get(hash).cloned(),
            Err(_) => None,
        }
    }
}

fn hex_to_bytes(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    let mut iter = hex.as_bytes().iter().copied();
    while let (Some(high), Some(low)) = (iter.next(), iter.next()) {
        let high = (high as char).to_digit(16)? as u8;
        let low = (low as char).to_digit(16)? as u8;
        bytes.push(high << 4 | low);
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OutboundMessage;
    use merged_script::message::pubkey_for_secret;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Mutex as StdMutex;

    fn make_test_secret_key(last_byte: u8) -> SecretKey {
        let mut bytes = [0u8; 32];
        bytes[31] = last_byte;
        SecretKey::from_slice(&bytes).expect("secret key")
    }

    #[derive(Default)]
    struct RecordingNetwork {
        pushed: StdMutex<Vec<(PeerId, OutboundMessage)>>,
        relayed: StdMutex<Vec<Inventory>>,
        misbehavior: StdMutex<Vec<(PeerId, i32)>>,
    }

    impl PeerNetwork for RecordingNetwork {
        fn push_message(&self, peer: PeerId, message: OutboundMessage) {
            self.pushed.lock().expect("lock").push((peer, message));
        }

        fn push_inventory(&self, _peer: PeerId, _inv: Inventory) {}

        fn relay_inventory(&self, inv: Inventory) {
            self.relayed.lock().expect("lock").push(inv);
        }

        fn misbehaving(&self, peer: PeerId, score: i32) {
            self.misbehavior.lock().expect("lock").push((peer, score));
        }
    }

    fn test_peer() -> PeerId {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)), 9647)
    }

    fn store_with_master(secret: &SecretKey) -> SporkStore {
        SporkStore::with_master_pubkey(pubkey_for_secret(secret).serialize().to_vec())
    }

    fn signed_spork(secret: &SecretKey, id: SporkId, value: i64, time: i64) -> SporkMessage {
        let mut spork = SporkMessage::new(id.id(), value, time);
        spork.sign(secret).expect("sign");
        spork
    }

    #[test]
    fn defaults_apply_until_a_record_lands() {
        let store = store_with_master(&make_test_secret_key(1));
        assert_eq!(store.value(SporkId::MaxValue), 1000);
        assert_eq!(store.value(SporkId::PaymentEnforcement), TIME_GATED_DEFAULT);
        assert!(!store.is_active(SporkId::PaymentEnforcement, 2_000_000_000));
        assert_eq!(store.value_by_id(12345), -1);
    }

    #[test]
    fn installs_and_relays_authenticated_records() {
        let master = make_test_secret_key(1);
        let store = store_with_master(&master);
        let net = RecordingNetwork::default();
        let spork = signed_spork(&master, SporkId::PaymentEnforcement, 1_000, 5_000);

        let installed = store.process(test_peer(), spork.clone(), &net).expect("process");
        assert!(installed);
        assert_eq!(store.value(SporkId::PaymentEnforcement), 1_000);
        assert!(store.is_active(SporkId::PaymentEnforcement, 1_001));
        assert_eq!(net.relayed.lock().expect("lock").len(), 1);
        assert_eq!(store.spork_by_hash(&spork.hash()), Some(spork));
    }

    #[test]
    fn replacement_is_monotonic_in_signed_time() {
        let master = make_test_secret_key(1);
        let store = store_with_master(&master);
        let net = RecordingNetwork::default();

        let first = signed_spork(&master, SporkId::PaymentEnforcement, 1_000, 5_000);
        store.process(test_peer(), first, &net).expect("install");

        // Same signed time: ignored.
        let same = signed_spork(&master, SporkId::PaymentEnforcement, 2_000, 5_000);
        assert!(!store.process(test_peer(), same, &net).expect("seen"));
        assert_eq!(store.value(SporkId::PaymentEnforcement), 1_000);

        // Older: ignored.
        let older = signed_spork(&master, SporkId::PaymentEnforcement, 3_000, 4_999);
        assert!(!store.process(test_peer(), older, &net).expect("seen"));
        assert_eq!(store.value(SporkId::PaymentEnforcement), 1_000);

        // Strictly newer wins.
        let newer = signed_spork(&master, SporkId::PaymentEnforcement, 4_000, 5_001);
        assert!(store.process(test_peer(), newer, &net).expect("install"));
        assert_eq!(store.value(SporkId::PaymentEnforcement), 4_000);
    }

    #[test]
    fn bad_signature_drops_without_score_by_default() {
        let master = make_test_secret_key(1);
        let intruder = make_test_secret_key(2);
        let store = store_with_master(&master);
        let net = RecordingNetwork::default();

        let forged = signed_spork(&intruder, SporkId::PaymentEnforcement, 0, 5_000);
        let err = store.process(test_peer(), forged, &net).expect_err("forged");
        assert_eq!(err.kind, GossipErrorKind::BadSignature);
        assert!(net.misbehavior.lock().expect("lock").is_empty());
        assert_eq!(store.value(SporkId::PaymentEnforcement), TIME_GATED_DEFAULT);
    }

    #[test]
    fn misbehavior_knob_scores_forged_sporks() {
        let master = make_test_secret_key(1);
        let intruder = make_test_secret_key(2);
        let mut store = store_with_master(&master);
        store.set_misbehavior_score(Some(100));
        let net = RecordingNetwork::default();

        let forged = signed_spork(&intruder, SporkId::PaymentEnforcement, 0, 5_000);
        store
            .process(test_peer(), forged, &net)
            .expect_err("forged");
        assert_eq!(
            net.misbehavior.lock().expect("lock").as_slice(),
            &[(test_peer(), 100)]
        );
    }

    #[test]
    fn getsporks_serves_every_active_record() {
        let master = make_test_secret_key(1);
        let store = store_with_master(&master);
        let net = RecordingNetwork::default();
        for (spork_id, value) in [
            (SporkId::PaymentEnforcement, 1_000),
            (SporkId::EnableSuperblocks, 2_000),
        ] {
            let spork = signed_spork(&master, spork_id, value, 5_000);
            store.process(test_peer(), spork, &net).expect("install");
        }

        store.serve_all(test_peer(), &net);
        let pushed = net.pushed.lock().expect("lock");
        assert_eq!(pushed.len(), 2);
        assert!(pushed
            .iter()
            .all(|(_, msg)| matches!(msg, OutboundMessage::Spork(_))));
    }

    #[test]
    fn local_update_requires_and_uses_signing_key() {
        let master = make_test_secret_key(1);
        let mut store = store_with_master(&master);
        let net = RecordingNetwork::default();

        assert!(matches!(
            store.update(SporkId::MaxValue, 500, 6_000, &net),
            Err(SporkError::NoSigningKey)
        ));

        store.set_signing_key(master);
        store
            .update(SporkId::MaxValue, 500, 6_000, &net)
            .expect("update");
        assert_eq!(store.value(SporkId::MaxValue), 500);
        assert_eq!(net.relayed.lock().expect("lock").len(), 1);
    }

    #[test]
    fn wire_roundtrip() {
        let spork = signed_spork(&make_test_secret_key(1), SporkId::MaxValue, 77, 8_000);
        let mut encoder = Encoder::new();
        spork.consensus_encode(&mut encoder);
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        let decoded = SporkMessage::consensus_decode(&mut decoder).expect("decode");
        assert_eq!(decoded, spork);
        assert!(decoder.is_empty());
    }

    #[test]
    fn id_name_lookup_roundtrip() {
        for spork in SporkId::ALL {
            assert_eq!(SporkId::from_id(spork.id()), Some(spork));
            assert_eq!(SporkId::from_name(spork.name()), Some(spork));
        }
        assert_eq!(SporkId::from_id(1), None);
        assert_eq!(SporkId::from_name("SPORK_99"), None);
    }
}
