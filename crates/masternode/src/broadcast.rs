//! The masternode announcement message (`mnb`).

use merged_consensus::constants::MASTERNODE_FUTURE_DRIFT;
use merged_consensus::{ChainParams, Hash256};
use merged_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use merged_primitives::hash::sha256d;
use merged_primitives::{OutPoint, ServiceAddress};
use merged_script::message::{sign_message, verify_message, MessageError};
use secp256k1::{PublicKey, SecretKey};

use crate::entry::MasternodePing;
use crate::error::{GossipError, GossipErrorKind};

/// Announcement registering a masternode with the network.
///
/// Signed by the collateral key; the embedded ping is signed by the operator
/// key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasternodeBroadcast {
    pub collateral: OutPoint,
    pub addr: ServiceAddress,
    pub collateral_pubkey: Vec<u8>,
    pub operator_pubkey: Vec<u8>,
    pub sig: Vec<u8>,
    pub sig_time: i64,
    pub protocol_version: i32,
    pub last_ping: Option<MasternodePing>,
}

/// Identity hash of an announcement: collateral, collateral key, sig time.
/// Registry entries reconstruct it to locate their cached broadcast.
pub fn identity_hash(collateral: &OutPoint, collateral_pubkey: &[u8], sig_time: i64) -> Hash256 {
    let mut encoder = Encoder::new();
    collateral.consensus_encode(&mut encoder);
    encoder.write_var_bytes(collateral_pubkey);
    encoder.write_i64_le(sig_time);
    sha256d(&encoder.into_inner())
}

impl MasternodeBroadcast {
    /// Identity hash over the announcement's signed identity fields.
    pub fn hash(&self) -> Hash256 {
        identity_hash(&self.collateral, &self.collateral_pubkey, self.sig_time)
    }

    fn signed_payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(self.addr.to_string().as_bytes());
        payload.extend_from_slice(self.sig_time.to_string().as_bytes());
        payload.extend_from_slice(&self.collateral_pubkey);
        payload.extend_from_slice(&self.operator_pubkey);
        payload.extend_from_slice(self.protocol_version.to_string().as_bytes());
        payload
    }

    pub fn sign(&mut self, collateral_secret: &SecretKey) -> Result<(), MessageError> {
        self.sig = sign_message(collateral_secret, &self.signed_payload())?;
        Ok(())
    }

    pub fn verify(&self) -> Result<(), MessageError> {
        verify_message(&self.collateral_pubkey, &self.sig, &self.signed_payload())
    }

    /// Stateless validation: timestamp sanity, protocol floor, key material,
    /// signature, and the advertised port.
    pub fn check(&self, now: i64, min_protocol: i32, params: &ChainParams) -> Result<(), GossipError> {
        if self.sig_time > now + MASTERNODE_FUTURE_DRIFT {
            return Err(GossipError::with_dos(GossipErrorKind::BadTimestamp, 1));
        }

        if self.protocol_version < min_protocol {
            return Err(GossipError::new(GossipErrorKind::ProtocolObsolete));
        }

        if PublicKey::from_slice(&self.collateral_pubkey).is_err()
            || PublicKey::from_slice(&self.operator_pubkey).is_err()
        {
            return Err(GossipError::with_dos(GossipErrorKind::CollateralInvalid, 100));
        }

        if self.verify().is_err() {
            return Err(GossipError::with_dos(GossipErrorKind::BadSignature, 100));
        }

        if params.is_mainnet() {
            if self.addr.port != params.default_port {
                return Err(GossipError::new(GossipErrorKind::WrongPort));
            }
        } else if self.addr.port == merged_consensus::chain_params(
            merged_consensus::Network::Mainnet,
        )
        .default_port
        {
            return Err(GossipError::new(GossipErrorKind::WrongPort));
        }

        Ok(())
    }
}

impl Encodable for MasternodeBroadcast {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.collateral.consensus_encode(encoder);
        self.addr.consensus_encode(encoder);
        encoder.write_var_bytes(&self.collateral_pubkey);
        encoder.write_var_bytes(&self.operator_pubkey);
        encoder.write_var_bytes(&self.sig);
        encoder.write_i64_le(self.sig_time);
        encoder.write_i32_le(self.protocol_version);
        match &self.last_ping {
            Some(ping) => {
                encoder.write_u8(1);
                ping.consensus_encode(encoder);
            }
            None => encoder.write_u8(0),
        }
    }
}

impl Decodable for MasternodeBroadcast {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let collateral = OutPoint::consensus_decode(decoder)?;
        let addr = ServiceAddress::consensus_decode(decoder)?;
        let collateral_pubkey = decoder.read_var_bytes()?;
        let operator_pubkey = decoder.read_var_bytes()?;
        let sig = decoder.read_var_bytes()?;
        let sig_time = decoder.read_i64_le()?;
        let protocol_version = decoder.read_i32_le()?;
        let last_ping = if decoder.read_u8()? != 0 {
            Some(MasternodePing::consensus_decode(decoder)?)
        } else {
            None
        };
        Ok(Self {
            collateral,
            addr,
            collateral_pubkey,
            operator_pubkey,
            sig,
            sig_time,
            protocol_version,
            last_ping,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merged_consensus::{chain_params, Network};
    use merged_script::message::pubkey_for_secret;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn make_test_secret_key(last_byte: u8) -> SecretKey {
        let mut bytes = [0u8; 32];
        bytes[31] = last_byte;
        SecretKey::from_slice(&bytes).expect("secret key")
    }

    fn make_broadcast(port: u16) -> (MasternodeBroadcast, SecretKey) {
        let collateral_secret = make_test_secret_key(5);
        let operator_secret = make_test_secret_key(6);
        let mut mnb = MasternodeBroadcast {
            collateral: OutPoint::new([0x11; 32], 0),
            addr: ServiceAddress::from(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
                port,
            )),
            collateral_pubkey: pubkey_for_secret(&collateral_secret).serialize().to_vec(),
            operator_pubkey: pubkey_for_secret(&operator_secret).serialize().to_vec(),
            sig: Vec::new(),
            sig_time: 50_000,
            protocol_version: 70920,
            last_ping: None,
        };
        mnb.sign(&collateral_secret).expect("sign");
        (mnb, collateral_secret)
    }

    #[test]
    fn wire_roundtrip_with_and_without_ping() {
        let (mut mnb, _) = make_broadcast(9647);
        for ping in [None, Some(MasternodePing::new(mnb.collateral, [0x22; 32], 50_100))] {
            mnb.last_ping = ping;
            let mut encoder = Encoder::new();
            mnb.consensus_encode(&mut encoder);
            let bytes = encoder.into_inner();
            let mut decoder = Decoder::new(&bytes);
            let decoded = MasternodeBroadcast::consensus_decode(&mut decoder).expect("decode");
            assert_eq!(decoded, mnb);
            assert!(decoder.is_empty());
        }
    }

    #[test]
    fn check_accepts_valid_broadcast() {
        let (mnb, _) = make_broadcast(9647);
        let params = chain_params(Network::Mainnet);
        mnb.check(50_100, 70918, &params).expect("valid broadcast");
    }

    #[test]
    fn check_rejects_future_sig_time_with_dos_one() {
        let (mnb, _) = make_broadcast(9647);
        let params = chain_params(Network::Mainnet);
        let err = mnb
            .check(mnb.sig_time - MASTERNODE_FUTURE_DRIFT - 1, 70918, &params)
            .expect_err("future sig time");
        assert_eq!(err.kind, GossipErrorKind::BadTimestamp);
        assert_eq!(err.dos, 1);
    }

    #[test]
    fn check_rejects_obsolete_protocol_without_dos() {
        let (mnb, _) = make_broadcast(9647);
        let params = chain_params(Network::Mainnet);
        let err = mnb.check(50_100, 80_000, &params).expect_err("obsolete");
        assert_eq!(err.kind, GossipErrorKind::ProtocolObsolete);
        assert_eq!(err.dos, 0);
    }

    #[test]
    fn check_rejects_tampered_signature_with_dos_100() {
        let (mut mnb, _) = make_broadcast(9647);
        mnb.sig_time += 1;
        let params = chain_params(Network::Mainnet);
        let err = mnb.check(50_101, 70918, &params).expect_err("tampered");
        assert_eq!(err.kind, GossipErrorKind::BadSignature);
        assert_eq!(err.dos, 100);
    }

    #[test]
    fn check_rejects_malformed_pubkey_with_dos_100() {
        let (mut mnb, _) = make_broadcast(9647);
        mnb.operator_pubkey = vec![0xff; 33];
        let params = chain_params(Network::Mainnet);
        let err = mnb.check(50_100, 70918, &params).expect_err("bad pubkey");
        assert_eq!(err.kind, GossipErrorKind::CollateralInvalid);
        assert_eq!(err.dos, 100);
    }

    #[test]
    fn check_enforces_network_port() {
        let params = chain_params(Network::Mainnet);
        let (mnb, _) = make_broadcast(19647);
        let err = mnb.check(50_100, 70918, &params).expect_err("wrong port");
        assert_eq!(err.kind, GossipErrorKind::WrongPort);

        // Mainnet port is refused off-mainnet.
        let testnet = chain_params(Network::Testnet);
        let (mnb, _) = make_broadcast(9647);
        let err = mnb.check(50_100, 70918, &testnet).expect_err("mainnet port");
        assert_eq!(err.kind, GossipErrorKind::WrongPort);
    }

    #[test]
    fn hash_ignores_mutable_fields() {
        let (mut mnb, _) = make_broadcast(9647);
        let hash = mnb.hash();
        mnb.last_ping = Some(MasternodePing::new(mnb.collateral, [0x22; 32], 50_100));
        mnb.protocol_version += 1;
        assert_eq!(mnb.hash(), hash);
        mnb.sig_time += 1;
        assert_ne!(mnb.hash(), hash);
    }
}
