//! Overlay payload codecs.
//!
//! Pairs of `build_*`/`parse_*` functions between the typed core messages
//! and raw command payloads.

use merged_consensus::Hash256;
use merged_masternode::{
    Inventory, InvKind, MasternodeBroadcast, MasternodePing, NetMessage, OutboundMessage,
    SporkMessage,
};
use merged_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use merged_primitives::OutPoint;

pub const MSG_MNB: &str = "mnb";
pub const MSG_MNP: &str = "mnp";
pub const MSG_DSEG: &str = "dseg";
pub const MSG_SPORK: &str = "spork";
pub const MSG_GETSPORKS: &str = "getsporks";
pub const MSG_SSC: &str = "ssc";
pub const MSG_INV: &str = "inv";
pub const MSG_GETDATA: &str = "getdata";

const MAX_INV_RESULTS: usize = 50_000;

/// Parse an overlay command payload into a core message. Returns `Ok(None)`
/// for commands the overlay does not handle.
pub fn parse_net_message(command: &str, payload: &[u8]) -> Result<Option<NetMessage>, DecodeError> {
    let message = match command {
        MSG_MNB => {
            let mut decoder = Decoder::new(payload);
            let mnb = MasternodeBroadcast::consensus_decode(&mut decoder)?;
            ensure_consumed(&decoder)?;
            NetMessage::MasternodeBroadcast(mnb)
        }
        MSG_MNP => {
            let mut decoder = Decoder::new(payload);
            let mnp = MasternodePing::consensus_decode(&mut decoder)?;
            ensure_consumed(&decoder)?;
            NetMessage::MasternodePing(mnp)
        }
        MSG_DSEG => {
            let mut decoder = Decoder::new(payload);
            let vin = OutPoint::consensus_decode(&mut decoder)?;
            ensure_consumed(&decoder)?;
            NetMessage::Dseg(vin)
        }
        MSG_SPORK => {
            let mut decoder = Decoder::new(payload);
            let spork = SporkMessage::consensus_decode(&mut decoder)?;
            ensure_consumed(&decoder)?;
            NetMessage::Spork(spork)
        }
        MSG_GETSPORKS => NetMessage::GetSporks,
        _ => return Ok(None),
    };
    Ok(Some(message))
}

/// Render a core outbound message as `(command, payload)`.
pub fn build_outbound(message: &OutboundMessage) -> (&'static str, Vec<u8>) {
    match message {
        OutboundMessage::Dseg(vin) => {
            let mut encoder = Encoder::new();
            vin.consensus_encode(&mut encoder);
            (MSG_DSEG, encoder.into_inner())
        }
        OutboundMessage::Spork(spork) => {
            let mut encoder = Encoder::new();
            spork.consensus_encode(&mut encoder);
            (MSG_SPORK, encoder.into_inner())
        }
        OutboundMessage::SyncStatusCount { item, count } => {
            let mut encoder = Encoder::new();
            encoder.write_i32_le(*item);
            encoder.write_i32_le(*count);
            (MSG_SSC, encoder.into_inner())
        }
    }
}

pub fn build_broadcast_payload(mnb: &MasternodeBroadcast) -> Vec<u8> {
    let mut encoder = Encoder::new();
    mnb.consensus_encode(&mut encoder);
    encoder.into_inner()
}

pub fn build_ping_payload(ping: &MasternodePing) -> Vec<u8> {
    let mut encoder = Encoder::new();
    ping.consensus_encode(&mut encoder);
    encoder.into_inner()
}

pub fn build_inv_payload(inventories: &[Inventory]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(inventories.len() as u64);
    for inv in inventories {
        encoder.write_u32_le(inv.kind.wire_type());
        encoder.write_hash_le(&inv.hash);
    }
    encoder.into_inner()
}

/// Parse an inv/getdata payload, keeping only overlay inventory types.
pub fn parse_inv_payload(payload: &[u8]) -> Result<Vec<Inventory>, DecodeError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint()?;
    if count as usize > MAX_INV_RESULTS {
        return Err(DecodeError::OversizedLength);
    }
    let mut inventories = Vec::new();
    for _ in 0..count {
        let wire_type = decoder.read_u32_le()?;
        let hash: Hash256 = decoder.read_hash_le()?;
        if let Some(kind) = InvKind::from_wire(wire_type) {
            inventories.push(Inventory { kind, hash });
        }
    }
    Ok(inventories)
}

fn ensure_consumed(decoder: &Decoder<'_>) -> Result<(), DecodeError> {
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use merged_primitives::ServiceAddress;

    fn make_ping() -> MasternodePing {
        MasternodePing::new(OutPoint::new([0x11; 32], 0), [0x22; 32], 1_234)
    }

    #[test]
    fn overlay_messages_roundtrip() {
        let ping = make_ping();
        let parsed = parse_net_message(MSG_MNP, &build_ping_payload(&ping)).expect("parse");
        assert!(matches!(
            parsed,
            Some(NetMessage::MasternodePing(decoded)) if decoded == ping
        ));

        let mnb = MasternodeBroadcast {
            collateral: OutPoint::new([0x11; 32], 0),
            addr: ServiceAddress::new([0u8; 16], 9647),
            collateral_pubkey: vec![0x02; 33],
            operator_pubkey: vec![0x03; 33],
            sig: vec![0x04; 65],
            sig_time: 1_234,
            protocol_version: 70_920,
            last_ping: Some(make_ping()),
        };
        let parsed = parse_net_message(MSG_MNB, &build_broadcast_payload(&mnb)).expect("parse");
        assert!(matches!(
            parsed,
            Some(NetMessage::MasternodeBroadcast(decoded)) if decoded == mnb
        ));
    }

    #[test]
    fn outbound_dseg_roundtrips_through_parse() {
        let (command, payload) = build_outbound(&OutboundMessage::Dseg(OutPoint::null()));
        assert_eq!(command, MSG_DSEG);
        let parsed = parse_net_message(command, &payload).expect("parse");
        assert!(matches!(parsed, Some(NetMessage::Dseg(vin)) if vin.is_null()));
    }

    #[test]
    fn unknown_commands_are_ignored() {
        assert!(parse_net_message("headers", &[1, 2, 3])
            .expect("parse")
            .is_none());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut payload = build_ping_payload(&make_ping());
        payload.push(0);
        assert_eq!(
            parse_net_message(MSG_MNP, &payload),
            Err(DecodeError::TrailingBytes)
        );
    }

    #[test]
    fn inv_payload_filters_foreign_types() {
        let spork_inv = Inventory {
            kind: InvKind::Spork,
            hash: [0x55; 32],
        };
        let mut encoder = Encoder::new();
        encoder.write_varint(2);
        encoder.write_u32_le(2); // MSG_BLOCK, not an overlay type
        encoder.write_hash_le(&[0x66; 32]);
        encoder.write_u32_le(spork_inv.kind.wire_type());
        encoder.write_hash_le(&spork_inv.hash);

        let parsed = parse_inv_payload(&encoder.into_inner()).expect("parse");
        assert_eq!(parsed, vec![spork_inv]);
    }
}
