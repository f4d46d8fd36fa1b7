//! P2P message framing, peer handshake, and the peer hub.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use merged_consensus::constants::PROTOCOL_VERSION;
use merged_masternode::{Inventory, OutboundMessage, PeerId, PeerNetwork};
use merged_primitives::encoding::{Decoder, Encoder};
use merged_primitives::hash::sha256d;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::wire;

const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;
const NODE_NETWORK: u64 = 1;
const USER_AGENT: &str = "/merged:0.1.0/";
/// Accumulated misbehavior at which a peer is disconnected and banned.
const MISBEHAVING_THRESHOLD: i32 = 100;
const MISBEHAVING_BAN_SECS: u64 = 60 * 60 * 24;

pub struct Peer {
    stream: TcpStream,
    magic: [u8; 4],
    addr: PeerId,
    remote_version: i32,
    remote_user_agent: String,
    remote_height: i32,
}

impl Peer {
    pub fn new(stream: TcpStream, addr: PeerId, magic: [u8; 4]) -> Self {
        Self {
            stream,
            magic,
            addr,
            remote_version: 0,
            remote_user_agent: String::new(),
            remote_height: -1,
        }
    }

    pub async fn connect(addr: PeerId, magic: [u8; 4]) -> Result<Self, String> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| err.to_string())?;
        Ok(Self::new(stream, addr, magic))
    }

    pub fn addr(&self) -> PeerId {
        self.addr
    }

    pub fn remote_version(&self) -> i32 {
        self.remote_version
    }

    pub fn remote_user_agent(&self) -> &str {
        &self.remote_user_agent
    }

    pub fn remote_height(&self) -> i32 {
        self.remote_height
    }

    pub async fn send_message(&mut self, command: &str, payload: &[u8]) -> Result<(), String> {
        let mut frame = Vec::with_capacity(24 + payload.len());
        frame.extend_from_slice(&self.magic);
        let mut command_bytes = [0u8; 12];
        let cmd = command.as_bytes();
        if cmd.len() > 12 {
            return Err("command too long".to_string());
        }
        command_bytes[..cmd.len()].copy_from_slice(cmd);
        frame.extend_from_slice(&command_bytes);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        let checksum = sha256d(payload);
        frame.extend_from_slice(&checksum[..4]);
        frame.extend_from_slice(payload);
        self.stream
            .write_all(&frame)
            .await
            .map_err(|err| err.to_string())
    }

    pub async fn read_message(&mut self) -> Result<(String, Vec<u8>), String> {
        let mut header = [0u8; 24];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(|err| err.to_string())?;
        if header[..4] != self.magic {
            return Err("invalid magic".to_string());
        }
        let command = header[4..16]
            .iter()
            .take_while(|byte| **byte != 0)
            .map(|byte| *byte as char)
            .collect::<String>();
        let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err("payload too large".to_string());
        }
        let checksum = [header[20], header[21], header[22], header[23]];
        let mut payload = vec![0u8; length];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|err| err.to_string())?;
        let calc = sha256d(&payload);
        if checksum != calc[..4] {
            return Err("invalid payload checksum".to_string());
        }
        Ok((command, payload))
    }

    /// Exchange version/verack in either direction.
    pub async fn handshake(&mut self, start_height: i32) -> Result<(), String> {
        let payload = build_version_payload(start_height);
        self.send_message("version", &payload).await?;

        let mut got_verack = false;
        let mut got_version = false;
        while !(got_verack && got_version) {
            let (command, payload) = self.read_message().await?;
            match command.as_str() {
                "version" => {
                    got_version = true;
                    self.send_message("verack", &[]).await?;
                    if let Ok(info) = parse_version(&payload) {
                        self.remote_version = info.version;
                        self.remote_user_agent = info.user_agent;
                        self.remote_height = info.start_height;
                    }
                }
                "verack" => {
                    got_verack = true;
                }
                "ping" => {
                    self.send_message("pong", &payload).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Work queued toward a peer's writer half.
#[derive(Debug)]
pub enum PeerCommand {
    Send { command: String, payload: Vec<u8> },
    Disconnect,
}

/// Connected peers and their misbehavior ledger. The core talks to the
/// network exclusively through this hub.
#[derive(Default)]
pub struct PeerHub {
    peers: Mutex<HashMap<PeerId, mpsc::UnboundedSender<PeerCommand>>>,
    scores: Mutex<HashMap<IpAddr, i32>>,
    banned: Mutex<HashMap<IpAddr, Instant>>,
}

impl PeerHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: PeerId, sender: mpsc::UnboundedSender<PeerCommand>) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(peer, sender);
        }
    }

    pub fn remove(&self, peer: PeerId) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.remove(&peer);
        }
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers
            .lock()
            .map(|peers| peers.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.peers.lock().map(|peers| peers.len()).unwrap_or(0)
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let Ok(mut banned) = self.banned.lock() else {
            return false;
        };
        if let Some(until) = banned.get(&ip).copied() {
            if until > now {
                return true;
            }
            banned.remove(&ip);
        }
        false
    }

    pub fn ban_for(&self, ip: IpAddr, secs: u64) {
        if let Ok(mut banned) = self.banned.lock() {
            banned.insert(ip, Instant::now() + Duration::from_secs(secs));
        }
    }

    fn send_to(&self, peer: PeerId, command: &str, payload: Vec<u8>) {
        let Ok(peers) = self.peers.lock() else {
            return;
        };
        if let Some(sender) = peers.get(&peer) {
            let _ = sender.send(PeerCommand::Send {
                command: command.to_string(),
                payload,
            });
        }
    }

    fn disconnect(&self, peer: PeerId) {
        let Ok(peers) = self.peers.lock() else {
            return;
        };
        if let Some(sender) = peers.get(&peer) {
            let _ = sender.send(PeerCommand::Disconnect);
        }
    }
}

impl PeerNetwork for PeerHub {
    fn push_message(&self, peer: PeerId, message: OutboundMessage) {
        let (command, payload) = wire::build_outbound(&message);
        self.send_to(peer, command, payload);
    }

    fn push_inventory(&self, peer: PeerId, inv: Inventory) {
        self.send_to(peer, wire::MSG_INV, wire::build_inv_payload(&[inv]));
    }

    fn relay_inventory(&self, inv: Inventory) {
        let payload = wire::build_inv_payload(&[inv]);
        for peer in self.peers() {
            self.send_to(peer, wire::MSG_INV, payload.clone());
        }
    }

    fn misbehaving(&self, peer: PeerId, score: i32) {
        let total = {
            let Ok(mut scores) = self.scores.lock() else {
                return;
            };
            let entry = scores.entry(peer.ip()).or_insert(0);
            *entry = entry.saturating_add(score);
            *entry
        };
        debug!(%peer, score, total, "peer misbehaving");
        if total >= MISBEHAVING_THRESHOLD {
            info!(%peer, total, "banning misbehaving peer");
            self.ban_for(peer.ip(), MISBEHAVING_BAN_SECS);
            self.disconnect(peer);
        }
    }
}

struct VersionInfo {
    version: i32,
    user_agent: String,
    start_height: i32,
}

fn build_version_payload(start_height: i32) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(PROTOCOL_VERSION);
    encoder.write_u64_le(NODE_NETWORK);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0);
    encoder.write_i64_le(timestamp);
    write_net_addr(&mut encoder, NODE_NETWORK, [0u8; 16], 0);
    write_net_addr(&mut encoder, NODE_NETWORK, [0u8; 16], 0);
    encoder.write_u64_le(rand::random());
    encoder.write_var_str(USER_AGENT);
    encoder.write_i32_le(start_height);
    encoder.write_u8(0);
    encoder.into_inner()
}

fn parse_version(payload: &[u8]) -> Result<VersionInfo, String> {
    let mut decoder = Decoder::new(payload);
    let version = decoder.read_i32_le().map_err(|err| err.to_string())?;
    let _services = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let _timestamp = decoder.read_i64_le().map_err(|err| err.to_string())?;
    read_net_addr(&mut decoder)?;
    read_net_addr(&mut decoder)?;
    let _nonce = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let user_agent = decoder.read_var_str().map_err(|err| err.to_string())?;
    let start_height = decoder.read_i32_le().map_err(|err| err.to_string())?;
    Ok(VersionInfo {
        version,
        user_agent,
        start_height,
    })
}

fn write_net_addr(encoder: &mut Encoder, services: u64, ip: [u8; 16], port: u16) {
    encoder.write_u64_le(services);
    encoder.write_bytes(&ip);
    encoder.write_bytes(&port.to_be_bytes());
}

fn read_net_addr(decoder: &mut Decoder<'_>) -> Result<(), String> {
    let _services = decoder.read_u64_le().map_err(|err| err.to_string())?;
    let _ip = decoder.read_fixed::<16>().map_err(|err| err.to_string())?;
    let _port = decoder.read_bytes(2).map_err(|err| err.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    fn peer(last: u8) -> PeerId {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, last)), 9647)
    }

    #[test]
    fn version_payload_roundtrip() {
        let payload = build_version_payload(1234);
        let info = parse_version(&payload).expect("parse");
        assert_eq!(info.version, PROTOCOL_VERSION);
        assert_eq!(info.user_agent, USER_AGENT);
        assert_eq!(info.start_height, 1234);
    }

    #[test]
    fn misbehavior_accumulates_to_a_ban() {
        let hub = PeerHub::new();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        hub.register(peer(1), sender);

        hub.misbehaving(peer(1), 34);
        hub.misbehaving(peer(1), 33);
        assert!(!hub.is_banned(peer(1).ip()));

        hub.misbehaving(peer(1), 33);
        assert!(hub.is_banned(peer(1).ip()));
        let mut saw_disconnect = false;
        while let Ok(command) = receiver.try_recv() {
            if matches!(command, PeerCommand::Disconnect) {
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);
    }

    #[test]
    fn relay_reaches_every_registered_peer() {
        let hub = PeerHub::new();
        let (sender_a, mut receiver_a) = mpsc::unbounded_channel();
        let (sender_b, mut receiver_b) = mpsc::unbounded_channel();
        hub.register(peer(1), sender_a);
        hub.register(peer(2), sender_b);

        hub.relay_inventory(Inventory {
            kind: merged_masternode::InvKind::Spork,
            hash: [0x11; 32],
        });
        assert!(matches!(
            receiver_a.try_recv(),
            Ok(PeerCommand::Send { command, .. }) if command == wire::MSG_INV
        ));
        assert!(matches!(
            receiver_b.try_recv(),
            Ok(PeerCommand::Send { command, .. }) if command == wire::MSG_INV
        ));
    }

    #[test]
    fn ban_expires() {
        let hub = PeerHub::new();
        hub.ban_for(peer(3).ip(), 0);
        assert!(!hub.is_banned(peer(3).ip()));
    }
}
