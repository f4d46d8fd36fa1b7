//! Peer sessions: accept loop, dispatch into the gossip core, and serving
//! getdata for overlay inventory.

use std::sync::Arc;
use std::time::Duration;

use merged_masternode::{GossipProtocol, Inventory, InvKind, PeerId};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::p2p::{Peer, PeerCommand, PeerHub};
use crate::wire;

const HANDSHAKE_TIMEOUT_SECS: u64 = 8;
const READ_TIMEOUT_SECS: u64 = 120;
const RECONNECT_DELAY_SECS: u64 = 10;

pub async fn serve_inbound(
    listener: TcpListener,
    magic: [u8; 4],
    gossip: Arc<GossipProtocol>,
    hub: Arc<PeerHub>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "overlay listening");
    }
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };
        let (stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        if hub.is_banned(remote.ip()) {
            debug!(%remote, "dropping banned peer");
            continue;
        }
        let peer = Peer::new(stream, remote, magic);
        let gossip = Arc::clone(&gossip);
        let hub = Arc::clone(&hub);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = run_peer(peer, gossip, hub, false, shutdown).await {
                debug!(%remote, %err, "peer session closed");
            }
        });
    }
}

/// Keep one outbound connection alive to a configured peer.
pub async fn keep_outbound(
    addr: PeerId,
    magic: [u8; 4],
    gossip: Arc<GossipProtocol>,
    hub: Arc<PeerHub>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        match Peer::connect(addr, magic).await {
            Ok(peer) => {
                info!(%addr, "connected to peer");
                if let Err(err) =
                    run_peer(peer, Arc::clone(&gossip), Arc::clone(&hub), true, shutdown.clone())
                        .await
                {
                    debug!(%addr, %err, "outbound peer session closed");
                }
            }
            Err(err) => {
                debug!(%addr, %err, "connect failed");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(RECONNECT_DELAY_SECS)) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn run_peer(
    mut peer: Peer,
    gossip: Arc<GossipProtocol>,
    hub: Arc<PeerHub>,
    outbound: bool,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    let addr = peer.addr();
    match timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        peer.handshake(0),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(format!("handshake failed: {err}")),
        Err(_) => return Err("handshake timed out".to_string()),
    }
    debug!(
        %addr,
        version = peer.remote_version(),
        agent = peer.remote_user_agent(),
        height = peer.remote_height(),
        "peer handshake complete"
    );

    let (sender, mut receiver) = mpsc::unbounded_channel();
    hub.register(addr, sender);

    // On an outbound connection, pull the spork set and the masternode list.
    if outbound {
        peer.send_message(wire::MSG_GETSPORKS, &[]).await.ok();
        gossip.dseg_update(addr);
    }

    let result = loop {
        tokio::select! {
            command = receiver.recv() => match command {
                Some(PeerCommand::Send { command, payload }) => {
                    if let Err(err) = peer.send_message(&command, &payload).await {
                        break Err(err);
                    }
                }
                Some(PeerCommand::Disconnect) | None => break Ok(()),
            },
            read = timeout(Duration::from_secs(READ_TIMEOUT_SECS), peer.read_message()) => {
                let (command, payload) = match read {
                    Ok(Ok(message)) => message,
                    Ok(Err(err)) => break Err(err),
                    Err(_) => break Err("peer read timed out".to_string()),
                };
                if let Err(err) = handle_message(&mut peer, &gossip, &command, &payload).await {
                    break Err(err);
                }
            }
            _ = shutdown.changed() => break Ok(()),
        }
    };

    hub.remove(addr);
    result
}

async fn handle_message(
    peer: &mut Peer,
    gossip: &GossipProtocol,
    command: &str,
    payload: &[u8],
) -> Result<(), String> {
    match command {
        "ping" => peer.send_message("pong", payload).await,
        wire::MSG_INV => {
            let inventories =
                wire::parse_inv_payload(payload).map_err(|err| err.to_string())?;
            let wanted = unseen(gossip, &inventories);
            if !wanted.is_empty() {
                peer.send_message(wire::MSG_GETDATA, &wire::build_inv_payload(&wanted))
                    .await?;
            }
            Ok(())
        }
        wire::MSG_GETDATA => {
            let inventories =
                wire::parse_inv_payload(payload).map_err(|err| err.to_string())?;
            serve_getdata(peer, gossip, &inventories).await
        }
        _ => match wire::parse_net_message(command, payload) {
            Ok(Some(message)) => {
                gossip.process(peer.addr(), message);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                debug!(peer = %peer.addr(), command, %err, "undecodable overlay payload");
                Ok(())
            }
        },
    }
}

fn unseen(gossip: &GossipProtocol, inventories: &[Inventory]) -> Vec<Inventory> {
    let registry = gossip.registry();
    let sporks = gossip.sporks();
    let Ok(registry) = registry.lock() else {
        return Vec::new();
    };
    inventories
        .iter()
        .filter(|inv| match inv.kind {
            InvKind::Spork => sporks.spork_by_hash(&inv.hash).is_none(),
            InvKind::MasternodeAnnounce => !registry.seen().has_broadcast(&inv.hash),
            InvKind::MasternodePing => !registry.seen().has_ping(&inv.hash),
        })
        .copied()
        .collect()
}

async fn serve_getdata(
    peer: &mut Peer,
    gossip: &GossipProtocol,
    inventories: &[Inventory],
) -> Result<(), String> {
    for inv in inventories {
        let reply = {
            let registry = gossip.registry();
            let sporks = gossip.sporks();
            let Ok(registry) = registry.lock() else {
                continue;
            };
            match inv.kind {
                InvKind::Spork => sporks
                    .spork_by_hash(&inv.hash)
                    .map(|spork| (wire::MSG_SPORK, {
                        let (_, payload) = wire::build_outbound(
                            &merged_masternode::OutboundMessage::Spork(spork),
                        );
                        payload
                    })),
                InvKind::MasternodeAnnounce => registry
                    .seen()
                    .broadcast(&inv.hash)
                    .map(|mnb| (wire::MSG_MNB, wire::build_broadcast_payload(mnb))),
                InvKind::MasternodePing => registry
                    .seen()
                    .ping(&inv.hash)
                    .map(|ping| (wire::MSG_MNP, wire::build_ping_payload(ping))),
            }
        };
        if let Some((command, payload)) = reply {
            peer.send_message(command, &payload).await?;
        }
    }
    Ok(())
}
