mod chain_rpc;
mod p2p;
mod p2p_server;
mod sync;
mod winners;
mod wire;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use merged_consensus::constants::MIN_PEER_PROTO_VERSION;
use merged_consensus::{chain_params, ChainParams, Network};
use merged_masternode::{
    ChainOracle, GossipProtocol, PaymentOracle, PaymentPicker, PeerNetwork, Registry, SporkStore,
    SyncCoordinator,
};
use secp256k1::SecretKey;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::chain_rpc::ChainRpcClient;
use crate::p2p::PeerHub;
use crate::sync::NodeSync;
use crate::winners::WinnerBook;

const DEFAULT_STATUS_INTERVAL_SECS: u64 = 60;
const MAINTENANCE_INTERVAL_SECS: u64 = 60;
const TIP_POLL_INTERVAL_SECS: u64 = 10;

struct Config {
    network: Network,
    listen: Option<SocketAddr>,
    connect: Vec<SocketAddr>,
    chain_rpc: Option<SocketAddr>,
    chain_rpc_user: Option<String>,
    chain_rpc_pass: Option<String>,
    spork_key: Option<String>,
    status_interval_secs: u64,
}

fn usage() -> String {
    [
        "usage: merged [options]",
        "  --network <mainnet|testnet|regtest>   network to join (default mainnet)",
        "  --listen <addr:port>                  overlay listen address",
        "  --connect <addr:port>                 peer to keep connected (repeatable)",
        "  --chain-rpc <addr:port>               chain daemon JSON-RPC endpoint",
        "  --chain-rpc-user <user>               JSON-RPC username",
        "  --chain-rpc-pass <pass>               JSON-RPC password",
        "  --spork-key <hex>                     spork signing key (operators only)",
        "  --status-interval-secs <n>            status log cadence (default 60)",
    ]
    .join("\n")
}

fn parse_args() -> Result<Config, String> {
    let mut network = Network::Mainnet;
    let mut listen: Option<SocketAddr> = None;
    let mut listen_set = false;
    let mut connect: Vec<SocketAddr> = Vec::new();
    let mut chain_rpc: Option<SocketAddr> = None;
    let mut chain_rpc_user: Option<String> = None;
    let mut chain_rpc_pass: Option<String> = None;
    let mut spork_key: Option<String> = None;
    let mut status_interval_secs = DEFAULT_STATUS_INTERVAL_SECS;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--network" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --network\n{}", usage()))?;
                network = match value.as_str() {
                    "mainnet" => Network::Mainnet,
                    "testnet" => Network::Testnet,
                    "regtest" => Network::Regtest,
                    other => return Err(format!("invalid network '{other}'\n{}", usage())),
                };
            }
            "--listen" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --listen\n{}", usage()))?;
                listen = Some(parse_socket_addr(&value)?);
                listen_set = true;
            }
            "--connect" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --connect\n{}", usage()))?;
                connect.push(parse_socket_addr(&value)?);
            }
            "--chain-rpc" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --chain-rpc\n{}", usage()))?;
                chain_rpc = Some(parse_socket_addr(&value)?);
            }
            "--chain-rpc-user" => {
                chain_rpc_user = Some(args.next().ok_or_else(|| {
                    format!("missing value for --chain-rpc-user\n{}", usage())
                })?);
            }
            "--chain-rpc-pass" => {
                chain_rpc_pass = Some(args.next().ok_or_else(|| {
                    format!("missing value for --chain-rpc-pass\n{}", usage())
                })?);
            }
            "--spork-key" => {
                spork_key = Some(
                    args.next()
                        .ok_or_else(|| format!("missing value for --spork-key\n{}", usage()))?,
                );
            }
            "--status-interval-secs" => {
                let value = args.next().ok_or_else(|| {
                    format!("missing value for --status-interval-secs\n{}", usage())
                })?;
                status_interval_secs = value
                    .parse()
                    .map_err(|_| format!("invalid status interval '{value}'\n{}", usage()))?;
            }
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }

    if !listen_set {
        let port = chain_params(network).default_port;
        listen = Some(SocketAddr::from(([0, 0, 0, 0], port)));
    }

    Ok(Config {
        network,
        listen,
        connect,
        chain_rpc,
        chain_rpc_user,
        chain_rpc_pass,
        spork_key,
        status_interval_secs,
    })
}

fn parse_socket_addr(value: &str) -> Result<SocketAddr, String> {
    value
        .parse()
        .map_err(|_| format!("invalid address '{value}'\n{}", usage()))
}

fn parse_hex_bytes(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(value.len() / 2);
    let mut iter = value.as_bytes().iter().copied();
    while let (Some(high), Some(low)) = (iter.next(), iter.next()) {
        let high = (high as char).to_digit(16)? as u8;
        let low = (low as char).to_digit(16)? as u8;
        bytes.push(high << 4 | low);
    }
    Some(bytes)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match parse_args() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(config).await {
        eprintln!("merged: {err}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), String> {
    let params: ChainParams = chain_params(config.network);
    let chain_rpc_addr = config
        .chain_rpc
        .ok_or_else(|| format!("--chain-rpc is required\n{}", usage()))?;

    let chain: Arc<dyn ChainOracle> = Arc::new(ChainRpcClient::new(
        chain_rpc_addr,
        config.chain_rpc_user.clone(),
        config.chain_rpc_pass.clone(),
    ));
    let hub = Arc::new(PeerHub::new());
    let node_sync = Arc::new(NodeSync::new(Arc::clone(&chain)));
    let winners = Arc::new(WinnerBook::new());

    let mut spork_store = SporkStore::new(&params);
    if let Some(key_hex) = &config.spork_key {
        let secret = parse_hex_bytes(key_hex)
            .as_deref()
            .and_then(|bytes| SecretKey::from_slice(bytes).ok())
            .ok_or_else(|| "invalid --spork-key".to_string())?;
        spork_store.set_signing_key(secret);
        info!("spork signing key loaded");
    }
    let sporks = Arc::new(spork_store);

    let registry = Arc::new(Mutex::new(Registry::new()));
    let gossip = Arc::new(GossipProtocol::new(
        Arc::clone(&registry),
        Arc::clone(&sporks),
        Arc::clone(&chain),
        Arc::clone(&hub) as Arc<dyn PeerNetwork>,
        Arc::clone(&node_sync) as Arc<dyn SyncCoordinator>,
        Arc::clone(&winners) as Arc<dyn PaymentOracle>,
        params.clone(),
    ));
    let picker = Arc::new(PaymentPicker::new(
        Arc::clone(&registry),
        Arc::clone(&chain),
        Arc::clone(&winners) as Arc<dyn PaymentOracle>,
        Arc::clone(&sporks),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(listen) = config.listen {
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|err| format!("failed to bind {listen}: {err}"))?;
        tokio::spawn(p2p_server::serve_inbound(
            listener,
            params.message_start,
            Arc::clone(&gossip),
            Arc::clone(&hub),
            shutdown_rx.clone(),
        ));
    }

    for addr in &config.connect {
        tokio::spawn(p2p_server::keep_outbound(
            *addr,
            params.message_start,
            Arc::clone(&gossip),
            Arc::clone(&hub),
            shutdown_rx.clone(),
        ));
    }

    tokio::spawn(maintenance_loop(
        Arc::clone(&gossip),
        Arc::clone(&hub),
        Arc::clone(&node_sync),
        shutdown_rx.clone(),
    ));
    tokio::spawn(winner_loop(
        Arc::clone(&picker),
        Arc::clone(&winners),
        Arc::clone(&chain),
        Arc::clone(&node_sync),
        shutdown_rx.clone(),
    ));
    tokio::spawn(status_loop(
        Arc::clone(&registry),
        Arc::clone(&chain),
        Arc::clone(&hub),
        Arc::clone(&node_sync),
        config.status_interval_secs,
        shutdown_rx,
    ));

    info!(network = ?config.network, "merged overlay started");
    tokio::signal::ctrl_c()
        .await
        .map_err(|err| err.to_string())?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

/// Tick the registry state machine and keep peer lists fresh.
async fn maintenance_loop(
    gossip: Arc<GossipProtocol>,
    hub: Arc<PeerHub>,
    node_sync: Arc<NodeSync>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        gossip.maintain(false);
        if node_sync.is_blockchain_synced() {
            for peer in hub.peers() {
                gossip.dseg_update(peer);
            }
        }
    }
}

/// Record an advisory payment pick for each new block.
async fn winner_loop(
    picker: Arc<PaymentPicker>,
    winners: Arc<WinnerBook>,
    chain: Arc<dyn ChainOracle>,
    node_sync: Arc<NodeSync>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(TIP_POLL_INTERVAL_SECS));
    let mut last_tip = 0i64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        let tip = chain.tip_height();
        if tip <= last_tip || !node_sync.is_blockchain_synced() {
            continue;
        }
        last_tip = tip;
        let target = tip + 1;
        let (winner, candidates) = picker.next_for_payment(target, true);
        match winner {
            Some(entry) => {
                info!(
                    height = target,
                    collateral = %entry.collateral,
                    candidates,
                    "payment pick"
                );
                winners.record(target, entry.payee_script());
            }
            None => warn!(height = target, candidates, "no payment candidate"),
        }
    }
}

async fn status_loop(
    registry: Arc<Mutex<Registry>>,
    chain: Arc<dyn ChainOracle>,
    hub: Arc<PeerHub>,
    node_sync: Arc<NodeSync>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        let now = chain.adjusted_time();
        let (total, enabled) = match registry.lock() {
            Ok(mut guard) => (
                guard.size(),
                guard.count_enabled(now, &chain, MIN_PEER_PROTO_VERSION),
            ),
            Err(_) => (0, 0),
        };
        info!(
            masternodes = total,
            enabled,
            peers = hub.count(),
            synced = node_sync.is_blockchain_synced(),
            list_items = node_sync.list_items(),
            "overlay status"
        );
    }
}
