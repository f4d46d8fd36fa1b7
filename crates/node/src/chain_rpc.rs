//! Chain access over the existing daemon's JSON-RPC interface.
//!
//! The overlay daemon does not validate blocks itself; block hashes, header
//! times, and collateral outputs come from the chain daemon next door. Tip
//! and header lookups are cached briefly so gossip bursts do not hammer the
//! RPC socket.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::Engine;
use merged_consensus::constants::COIN;
use merged_consensus::Hash256;
use merged_masternode::{ChainOracle, CollateralInfo};
use merged_primitives::hash::hash256_to_hex;
use merged_primitives::OutPoint;
use serde_json::{json, Value};
use tracing::{debug, warn};

const RPC_TIMEOUT_SECS: u64 = 5;
const TIP_CACHE_SECS: u64 = 5;
const HASH_CACHE_MAX: usize = 100_000;

struct ChainCache {
    tip: Option<(i64, Instant)>,
    hash_by_height: HashMap<i64, Hash256>,
    header_by_hash: HashMap<Hash256, (i64, i64)>,
}

pub struct ChainRpcClient {
    addr: SocketAddr,
    auth: Option<String>,
    cache: Mutex<ChainCache>,
}

impl ChainRpcClient {
    pub fn new(addr: SocketAddr, user: Option<String>, pass: Option<String>) -> Self {
        let auth = user.map(|user| {
            let pass = pass.unwrap_or_default();
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
        });
        Self {
            addr,
            auth,
            cache: Mutex::new(ChainCache {
                tip: None,
                hash_by_height: HashMap::new(),
                header_by_hash: HashMap::new(),
            }),
        }
    }

    fn call(&self, method: &str, params: Value) -> Result<Value, String> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "merged",
            "method": method,
            "params": params,
        })
        .to_string();
        let response = self.http_post(&body)?;
        let parsed: Value =
            serde_json::from_str(&response).map_err(|err| format!("bad rpc json: {err}"))?;
        if let Some(error) = parsed.get("error") {
            if !error.is_null() {
                return Err(format!("rpc error from {method}: {error}"));
            }
        }
        parsed
            .get("result")
            .cloned()
            .ok_or_else(|| format!("rpc response for {method} has no result"))
    }

    fn http_post(&self, body: &str) -> Result<String, String> {
        let timeout = Duration::from_secs(RPC_TIMEOUT_SECS);
        let mut stream =
            TcpStream::connect_timeout(&self.addr, timeout).map_err(|err| err.to_string())?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|err| err.to_string())?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(|err| err.to_string())?;

        let mut request = format!(
            "POST / HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
            self.addr,
            body.len()
        );
        if let Some(auth) = &self.auth {
            request.push_str(&format!("Authorization: Basic {auth}\r\n"));
        }
        request.push_str("\r\n");
        request.push_str(body);
        stream
            .write_all(request.as_bytes())
            .map_err(|err| err.to_string())?;

        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .map_err(|err| err.to_string())?;
        let Some(split) = response.find("\r\n\r\n") else {
            return Err("malformed http response".to_string());
        };
        Ok(response[split + 4..].to_string())
    }

    /// Header height and time for a block hash, cached.
    fn header(&self, hash: &Hash256) -> Option<(i64, i64)> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(header) = cache.header_by_hash.get(hash) {
                return Some(*header);
            }
        }
        let result = self
            .call("getblockheader", json!([hash256_to_hex(hash)]))
            .map_err(|err| debug!(%err, "getblockheader failed"))
            .ok()?;
        let height = result.get("height")?.as_i64()?;
        let time = result.get("time")?.as_i64()?;
        if let Ok(mut cache) = self.cache.lock() {
            if cache.header_by_hash.len() >= HASH_CACHE_MAX {
                cache.header_by_hash.clear();
            }
            cache.header_by_hash.insert(*hash, (height, time));
        }
        Some((height, time))
    }
}

impl ChainOracle for ChainRpcClient {
    fn tip_height(&self) -> i64 {
        if let Ok(cache) = self.cache.lock() {
            if let Some((height, fetched)) = cache.tip {
                if fetched.elapsed() < Duration::from_secs(TIP_CACHE_SECS) {
                    return height;
                }
            }
        }
        match self.call("getblockcount", json!([])) {
            Ok(result) => {
                let height = result.as_i64().unwrap_or(0);
                if let Ok(mut cache) = self.cache.lock() {
                    cache.tip = Some((height, Instant::now()));
                }
                height
            }
            Err(err) => {
                warn!(%err, "getblockcount failed");
                0
            }
        }
    }

    fn block_hash(&self, height: i64) -> Option<Hash256> {
        if height < 0 {
            return None;
        }
        if let Ok(cache) = self.cache.lock() {
            if let Some(hash) = cache.hash_by_height.get(&height) {
                return Some(*hash);
            }
        }
        let result = self
            .call("getblockhash", json!([height]))
            .map_err(|err| debug!(%err, height, "getblockhash failed"))
            .ok()?;
        let hash = hex_to_hash256(result.as_str()?)?;
        if let Ok(mut cache) = self.cache.lock() {
            if cache.hash_by_height.len() >= HASH_CACHE_MAX {
                cache.hash_by_height.clear();
            }
            // Hashes near the tip can still reorg away; cache only settled
            // heights.
            if let Some((tip, _)) = cache.tip {
                if height <= tip - 30 {
                    cache.hash_by_height.insert(height, hash);
                }
            }
        }
        Some(hash)
    }

    fn block_height(&self, hash: &Hash256) -> Option<i64> {
        self.header(hash).map(|(height, _)| height)
    }

    fn block_time(&self, height: i64) -> Option<i64> {
        let hash = self.block_hash(height)?;
        self.header(&hash).map(|(_, time)| time)
    }

    fn adjusted_time(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0)
    }

    fn collateral_utxo(&self, outpoint: &OutPoint) -> Option<CollateralInfo> {
        let result = self
            .call(
                "gettxout",
                json!([hash256_to_hex(&outpoint.hash), outpoint.index, false]),
            )
            .map_err(|err| debug!(%err, "gettxout failed"))
            .ok()?;
        if result.is_null() {
            return None;
        }
        let value_coins = result.get("value")?.as_f64()?;
        let value = (value_coins * COIN as f64).round() as i64;
        let confirmations = result.get("confirmations")?.as_i64()?;
        let height = self.tip_height() - confirmations + 1;
        let key_hash = result
            .get("scriptPubKey")
            .and_then(|script| script.get("hex"))
            .and_then(|hex| hex.as_str())
            .and_then(hex_to_bytes)
            .and_then(|script| merged_script::standard::p2pkh_key_hash(&script));
        Some(CollateralInfo {
            value,
            height,
            key_hash,
        })
    }
}

/// Display-order hex to internal byte order.
fn hex_to_hash256(hex: &str) -> Option<Hash256> {
    let bytes = hex_to_bytes(hex)?;
    if bytes.len() != 32 {
        return None;
    }
    let mut hash = [0u8; 32];
    for (index, byte) in bytes.iter().rev().enumerate() {
        hash[index] = *byte;
    }
    Some(hash)
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

    #[test]
    fn hex_conversion_reverses_display_order() {
        let mut expected = [0u8; 32];
        expected[31] = 0xab;
        let hex = format!("ab{}", "00".repeat(31));
        assert_eq!(hex_to_hash256(&hex), Some(expected));
        assert_eq!(hash256_to_hex(&expected), hex);
        assert!(hex_to_hash256("abcd").is_none());
    }
}
