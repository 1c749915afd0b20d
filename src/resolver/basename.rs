//! L2 basename resolution.
//!
//! Same registry/resolver shape as mainnet, with two twists: the
//! resolver contract and chain id are discovered lazily on first use
//! (unless pinned in config), and reverse records live under a
//! chain-scoped namespace derived from the ENSIP-11 coin type,
//! `hex(0x80000000 | chain_id) + ".reverse"`.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::cache::TtlCache;
use crate::config::BasenameConfig;
use crate::rpc::{
    ChainRpc, call_with_word, decode_address, decode_string, keccak256, namehash, selector,
};

/// Root under which basenames are registered.
const BASENAME_ROOT: &str = "base.eth";

#[derive(Clone)]
struct Discovered {
    resolver: String,
    chain_id: u64,
}

pub struct BasenameResolver {
    rpc: Arc<dyn ChainRpc>,
    registry: String,
    resolver_override: Option<String>,
    discovered: RwLock<Option<Discovered>>,
    forward: Mutex<TtlCache<String, String>>,
    reverse: Mutex<TtlCache<String, String>>,
}

impl BasenameResolver {
    pub fn new(rpc: Arc<dyn ChainRpc>, config: &BasenameConfig) -> Self {
        Self {
            rpc,
            registry: config.registry.clone(),
            resolver_override: config.resolver_address.clone(),
            discovered: RwLock::new(None),
            forward: Mutex::new(TtlCache::new(config.cache.max_cache_size, config.cache.ttl())),
            reverse: Mutex::new(TtlCache::new(config.cache.max_cache_size, config.cache.ttl())),
        }
    }

    /// Basename → address, lowercased.
    pub async fn resolve_name(&self, name: &str) -> Option<String> {
        let key = name.to_ascii_lowercase();
        if let Some(hit) = self.forward.lock().await.get(&key) {
            return Some(hit);
        }
        let discovered = self.discover().await?;
        let node = namehash(&key);
        let address = match self
            .rpc
            .eth_call(
                &discovered.resolver,
                &call_with_word(selector("addr(bytes32)"), node),
            )
            .await
        {
            Ok(ret) => decode_address(&ret)?,
            Err(error) => {
                tracing::debug!(%error, name = %key, "basename address lookup failed");
                return None;
            }
        };
        self.forward.lock().await.insert(key, address.clone());
        Some(address)
    }

    /// Address → primary basename.
    pub async fn resolve_address(&self, address: &str) -> Option<String> {
        let key = address.to_ascii_lowercase();
        if let Some(hit) = self.reverse.lock().await.get(&key) {
            return Some(hit);
        }
        let discovered = self.discover().await?;
        let node = reverse_node(&key, discovered.chain_id);
        let name = match self
            .rpc
            .eth_call(
                &discovered.resolver,
                &call_with_word(selector("name(bytes32)"), node),
            )
            .await
        {
            Ok(ret) => decode_string(&ret)?,
            Err(error) => {
                tracing::debug!(%error, address = %key, "basename reverse lookup failed");
                return None;
            }
        };
        self.reverse.lock().await.insert(key, name.clone());
        Some(name)
    }

    /// Resolver contract and chain id, discovered once and pinned for the
    /// life of the resolver.
    async fn discover(&self) -> Option<Discovered> {
        if let Some(discovered) = self.discovered.read().await.clone() {
            return Some(discovered);
        }
        let mut slot = self.discovered.write().await;
        if let Some(discovered) = slot.clone() {
            return Some(discovered);
        }

        let chain_id = match self.rpc.chain_id().await {
            Ok(id) => id,
            Err(error) => {
                tracing::debug!(%error, "chain id discovery failed");
                return None;
            }
        };
        let resolver = match &self.resolver_override {
            Some(resolver) => resolver.to_ascii_lowercase(),
            None => {
                let data =
                    call_with_word(selector("resolver(bytes32)"), namehash(BASENAME_ROOT));
                match self.rpc.eth_call(&self.registry, &data).await {
                    Ok(ret) => decode_address(&ret)?,
                    Err(error) => {
                        tracing::debug!(%error, "basename resolver discovery failed");
                        return None;
                    }
                }
            }
        };
        tracing::debug!(%resolver, chain_id, "discovered basename resolver");

        let discovered = Discovered { resolver, chain_id };
        *slot = Some(discovered.clone());
        Some(discovered)
    }
}

/// Reverse namespace for a chain, per the EVM coin-type convention.
fn reverse_namespace(chain_id: u64) -> String {
    format!("{:x}.reverse", 0x8000_0000u64 | chain_id)
}

/// Node of an address's reverse record: the address label (lowercase hex,
/// no prefix) hashed under the chain's reverse namespace.
fn reverse_node(address: &str, chain_id: u64) -> [u8; 32] {
    let label = address.trim_start_matches("0x");
    let parent = namehash(&reverse_namespace(chain_id));
    let label_hash = keccak256(label.as_bytes());
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(&parent);
    buf[32..].copy_from_slice(&label_hash);
    keccak256(&buf)
}
