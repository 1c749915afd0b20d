//! Mainnet name service resolution.
//!
//! Forward: name → registry `resolver(node)` → resolver `addr(node)`.
//! Reverse: address → `<addr>.addr.reverse` node → registry → resolver
//! `name(node)`. Successes are cached; misses and node errors degrade to
//! `None` and are retried on the next ask.

use std::sync::Arc;

use tokio::sync::Mutex;

use super::cache::TtlCache;
use crate::config::EnsConfig;
use crate::rpc::{ChainRpc, call_with_word, decode_address, decode_string, namehash, selector};

pub struct EnsResolver {
    rpc: Arc<dyn ChainRpc>,
    registry: String,
    forward: Mutex<TtlCache<String, String>>,
    reverse: Mutex<TtlCache<String, String>>,
}

impl EnsResolver {
    pub fn new(rpc: Arc<dyn ChainRpc>, config: &EnsConfig) -> Self {
        Self {
            rpc,
            registry: config.registry.clone(),
            forward: Mutex::new(TtlCache::new(config.cache.max_cache_size, config.cache.ttl())),
            reverse: Mutex::new(TtlCache::new(config.cache.max_cache_size, config.cache.ttl())),
        }
    }

    /// Name → address, lowercased. `None` when unregistered or the node
    /// is unreachable.
    pub async fn resolve_name(&self, name: &str) -> Option<String> {
        let key = name.to_ascii_lowercase();
        if let Some(hit) = self.forward.lock().await.get(&key) {
            return Some(hit);
        }
        let address = self.forward_lookup(&key).await?;
        self.forward.lock().await.insert(key, address.clone());
        Some(address)
    }

    /// Address → primary name.
    pub async fn resolve_address(&self, address: &str) -> Option<String> {
        let key = address.to_ascii_lowercase();
        if let Some(hit) = self.reverse.lock().await.get(&key) {
            return Some(hit);
        }
        let name = self.reverse_lookup(&key).await?;
        self.reverse.lock().await.insert(key, name.clone());
        Some(name)
    }

    async fn forward_lookup(&self, name: &str) -> Option<String> {
        let node = namehash(name);
        let resolver = self.resolver_for(node, name).await?;
        match self
            .rpc
            .eth_call(&resolver, &call_with_word(selector("addr(bytes32)"), node))
            .await
        {
            Ok(ret) => decode_address(&ret),
            Err(error) => {
                tracing::debug!(%error, name, "address lookup failed");
                None
            }
        }
    }

    async fn reverse_lookup(&self, address: &str) -> Option<String> {
        let reverse_name = format!("{}.addr.reverse", address.trim_start_matches("0x"));
        let node = namehash(&reverse_name);
        let resolver = self.resolver_for(node, address).await?;
        match self
            .rpc
            .eth_call(&resolver, &call_with_word(selector("name(bytes32)"), node))
            .await
        {
            Ok(ret) => decode_string(&ret),
            Err(error) => {
                tracing::debug!(%error, address, "reverse name lookup failed");
                None
            }
        }
    }

    async fn resolver_for(&self, node: [u8; 32], subject: &str) -> Option<String> {
        match self
            .rpc
            .eth_call(
                &self.registry,
                &call_with_word(selector("resolver(bytes32)"), node),
            )
            .await
        {
            Ok(ret) => decode_address(&ret),
            Err(error) => {
                tracing::debug!(%error, subject, "registry resolver lookup failed");
                None
            }
        }
    }
}
