//! Message lookup, reply-chain walking, and a standalone address path.
//!
//! The address path deliberately duplicates what
//! [`super::address::AddressResolver`] does over identity state, with its
//! own cache, so message enrichment keeps working even when the primary
//! path's cache or conversation context is unavailable.

use std::collections::HashSet;

use tokio::sync::Mutex;

use super::cache::TtlCache;
use crate::client::{ClientHandle, Envelope};
use crate::config::ResolverConfig;

pub struct MessageResolver {
    handle: ClientHandle,
    messages: Mutex<TtlCache<String, Envelope>>,
    addresses: Mutex<TtlCache<String, String>>,
}

impl MessageResolver {
    pub fn new(handle: ClientHandle, config: &ResolverConfig) -> Self {
        Self {
            handle,
            messages: Mutex::new(TtlCache::new(
                config.message.max_cache_size,
                config.message.ttl(),
            )),
            addresses: Mutex::new(TtlCache::new(
                config.address.max_cache_size,
                config.address.ttl(),
            )),
        }
    }

    /// Fetch a message by id, through the cache.
    pub async fn find_message(&self, id: &str) -> Option<Envelope> {
        if let Some(hit) = self.messages.lock().await.get(&id.to_string()) {
            return Some(hit);
        }
        let Some(client) = self.handle.try_get().await else {
            tracing::debug!(message_id = id, "no client available for message lookup");
            return None;
        };
        match client.message_by_id(id).await {
            Ok(Some(envelope)) => {
                self.messages
                    .lock()
                    .await
                    .insert(id.to_string(), envelope.clone());
                Some(envelope)
            }
            Ok(None) => {
                tracing::debug!(message_id = id, "message not found");
                None
            }
            Err(error) => {
                tracing::warn!(%error, message_id = id, "message lookup failed");
                None
            }
        }
    }

    /// Walk a reply chain to its root. `None` if any hop is missing or
    /// the chain loops back on itself.
    pub async fn find_root_message(&self, id: &str) -> Option<Envelope> {
        let mut visited = HashSet::new();
        let mut current = id.to_string();
        loop {
            if !visited.insert(current.clone()) {
                tracing::warn!(message_id = id, "reply chain contains a cycle");
                return None;
            }
            let envelope = self.find_message(&current).await?;
            match envelope.reference() {
                Some(reference) => current = reference.to_string(),
                None => return Some(envelope),
            }
        }
    }

    /// Inbox → address over identity state only. Single attempt, own cache.
    pub async fn resolve_address(&self, inbox_id: &str) -> Option<String> {
        let key = inbox_id.to_ascii_lowercase();
        if let Some(hit) = self.addresses.lock().await.get(&key) {
            return Some(hit);
        }
        let client = self.handle.try_get().await?;
        match client.identity_state(inbox_id).await {
            Ok(Some(state)) => {
                let address = state.ethereum_address()?;
                self.addresses.lock().await.insert(key, address.clone());
                Some(address)
            }
            Ok(None) => None,
            Err(error) => {
                tracing::debug!(%error, inbox_id, "identity lookup failed");
                None
            }
        }
    }
}
