//! Inbox → wallet address resolution.
//!
//! Fast path reads conversation membership when the conversation is
//! known; fallback asks the network for identity state. A lookup that
//! races identity propagation gets a bounded resync-and-retry before the
//! resolver gives up.

use std::time::Duration;

use tokio::sync::Mutex;

use super::cache::TtlCache;
use crate::client::{ClientHandle, Member, MessagingClient};
use crate::config::CacheConfig;
use crate::error::ClientError;

/// Extra attempts after an identity lookup races propagation.
const IDENTITY_RETRIES: u32 = 2;
const IDENTITY_RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct AddressResolver {
    handle: ClientHandle,
    cache: Mutex<TtlCache<String, String>>,
}

impl AddressResolver {
    pub fn new(handle: ClientHandle, config: &CacheConfig) -> Self {
        Self {
            handle,
            cache: Mutex::new(TtlCache::new(config.max_cache_size, config.ttl())),
        }
    }

    /// Resolve an inbox to its wallet address, lowercased. `None` on any
    /// miss; misses are never cached.
    pub async fn resolve(&self, inbox_id: &str, conversation_id: Option<&str>) -> Option<String> {
        let key = inbox_id.to_ascii_lowercase();
        if let Some(hit) = self.cache.lock().await.get(&key) {
            return Some(hit);
        }

        let client = match self.handle.try_get().await {
            Some(client) => client,
            None => {
                tracing::debug!(inbox_id, "no client available for address resolution");
                return None;
            }
        };

        let mut address = None;
        if let Some(conversation_id) = conversation_id {
            address = member_address(client.as_ref(), conversation_id, inbox_id).await;
        }
        if address.is_none() {
            address = identity_address(client.as_ref(), inbox_id).await;
        }

        let address = address?;
        self.cache.lock().await.insert(key, address.clone());
        Some(address)
    }

    /// Seed the cache, e.g. from conversation membership at startup.
    pub async fn prime(&self, inbox_id: &str, address: &str) {
        self.cache.lock().await.insert(
            inbox_id.to_ascii_lowercase(),
            address.to_ascii_lowercase(),
        );
    }
}

async fn member_address(
    client: &dyn MessagingClient,
    conversation_id: &str,
    inbox_id: &str,
) -> Option<String> {
    match client.members(conversation_id).await {
        Ok(members) => members
            .iter()
            .find(|m| m.inbox_id.eq_ignore_ascii_case(inbox_id))
            .and_then(Member::ethereum_address),
        Err(error) => {
            tracing::debug!(%error, conversation_id, "membership lookup failed");
            None
        }
    }
}

async fn identity_address(client: &dyn MessagingClient, inbox_id: &str) -> Option<String> {
    let mut attempt = 0;
    loop {
        match client.identity_state(inbox_id).await {
            Ok(Some(state)) => return state.ethereum_address(),
            Ok(None) => {
                tracing::debug!(inbox_id, "no identity state on the network");
                return None;
            }
            Err(ClientError::MissingIdentityUpdate(_)) if attempt < IDENTITY_RETRIES => {
                attempt += 1;
                tracing::debug!(inbox_id, attempt, "identity update not yet propagated, resyncing");
                if let Err(error) = client.sync_conversations().await {
                    tracing::debug!(%error, "resync before identity retry failed");
                }
                tokio::time::sleep(IDENTITY_RETRY_DELAY).await;
            }
            Err(error) => {
                tracing::warn!(%error, inbox_id, "identity lookup failed");
                return None;
            }
        }
    }
}
