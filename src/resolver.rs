//! Identity and message resolution.
//!
//! Three cached resolvers plus a facade: inbox → address
//! ([`AddressResolver`]), names on two chains ([`EnsResolver`],
//! [`BasenameResolver`]), and message lookup ([`MessageResolver`]).
//! [`UnifiedResolver`] routes by name shape, layers fallbacks, and
//! normalizes senders into display form. Resolution never fails a
//! caller: every miss is `None` or a degraded display string.

use std::sync::Arc;

use serde::Serialize;

use crate::client::{ClientHandle, Envelope};
use crate::config::ResolverConfig;
use crate::error::RpcError;
use crate::rpc::{ChainRpc, HttpRpc};

pub mod address;
pub mod basename;
pub mod cache;
pub mod ens;
pub mod message;

pub use address::AddressResolver;
pub use basename::BasenameResolver;
pub use cache::TtlCache;
pub use ens::EnsResolver;
pub use message::MessageResolver;

/// A fully normalized message sender.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sender {
    pub address: String,
    pub inbox_id: String,
    /// Best display name: basename, then mainnet name, then a truncated
    /// address.
    pub name: String,
    pub basename: Option<String>,
}

/// Name records known for an address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    pub address: String,
    pub name: Option<String>,
    pub basename: Option<String>,
}

pub struct UnifiedResolver {
    address: AddressResolver,
    ens: EnsResolver,
    basename: BasenameResolver,
    message: MessageResolver,
}

impl UnifiedResolver {
    pub fn new(
        handle: ClientHandle,
        config: &ResolverConfig,
        mainnet: Arc<dyn ChainRpc>,
        l2: Arc<dyn ChainRpc>,
    ) -> Self {
        Self {
            address: AddressResolver::new(handle.clone(), &config.address),
            ens: EnsResolver::new(mainnet, &config.ens),
            basename: BasenameResolver::new(l2, &config.basename),
            message: MessageResolver::new(handle, config),
        }
    }

    /// Build with HTTP transports taken from config.
    pub fn from_config(handle: ClientHandle, config: &ResolverConfig) -> Result<Self, RpcError> {
        let mainnet = Arc::new(HttpRpc::new(&config.ens.rpc_url)?);
        let l2 = Arc::new(HttpRpc::new(&config.basename.rpc_url)?);
        Ok(Self::new(handle, config, mainnet, l2))
    }

    /// Name → address. `.base.eth` names go to the L2, other `.eth`
    /// names to mainnet. A bare label tries `<label>.base.eth` first,
    /// then `<label>.eth`.
    pub async fn resolve_name(&self, name: &str) -> Option<String> {
        let name = name.to_ascii_lowercase();
        if name.ends_with(".base.eth") {
            self.basename.resolve_name(&name).await
        } else if name.ends_with(".eth") {
            self.ens.resolve_name(&name).await
        } else {
            if let Some(address) = self.basename.resolve_name(&format!("{name}.base.eth")).await {
                return Some(address);
            }
            self.ens.resolve_name(&format!("{name}.eth")).await
        }
    }

    /// Address → display name, basenames preferred.
    pub async fn resolve_address_to_name(&self, address: &str) -> Option<String> {
        if let Some(basename) = self.basename.resolve_address(address).await {
            return Some(basename);
        }
        self.ens.resolve_address(address).await
    }

    /// Inbox → address: primary path first, then the message resolver's
    /// independent path.
    pub async fn resolve_address(
        &self,
        inbox_id: &str,
        conversation_id: Option<&str>,
    ) -> Option<String> {
        if let Some(address) = self.address.resolve(inbox_id, conversation_id).await {
            return Some(address);
        }
        self.message.resolve_address(inbox_id).await
    }

    pub async fn find_message(&self, id: &str) -> Option<Envelope> {
        self.message.find_message(id).await
    }

    pub async fn find_root_message(&self, id: &str) -> Option<Envelope> {
        self.message.find_root_message(id).await
    }

    /// Seed the inbox → address cache.
    pub async fn prime_address(&self, inbox_id: &str, address: &str) {
        self.address.prime(inbox_id, address).await;
    }

    /// Every name record known for an address.
    pub async fn profile(&self, address: &str) -> Profile {
        Profile {
            address: address.to_ascii_lowercase(),
            name: self.ens.resolve_address(address).await,
            basename: self.basename.resolve_address(address).await,
        }
    }

    /// Normalize a sender — either an inbox id or a raw address — into
    /// display form. Never fails: when nothing resolves, the display
    /// name degrades to a truncated rendering of the input.
    pub async fn sender_for(&self, identifier: &str, conversation_id: &str) -> Sender {
        let address = if looks_like_address(identifier) {
            Some(identifier.to_ascii_lowercase())
        } else {
            self.resolve_address(identifier, Some(conversation_id)).await
        };

        match address {
            Some(address) => {
                let basename = self.basename.resolve_address(&address).await;
                let name = match &basename {
                    Some(basename) => basename.clone(),
                    None => match self.ens.resolve_address(&address).await {
                        Some(name) => name,
                        None => truncate_address(&address),
                    },
                };
                Sender {
                    address,
                    inbox_id: identifier.to_string(),
                    name,
                    basename,
                }
            }
            None => Sender {
                address: identifier.to_string(),
                inbox_id: identifier.to_string(),
                name: truncate_address(identifier),
                basename: None,
            },
        }
    }
}

fn looks_like_address(value: &str) -> bool {
    value.len() == 42
        && value.starts_with("0x")
        && value[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// `first6...last4` display form for unresolvable values.
fn truncate_address(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 10 {
        return value.to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
