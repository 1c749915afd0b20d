//! Messaging client abstraction.
//!
//! The runtime never talks to a concrete network SDK directly. Everything
//! goes through [`MessagingClient`], a narrow capability trait, so the
//! supervision, resolution, and listening layers stay testable against a
//! scripted fake. [`ClientHandle`] is the shared slot a reconnect can swap
//! a fresh client into without restarting consumers.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ClientError;

#[cfg(test)]
pub mod fake;

/// Stream of inbound envelopes. `Ok(None)` marks an item the transport
/// delivered but could not decode.
pub type MessageStream =
    Pin<Box<dyn Stream<Item = Result<Option<Envelope>, ClientError>> + Send>>;

/// A conversation the client participates in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub name: Option<String>,
}

/// Reaction direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Added,
    Removed,
}

/// Decoded message content, classified by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        text: String,
    },
    Reply {
        reference: String,
        text: String,
    },
    Reaction {
        reference: String,
        emoji: String,
        action: ReactionAction,
    },
    Attachment {
        filename: String,
        mime_type: String,
    },
    Other {
        content_type: String,
    },
}

/// A single decoded message as delivered by the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub conversation_id: String,
    pub sender_inbox_id: String,
    pub sent_at: DateTime<Utc>,
    pub body: MessageBody,
}

impl Envelope {
    /// The message this one points at, for replies and reactions.
    pub fn reference(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Reply { reference, .. } => Some(reference),
            MessageBody::Reaction { reference, .. } => Some(reference),
            _ => None,
        }
    }

    /// Human-readable rendering of the body, used for mention scanning
    /// and downstream display.
    pub fn display_text(&self) -> String {
        match &self.body {
            MessageBody::Text { text } => text.clone(),
            MessageBody::Reply { text, .. } => text.clone(),
            MessageBody::Reaction { emoji, action, .. } => match action {
                ReactionAction::Added => emoji.clone(),
                ReactionAction::Removed => format!("removed {emoji}"),
            },
            MessageBody::Attachment { filename, .. } => {
                format!("[attachment: {filename}]")
            }
            MessageBody::Other { content_type } => {
                format!("[unsupported content: {content_type}]")
            }
        }
    }
}

/// How an on-network identity is identified externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    Ethereum,
    Passkey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identifier {
    pub kind: IdentifierKind,
    pub value: String,
}

/// A member of a conversation, with whatever identifiers the network knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub inbox_id: String,
    pub identifiers: Vec<Identifier>,
}

/// Network-wide identity record for an inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityState {
    pub inbox_id: String,
    pub identifiers: Vec<Identifier>,
}

impl Member {
    /// First Ethereum identifier, lowercased, if any.
    pub fn ethereum_address(&self) -> Option<String> {
        first_ethereum(&self.identifiers)
    }
}

impl IdentityState {
    pub fn ethereum_address(&self) -> Option<String> {
        first_ethereum(&self.identifiers)
    }
}

fn first_ethereum(identifiers: &[Identifier]) -> Option<String> {
    identifiers
        .iter()
        .find(|id| id.kind == IdentifierKind::Ethereum)
        .map(|id| id.value.to_ascii_lowercase())
}

/// Capabilities the runtime needs from a connected messaging client.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// The inbox this client is signed in as.
    fn inbox_id(&self) -> &str;

    /// Force a full conversation sync from the network.
    async fn sync_conversations(&self) -> Result<(), ClientError>;

    async fn list_conversations(&self) -> Result<Vec<Conversation>, ClientError>;

    async fn conversation_by_id(&self, id: &str) -> Result<Option<Conversation>, ClientError>;

    async fn message_by_id(&self, id: &str) -> Result<Option<Envelope>, ClientError>;

    /// Open the network-wide message stream.
    async fn stream_messages(&self) -> Result<MessageStream, ClientError>;

    async fn members(&self, conversation_id: &str) -> Result<Vec<Member>, ClientError>;

    /// Look up the network identity record for an inbox. `Ok(None)` means
    /// the inbox is unknown; [`ClientError::MissingIdentityUpdate`] means
    /// the record exists but has not propagated yet.
    async fn identity_state(&self, inbox_id: &str) -> Result<Option<IdentityState>, ClientError>;

    async fn send_text(&self, conversation_id: &str, content: &str)
    -> Result<String, ClientError>;

    async fn send_reply(
        &self,
        conversation_id: &str,
        reference: &str,
        content: &str,
    ) -> Result<String, ClientError>;

    async fn send_reaction(
        &self,
        conversation_id: &str,
        reference: &str,
        emoji: &str,
    ) -> Result<String, ClientError>;
}

/// Builds connected clients. One attempt per call; retry policy lives in
/// [`crate::connection::ConnectionManager`].
#[async_trait]
pub trait Connector: Send + Sync {
    /// `persist` controls whether the client keeps its local database
    /// across restarts.
    async fn connect(&self, persist: bool) -> Result<Arc<dyn MessagingClient>, ClientError>;
}

/// Shared slot holding the current client, if any.
///
/// Reconnects swap in a fresh client here; consumers that resolve through
/// the handle pick it up on their next call without restarting.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<RwLock<Option<Arc<dyn MessagingClient>>>>,
}

impl ClientHandle {
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    /// Current client, or [`ClientError::NotConnected`].
    pub async fn get(&self) -> Result<Arc<dyn MessagingClient>, ClientError> {
        self.inner
            .read()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    /// Current client, or `None`.
    pub async fn try_get(&self) -> Option<Arc<dyn MessagingClient>> {
        self.inner.read().await.clone()
    }

    pub(crate) async fn set(&self, client: Arc<dyn MessagingClient>) {
        *self.inner.write().await = Some(client);
    }

    pub(crate) async fn clear(&self) {
        *self.inner.write().await = None;
    }
}
