//! Scripted in-memory messaging client for tests.
//!
//! Every lookup is counted so tests can assert cache hits, retry budgets,
//! and reconnect behavior; the stream is fed by `push_*` helpers and
//! buffers items pushed before a stream is open.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    Conversation, Envelope, Identifier, IdentifierKind, IdentityState, Member, MessageBody,
    MessageStream, MessagingClient, ReactionAction,
};
use crate::client::Connector;
use crate::error::ClientError;

type StreamItem = Result<Option<Envelope>, ClientError>;

/// Outbound action recorded by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentAction {
    Text {
        conversation_id: String,
        content: String,
    },
    Reply {
        conversation_id: String,
        reference: String,
        content: String,
    },
    Reaction {
        conversation_id: String,
        reference: String,
        emoji: String,
    },
}

#[derive(Default)]
struct Store {
    conversations: Vec<Conversation>,
    members: HashMap<String, Vec<Member>>,
    messages: HashMap<String, Envelope>,
    identities: HashMap<String, IdentityState>,
    identity_failures: HashMap<String, u32>,
    stream_tx: Option<mpsc::UnboundedSender<StreamItem>>,
    pending: VecDeque<StreamItem>,
    sent: Vec<SentAction>,
}

pub struct FakeClient {
    inbox_id: String,
    store: Mutex<Store>,
    list_failing: AtomicBool,
    send_failing: AtomicBool,
    sync_calls: AtomicU32,
    list_calls: AtomicU32,
    message_calls: AtomicU32,
    identity_calls: AtomicU32,
    member_calls: AtomicU32,
    send_seq: AtomicU32,
}

impl FakeClient {
    pub fn new(inbox_id: &str) -> Arc<Self> {
        Arc::new(Self {
            inbox_id: inbox_id.to_string(),
            store: Mutex::new(Store::default()),
            list_failing: AtomicBool::new(false),
            send_failing: AtomicBool::new(false),
            sync_calls: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
            message_calls: AtomicU32::new(0),
            identity_calls: AtomicU32::new(0),
            member_calls: AtomicU32::new(0),
            send_seq: AtomicU32::new(0),
        })
    }

    pub async fn add_conversation(&self, id: &str, name: Option<&str>) {
        self.store.lock().await.conversations.push(Conversation {
            id: id.to_string(),
            name: name.map(str::to_string),
        });
    }

    pub async fn add_member(&self, conversation_id: &str, inbox_id: &str, address: Option<&str>) {
        let identifiers = address
            .map(|a| {
                vec![Identifier {
                    kind: IdentifierKind::Ethereum,
                    value: a.to_string(),
                }]
            })
            .unwrap_or_default();
        self.store
            .lock()
            .await
            .members
            .entry(conversation_id.to_string())
            .or_default()
            .push(Member {
                inbox_id: inbox_id.to_string(),
                identifiers,
            });
    }

    pub async fn add_message(&self, envelope: Envelope) {
        self.store
            .lock()
            .await
            .messages
            .insert(envelope.id.clone(), envelope);
    }

    pub async fn add_identity(&self, inbox_id: &str, address: &str) {
        self.store.lock().await.identities.insert(
            inbox_id.to_ascii_lowercase(),
            IdentityState {
                inbox_id: inbox_id.to_string(),
                identifiers: vec![Identifier {
                    kind: IdentifierKind::Ethereum,
                    value: address.to_string(),
                }],
            },
        );
    }

    /// The next `n` identity lookups for this inbox fail with
    /// `MissingIdentityUpdate`, then lookups succeed.
    pub async fn fail_identity_times(&self, inbox_id: &str, n: u32) {
        self.store
            .lock()
            .await
            .identity_failures
            .insert(inbox_id.to_ascii_lowercase(), n);
    }

    /// Make conversation listing fail, for probing health-check paths.
    pub fn set_list_failing(&self, failing: bool) {
        self.list_failing.store(failing, Ordering::SeqCst);
    }

    /// Make outbound sends fail.
    pub fn set_send_failing(&self, failing: bool) {
        self.send_failing.store(failing, Ordering::SeqCst);
    }

    fn check_send(&self) -> Result<(), ClientError> {
        if self.send_failing.load(Ordering::SeqCst) {
            return Err(ClientError::Other(anyhow!("scripted send failure")));
        }
        Ok(())
    }

    pub async fn push(&self, envelope: Envelope) {
        self.push_item(Ok(Some(envelope))).await;
    }

    pub async fn push_undecodable(&self) {
        self.push_item(Ok(None)).await;
    }

    pub async fn push_error(&self, reason: &str) {
        self.push_item(Err(ClientError::Stream(reason.to_string())))
            .await;
    }

    /// Drop the stream sender so an open stream terminates.
    pub async fn end_stream(&self) {
        self.store.lock().await.stream_tx = None;
    }

    async fn push_item(&self, item: StreamItem) {
        let mut store = self.store.lock().await;
        match &store.stream_tx {
            Some(tx) => {
                if let Err(mpsc::error::SendError(item)) = tx.send(item) {
                    store.stream_tx = None;
                    store.pending.push_back(item);
                }
            }
            None => store.pending.push_back(item),
        }
    }

    pub async fn sent(&self) -> Vec<SentAction> {
        self.store.lock().await.sent.clone()
    }

    pub fn sync_count(&self) -> u32 {
        self.sync_calls.load(Ordering::SeqCst)
    }

    pub fn list_count(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn message_lookups(&self) -> u32 {
        self.message_calls.load(Ordering::SeqCst)
    }

    pub fn identity_lookups(&self) -> u32 {
        self.identity_calls.load(Ordering::SeqCst)
    }

    pub fn member_lookups(&self) -> u32 {
        self.member_calls.load(Ordering::SeqCst)
    }

    fn next_message_id(&self) -> String {
        format!("sent-{}", self.send_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl MessagingClient for FakeClient {
    fn inbox_id(&self) -> &str {
        &self.inbox_id
    }

    async fn sync_conversations(&self) -> Result<(), ClientError> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, ClientError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.list_failing.load(Ordering::SeqCst) {
            return Err(ClientError::Other(anyhow!("scripted listing failure")));
        }
        Ok(self.store.lock().await.conversations.clone())
    }

    async fn conversation_by_id(&self, id: &str) -> Result<Option<Conversation>, ClientError> {
        Ok(self
            .store
            .lock()
            .await
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn message_by_id(&self, id: &str) -> Result<Option<Envelope>, ClientError> {
        self.message_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.store.lock().await.messages.get(id).cloned())
    }

    async fn stream_messages(&self) -> Result<MessageStream, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut store = self.store.lock().await;
        while let Some(item) = store.pending.pop_front() {
            let _ = tx.send(item);
        }
        store.stream_tx = Some(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn members(&self, conversation_id: &str) -> Result<Vec<Member>, ClientError> {
        self.member_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .store
            .lock()
            .await
            .members
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn identity_state(&self, inbox_id: &str) -> Result<Option<IdentityState>, ClientError> {
        self.identity_calls.fetch_add(1, Ordering::SeqCst);
        let key = inbox_id.to_ascii_lowercase();
        let mut store = self.store.lock().await;
        if let Some(remaining) = store.identity_failures.get_mut(&key)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ClientError::MissingIdentityUpdate(inbox_id.to_string()));
        }
        Ok(store.identities.get(&key).cloned())
    }

    async fn send_text(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<String, ClientError> {
        self.check_send()?;
        self.store.lock().await.sent.push(SentAction::Text {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
        });
        Ok(self.next_message_id())
    }

    async fn send_reply(
        &self,
        conversation_id: &str,
        reference: &str,
        content: &str,
    ) -> Result<String, ClientError> {
        self.check_send()?;
        self.store.lock().await.sent.push(SentAction::Reply {
            conversation_id: conversation_id.to_string(),
            reference: reference.to_string(),
            content: content.to_string(),
        });
        Ok(self.next_message_id())
    }

    async fn send_reaction(
        &self,
        conversation_id: &str,
        reference: &str,
        emoji: &str,
    ) -> Result<String, ClientError> {
        self.check_send()?;
        self.store.lock().await.sent.push(SentAction::Reaction {
            conversation_id: conversation_id.to_string(),
            reference: reference.to_string(),
            emoji: emoji.to_string(),
        });
        Ok(self.next_message_id())
    }
}

/// Connector over a queue of fake clients. Each successful connect hands
/// out the next client; the last one repeats.
pub struct FakeConnector {
    clients: Mutex<VecDeque<Arc<FakeClient>>>,
    fail_remaining: AtomicU32,
    attempts: AtomicU32,
}

impl FakeConnector {
    pub fn new(client: Arc<FakeClient>) -> Self {
        Self::with_clients(vec![client])
    }

    pub fn with_clients(clients: Vec<Arc<FakeClient>>) -> Self {
        Self {
            clients: Mutex::new(clients.into()),
            fail_remaining: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        }
    }

    /// Fail the first `n` connect calls before handing out clients.
    pub fn fail_first(self, n: u32) -> Self {
        self.fail_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the next `n` connect calls from now on.
    pub fn set_fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _persist: bool) -> Result<Arc<dyn MessagingClient>, ClientError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_remaining.load(Ordering::SeqCst) > 0 {
            self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(ClientError::Other(anyhow!("scripted connect failure")));
        }
        let mut clients = self.clients.lock().await;
        let client = clients
            .pop_front()
            .expect("fake connector needs at least one client");
        if clients.is_empty() {
            clients.push_back(client.clone());
        }
        Ok(client)
    }
}

/// Builders for envelopes used across test modules.
pub fn text_message(id: &str, conversation_id: &str, sender: &str, text: &str) -> Envelope {
    Envelope {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_inbox_id: sender.to_string(),
        sent_at: chrono::Utc::now(),
        body: MessageBody::Text {
            text: text.to_string(),
        },
    }
}

pub fn reply_message(
    id: &str,
    conversation_id: &str,
    sender: &str,
    reference: &str,
    text: &str,
) -> Envelope {
    Envelope {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_inbox_id: sender.to_string(),
        sent_at: chrono::Utc::now(),
        body: MessageBody::Reply {
            reference: reference.to_string(),
            text: text.to_string(),
        },
    }
}

pub fn reaction_message(
    id: &str,
    conversation_id: &str,
    sender: &str,
    reference: &str,
    emoji: &str,
) -> Envelope {
    Envelope {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_inbox_id: sender.to_string(),
        sent_at: chrono::Utc::now(),
        body: MessageBody::Reaction {
            reference: reference.to_string(),
            emoji: emoji.to_string(),
            action: ReactionAction::Added,
        },
    }
}
