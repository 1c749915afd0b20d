//! Self-healing message listener.
//!
//! A supervision loop owns one streaming session at a time: prime
//! resolver caches, sync, snapshot conversations, then drain the message
//! stream. Any failure tears the session down, emits an error event, and
//! restarts after a short pause — indefinitely, until told to stop.
//! Messages are enriched (conversation, reply-chain root, sender,
//! mention subjects) one at a time, in arrival order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt as _;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::client::{ClientHandle, Conversation, Envelope, MessagingClient};
use crate::config::ListenerConfig;
use crate::mentions;
use crate::resolver::{Sender, UnifiedResolver};

/// Event channel capacity. When consumers lag this far behind, the
/// listener blocks rather than dropping messages.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Starting,
    Streaming,
    Recovering,
    Stopped,
}

/// A fully enriched inbound message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageEvent {
    pub conversation: Conversation,
    pub message: Envelope,
    /// Root of the reply chain; the message itself when it is not a reply.
    pub root_message: Envelope,
    /// The directly referenced message, for replies and reactions.
    pub parent_message: Option<Envelope>,
    pub sender: Sender,
    /// Mentioned names resolved to addresses.
    pub subjects: HashMap<String, String>,
}

#[derive(Debug)]
pub enum ListenerEvent {
    Started { conversation_count: usize },
    Message(MessageEvent),
    Heartbeat {
        message_count: u64,
        conversation_count: usize,
    },
    Error { message: String },
    Stopped,
}

/// Predicate gating emission: conversation, message, chain root.
pub type MessageFilter = Arc<dyn Fn(&Conversation, &Envelope, &Envelope) -> bool + Send + Sync>;

pub struct MessageListener {
    handle: ClientHandle,
    resolver: Arc<UnifiedResolver>,
    config: ListenerConfig,
    filter: Option<MessageFilter>,
}

impl MessageListener {
    pub fn new(
        handle: ClientHandle,
        resolver: Arc<UnifiedResolver>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            handle,
            resolver,
            config,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: MessageFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Spawn the supervision loop. Returns the control handle and the
    /// event receiver.
    pub fn spawn(self) -> (ListenerHandle, mpsc::Receiver<ListenerEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ListenerState::Idle);
        let runtime = Runtime {
            handle: self.handle,
            resolver: self.resolver,
            config: self.config,
            filter: self.filter,
            events: events_tx,
            state: state_tx,
            shutdown: shutdown_rx,
            conversations: Arc::new(ArcSwap::from_pointee(Vec::new())),
            message_count: Arc::new(AtomicU64::new(0)),
        };
        let task = tokio::spawn(runtime.run());
        (
            ListenerHandle {
                shutdown: shutdown_tx,
                state: state_rx,
                task,
            },
            events_rx,
        )
    }
}

pub struct ListenerHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ListenerState>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Watch lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.state.clone()
    }

    pub fn current_state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Signal shutdown and wait for the loop to wind down.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Adapt the event receiver into a `futures` stream.
pub fn into_stream(
    events: mpsc::Receiver<ListenerEvent>,
) -> impl futures::Stream<Item = ListenerEvent> + Send {
    tokio_stream::wrappers::ReceiverStream::new(events)
}

enum SessionEnd {
    Shutdown,
    Failed(String),
}

struct Runtime {
    handle: ClientHandle,
    resolver: Arc<UnifiedResolver>,
    config: ListenerConfig,
    filter: Option<MessageFilter>,
    events: mpsc::Sender<ListenerEvent>,
    state: watch::Sender<ListenerState>,
    shutdown: watch::Receiver<bool>,
    conversations: Arc<ArcSwap<Vec<Conversation>>>,
    message_count: Arc<AtomicU64>,
}

impl Runtime {
    async fn run(self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.state.send_replace(ListenerState::Starting);
            match self.run_session().await {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed(reason) => {
                    tracing::warn!(reason, "listener session failed, recovering");
                    let _ = self
                        .events
                        .send(ListenerEvent::Error { message: reason })
                        .await;
                    self.state.send_replace(ListenerState::Recovering);
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = sleep(self.config.recover_delay()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        self.state.send_replace(ListenerState::Stopped);
        let _ = self.events.send(ListenerEvent::Stopped).await;
        tracing::info!("listener stopped");
    }

    async fn run_session(&self) -> SessionEnd {
        let client = match self.handle.get().await {
            Ok(client) => client,
            Err(error) => return SessionEnd::Failed(error.to_string()),
        };

        self.prime_resolver_caches(client.as_ref()).await;

        if let Err(error) = client.sync_conversations().await {
            return SessionEnd::Failed(format!("conversation sync failed: {error}"));
        }
        let conversations = match client.list_conversations().await {
            Ok(conversations) => conversations,
            Err(error) => {
                return SessionEnd::Failed(format!("conversation listing failed: {error}"));
            }
        };
        let conversation_count = conversations.len();
        self.conversations.store(Arc::new(conversations));
        tracing::info!(conversations = conversation_count, "listener starting");
        let _ = self
            .events
            .send(ListenerEvent::Started { conversation_count })
            .await;

        let mut stream = match client.stream_messages().await {
            Ok(stream) => stream,
            Err(error) => {
                return SessionEnd::Failed(format!("could not open message stream: {error}"));
            }
        };

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.events.clone(),
            self.message_count.clone(),
            self.conversations.clone(),
            self.config.heartbeat_interval(),
        ));
        let poll = tokio::spawn(poll_conversations(
            self.handle.clone(),
            self.conversations.clone(),
            self.config.conversation_check_interval(),
        ));
        self.state.send_replace(ListenerState::Streaming);

        let mut shutdown = self.shutdown.clone();
        let end = loop {
            tokio::select! {
                _ = shutdown.changed() => break SessionEnd::Shutdown,
                item = stream.next() => match item {
                    Some(Ok(envelope)) => {
                        self.message_count.fetch_add(1, Ordering::Relaxed);
                        match envelope {
                            Some(envelope) => self.process_message(envelope).await,
                            None => tracing::debug!("skipping undecodable message"),
                        }
                    }
                    Some(Err(error)) => {
                        break SessionEnd::Failed(format!("message stream error: {error}"));
                    }
                    None => break SessionEnd::Failed("message stream ended".to_string()),
                },
            }
        };

        heartbeat.abort();
        poll.abort();
        end
    }

    /// Seed inbox → address mappings from conversation membership so the
    /// first messages do not each pay a network lookup. Best effort.
    async fn prime_resolver_caches(&self, client: &dyn MessagingClient) {
        let conversations = match client.list_conversations().await {
            Ok(conversations) => conversations,
            Err(error) => {
                tracing::debug!(%error, "cache pre-population skipped");
                return;
            }
        };
        let own_inbox = client.inbox_id().to_string();
        let mut primed = 0usize;
        for conversation in &conversations {
            match client.members(&conversation.id).await {
                Ok(members) => {
                    for member in members {
                        if member.inbox_id.eq_ignore_ascii_case(&own_inbox) {
                            continue;
                        }
                        if let Some(address) = member.ethereum_address() {
                            self.resolver.prime_address(&member.inbox_id, &address).await;
                            primed += 1;
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!(
                        %error,
                        conversation_id = %conversation.id,
                        "membership fetch failed during pre-population"
                    );
                }
            }
        }
        tracing::debug!(primed, "resolver caches pre-populated");
    }

    async fn process_message(&self, envelope: Envelope) {
        let Some(client) = self.handle.try_get().await else {
            tracing::warn!("client went away mid-stream, dropping message");
            return;
        };

        if envelope.sender_inbox_id.eq_ignore_ascii_case(client.inbox_id()) {
            tracing::debug!(message_id = %envelope.id, "skipping own message");
            return;
        }

        let conversation = match client.conversation_by_id(&envelope.conversation_id).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => {
                tracing::warn!(
                    conversation_id = %envelope.conversation_id,
                    "conversation not found, skipping message"
                );
                return;
            }
            Err(error) => {
                tracing::warn!(
                    %error,
                    conversation_id = %envelope.conversation_id,
                    "conversation lookup failed, skipping message"
                );
                return;
            }
        };

        let (root_message, parent_message) = match envelope.reference() {
            None => (envelope.clone(), None),
            Some(reference) => match self.resolver.find_root_message(reference).await {
                Some(root) => {
                    let parent = self.resolver.find_message(reference).await;
                    (root, parent)
                }
                None => {
                    tracing::warn!(
                        message_id = %envelope.id,
                        reference,
                        "reply chain root unresolved, skipping message"
                    );
                    return;
                }
            },
        };

        if let Some(filter) = &self.filter
            && !filter(&conversation, &envelope, &root_message)
        {
            tracing::debug!(message_id = %envelope.id, "message filtered out");
            return;
        }

        let sender = self
            .resolver
            .sender_for(&envelope.sender_inbox_id, &envelope.conversation_id)
            .await;
        let subjects = mentions::extract_subjects(&envelope.display_text(), &self.resolver).await;

        let event = MessageEvent {
            conversation,
            message: envelope,
            root_message,
            parent_message,
            sender,
            subjects,
        };
        if self.events.send(ListenerEvent::Message(event)).await.is_err() {
            tracing::debug!("event receiver dropped");
        }
    }
}

async fn heartbeat_loop(
    events: mpsc::Sender<ListenerEvent>,
    message_count: Arc<AtomicU64>,
    conversations: Arc<ArcSwap<Vec<Conversation>>>,
    interval: Duration,
) {
    loop {
        sleep(interval).await;
        let event = ListenerEvent::Heartbeat {
            message_count: message_count.load(Ordering::Relaxed),
            conversation_count: conversations.load().len(),
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
}

/// Re-poll the conversation list and append anything new to the shared
/// snapshot. Existing entries are never reordered or dropped.
async fn poll_conversations(
    handle: ClientHandle,
    conversations: Arc<ArcSwap<Vec<Conversation>>>,
    interval: Duration,
) {
    loop {
        sleep(interval).await;
        let Some(client) = handle.try_get().await else {
            continue;
        };
        let latest = match client.list_conversations().await {
            Ok(latest) => latest,
            Err(error) => {
                tracing::debug!(%error, "conversation poll failed");
                continue;
            }
        };
        let known = conversations.load();
        let fresh: Vec<Conversation> = latest
            .into_iter()
            .filter(|c| !known.iter().any(|k| k.id == c.id))
            .collect();
        if fresh.is_empty() {
            continue;
        }
        for conversation in &fresh {
            tracing::info!(conversation_id = %conversation.id, "discovered new conversation");
        }
        conversations.rcu(|current| {
            let mut next = (**current).clone();
            for conversation in &fresh {
                if !next.iter().any(|k| k.id == conversation.id) {
                    next.push(conversation.clone());
                }
            }
            next
        });
    }
}
