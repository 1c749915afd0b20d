//! Tideline — consumer-side runtime for decentralized E2EE messaging.
//!
//! The crate wraps a messaging client behind a small trait and layers the
//! machinery an application needs around it:
//!
//! - [`connection`]: supervised connect/retry, background liveness
//!   probes, and transparent reconnection behind a shared handle.
//! - [`resolver`]: TTL-cached identity resolution — inbox ids to wallet
//!   addresses, names on two chains, and reply-chain message lookup —
//!   unified behind one facade that never fails a caller.
//! - [`listener`]: a self-healing message stream that enriches each
//!   inbound message with its conversation, chain root, sender identity,
//!   and extracted mention subjects.
//! - [`auth`] and [`api`]: single-action HMAC tokens and the axum
//!   boundary that accepts them.
//!
//! Applications implement [`client::MessagingClient`] (or use a provided
//! implementation) and wire the pieces together from a [`config::Config`].

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod logging;
pub mod mentions;
pub mod resolver;
pub mod rpc;

pub use client::{
    ClientHandle, Connector, Conversation, Envelope, Member, MessageBody, MessagingClient,
};
pub use config::Config;
pub use connection::{ConnectionHealth, ConnectionManager};
pub use error::{Error, Result};
pub use listener::{ListenerEvent, ListenerHandle, MessageEvent, MessageListener};
pub use resolver::{Sender, UnifiedResolver};
