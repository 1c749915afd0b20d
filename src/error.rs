//! Error taxonomy for the runtime.
//!
//! Each subsystem owns a small `thiserror` enum; the crate-wide [`Error`]
//! umbrella collects them so callers can hold one `Result` type. Resolution
//! misses (no name, no address, no root message) are not errors — resolvers
//! return `None` and callers degrade gracefully.

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Umbrella error for the whole runtime.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures surfaced by the messaging client or the handle that publishes it.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No live client is available (never connected, or disconnected).
    #[error("messaging client is not connected")]
    NotConnected,

    /// The network has not yet propagated an identity update for this inbox.
    /// Transient: callers re-sync and retry a bounded number of times.
    #[error("missing identity update for inbox {0}")]
    MissingIdentityUpdate(String),

    /// The message stream broke or ended unexpectedly.
    #[error("message stream failed: {0}")]
    Stream(String),

    /// An operation exceeded its configured deadline.
    #[error("client operation timed out")]
    Timeout,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Connection establishment failures.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Every attempt in the retry budget failed. Fatal — upstream decides
    /// whether to terminate the process.
    #[error("connection failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Chain RPC failures.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The node answered with a JSON-RPC error object.
    #[error("rpc node error {code}: {message}")]
    Node { code: i64, message: String },

    #[error("malformed rpc response: {0}")]
    Malformed(String),
}

/// Action-token failures, mapped to status codes at the HTTP boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,

    #[error("bad token signature")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("token authorizes {found}, endpoint requires {expected}")]
    ActionMismatch { expected: String, found: String },

    #[error("token signing failed: {0}")]
    Signing(String),
}

/// Startup configuration failures. Fatal, never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("missing required secret: {0}")]
    MissingSecret(&'static str),
}
