//! Single-action HMAC tokens for the HTTP boundary.
//!
//! A token authorizes exactly one action kind against one conversation
//! and expires quickly. Format: `base64url(claims).base64url(signature)`
//! with an HMAC-SHA256 signature over the serialized claims. The
//! signature is checked before the claims are parsed.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::{AuthError, ConfigError};

type HmacSha256 = Hmac<Sha256>;

/// The one thing a token is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Send,
    Reply,
    React,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::Send => "send",
            ActionKind::Reply => "reply",
            ActionKind::React => "react",
        })
    }
}

/// Signed claims carried inside a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionToken {
    pub action: ActionKind,
    pub conversation_id: String,
    /// Message the action targets, for replies and reactions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Random per-token value so identical claims still produce
    /// distinct tokens.
    pub nonce: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Mints and validates action tokens.
#[derive(Clone)]
pub struct TokenService {
    secret: Vec<u8>,
    service_secret: Option<String>,
    token_ttl_secs: u64,
}

impl TokenService {
    pub fn new(config: &AuthConfig) -> Result<Self, ConfigError> {
        let secret = config
            .secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingSecret(
                "auth.secret (or TIDELINE_AUTH_SECRET)",
            ))?;
        Ok(Self {
            secret: secret.as_bytes().to_vec(),
            service_secret: config.service_secret.clone(),
            token_ttl_secs: config.token_ttl_secs,
        })
    }

    /// Mint a token authorizing `action` against `conversation_id`.
    pub fn mint(
        &self,
        action: ActionKind,
        conversation_id: &str,
        reference: Option<&str>,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = ActionToken {
            action,
            conversation_id: conversation_id.to_string(),
            reference: reference.map(str::to_string),
            nonce: Uuid::new_v4(),
            issued_at: now,
            expires_at: now + chrono::Duration::seconds(self.token_ttl_secs as i64),
        };
        let payload =
            serde_json::to_vec(&claims).map_err(|error| AuthError::Signing(error.to_string()))?;
        let signature = self.sign(&payload)?;
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    /// Verify a token's signature and expiry and return its claims.
    pub fn validate(&self, token: &str) -> Result<ActionToken, AuthError> {
        let (payload, signature) = token.split_once('.').ok_or(AuthError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::Malformed)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|error| AuthError::Signing(error.to_string()))?;
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let claims: ActionToken =
            serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)?;
        if claims.expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }

    /// [`validate`](Self::validate), additionally requiring the token's
    /// action to match the endpoint's.
    pub fn validate_for(&self, token: &str, action: ActionKind) -> Result<ActionToken, AuthError> {
        let claims = self.validate(token)?;
        if claims.action != action {
            return Err(AuthError::ActionMismatch {
                expected: action.to_string(),
                found: claims.action.to_string(),
            });
        }
        Ok(claims)
    }

    /// Whether a presented `x-service-secret` value unlocks the token
    /// bypass. Always false when no service secret is configured.
    pub fn bypass_allowed(&self, presented: &str) -> bool {
        self.service_secret
            .as_deref()
            .is_some_and(|secret| secret == presented)
    }

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|error| AuthError::Signing(error.to_string()))?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}
