//! Minimal JSON-RPC chain access.
//!
//! Name resolution needs exactly two node calls: `eth_call` against
//! registry/resolver contracts and `eth_chainId`. [`ChainRpc`] keeps that
//! surface mockable; [`HttpRpc`] is the production transport. The ABI
//! helpers cover the handful of fixed layouts the resolvers touch, so no
//! contract-binding machinery is pulled in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::error::RpcError;

/// Narrow node interface used by the name resolvers.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Read-only contract call at the latest block. Returns raw return data.
    async fn eth_call(&self, to: &str, data: &[u8]) -> Result<Vec<u8>, RpcError>;

    async fn chain_id(&self) -> Result<u64, RpcError>;
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u32,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<serde_json::Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC 2.0 over HTTP.
pub struct HttpRpc {
    url: String,
    http: reqwest::Client,
}

impl HttpRpc {
    pub fn new(url: &str) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.to_string(),
            http,
        })
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };
        let response: RpcResponse = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(error) = response.error {
            return Err(RpcError::Node {
                code: error.code,
                message: error.message,
            });
        }
        response.result.ok_or_else(|| {
            RpcError::Malformed("response carries neither result nor error".to_string())
        })
    }

    fn hex_field(value: &serde_json::Value) -> Result<&str, RpcError> {
        value
            .as_str()
            .and_then(|s| s.strip_prefix("0x"))
            .ok_or_else(|| RpcError::Malformed("result is not a hex string".to_string()))
    }
}

#[async_trait]
impl ChainRpc for HttpRpc {
    async fn eth_call(&self, to: &str, data: &[u8]) -> Result<Vec<u8>, RpcError> {
        let params = serde_json::json!([
            { "to": to, "data": format!("0x{}", hex::encode(data)) },
            "latest",
        ]);
        let result = self.call("eth_call", params).await?;
        hex::decode(Self::hex_field(&result)?)
            .map_err(|e| RpcError::Malformed(format!("undecodable return data: {e}")))
    }

    async fn chain_id(&self) -> Result<u64, RpcError> {
        let result = self.call("eth_chainId", serde_json::json!([])).await?;
        u64::from_str_radix(Self::hex_field(&result)?, 16)
            .map_err(|e| RpcError::Malformed(format!("undecodable chain id: {e}")))
    }
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// EIP-137 name hash. Labels are hashed right to left; the empty name is
/// the zero node. Callers pass already-lowercased names.
pub fn namehash(name: &str) -> [u8; 32] {
    let mut node = [0u8; 32];
    if name.is_empty() {
        return node;
    }
    for label in name.rsplit('.') {
        let label_hash = keccak256(label.as_bytes());
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(&node);
        buf[32..].copy_from_slice(&label_hash);
        node = keccak256(&buf);
    }
    node
}

/// Four-byte function selector for a canonical signature like
/// `"resolver(bytes32)"`.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Calldata for a single-`bytes32`-argument call.
pub fn call_with_word(selector: [u8; 4], word: [u8; 32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(&selector);
    data.extend_from_slice(&word);
    data
}

/// Decode an ABI `address` return word. The zero address reads as a miss.
pub fn decode_address(ret: &[u8]) -> Option<String> {
    if ret.len() < 32 {
        return None;
    }
    let addr = &ret[12..32];
    if addr.iter().all(|b| *b == 0) {
        return None;
    }
    Some(format!("0x{}", hex::encode(addr)))
}

/// Decode an ABI dynamic `string` return. The empty string reads as a miss.
pub fn decode_string(ret: &[u8]) -> Option<String> {
    let offset = word_to_usize(ret.get(..32)?)?;
    let len_end = offset.checked_add(32)?;
    let len = word_to_usize(ret.get(offset..len_end)?)?;
    let data = ret.get(len_end..len_end.checked_add(len)?)?;
    let s = std::str::from_utf8(data).ok()?;
    if s.is_empty() { None } else { Some(s.to_string()) }
}

fn word_to_usize(word: &[u8]) -> Option<usize> {
    if word.len() != 32 || word[..24].iter().any(|b| *b != 0) {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[24..]);
    Some(u64::from_be_bytes(buf) as usize)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namehash_of_empty_name_is_the_zero_node() {
        assert_eq!(namehash(""), [0u8; 32]);
    }

    #[test]
    fn namehash_matches_published_vectors() {
        assert_eq!(
            hex::encode(namehash("eth")),
            "93cdeb708b7545dc668eb9280176169d1c33cfd8ed6f04690a0bcc88a93fc4ae"
        );
        assert_eq!(
            hex::encode(namehash("foo.eth")),
            "de9b09fd7c5f901e23a3f19fecc54828e9c848539801e86591bd9801b019f84f"
        );
    }

    #[test]
    fn selectors_match_registry_abi() {
        assert_eq!(selector("resolver(bytes32)"), [0x01, 0x78, 0xb8, 0xbf]);
        assert_eq!(selector("addr(bytes32)"), [0x3b, 0x3b, 0x57, 0xde]);
        assert_eq!(selector("name(bytes32)"), [0x69, 0x1f, 0x34, 0x31]);
    }

    #[test]
    fn call_data_is_selector_then_word() {
        let data = call_with_word(selector("addr(bytes32)"), namehash("foo.eth"));
        assert_eq!(data.len(), 36);
        assert_eq!(&data[..4], &[0x3b, 0x3b, 0x57, 0xde]);
        assert_eq!(&data[4..], &namehash("foo.eth"));
    }

    #[test]
    fn zero_address_decodes_as_miss() {
        assert_eq!(decode_address(&[0u8; 32]), None);
        assert_eq!(decode_address(&[]), None);
    }

    #[test]
    fn address_word_decodes_to_lowercase_hex() {
        let ret = testing::address_ret("0xABCDEF0123456789abcdef0123456789ABCDEF01");
        assert_eq!(
            decode_address(&ret).as_deref(),
            Some("0xabcdef0123456789abcdef0123456789abcdef01")
        );
    }

    #[test]
    fn string_returns_decode_and_empty_is_miss() {
        assert_eq!(
            decode_string(&testing::string_ret("alice.base.eth")).as_deref(),
            Some("alice.base.eth")
        );
        assert_eq!(decode_string(&testing::string_ret("")), None);
        assert_eq!(decode_string(&[0u8; 32]), None);
        assert_eq!(decode_string(&[0xffu8; 64]), None);
    }
}
