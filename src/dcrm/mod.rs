//! Threshold signer (DCRM) client
//!
//! The signing group is an external service consumed through one narrow
//! call: submit a message hash with its context, receive the rsv tuples
//! the group produced. Transport failures are transient; protocol-level
//! rejections are signing failures for the swap at hand.

use crate::config::DcrmConfig;
use crate::error::{BridgeError, BridgeResult};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Contract of the threshold signing service.
#[async_trait]
pub trait DcrmSigner: Send + Sync {
    /// Submit `msg_hash` for signing under `pubkey`. `msg_context` is an
    /// opaque audit payload stored alongside the signing request.
    /// Returns the key id of the signing round and the rsv tuples, each
    /// a 65-byte hex string.
    async fn do_sign_one(
        &self,
        pubkey: &str,
        msg_hash: &str,
        msg_context: &str,
    ) -> BridgeResult<(String, Vec<String>)>;
}

/// JSON-RPC client for a DCRM signing node
pub struct RpcDcrmClient {
    endpoint: String,
    client: reqwest::Client,
}

impl RpcDcrmClient {
    pub fn new(config: &DcrmConfig) -> BridgeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BridgeError::Config(format!("dcrm client: {e}")))?;
        Ok(Self {
            endpoint: config.rpc_address.clone(),
            client,
        })
    }
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<SignOneResult>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct SignOneResult {
    key_id: String,
    rsvs: Vec<String>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[async_trait]
impl DcrmSigner for RpcDcrmClient {
    async fn do_sign_one(
        &self,
        pubkey: &str,
        msg_hash: &str,
        msg_context: &str,
    ) -> BridgeResult<(String, Vec<String>)> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": "dcrm_signOne",
            "params": [pubkey, msg_hash, msg_context],
            "id": 1,
        });

        debug!("dcrm signOne request, msghash {}", msg_hash);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| BridgeError::Gateway(format!("dcrm rpc: {e}")))?;

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::Gateway(format!("dcrm rpc decode: {e}")))?;

        if let Some(error) = body.error {
            return Err(BridgeError::Sign(format!(
                "dcrm signOne rejected ({}): {}",
                error.code, error.message
            )));
        }
        let result = body
            .result
            .ok_or_else(|| BridgeError::Sign("dcrm signOne returned no result".to_string()))?;

        Ok((result.key_id, result.rsvs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_response_decoding() {
        let raw = r#"{"result": {"key_id": "k-1", "rsvs": ["0xabcd"]}, "error": null}"#;
        let body: RpcResponse = serde_json::from_str(raw).unwrap();
        let result = body.result.unwrap();
        assert_eq!(result.key_id, "k-1");
        assert_eq!(result.rsvs.len(), 1);

        let raw = r#"{"result": null, "error": {"code": -32000, "message": "group offline"}}"#;
        let body: RpcResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(body.error.unwrap().message, "group offline");
    }
}
