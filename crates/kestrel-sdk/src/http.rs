//! [`NodeRpc`] over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kestrel_chain::{Block, BlockHeader, BlockId, NodeRpc, ProtocolConstants};
use kestrel_core::{
    parse_u64, BlockHash, ClientConfig, ContractScript, KestrelError, OperationEnvelope,
    OperationHash, Result,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

/// Node RPC client speaking the node's JSON paths.
#[derive(Clone)]
pub struct RpcClient {
    base_url: String,
    chain: String,
    http: reqwest::Client,
}

/// Block as returned by the node. Only what inclusion search needs is kept.
#[derive(Debug, Deserialize)]
struct RawBlock {
    hash: BlockHash,
    header: RawShellHeader,
    #[serde(default)]
    operations: Vec<Vec<RawOperation>>,
}

#[derive(Debug, Deserialize)]
struct RawShellHeader {
    level: u64,
    predecessor: BlockHash,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawOperation {
    hash: OperationHash,
}

impl From<RawBlock> for Block {
    fn from(raw: RawBlock) -> Self {
        Block {
            header: BlockHeader {
                hash: raw.hash,
                level: raw.header.level,
                predecessor: raw.header.predecessor,
                timestamp: raw.header.timestamp,
            },
            operation_hashes: raw
                .operations
                .into_iter()
                .flatten()
                .map(|op| op.hash)
                .collect(),
        }
    }
}

/// How a failed response is reported. Only an injection can be rejected;
/// a failed read is a transport problem whatever the body says.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Read,
    Inject,
}

#[derive(Debug, Serialize)]
struct BigMapQuery<'a> {
    key: &'a Value,
    #[serde(rename = "type")]
    key_type: &'a Value,
}

impl RpcClient {
    /// Client whose requests give up after `timeout`.
    pub fn new(base_url: impl Into<String>, chain: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KestrelError::Rpc(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            chain: chain.into(),
            http,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::new(config.rpc_url.clone(), config.chain.clone(), config.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn block_path(&self, id: &BlockId) -> String {
        format!("/chains/{}/blocks/{}", self.chain, id)
    }

    fn contract_path(&self, address: &str, leaf: &str) -> String {
        format!(
            "{}/context/contracts/{}/{}",
            self.block_path(&BlockId::Head),
            address,
            leaf
        )
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        debug!(path, "GET");
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| KestrelError::Rpc(e.to_string()))?;
        Self::decode(path, response, Call::Read).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        call: Call,
    ) -> Result<T> {
        debug!(path, "POST");
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| KestrelError::Rpc(e.to_string()))?;
        Self::decode(path, response, call).await
    }

    async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response, call: Call) -> Result<T> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(KestrelError::NotFound {
                resource_type: "RPC path".to_string(),
                id: path.to_string(),
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            // Node errors come back as a JSON array of error objects.
            return Err(match serde_json::from_str::<Value>(&text) {
                Ok(errors @ Value::Array(_))
                    if call == Call::Inject
                        && (status.is_server_error() || status == StatusCode::BAD_REQUEST) =>
                {
                    KestrelError::rejected(errors)
                }
                _ => KestrelError::Rpc(format!("{path}: {status}: {text}")),
            });
        }
        response
            .json()
            .await
            .map_err(|e| KestrelError::Serialization(format!("{path}: {e}")))
    }
}

#[async_trait]
impl NodeRpc for RpcClient {
    async fn head(&self) -> Result<BlockHeader> {
        self.get(&format!("{}/header", self.block_path(&BlockId::Head))).await
    }

    async fn block(&self, id: BlockId) -> Result<Block> {
        let raw: RawBlock = self.get(&self.block_path(&id)).await?;
        Ok(raw.into())
    }

    async fn counter(&self, address: &str) -> Result<u64> {
        let value: Value = self.get(&self.contract_path(address, "counter")).await?;
        parse_u64(&value)
            .ok_or_else(|| KestrelError::Serialization(format!("counter is not an integer: {value}")))
    }

    async fn manager_key(&self, address: &str) -> Result<Option<String>> {
        match self.get::<Option<Value>>(&self.contract_path(address, "manager_key")).await {
            // Older nodes wrap the key in an object.
            Ok(Some(Value::Object(obj))) => Ok(obj.get("key").and_then(Value::as_str).map(str::to_string)),
            Ok(Some(Value::String(key))) => Ok(Some(key)),
            Ok(_) => Ok(None),
            Err(KestrelError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn script(&self, address: &str) -> Result<ContractScript> {
        self.get(&self.contract_path(address, "script")).await
    }

    async fn storage(&self, address: &str) -> Result<Value> {
        self.get(&self.contract_path(address, "storage")).await
    }

    async fn big_map_get(&self, address: &str, key: &Value, key_type: &Value) -> Result<Option<Value>> {
        let query = BigMapQuery { key, key_type };
        match self.post(&self.contract_path(address, "big_map_get"), &query, Call::Read).await {
            Ok(value) => Ok(Some(value)),
            Err(KestrelError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn constants(&self) -> Result<ProtocolConstants> {
        self.get(&format!("{}/context/constants", self.block_path(&BlockId::Head)))
            .await
    }

    async fn inject(&self, signed_hex: &str) -> Result<OperationHash> {
        let path = format!("/injection/operation?chain={}", self.chain);
        self.post(&path, signed_hex, Call::Inject).await
    }

    async fn run_operation(&self, envelope: &OperationEnvelope, signature: &str) -> Result<Value> {
        let path = format!(
            "{}/helpers/scripts/run_operation",
            self.block_path(&BlockId::Head)
        );
        let body = json!({
            "operation": {
                "branch": envelope.branch,
                "contents": envelope.contents,
                "signature": signature,
            }
        });
        self.post(&path, &body, Call::Read).await
    }
}
