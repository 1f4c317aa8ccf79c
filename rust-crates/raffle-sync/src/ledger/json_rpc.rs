use crate::{
    Result,
    config::SyncConfig,
    entity::Address,
    error::{
        ConfigError,
        LedgerError,
    },
    ledger::{
        LedgerReader,
        MethodCall,
    },
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::json;
use std::{
    fmt,
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
};
use tracing::trace;
use url::Url;

/// `eth_call` over HTTP JSON-RPC.
pub struct JsonRpcLedger {
    url: Url,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl fmt::Debug for JsonRpcLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonRpcLedger")
            .field("url", &self.url.as_str())
            .finish()
    }
}

impl JsonRpcLedger {
    pub fn new(url: Url) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(LedgerError::Transport)?;
        Ok(Self {
            url,
            http,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let url = config.ledger_rpc_url()?.ok_or(ConfigError::Missing {
            var: crate::config::LEDGER_RPC_URL_VAR,
        })?;
        Self::new(url)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[derive(Serialize)]
struct RpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<String>,
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

impl LedgerReader for JsonRpcLedger {
    async fn call(&self, to: &Address, call: &MethodCall) -> Result<Vec<u8>> {
        let data = call.encode()?;
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: "eth_call",
            params: json!([
                { "to": to.as_str(), "data": format!("0x{}", hex::encode(data)) },
                "latest"
            ]),
        };
        trace!(%to, method = call.name(), "eth_call");
        let res = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(LedgerError::Transport)?;
        let status = res.status();
        let bytes = res.bytes().await.map_err(LedgerError::Transport)?;
        if !status.is_success() {
            return Err(LedgerError::Http {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            }
            .into());
        }
        let response: RpcResponse = serde_json::from_slice(&bytes)
            .map_err(|err| LedgerError::Decode(err.to_string()))?;
        if let Some(error) = response.error {
            return Err(LedgerError::Rpc {
                code: error.code,
                message: error.message,
            }
            .into());
        }
        let result = response.result.ok_or_else(|| {
            LedgerError::Decode("response has neither result nor error".to_string())
        })?;
        let body = result.strip_prefix("0x").unwrap_or(&result);
        if body.is_empty() {
            return Err(LedgerError::EmptyReturnData {
                method: call.name().to_string(),
            }
            .into());
        }
        Ok(hex::decode(body).map_err(|err| LedgerError::Decode(err.to_string()))?)
    }
}
