//! Auxiliary JSON-RPC client.
//!
//! Used for the per-block diagnostic trace call only; the WebSocket transport
//! remains the primary feed. The payload is treated as opaque: we only care
//! whether the call produced a result or an error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Encode a u64 as a JSON-RPC quantity (`0x` + minimal base-16 digits).
pub fn hex_quantity(n: u64) -> String {
    format!("0x{n:x}")
}

/// Parse a JSON-RPC quantity back into a u64.
pub fn parse_quantity(s: &str) -> Result<u64> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid hex quantity: {s}"))
}

/// Seam for the auxiliary request/response call so tests can script it.
#[async_trait]
pub trait TraceRpc: Send + Sync {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value>;
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a [Value],
}

#[derive(Debug, Deserialize)]
pub(crate) struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

/// HTTP JSON-RPC client for the auxiliary endpoint.
#[derive(Clone)]
pub struct HttpRpcClient {
    client: Client,
    url: String,
    next_id: std::sync::Arc<AtomicU64>,
}

impl HttpRpcClient {
    pub fn new(url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("failed to build trace rpc client")?;

        Ok(Self {
            client,
            url,
            next_id: std::sync::Arc::new(AtomicU64::new(1)),
        })
    }
}

#[async_trait]
impl TraceRpc for HttpRpcClient {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params: &params,
        };

        let resp = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("POST {method} failed"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{method} {status}: {text}");
        }

        let parsed: RpcResponse = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {method} response"))?;

        if let Some(err) = parsed.error {
            bail!("{method} rpc error {}: {}", err.code, err.message);
        }

        parsed
            .result
            .ok_or_else(|| anyhow!("{method} response carried neither result nor error"))
    }
}
