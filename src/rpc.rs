// src/rpc.rs
use eyre::{eyre, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize, Clone)]
pub struct Log {
    #[allow(dead_code)]
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,

    #[serde(rename = "blockNumber")]
    pub block_number_hex: String,

    #[serde(rename = "transactionHash")]
    pub tx_hash: String,

    #[serde(rename = "logIndex")]
    pub log_index_hex: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Receipt {
    /// "0x1" success, "0x0" reverted.
    pub status: Option<String>,

    #[serde(rename = "blockNumber")]
    pub block_number_hex: Option<String>,
}

impl Receipt {
    pub fn succeeded(&self) -> bool {
        self.status.as_deref() == Some("0x1")
    }

    pub fn block_number(&self) -> Option<u64> {
        self.block_number_hex
            .as_deref()
            .and_then(|s| parse_hex_u64(s).ok())
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// ERC20 Transfer event topic keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

const BALANCE_OF_SELECTOR: &str = "0x70a08231";
const DECIMALS_SELECTOR: &str = "0x313ce567";

pub fn parse_hex_u64(s: &str) -> Result<u64> {
    Ok(u64::from_str_radix(s.trim_start_matches("0x"), 16)?)
}

pub fn parse_hex_u128(s: &str) -> Result<u128> {
    Ok(u128::from_str_radix(s.trim_start_matches("0x"), 16)?)
}

/// JSON-RPC chain client. One shared HTTP client with a bounded per-request
/// timeout; every method is a single suspension point.
pub struct ChainRpc {
    http: Client,
    url: String,
}

impl ChainRpc {
    pub fn new(url: &str) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        debug!("rpc {} -> {}", method, self.url);

        let resp = self.http.post(&self.url).json(&payload).send().await?;
        if !resp.status().is_success() {
            return Err(eyre!("RPC error: HTTP {}", resp.status()));
        }

        let parsed: RpcResponse<T> = resp.json().await?;
        if let Some(err) = parsed.error {
            return Err(eyre!("RPC {} failed: {} (code {})", method, err.message, err.code));
        }
        Ok(parsed.result)
    }

    async fn request_required<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T> {
        self.request(method, params)
            .await?
            .ok_or_else(|| eyre!("RPC {method} returned no result"))
    }

    /// Get the latest block number with retries
    pub async fn block_number(&self) -> Result<u64> {
        let mut last_err = None;
        for attempt in 1..=3 {
            match self.request_required::<String>("eth_blockNumber", json!([])).await {
                Ok(hex) => return parse_hex_u64(&hex),
                Err(e) if attempt < 3 => {
                    debug!("eth_blockNumber failed (attempt {attempt}): {e}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| eyre!("retries exhausted")))
    }

    /// Fetch Transfer logs for a token in a block range, filtered to a chunk
    /// of destination-address topics (chain APIs cap topic list sizes).
    pub async fn transfer_logs(
        &self,
        token_address: &str,
        from_block: u64,
        to_block: u64,
        to_topics: &[String],
    ) -> Result<Vec<Log>> {
        self.request_required(
            "eth_getLogs",
            json!([{
                "fromBlock": format!("0x{from_block:x}"),
                "toBlock": format!("0x{to_block:x}"),
                "address": token_address,
                "topics": [TRANSFER_TOPIC, Value::Null, to_topics],
            }]),
        )
        .await
    }

    /// None when the transaction is not yet included.
    pub async fn transaction_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>> {
        self.request("eth_getTransactionReceipt", json!([tx_hash]))
            .await
    }

    async fn call(&self, to: &str, data: String) -> Result<String> {
        self.request_required("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await
    }

    pub async fn token_decimals(&self, contract: &str) -> Result<u32> {
        let raw = self.call(contract, DECIMALS_SELECTOR.to_string()).await?;
        Ok(parse_hex_u64(&raw)? as u32)
    }

    /// Raw token units held by `owner`.
    pub async fn token_balance(&self, contract: &str, owner: &str) -> Result<alloy::primitives::U256> {
        let data = format!(
            "{BALANCE_OF_SELECTOR}000000000000000000000000{}",
            owner.trim_start_matches("0x").to_lowercase()
        );
        let raw = self.call(contract, data).await?;
        alloy::primitives::U256::from_str_radix(raw.trim_start_matches("0x"), 16)
            .map_err(|e| eyre!("bad balanceOf result: {e}"))
    }

    pub async fn transaction_count(&self, address: &str) -> Result<u64> {
        let raw: String = self
            .request_required("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        parse_hex_u64(&raw)
    }

    pub async fn gas_price(&self) -> Result<u128> {
        let raw: String = self.request_required("eth_gasPrice", json!([])).await?;
        parse_hex_u128(&raw)
    }

    /// Submit a signed raw transaction; returns the transaction hash.
    pub async fn send_raw_transaction(&self, raw_hex: &str) -> Result<String> {
        self.request_required("eth_sendRawTransaction", json!([raw_hex]))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_parsing() {
        assert_eq!(parse_hex_u64("0x10").unwrap(), 16);
        assert_eq!(parse_hex_u64("ff").unwrap(), 255);
        assert!(parse_hex_u64("0xzz").is_err());
    }

    #[test]
    fn receipt_status_and_block() {
        let receipt = Receipt {
            status: Some("0x1".to_string()),
            block_number_hex: Some("0x64".to_string()),
        };
        assert!(receipt.succeeded());
        assert_eq!(receipt.block_number(), Some(100));

        let reverted = Receipt {
            status: Some("0x0".to_string()),
            block_number_hex: None,
        };
        assert!(!reverted.succeeded());
    }
}
