use dotenvy::dotenv;
use eyre::Result;
use rust_decimal::Decimal;
use std::{env, str::FromStr, time::Duration};

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_http_url: String,
    pub db_path: String,
    pub port: u16,
    pub chain_id: u64,

    // token under custody
    pub token_contract: Option<String>,
    pub token_symbol: String,
    pub token_decimals_override: Option<u32>,
    pub deposit_network: String,

    // scanning
    pub confirmations: u64,
    pub deposit_start_block: Option<u64>,
    pub scan_block_batch: u64,
    pub address_topic_chunk: usize,
    pub scan_interval: Duration,
    pub wallet_refresh_interval: Duration,
    pub deposit_scan_enabled: bool,

    // settlement
    pub withdraw_interval: Duration,
    pub reconcile_interval: Duration,
    pub min_net_withdrawal: Decimal,

    // signing material (absence disables the affected task, never the process)
    pub xpub: Option<String>,
    pub mnemonic: Option<String>,
    pub derivation_path: String,

    pub auto_activate_enabled: bool,
    /// Level 1..3 defaults; plan rows can override per plan.
    pub commission_pcts: [Decimal; 3],
}

fn parse_commission_pcts(raw: Option<String>) -> [Decimal; 3] {
    let defaults = [Decimal::from(15), Decimal::ONE, Decimal::ONE];
    let Some(raw) = raw else {
        return defaults;
    };
    let parts: Vec<_> = raw.split(',').map(str::trim).collect();
    if parts.len() != 3 {
        return defaults;
    }
    let mut pcts = defaults;
    for (slot, part) in pcts.iter_mut().zip(parts) {
        if let Ok(pct) = Decimal::from_str(part) {
            *slot = pct;
        }
    }
    pcts
}

fn env_opt(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_opt(key).map(|v| v.to_lowercase()) {
        Some(v) if v == "false" || v == "0" => false,
        Some(v) if v == "true" || v == "1" => true,
        _ => default,
    }
}

pub fn load() -> Result<Config> {
    dotenv().ok();

    let cfg = Config {
        rpc_http_url: env_opt("RPC_HTTP_URL")
            .or_else(|| env_opt("BSC_RPC_URL"))
            .unwrap_or_else(|| "https://bsc-dataseed.binance.org".to_string()),
        db_path: env_opt("DB_PATH").unwrap_or_else(|| "custody.db".to_string()),
        port: env_parse("PORT", 8080),
        chain_id: env_parse("CHAIN_ID", 56),

        token_contract: env_opt("TOKEN_CONTRACT")
            .or_else(|| env_opt("USDT_CONTRACT_BSC"))
            .map(|a| a.to_lowercase()),
        token_symbol: env_opt("TOKEN_SYMBOL").unwrap_or_else(|| "USDT".to_string()),
        token_decimals_override: env_opt("TOKEN_DECIMALS").and_then(|v| v.parse().ok()),
        deposit_network: env_opt("DEPOSIT_NETWORK").unwrap_or_else(|| "BEP20-USDT".to_string()),

        confirmations: env_parse("CONFIRMATIONS", 1),
        deposit_start_block: env_opt("DEPOSIT_START_BLOCK").and_then(|v| v.parse().ok()),
        scan_block_batch: env_parse("SCAN_BLOCK_BATCH", 500),
        address_topic_chunk: env_parse("ADDRESS_TOPIC_CHUNK", 25),
        scan_interval: Duration::from_secs(env_parse("SCAN_INTERVAL_SECS", 15)),
        wallet_refresh_interval: Duration::from_secs(env_parse("WALLET_REFRESH_SECS", 30)),
        deposit_scan_enabled: env_bool("DEPOSIT_SCAN_ENABLED", true),

        withdraw_interval: Duration::from_secs(env_parse("WITHDRAW_INTERVAL_SECS", 10)),
        reconcile_interval: Duration::from_secs(env_parse("RECONCILE_INTERVAL_SECS", 30)),
        min_net_withdrawal: env_opt("MIN_NET_WITHDRAWAL")
            .and_then(|v| Decimal::from_str(&v).ok())
            .unwrap_or_else(|| Decimal::from(10)),

        xpub: env_opt("XPUB").or_else(|| env_opt("BSC_XPUB")),
        mnemonic: env_opt("MNEMONIC").or_else(|| env_opt("BSC_MNEMONIC")),
        derivation_path: env_opt("DERIVATION_PATH")
            .unwrap_or_else(|| "m/44'/60'/0'/0".to_string()),

        auto_activate_enabled: env_bool("AUTO_ACTIVATE_ENABLED", true),
        commission_pcts: parse_commission_pcts(env_opt("COMMISSION_PCTS")),
    };

    Ok(cfg)
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        rpc_http_url: "http://localhost:8545".to_string(),
        db_path: ":memory:".to_string(),
        port: 0,
        chain_id: 56,
        token_contract: Some("0x55d398326f99059ff775485246999027b3197955".to_string()),
        token_symbol: "USDT".to_string(),
        token_decimals_override: Some(18),
        deposit_network: "BEP20-USDT".to_string(),
        confirmations: 2,
        deposit_start_block: None,
        scan_block_batch: 500,
        address_topic_chunk: 25,
        scan_interval: Duration::from_secs(15),
        wallet_refresh_interval: Duration::from_secs(30),
        deposit_scan_enabled: true,
        withdraw_interval: Duration::from_secs(10),
        reconcile_interval: Duration::from_secs(30),
        min_net_withdrawal: Decimal::from(10),
        xpub: None,
        mnemonic: None,
        derivation_path: "m/44'/60'/0'/0".to_string(),
        auto_activate_enabled: true,
        commission_pcts: [Decimal::from(15), Decimal::ONE, Decimal::ONE],
    }
}
