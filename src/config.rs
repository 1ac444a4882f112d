use alloy::primitives::utils::parse_units;
use alloy::primitives::{Address, U256};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub chain: ChainConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub pending: PendingConfig,
    #[serde(default)]
    pub enforcement: EnforcementConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    #[serde(default = "default_chain_name")]
    pub name: String,
    pub rpc_http: String,
    pub rpc_ws: Option<String>,
    pub token_address: String,
    #[serde(default = "default_token_decimals")]
    pub token_decimals: u8,
    pub start_block: Option<u64>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_log_batch_size")]
    pub log_batch_size: u64,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

fn default_chain_name() -> String {
    "mainnet".to_string()
}

fn default_token_decimals() -> u8 {
    18
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_log_batch_size() -> u64 {
    100
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

impl ChainConfig {
    pub fn token(&self) -> eyre::Result<Address> {
        parse_address(&self.token_address)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ============================================================
// Rule Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct RulesConfig {
    /// Token units, scaled by `chain.token_decimals` before use.
    #[serde(default = "default_amount_threshold")]
    pub large_amount_threshold: String,
    #[serde(default = "default_window_blocks")]
    pub outgoing_window_blocks: u64,
    #[serde(default = "default_outgoing_count")]
    pub outgoing_count_threshold: u64,
    #[serde(default = "default_window_blocks")]
    pub incoming_window_blocks: u64,
    #[serde(default = "default_amount_threshold")]
    pub incoming_amount_threshold: String,
    #[serde(default)]
    pub suspicious_addresses: Vec<String>,
    pub suspicious_addresses_path: Option<String>,
    /// Transfers touching these addresses skip every rule.
    #[serde(default)]
    pub whitelist_addresses: Vec<String>,
    pub whitelist_path: Option<String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            large_amount_threshold: default_amount_threshold(),
            outgoing_window_blocks: default_window_blocks(),
            outgoing_count_threshold: default_outgoing_count(),
            incoming_window_blocks: default_window_blocks(),
            incoming_amount_threshold: default_amount_threshold(),
            suspicious_addresses: Vec::new(),
            suspicious_addresses_path: None,
            whitelist_addresses: Vec::new(),
            whitelist_path: None,
        }
    }
}

fn default_amount_threshold() -> String {
    "1000".to_string()
}

fn default_window_blocks() -> u64 {
    10
}

fn default_outgoing_count() -> u64 {
    5
}

/// Rule thresholds resolved to exact base units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thresholds {
    pub large_amount: U256,
    pub outgoing_window_blocks: u64,
    pub outgoing_count: u64,
    pub incoming_window_blocks: u64,
    pub incoming_amount: U256,
}

impl RulesConfig {
    pub fn thresholds(&self, decimals: u8) -> eyre::Result<Thresholds> {
        Ok(Thresholds {
            large_amount: to_base_units(&self.large_amount_threshold, decimals)?,
            outgoing_window_blocks: self.outgoing_window_blocks,
            outgoing_count: self.outgoing_count_threshold,
            incoming_window_blocks: self.incoming_window_blocks,
            incoming_amount: to_base_units(&self.incoming_amount_threshold, decimals)?,
        })
    }
}

/// Convert a decimal amount in token units (e.g. "1000" or "0.5") into base units.
/// Rejects negative values and more fractional digits than the token carries.
pub fn to_base_units(amount: &str, decimals: u8) -> eyre::Result<U256> {
    let amount = amount.trim();
    if amount.is_empty() || amount.starts_with('-') {
        return Err(eyre::eyre!("Invalid token amount '{}'", amount));
    }
    if let Some((_, fraction)) = amount.split_once('.') {
        if fraction.len() > decimals as usize {
            return Err(eyre::eyre!(
                "Token amount '{}' has more than {} fractional digits",
                amount,
                decimals
            ));
        }
    }
    let parsed = parse_units(amount, decimals)
        .map_err(|e| eyre::eyre!("Invalid token amount '{}': {}", amount, e))?;
    Ok(parsed.get_absolute())
}

// ============================================================
// Analyzer / Pending / Enforcement / Shutdown Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct AnalyzerConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch_size: i64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            sweep_batch_size: default_sweep_batch(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    5
}

fn default_sweep_batch() -> i64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct PendingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_pending_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_pending_timeout(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_pending_timeout() -> u64 {
    3600
}

fn default_reap_interval() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnforcementConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub restrict_contract: Option<String>,
    /// Name of the environment variable holding the hex-encoded private key.
    #[serde(default = "default_signing_key_env")]
    pub signing_key_env: String,
    #[serde(default = "default_enforcement_batch")]
    pub batch_size: usize,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_signing_key_env() -> String {
    "BLACKLIST_PRIVATE_KEY".to_string()
}

fn default_enforcement_batch() -> usize {
    10
}

fn default_retry_interval() -> u64 {
    5
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            restrict_contract: None,
            signing_key_env: default_signing_key_env(),
            batch_size: default_enforcement_batch(),
            retry_interval_secs: default_retry_interval(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownConfig {
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period(),
        }
    }
}

fn default_grace_period() -> u64 {
    10
}

pub fn parse_address(value: &str) -> eyre::Result<Address> {
    if !value.starts_with("0x") || value.len() != 42 {
        return Err(eyre::eyre!("Invalid address '{}'", value));
    }
    Address::from_str(value).map_err(|e| eyre::eyre!("Invalid address '{}': {}", value, e))
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> eyre::Result<()> {
        self.chain.token()?;

        if self.chain.log_batch_size == 0 {
            return Err(eyre::eyre!("chain.log_batch_size must be at least 1"));
        }

        let rules = &self.rules;
        if rules.outgoing_window_blocks == 0 || rules.incoming_window_blocks == 0 {
            return Err(eyre::eyre!("Rule window widths must be at least 1 block"));
        }
        if rules.outgoing_count_threshold == 0 {
            return Err(eyre::eyre!("rules.outgoing_count_threshold must be at least 1"));
        }
        rules.thresholds(self.chain.token_decimals)?;
        for address in rules.suspicious_addresses.iter().chain(&rules.whitelist_addresses) {
            parse_address(address)?;
        }

        if self.analyzer.sweep_batch_size <= 0 {
            return Err(eyre::eyre!("analyzer.sweep_batch_size must be at least 1"));
        }

        if self.pending.enabled && self.chain.rpc_ws.is_none() {
            return Err(eyre::eyre!(
                "chain.rpc_ws is required when the pending watcher is enabled"
            ));
        }

        if self.enforcement.enabled {
            let contract = self.enforcement.restrict_contract.as_deref().ok_or_else(|| {
                eyre::eyre!("enforcement.restrict_contract is required when enforcement is enabled")
            })?;
            parse_address(contract)?;
            if self.enforcement.batch_size == 0 || self.enforcement.queue_capacity == 0 {
                return Err(eyre::eyre!(
                    "enforcement.batch_size and enforcement.queue_capacity must be at least 1"
                ));
            }
        }

        Ok(())
    }
}
