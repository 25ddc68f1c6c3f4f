//! Configuration management for the swap router
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::finality::recommended_confirmations;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub router: RouterConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub blacklist: BlacklistConfig,
    #[serde(default)]
    pub tokens: HashMap<String, TokenConfig>,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub mpc: MpcConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
}

/// Which engines this node runs
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Verify, dispatch, stabilise, replace and reswap
    #[default]
    Server,
    /// Accept-sign only
    Oracle,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouterConfig {
    /// Application identifier embedded in every sign context
    pub identifier: String,
    #[serde(default)]
    pub role: NodeRole,
    #[serde(default)]
    pub parallel_swap: bool,
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default)]
    pub assistants: Vec<String>,
    /// MPC initiators whose sign requests this node is willing to vote on
    #[serde(default)]
    pub initiators: Vec<String>,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

impl RouterConfig {
    pub fn is_admin(&self, account: &str) -> bool {
        contains_ignore_case(&self.admins, account)
    }

    pub fn is_assistant(&self, account: &str) -> bool {
        contains_ignore_case(&self.assistants, account)
    }

    pub fn is_initiator(&self, account: &str) -> bool {
        contains_ignore_case(&self.initiators, account)
    }
}

/// Engine timing, queue sizes and retry policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub verify_interval_secs: u64,
    pub swap_interval_secs: u64,
    pub stable_interval_secs: u64,
    pub replace_interval_secs: u64,
    pub reswap_interval_secs: u64,
    pub pass_big_value_interval_secs: u64,
    pub latest_block_interval_secs: u64,

    /// Find windows: only rows touched within the lifetime are polled
    pub max_verify_lifetime_secs: u64,
    pub max_swap_lifetime_secs: u64,
    pub max_stable_lifetime_secs: u64,
    pub max_replace_lifetime_secs: u64,
    pub max_tx_not_found_secs: u64,

    pub swap_queue_size: usize,
    pub stable_queue_size: usize,
    pub max_cached_swap_tasks: usize,
    pub max_cached_verifying: usize,
    pub swap_history_size: usize,

    pub enable_replace: bool,
    pub wait_time_to_replace_secs: u64,
    pub max_replace_count: usize,
    pub nonce_passed_interval_secs: u64,
    pub nonce_recycle_ack_secs: u64,

    pub retry_send_tx_loops: u32,
    pub send_tx_retries: u32,
    pub send_retry_interval_ms: u64,
    pub send_retry_loop_interval_ms: u64,
    pub enable_send_tx_loop: bool,
    pub send_tx_loop_count: u32,
    pub send_tx_loop_interval_secs: u64,

    pub accept_workers: usize,
    pub accept_poll_interval_secs: u64,
    pub accept_retry_interval_secs: u64,
    pub accept_history_size: usize,

    pub enable_pass_big_value: bool,
    pub pass_big_value_after_secs: u64,

    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            verify_interval_secs: 10,
            swap_interval_secs: 3,
            stable_interval_secs: 10,
            replace_interval_secs: 30,
            reswap_interval_secs: 30,
            pass_big_value_interval_secs: 60,
            latest_block_interval_secs: 5,
            max_verify_lifetime_secs: 7 * 86400,
            max_swap_lifetime_secs: 7 * 86400,
            max_stable_lifetime_secs: 7 * 86400,
            max_replace_lifetime_secs: 7 * 86400,
            max_tx_not_found_secs: 7200,
            swap_queue_size: 10,
            stable_queue_size: 50,
            max_cached_swap_tasks: 10000,
            max_cached_verifying: 100,
            swap_history_size: 1000,
            enable_replace: true,
            wait_time_to_replace_secs: 300,
            max_replace_count: 20,
            nonce_passed_interval_secs: 300,
            nonce_recycle_ack_secs: 300,
            retry_send_tx_loops: 2,
            send_tx_retries: 3,
            send_retry_interval_ms: 1000,
            send_retry_loop_interval_ms: 3000,
            enable_send_tx_loop: true,
            send_tx_loop_count: 10,
            send_tx_loop_interval_secs: 10,
            accept_workers: 10,
            accept_poll_interval_secs: 20,
            accept_retry_interval_secs: 3,
            accept_history_size: 500,
            enable_pass_big_value: false,
            pass_big_value_after_secs: 86400,
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlacklistConfig {
    #[serde(default)]
    pub chain_ids: Vec<u64>,
    #[serde(default)]
    pub token_ids: Vec<String>,
    #[serde(default)]
    pub accounts: Vec<String>,
}

/// Per token-ID policy shared by every chain
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenConfig {
    /// Threshold in whole token units, 0 disables the check
    #[serde(default)]
    pub big_value_threshold: u64,
    #[serde(default)]
    pub big_value_whitelist: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub router_contract: String,
    /// MPC account that signs payouts on this chain
    #[serde(default)]
    pub router_mpc: String,
    #[serde(default)]
    pub router_mpc_pubkey: String,
    #[serde(default)]
    pub confirmations: Option<u64>,
    #[serde(default)]
    pub initial_height: u64,
    #[serde(default)]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    /// Extra fee per replace attempt, in percent
    #[serde(default = "default_replace_gas_bump_percent")]
    pub replace_gas_bump_percent: u64,
    /// Block-height TTL for reswap-capable chains, 0 disables reswap
    #[serde(default)]
    pub reswap_ttl: u64,
    /// Token address (lowercase) -> token settings on this chain
    #[serde(default)]
    pub tokens: HashMap<String, ChainTokenConfig>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ChainConfig {
    pub fn required_confirmations(&self) -> u64 {
        self.confirmations
            .unwrap_or_else(|| recommended_confirmations(self.chain_id))
    }

    pub fn token_config(&self, address: &str) -> Option<&ChainTokenConfig> {
        self.tokens
            .iter()
            .find(|(addr, _)| addr.eq_ignore_ascii_case(address))
            .map(|(_, cfg)| cfg)
    }

    /// Address of the token with the given ID on this chain
    pub fn token_address(&self, token_id: &str) -> Option<&str> {
        self.tokens
            .iter()
            .find(|(_, cfg)| cfg.token_id == token_id)
            .map(|(addr, _)| addr.as_str())
    }

    pub fn is_reswap_capable(&self) -> bool {
        self.reswap_ttl > 0
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChainTokenConfig {
    pub token_id: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    #[default]
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MpcConfig {
    pub enabled: bool,
    pub rpc_url: String,
    /// Environment variable holding the node's user key
    pub key_env: String,
    pub group_id: String,
    pub threshold: String,
    pub mode: u32,
    pub chain_id: u64,
    pub sign_status_interval_secs: u64,
    pub sign_status_retries: u32,
}

impl Default for MpcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rpc_url: String::new(),
            key_env: "MPC_USER_PRIVATE_KEY".to_string(),
            group_id: String::new(),
            threshold: "2/3".to_string(),
            mode: 0,
            chain_id: 30400,
            sign_status_interval_secs: 3,
            sign_status_retries: 70,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Settings {
    /// Load settings from the file named by `SWAP_ROUTER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("SWAP_ROUTER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));
        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.router.identifier.is_empty() {
            anyhow::bail!("router.identifier must be set");
        }

        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        let mut seen = std::collections::HashSet::new();
        for (name, chain) in self.enabled_chains() {
            if !seen.insert(chain.chain_id) {
                anyhow::bail!("Duplicate chain id {} (chain {})", chain.chain_id, name);
            }
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            if self.router.role == NodeRole::Server && chain.router_mpc.is_empty() {
                anyhow::bail!("Chain {} has no router MPC address", name);
            }
            for (address, token) in &chain.tokens {
                if !self.tokens.contains_key(&token.token_id) {
                    tracing::warn!(
                        "Chain {} token {} refers to unknown token id {}",
                        name,
                        address,
                        token.token_id
                    );
                }
            }
        }

        if self.worker.swap_queue_size == 0 || self.worker.stable_queue_size == 0 {
            anyhow::bail!("worker queue sizes must be positive");
        }
        if self.worker.accept_workers == 0 {
            anyhow::bail!("worker.accept_workers must be positive");
        }
        if self.database.backend == StoreBackend::Postgres && self.database.url.is_empty() {
            anyhow::bail!("database.url is required for the postgres backend");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }
}

fn contains_ignore_case(list: &[String], item: &str) -> bool {
    list.iter().any(|x| x.eq_ignore_ascii_case(item))
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_max_gas_price_gwei() -> u64 {
    500
}

fn default_replace_gas_bump_percent() -> u64 {
    10
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

lazy_static! {
    static ref ENV_VAR_PATTERN: Regex =
        Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR_PATTERN.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [router]
        identifier = "SWAP_ROUTER_TEST"
        admins = ["0xAbC0000000000000000000000000000000000001"]
        initiators = ["0x00000000000000000000000000000000000000aa"]

        [worker]
        max_replace_count = 5

        [tokens.USDC]
        big_value_threshold = 1000

        [chains.ethereum]
        chain_id = 1
        name = "Ethereum"
        rpc_urls = ["${TEST_SWAP_ROUTER_RPC}"]
        router_contract = "0x1111111111111111111111111111111111111111"
        router_mpc = "0x2222222222222222222222222222222222222222"

        [chains.ethereum.tokens."0x3333333333333333333333333333333333333333"]
        token_id = "USDC"
        decimals = 6

        [database]
        backend = "memory"

        [api]
        host = "127.0.0.1"
        port = 8080

        [metrics]
        enabled = false
        port = 9090
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_from_file() {
        env::set_var("TEST_SWAP_ROUTER_RPC", "http://localhost:8545");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        let chain = &settings.chains["ethereum"];
        assert_eq!(chain.rpc_urls, vec!["http://localhost:8545".to_string()]);
        // falls back to the recommended depth for mainnet
        assert_eq!(chain.required_confirmations(), 32);
        assert_eq!(settings.worker.max_replace_count, 5);
        assert_eq!(settings.worker.swap_queue_size, 10);
        assert_eq!(settings.database.backend, StoreBackend::Memory);
        assert!(settings.router.is_admin("0xabc0000000000000000000000000000000000001"));
        assert!(!settings.router.is_assistant("0xabc0000000000000000000000000000000000001"));
    }

    #[test]
    fn test_chain_token_lookup() {
        env::set_var("TEST_SWAP_ROUTER_RPC", "http://localhost:8545");
        let settings = Settings::parse(SAMPLE).unwrap();
        assert_eq!(settings.tokens["USDC"].big_value_threshold, 1000);

        let chain = &settings.chains["ethereum"];
        let token = chain
            .token_config("0x3333333333333333333333333333333333333333")
            .unwrap();
        assert_eq!(token.token_id, "USDC");
        assert_eq!(
            chain.token_address("USDC"),
            Some("0x3333333333333333333333333333333333333333")
        );
    }

    #[test]
    fn test_missing_identifier_rejected() {
        let bad = SAMPLE.replace("identifier = \"SWAP_ROUTER_TEST\"", "identifier = \"\"");
        assert!(Settings::parse(&bad).is_err());
    }
}
