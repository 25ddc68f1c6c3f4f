//! Blacklists and big-value rules, adjustable at runtime by operators

use crate::config::{BlacklistConfig, ChainConfig, Settings};
use crate::swap::SwapRecord;

use dashmap::DashSet;
use ethers::types::U256;
use std::collections::HashMap;
use tracing::info;

/// Per-deployment swap admission rules
pub struct SwapPolicy {
    blacked_chains: DashSet<u64>,
    blacked_tokens: DashSet<String>,
    blacked_accounts: DashSet<String>,
    /// `(token_id, account)` pairs exempt from the big-value hold
    big_value_whitelist: DashSet<(String, String)>,
    /// Token ID -> threshold in whole units
    thresholds: HashMap<String, u64>,
}

impl SwapPolicy {
    pub fn new(settings: &Settings) -> Self {
        let policy = Self::from_blacklist(&settings.blacklist);
        let mut thresholds = HashMap::new();
        for (token_id, token) in &settings.tokens {
            thresholds.insert(token_id.to_lowercase(), token.big_value_threshold);
            for account in &token.big_value_whitelist {
                policy
                    .big_value_whitelist
                    .insert((token_id.to_lowercase(), account.to_lowercase()));
            }
        }
        Self {
            thresholds,
            ..policy
        }
    }

    fn from_blacklist(config: &BlacklistConfig) -> Self {
        Self {
            blacked_chains: config.chain_ids.iter().copied().collect(),
            blacked_tokens: config.token_ids.iter().map(|t| t.to_lowercase()).collect(),
            blacked_accounts: config.accounts.iter().map(|a| a.to_lowercase()).collect(),
            big_value_whitelist: DashSet::new(),
            thresholds: HashMap::new(),
        }
    }

    /// Whether any chain, token or account of the swap is blacklisted
    pub fn is_blacked(&self, record: &SwapRecord) -> bool {
        self.is_chain_blacked(record.from_chain_id)
            || self.is_chain_blacked(record.to_chain_id)
            || self.is_token_blacked(&record.token_id)
            || self.is_account_blacked(&record.from)
            || self.is_account_blacked(&record.bind)
    }

    pub fn is_chain_blacked(&self, chain_id: u64) -> bool {
        self.blacked_chains.contains(&chain_id)
    }

    pub fn is_token_blacked(&self, token_id: &str) -> bool {
        self.blacked_tokens.contains(&token_id.to_lowercase())
    }

    pub fn is_account_blacked(&self, account: &str) -> bool {
        !account.is_empty() && self.blacked_accounts.contains(&account.to_lowercase())
    }

    pub fn set_chain_blacked(&self, chain_id: u64, blacked: bool) {
        info!("Set chain {} blacklisted: {}", chain_id, blacked);
        if blacked {
            self.blacked_chains.insert(chain_id);
        } else {
            self.blacked_chains.remove(&chain_id);
        }
    }

    pub fn set_token_blacked(&self, token_id: &str, blacked: bool) {
        info!("Set token {} blacklisted: {}", token_id, blacked);
        if blacked {
            self.blacked_tokens.insert(token_id.to_lowercase());
        } else {
            self.blacked_tokens.remove(&token_id.to_lowercase());
        }
    }

    pub fn set_account_blacked(&self, account: &str, blacked: bool) {
        info!("Set account {} blacklisted: {}", account, blacked);
        if blacked {
            self.blacked_accounts.insert(account.to_lowercase());
        } else {
            self.blacked_accounts.remove(&account.to_lowercase());
        }
    }

    pub fn set_big_value_whitelisted(&self, token_id: &str, account: &str, whitelisted: bool) {
        info!(
            "Set {} big value whitelisted for {}: {}",
            account, token_id, whitelisted
        );
        let entry = (token_id.to_lowercase(), account.to_lowercase());
        if whitelisted {
            self.big_value_whitelist.insert(entry);
        } else {
            self.big_value_whitelist.remove(&entry);
        }
    }

    pub fn is_big_value_whitelisted(&self, token_id: &str, account: &str) -> bool {
        self.big_value_whitelist
            .contains(&(token_id.to_lowercase(), account.to_lowercase()))
    }

    /// Threshold in raw units, if the token has one
    pub fn big_value_threshold(&self, token_id: &str, decimals: u8) -> Option<U256> {
        let threshold = *self.thresholds.get(&token_id.to_lowercase())?;
        if threshold == 0 {
            return None;
        }
        Some(U256::from(threshold) * U256::exp10(decimals as usize))
    }

    /// Whether the swap must wait for an operator release
    pub fn is_big_value(&self, record: &SwapRecord, source: &ChainConfig) -> bool {
        let Some(token) = source.token_config(&record.token) else {
            return false;
        };
        let Some(threshold) = self.big_value_threshold(&record.token_id, token.decimals) else {
            return false;
        };
        record.value > threshold && !self.is_big_value_whitelisted(&record.token_id, &record.from)
    }
}
