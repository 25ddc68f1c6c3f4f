//! Chain provider with multi-RPC support and automatic failover

use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::BridgeError;

use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain ID
    chain_id: u64,
    /// Gas price strategy
    gas_price_strategy: GasPriceStrategy,
    /// Gas price cap in gwei
    max_gas_price_gwei: u64,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: &ChainConfig) -> Result<Self, BridgeError> {
        let mut http_providers = Vec::new();

        // Initialize HTTP providers
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(BridgeError::Rpc(format!(
                "no valid RPC providers for chain {}",
                config.chain_id
            )));
        }

        Ok(Self {
            chain_id: config.chain_id,
            gas_price_strategy: config.gas_price_strategy,
            max_gas_price_gwei: config.max_gas_price_gwei,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    /// Run a query against each provider in turn until one answers
    async fn with_failover<T, F, Fut>(&self, op: &str, f: F) -> Result<T, BridgeError>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = String::new();
        for _ in 0..self.http_providers.len() {
            match f(self.http().clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("Failed to {} on chain {}: {}", op, self.chain_id, e);
                    last_error = e.to_string();
                    self.failover();
                }
            }
        }

        Err(BridgeError::Rpc(format!("{}: {}", op, last_error)))
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> Result<u64, BridgeError> {
        self.with_failover("get block number", |p| async move { p.get_block_number().await })
            .await
            .map(|b| b.as_u64())
    }

    /// Get block header
    pub async fn get_block(&self, block_number: u64) -> Result<Option<Block<H256>>, BridgeError> {
        self.with_failover("get block", |p| async move { p.get_block(block_number).await })
            .await
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> Result<Option<TransactionReceipt>, BridgeError> {
        self.with_failover("get receipt", |p| async move {
            p.get_transaction_receipt(tx_hash).await
        })
        .await
    }

    /// Get transaction by hash
    pub async fn get_transaction(&self, tx_hash: H256) -> Result<Option<Transaction>, BridgeError> {
        self.with_failover("get transaction", |p| async move {
            p.get_transaction(tx_hash).await
        })
        .await
    }

    /// Get account nonce at the given block tag
    pub async fn get_transaction_count(
        &self,
        address: Address,
        tag: BlockNumber,
    ) -> Result<u64, BridgeError> {
        self.with_failover("get transaction count", |p| async move {
            p.get_transaction_count(address, Some(tag.into())).await
        })
        .await
        .map(|n| n.as_u64())
    }

    /// Estimate gas for a transaction
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> Result<U256, BridgeError> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| BridgeError::EstimateGasFailed(e.to_string()))
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> Result<GasPrice, BridgeError> {
        match self.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .with_failover("get gas price", |p| async move { p.get_gas_price().await })
                    .await?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> Result<(U256, U256), BridgeError> {
        let block = self
            .with_failover("get latest block", |p| async move {
                p.get_block(BlockNumber::Latest).await
            })
            .await?
            .ok_or_else(|| BridgeError::Rpc("no latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| BridgeError::Rpc("no base fee in block".to_string()))?;

        // Priority fee estimation (can be improved with fee history)
        let priority_fee = U256::from(2_000_000_000u64); // 2 gwei default

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;

        // Cap at configured max
        let max_gwei = U256::from(self.max_gas_price_gwei) * U256::from(1_000_000_000u64);
        let max_fee = std::cmp::min(max_fee, max_gwei);

        Ok((max_fee, priority_fee))
    }

    /// Broadcast a signed transaction on the active provider
    pub async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, BridgeError> {
        self.http()
            .send_raw_transaction(raw)
            .await
            .map(|pending| pending.tx_hash())
            .map_err(|e| BridgeError::Send(e.to_string()))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.chain_id, e);
                false
            }
        }
    }

    /// Get chain ID
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn gas_price_strategy(&self) -> GasPriceStrategy {
        self.gas_price_strategy
    }
}

/// Gas price types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// Price to put in a legacy transaction
    pub fn effective(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }
}
