//! Chain module - per-chain capability contract and the bridge registry
//!
//! This module provides:
//! - The `Bridge` contract every supported chain implements
//! - Optional `NonceSetter` and `Reswapable` capabilities
//! - Multi-RPC provider management with automatic failover
//! - The process-wide registry handed to every engine

pub mod evm;
pub mod finality;
pub mod provider;
pub mod router;

pub use evm::EvmBridge;
pub use provider::{ChainProvider, GasPrice};

use crate::config::ChainConfig;
use crate::error::{BridgeError, RouterError, RouterResult};
use crate::swap::{BuildTxArgs, SwapInfo, SwapType, TxStatus, VerifyArgs};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Unsigned, chain-specific transaction produced by `build_raw_transaction`
pub struct RawTx(Box<dyn Any + Send + Sync>);

impl RawTx {
    pub fn new<T: Any + Send + Sync>(tx: T) -> Self {
        Self(Box::new(tx))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for RawTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RawTx(..)")
    }
}

/// Signed transaction ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
    pub bytes: Vec<u8>,
}

/// Which pool view to read an account nonce from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceTag {
    Pending,
    Latest,
}

/// Options for decoding swaps out of a source transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterArgs {
    pub swap_type: SwapType,
    /// Restrict to one log; `None` registers every swap in the tx
    pub log_index: Option<u32>,
}

/// Capability set of one supported chain
#[async_trait]
pub trait Bridge: Send + Sync {
    fn config(&self) -> &ChainConfig;

    fn chain_id(&self) -> u64 {
        self.config().chain_id
    }

    fn is_valid_address(&self, address: &str) -> bool;

    /// Decode every swap a source transaction carries, one result per swap
    async fn register_swap(
        &self,
        tx_id: &str,
        args: &RegisterArgs,
    ) -> Vec<Result<SwapInfo, BridgeError>>;

    /// Re-validate one swap against the chain
    async fn verify_transaction(
        &self,
        tx_id: &str,
        args: &VerifyArgs,
    ) -> Result<SwapInfo, BridgeError>;

    /// Build the payout; fills nonce, gas, value, `to` and `input` into `args`
    async fn build_raw_transaction(&self, args: &mut BuildTxArgs) -> Result<RawTx, BridgeError>;

    /// MPC-sign a built payout, returning the signed tx and its hash
    async fn mpc_sign_transaction(
        &self,
        raw_tx: &RawTx,
        args: &BuildTxArgs,
    ) -> Result<(SignedTx, String), BridgeError>;

    /// Check that `msg_hashes` is exactly what signing `raw_tx` would sign
    fn verify_msg_hash(&self, raw_tx: &RawTx, msg_hashes: &[String]) -> Result<(), BridgeError>;

    async fn send_transaction(&self, signed_tx: &SignedTx) -> Result<String, BridgeError>;

    /// `TxNotFound` when the chain does not know the hash
    async fn get_transaction_status(&self, tx_hash: &str) -> Result<TxStatus, BridgeError>;

    async fn get_latest_block_number(&self) -> Result<u64, BridgeError>;

    /// Account-nonce chains expose their nonce cache
    fn nonce_setter(&self) -> Option<&dyn NonceSetter> {
        None
    }

    /// Chains whose payouts can expire and be resent from scratch
    fn reswapable(&self) -> Option<&dyn Reswapable> {
        None
    }
}

/// Account-nonce management backed by a `NonceCache`
#[async_trait]
pub trait NonceSetter: Send + Sync {
    async fn get_pool_nonce(&self, address: &str, tag: NonceTag) -> Result<u64, BridgeError>;

    async fn get_swap_nonce(&self, address: &str) -> u64;

    async fn adjust_nonce(&self, address: &str, value: u64) -> u64;

    async fn set_nonce(&self, address: &str, value: u64);

    /// Hand back the nonce of an abandoned payout for reuse after the ack interval
    async fn recycle_swap_nonce(&self, address: &str, nonce: u64);

    /// Return a nonce this node allocated but never got signed
    async fn release_swap_nonce(&self, address: &str, nonce: u64) {
        self.recycle_swap_nonce(address, nonce).await
    }
}

/// Chains with a TTL-based reswap policy
#[async_trait]
pub trait Reswapable: Send + Sync {
    /// Chain-specific "now" the TTL is compared against
    async fn get_current_threshold(&self) -> Result<u64, BridgeError>;

    fn is_tx_timeout(&self, ttl: u64, current: u64) -> bool {
        ttl > 0 && current > ttl
    }
}

/// Chain-ID -> bridge lookup plus per-chain runtime state
pub struct BridgeRegistry {
    /// Bridges indexed by chain ID
    bridges: DashMap<u64, Arc<dyn Bridge>>,
    /// Chains an operator paused
    paused: DashSet<u64>,
    /// Last observed tip per chain
    latest_blocks: DashMap<u64, u64>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self {
            bridges: DashMap::new(),
            paused: DashSet::new(),
            latest_blocks: DashMap::new(),
        }
    }

    /// Register a bridge under its chain ID, replacing any previous one
    pub fn insert(&self, bridge: Arc<dyn Bridge>) {
        let chain_id = bridge.chain_id();
        info!("Registered bridge for chain {}", chain_id);
        self.bridges.insert(chain_id, bridge);
    }

    /// Get the bridge for a chain
    pub fn get(&self, chain_id: u64) -> RouterResult<Arc<dyn Bridge>> {
        self.bridges
            .get(&chain_id)
            .map(|b| b.clone())
            .ok_or(RouterError::ChainNotFound { chain_id })
    }

    pub fn contains(&self, chain_id: u64) -> bool {
        self.bridges.contains_key(&chain_id)
    }

    /// Get all registered chain IDs, sorted
    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.bridges.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Router MPC account paying out on a chain
    pub fn router_mpc(&self, chain_id: u64) -> RouterResult<String> {
        let bridge = self.get(chain_id)?;
        let mpc = bridge.config().router_mpc.to_lowercase();
        if mpc.is_empty() {
            return Err(RouterError::Config(format!(
                "chain {} has no router mpc",
                chain_id
            )));
        }
        Ok(mpc)
    }

    pub fn is_reswap_supported(&self, chain_id: u64) -> bool {
        self.bridges
            .get(&chain_id)
            .map(|b| b.reswapable().is_some())
            .unwrap_or(false)
    }

    pub fn pause(&self, chain_id: u64) {
        warn!("Chain {} paused", chain_id);
        self.paused.insert(chain_id);
        crate::metrics::record_chain_paused(chain_id, true);
    }

    pub fn unpause(&self, chain_id: u64) {
        info!("Chain {} unpaused", chain_id);
        self.paused.remove(&chain_id);
        crate::metrics::record_chain_paused(chain_id, false);
    }

    pub fn is_paused(&self, chain_id: u64) -> bool {
        self.paused.contains(&chain_id)
    }

    pub fn paused_chains(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.paused.iter().map(|id| *id).collect();
        ids.sort_unstable();
        ids
    }

    /// Record a newer tip; stale reads are ignored
    pub fn set_latest_block(&self, chain_id: u64, height: u64) {
        let mut entry = self.latest_blocks.entry(chain_id).or_insert(0);
        if height > *entry {
            *entry = height;
        }
    }

    /// Cached tip, 0 if never observed
    pub fn cached_latest_block(&self, chain_id: u64) -> u64 {
        self.latest_blocks
            .get(&chain_id)
            .map(|h| *h)
            .unwrap_or(0)
    }

    /// Refresh the cached tip of every chain
    pub async fn refresh_latest_blocks(&self) {
        let bridges: Vec<Arc<dyn Bridge>> = self.bridges.iter().map(|e| e.value().clone()).collect();
        for bridge in bridges {
            match bridge.get_latest_block_number().await {
                Ok(height) => {
                    self.set_latest_block(bridge.chain_id(), height);
                    debug!("Chain {} latest block {}", bridge.chain_id(), height);
                }
                Err(e) => {
                    warn!(
                        "Failed to get latest block of chain {}: {}",
                        bridge.chain_id(),
                        e
                    );
                }
            }
        }
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let mut results = Vec::new();

        for chain_id in self.chain_ids() {
            let Ok(bridge) = self.get(chain_id) else {
                continue;
            };
            let healthy = match bridge.get_latest_block_number().await {
                Ok(height) => {
                    self.set_latest_block(chain_id, height);
                    true
                }
                Err(e) => {
                    error!("Health check failed for chain {}: {}", chain_id, e);
                    false
                }
            };
            results.push((chain_id, healthy));

            crate::metrics::record_chain_health(chain_id, healthy);
        }

        results
    }
}

impl Default for BridgeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
