//! Nonce management for reliable payout submission
//!
//! Handles:
//! - Local next-nonce tracking per signer address
//! - Sanity guard against corrupt on-chain reads
//! - Recycling of nonces abandoned by replacement

use crate::swap::now;

use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Nonces freed by abandoned payouts for one account
#[derive(Debug, Default)]
struct RecyclePool {
    /// Queued nonce -> time it was handed back
    queued: BTreeMap<u64, i64>,
    /// Recycled nonces already given to another payout
    reused: HashSet<u64>,
}

/// Next-nonce tracker for the signer accounts of one chain
pub struct NonceCache {
    /// Chain ID, for logging
    chain_id: u64,
    /// Lowercase address -> next nonce
    swap_nonce: RwLock<HashMap<String, u64>>,
    /// Lowercase address -> recycled nonces
    recycled: RwLock<HashMap<String, RecyclePool>>,
    /// Seconds a recycled nonce must age before reuse
    recycle_ack_secs: i64,
}

impl NonceCache {
    /// Create an empty cache
    pub fn new(chain_id: u64, recycle_ack_secs: u64) -> Self {
        Self {
            chain_id,
            swap_nonce: RwLock::new(HashMap::new()),
            recycled: RwLock::new(HashMap::new()),
            recycle_ack_secs: recycle_ack_secs as i64,
        }
    }

    /// Seed an account, preferring the pool nonce when it is ahead
    pub async fn init(&self, address: &str, stored: u64, pending: Option<u64>) {
        let account = address.to_lowercase();
        let nonce = match pending {
            Some(p) if p > stored => {
                warn!(
                    "Init nonce on chain {} with pool nonce {} (stored {})",
                    self.chain_id, p, stored
                );
                p
            }
            _ => stored,
        };
        self.swap_nonce.write().await.insert(account.clone(), nonce);
        info!(
            "Initialized nonce for {} on chain {}: {}",
            account, self.chain_id, nonce
        );
    }

    /// Current next nonce for an account (0 if unknown)
    pub async fn get(&self, address: &str) -> u64 {
        self.swap_nonce
            .read()
            .await
            .get(&address.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    /// Reconcile with an on-chain read without storing it
    ///
    /// Returns the larger of cached and on-chain values, but keeps the
    /// cached value when the read jumps past `2*old + 1000`.
    pub async fn adjust(&self, address: &str, value: u64) -> u64 {
        let old = self.get(address).await;
        if value > old.saturating_mul(2).saturating_add(1000) {
            warn!(
                "Forbid adjust nonce on chain {} for {}: old {} new {} (too big)",
                self.chain_id, address, old, value
            );
            return old;
        }
        let nonce = old.max(value);
        debug!(
            "Adjust nonce on chain {} for {}: old {} new {}",
            self.chain_id, address, old, nonce
        );
        nonce
    }

    /// Raise the next nonce; never moves it backwards
    pub async fn set(&self, address: &str, value: u64) {
        let account = address.to_lowercase();
        let mut nonces = self.swap_nonce.write().await;
        let entry = nonces.entry(account.clone()).or_insert(value);
        if *entry < value {
            *entry = value;
        }
        debug!(
            "Set nonce on chain {} for {}: {}",
            self.chain_id, account, *entry
        );
    }

    /// Reserve a nonce for parallel dispatch
    ///
    /// The lowest acked recycled nonce is handed out first, otherwise the
    /// next nonce is returned and the counter advances.
    pub async fn allocate(&self, address: &str) -> u64 {
        let account = address.to_lowercase();

        {
            let mut recycled = self.recycled.write().await;
            if let Some(pool) = recycled.get_mut(&account) {
                let acked = pool
                    .queued
                    .iter()
                    .find(|(_, at)| now() - **at >= self.recycle_ack_secs)
                    .map(|(nonce, _)| *nonce);
                if let Some(nonce) = acked {
                    pool.queued.remove(&nonce);
                    pool.reused.insert(nonce);
                    info!(
                        "Reuse recycled nonce {} on chain {} for {}",
                        nonce, self.chain_id, account
                    );
                    return nonce;
                }
            }
        }

        let mut nonces = self.swap_nonce.write().await;
        let next = nonces.entry(account).or_insert(0);
        let nonce = *next;
        *next += 1;
        nonce
    }

    /// Hand a nonce back for reuse
    ///
    /// A nonce is queued once and reused at most once. Nonces never
    /// allocated from this cache are ignored.
    pub async fn recycle(&self, address: &str, nonce: u64) {
        let account = address.to_lowercase();
        if nonce >= self.get(&account).await {
            warn!(
                "Ignore recycle of unallocated nonce {} on chain {} for {}",
                nonce, self.chain_id, account
            );
            return;
        }
        let mut recycled = self.recycled.write().await;
        let pool = recycled.entry(account.clone()).or_default();
        if pool.reused.contains(&nonce) || pool.queued.contains_key(&nonce) {
            warn!(
                "Ignore repeated recycle of nonce {} on chain {} for {}",
                nonce, self.chain_id, account
            );
            return;
        }
        pool.queued.insert(nonce, now());
        info!(
            "Recycled nonce {} on chain {} for {}",
            nonce, self.chain_id, account
        );
    }

    /// Return an allocation whose payout was never signed
    ///
    /// A reused nonce goes straight back to the queue, a fresh one is
    /// recycled as usual.
    pub async fn release(&self, address: &str, nonce: u64) {
        let account = address.to_lowercase();
        {
            let mut recycled = self.recycled.write().await;
            if let Some(pool) = recycled.get_mut(&account) {
                if pool.reused.remove(&nonce) {
                    pool.queued.insert(nonce, now());
                    debug!(
                        "Released recycled nonce {} on chain {} for {}",
                        nonce, self.chain_id, account
                    );
                    return;
                }
            }
        }
        self.recycle(&account, nonce).await
    }
}
