//! In-memory swap store, used by tests and `backend = "memory"`

use super::{apply_old_swap_tx, apply_status, apply_update, StoreStats, SwapStore};
use crate::error::{RouterError, RouterResult};
use crate::swap::{
    now, RecordStatus, ResultStatus, SwapKey, SwapRecord, SwapResult, SwapResultUpdate,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Stores records and results in process memory
#[derive(Clone, Default)]
pub struct MemorySwapStore {
    records: Arc<RwLock<HashMap<SwapKey, SwapRecord>>>,
    results: Arc<RwLock<HashMap<SwapKey, SwapResult>>>,
}

impl std::fmt::Debug for MemorySwapStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySwapStore").finish()
    }
}

impl MemorySwapStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a result as-is
    #[cfg(test)]
    pub async fn put_result(&self, result: SwapResult) {
        self.results.write().await.insert(result.key(), result);
    }

    /// Overwrite a record as-is
    #[cfg(test)]
    pub async fn put_swap(&self, record: SwapRecord) {
        self.records.write().await.insert(record.key(), record);
    }
}

fn sorted_by_time<T, F: Fn(&T) -> i64>(mut rows: Vec<T>, ts: F) -> Vec<T> {
    rows.sort_by_key(|r| ts(r));
    rows
}

#[async_trait]
impl SwapStore for MemorySwapStore {
    async fn add_swap(&self, record: &SwapRecord) -> RouterResult<bool> {
        let mut records = self.records.write().await;
        let key = record.key();
        if records.contains_key(&key) {
            return Ok(false);
        }
        records.insert(key.clone(), record.clone());
        debug!("Added swap {}", key);
        Ok(true)
    }

    async fn find_swap(&self, key: &SwapKey) -> RouterResult<SwapRecord> {
        self.records
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| RouterError::SwapNotFound {
                key: key.to_string(),
            })
    }

    async fn update_swap_status(
        &self,
        key: &SwapKey,
        status: RecordStatus,
        memo: &str,
    ) -> RouterResult<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(key)
            .ok_or_else(|| RouterError::SwapNotFound {
                key: key.to_string(),
            })?;
        record.status = status;
        record.timestamp = now();
        if !memo.is_empty() {
            record.memo = memo.to_string();
        }
        Ok(())
    }

    async fn find_swaps_with_status(
        &self,
        status: RecordStatus,
        since: i64,
    ) -> RouterResult<Vec<SwapRecord>> {
        let rows = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.status == status && r.timestamp >= since)
            .cloned()
            .collect();
        Ok(sorted_by_time(rows, |r: &SwapRecord| r.timestamp))
    }

    async fn add_initial_result(&self, result: &SwapResult) -> RouterResult<()> {
        let mut results = self.results.write().await;
        let key = result.key();
        if results.contains_key(&key) {
            return Err(RouterError::ResultExists {
                key: key.to_string(),
            });
        }
        results.insert(key, result.clone());
        Ok(())
    }

    async fn find_result(&self, key: &SwapKey) -> RouterResult<SwapResult> {
        self.results
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| RouterError::ResultNotFound {
                key: key.to_string(),
            })
    }

    async fn update_result(&self, key: &SwapKey, update: &SwapResultUpdate) -> RouterResult<()> {
        let mut results = self.results.write().await;
        let res = results
            .get_mut(key)
            .ok_or_else(|| RouterError::ResultNotFound {
                key: key.to_string(),
            })?;
        apply_update(res, update)?;
        Ok(())
    }

    async fn update_result_status(
        &self,
        key: &SwapKey,
        status: ResultStatus,
        memo: &str,
    ) -> RouterResult<()> {
        let mut results = self.results.write().await;
        let res = results
            .get_mut(key)
            .ok_or_else(|| RouterError::ResultNotFound {
                key: key.to_string(),
            })?;
        apply_status(res, status, memo, false)
    }

    async fn override_result_status(
        &self,
        key: &SwapKey,
        status: ResultStatus,
        memo: &str,
    ) -> RouterResult<()> {
        let mut results = self.results.write().await;
        let res = results
            .get_mut(key)
            .ok_or_else(|| RouterError::ResultNotFound {
                key: key.to_string(),
            })?;
        apply_status(res, status, memo, true)
    }

    async fn update_old_swap_txs(&self, key: &SwapKey, swap_tx: &str) -> RouterResult<()> {
        let mut results = self.results.write().await;
        let res = results
            .get_mut(key)
            .ok_or_else(|| RouterError::ResultNotFound {
                key: key.to_string(),
            })?;
        apply_old_swap_tx(res, swap_tx);
        Ok(())
    }

    async fn update_result_timestamp(&self, key: &SwapKey) -> RouterResult<()> {
        let mut results = self.results.write().await;
        let res = results
            .get_mut(key)
            .ok_or_else(|| RouterError::ResultNotFound {
                key: key.to_string(),
            })?;
        res.timestamp = now();
        Ok(())
    }

    async fn find_results_with_status(
        &self,
        status: ResultStatus,
        since: i64,
    ) -> RouterResult<Vec<SwapResult>> {
        let rows = self
            .results
            .read()
            .await
            .values()
            .filter(|r| r.status == status && r.timestamp >= since)
            .cloned()
            .collect();
        Ok(sorted_by_time(rows, |r: &SwapResult| r.timestamp))
    }

    async fn stats(&self) -> RouterResult<StoreStats> {
        let mut stats = StoreStats::default();
        for record in self.records.read().await.values() {
            *stats
                .records
                .entry(record.status.to_string())
                .or_insert(0) += 1;
        }
        for result in self.results.read().await.values() {
            *stats
                .results
                .entry(result.status.to_string())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }

    async fn health_check(&self) -> bool {
        true
    }
}
