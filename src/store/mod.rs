//! Persistence for swap records and results
//!
//! Both backends share the mutation rules below so the forward-only result
//! status machine holds no matter where rows live.

mod memory;
mod postgres;

pub use memory::MemorySwapStore;
pub use postgres::PgSwapStore;

use crate::error::{RouterError, RouterResult};
use crate::swap::{
    now, RecordStatus, ResultStatus, SwapKey, SwapRecord, SwapResult, SwapResultUpdate,
};

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::warn;

/// Row counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub records: BTreeMap<String, u64>,
    pub results: BTreeMap<String, u64>,
}

/// Document-store facade keyed by `(from_chain_id, tx_id, log_index)`
///
/// No transactions span calls; callers re-check state before mutating.
#[async_trait]
pub trait SwapStore: Send + Sync {
    /// Insert a record; `Ok(false)` if the key is already registered
    async fn add_swap(&self, record: &SwapRecord) -> RouterResult<bool>;

    async fn find_swap(&self, key: &SwapKey) -> RouterResult<SwapRecord>;

    async fn update_swap_status(
        &self,
        key: &SwapKey,
        status: RecordStatus,
        memo: &str,
    ) -> RouterResult<()>;

    /// Records in `status` touched at or after `since`
    async fn find_swaps_with_status(
        &self,
        status: RecordStatus,
        since: i64,
    ) -> RouterResult<Vec<SwapRecord>>;

    /// Create the one result for a key; `ResultExists` if already present
    async fn add_initial_result(&self, result: &SwapResult) -> RouterResult<()>;

    async fn find_result(&self, key: &SwapKey) -> RouterResult<SwapResult>;

    async fn update_result(&self, key: &SwapKey, update: &SwapResultUpdate) -> RouterResult<()>;

    async fn update_result_status(
        &self,
        key: &SwapKey,
        status: ResultStatus,
        memo: &str,
    ) -> RouterResult<()>;

    /// Admin-only status write that bypasses the transition table
    async fn override_result_status(
        &self,
        key: &SwapKey,
        status: ResultStatus,
        memo: &str,
    ) -> RouterResult<()>;

    /// Record a new payout hash, keeping every superseded one
    async fn update_old_swap_txs(&self, key: &SwapKey, swap_tx: &str) -> RouterResult<()>;

    async fn update_result_timestamp(&self, key: &SwapKey) -> RouterResult<()>;

    async fn find_results_with_status(
        &self,
        status: ResultStatus,
        since: i64,
    ) -> RouterResult<Vec<SwapResult>>;

    /// `NotStable` results touched at or after `since`
    async fn find_results_to_stable(&self, since: i64) -> RouterResult<Vec<SwapResult>> {
        self.find_results_with_status(ResultStatus::NotStable, since)
            .await
    }

    /// `NotStable` results with no confirmed height touched at or after `since`
    async fn find_results_to_replace(&self, since: i64) -> RouterResult<Vec<SwapResult>> {
        let results = self
            .find_results_with_status(ResultStatus::NotStable, since)
            .await?;
        Ok(results
            .into_iter()
            .filter(|r| r.swap_height == 0 && !r.swap_tx.is_empty())
            .collect())
    }

    async fn stats(&self) -> RouterResult<StoreStats>;

    async fn health_check(&self) -> bool;
}

/// Apply a partial update under the store's lock
///
/// Stable results are left untouched. A non-zero nonce is never rewritten.
pub(crate) fn apply_update(res: &mut SwapResult, update: &SwapResultUpdate) -> RouterResult<bool> {
    let key = res.key();
    if res.status == ResultStatus::Stable {
        warn!("Ignore update of stable swap result {}", key);
        return Ok(false);
    }

    if let Some(status) = update.status {
        check_transition(&key, res.status, status)?;
    }

    let writes_nonce = update.swap_nonce.map(|n| n != 0).unwrap_or(false);
    if writes_nonce && res.swap_nonce != 0 {
        return Err(RouterError::Store(format!(
            "forbid update swap nonce again for {}: old {} new {}",
            key,
            res.swap_nonce,
            update.swap_nonce.unwrap_or_default()
        )));
    }

    if let Some(status) = update.status {
        res.status = status;
    }
    if let Some(tx) = update.swap_tx.as_ref().filter(|s| !s.is_empty()) {
        res.swap_tx = tx.to_lowercase();
    }
    if let Some(nonce) = update.swap_nonce.filter(|n| *n != 0) {
        res.swap_nonce = nonce;
    }
    if let Some(height) = update.swap_height.filter(|h| *h != 0) {
        res.swap_height = height;
    }
    if let Some(time) = update.swap_time.filter(|t| *t != 0) {
        res.swap_time = time;
    }
    if let Some(value) = update.swap_value.as_ref().filter(|s| !s.is_empty()) {
        res.swap_value = value.clone();
    }
    if let Some(mpc) = update.mpc.as_ref().filter(|s| !s.is_empty()) {
        res.mpc = mpc.to_lowercase();
    }
    if let Some(ttl) = update.ttl.filter(|t| *t != 0) {
        res.ttl = ttl;
    }
    match update.memo.as_ref().filter(|s| !s.is_empty()) {
        Some(memo) => res.memo = memo.clone(),
        None if update.status == Some(ResultStatus::NotStable) => res.memo.clear(),
        None => {}
    }
    res.timestamp = now();
    Ok(true)
}

/// Apply a status change, enforcing the transition table unless `force`
pub(crate) fn apply_status(
    res: &mut SwapResult,
    status: ResultStatus,
    memo: &str,
    force: bool,
) -> RouterResult<()> {
    if !force {
        check_transition(&res.key(), res.status, status)?;
    }
    res.status = status;
    res.timestamp = now();
    if !memo.is_empty() {
        res.memo = memo.to_string();
    }
    if status == ResultStatus::Reswapping {
        res.memo.clear();
        res.swap_tx.clear();
        res.old_swap_txs.clear();
        res.swap_height = 0;
        res.swap_time = 0;
        res.swap_nonce = 0;
    }
    Ok(())
}

/// Append a payout hash; returns whether anything changed
pub(crate) fn apply_old_swap_tx(res: &mut SwapResult, swap_tx: &str) -> bool {
    let swap_tx = swap_tx.to_lowercase();
    if swap_tx.is_empty()
        || res.swap_tx.eq_ignore_ascii_case(&swap_tx)
        || res.old_swap_txs.iter().any(|t| t.eq_ignore_ascii_case(&swap_tx))
    {
        return false;
    }

    if res.old_swap_txs.is_empty() && !res.swap_tx.is_empty() {
        res.old_swap_txs.push(res.swap_tx.clone());
    }
    res.old_swap_txs.push(swap_tx.clone());

    match res.status {
        ResultStatus::NeedReswap => res.swap_tx.clear(),
        ResultStatus::Stable => {
            warn!(
                "Keep swap tx of stable result {}, ignored {}",
                res.key(),
                swap_tx
            );
        }
        _ => res.swap_tx = swap_tx,
    }
    res.timestamp = now();
    true
}

fn check_transition(key: &SwapKey, from: ResultStatus, to: ResultStatus) -> RouterResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        warn!(
            "Rejected swap result status change of {} from {} to {}",
            key, from, to
        );
        Err(RouterError::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sample_result;

    #[test]
    fn test_update_refuses_second_nonce() {
        let mut res = sample_result(ResultStatus::Empty);
        let first = SwapResultUpdate {
            status: Some(ResultStatus::NotStable),
            swap_nonce: Some(7),
            swap_tx: Some("0xAB".into()),
            ..Default::default()
        };
        assert!(apply_update(&mut res, &first).unwrap());
        assert_eq!(res.swap_nonce, 7);
        assert_eq!(res.swap_tx, "0xab");

        let second = SwapResultUpdate {
            swap_nonce: Some(8),
            ..Default::default()
        };
        assert!(apply_update(&mut res, &second).is_err());
        assert_eq!(res.swap_nonce, 7);
    }

    #[test]
    fn test_update_ignores_stable() {
        let mut res = sample_result(ResultStatus::Stable);
        let update = SwapResultUpdate {
            swap_tx: Some("0xcc".into()),
            ..Default::default()
        };
        assert!(!apply_update(&mut res, &update).unwrap());
        assert!(res.swap_tx.is_empty());
    }

    #[test]
    fn test_reswapping_clears_payout_fields() {
        let mut res = sample_result(ResultStatus::NeedReswap);
        res.swap_tx = "0xaa".into();
        res.swap_nonce = 3;
        res.old_swap_txs = vec!["0xa0".into(), "0xaa".into()];
        apply_status(&mut res, ResultStatus::Reswapping, "", false).unwrap();
        assert!(res.swap_tx.is_empty());
        assert!(res.old_swap_txs.is_empty());
        assert_eq!(res.swap_nonce, 0);
    }

    #[test]
    fn test_status_change_obeys_table_unless_forced() {
        let mut res = sample_result(ResultStatus::Failed);
        assert!(apply_status(&mut res, ResultStatus::NeedReswap, "", false).is_err());
        apply_status(&mut res, ResultStatus::NeedReswap, "admin", true).unwrap();
        assert_eq!(res.status, ResultStatus::NeedReswap);
        assert_eq!(res.memo, "admin");
    }

    #[test]
    fn test_old_swap_txs_seed_and_dedup() {
        let mut res = sample_result(ResultStatus::NotStable);
        res.swap_tx = "0xa1".into();
        assert!(apply_old_swap_tx(&mut res, "0xA2"));
        assert_eq!(res.old_swap_txs, vec!["0xa1".to_string(), "0xa2".to_string()]);
        assert_eq!(res.swap_tx, "0xa2");
        assert!(!apply_old_swap_tx(&mut res, "0xa1"));
        assert!(apply_old_swap_tx(&mut res, "0xa3"));
        assert_eq!(res.old_swap_txs.len(), 3);
    }
}
