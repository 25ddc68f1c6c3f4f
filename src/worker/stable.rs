//! Stable engine: follows sent payouts until they are final

use super::queue::{self, TaskQueue};
use super::reswap::ReswapEngine;
use super::{check_swap_nonce_passed, WorkerContext};
use crate::error::RouterResult;
use crate::metrics;
use crate::swap::{ResultStatus, SwapResult, SwapResultUpdate};
use crate::tx::find_swap_tx_on_chain;

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct StableEngine {
    ctx: WorkerContext,
    reswap: Arc<ReswapEngine>,
    queue: Arc<TaskQueue<SwapResult>>,
}

impl StableEngine {
    pub fn new(ctx: WorkerContext, reswap: Arc<ReswapEngine>) -> Self {
        Self {
            queue: Arc::new(TaskQueue::new("stable", ctx.worker().stable_queue_size)),
            reswap,
            ctx,
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!("Stable engine started");
        let mut consumers = Vec::new();
        for chain_id in self.ctx.registry.chain_ids() {
            let rx = self.queue.register(chain_id);
            let engine = self.clone();
            consumers.push(tokio::spawn(queue::consume(
                rx,
                self.queue.clone(),
                self.ctx.shutdown.clone(),
                move |res: SwapResult| {
                    let engine = engine.clone();
                    async move {
                        if let Err(e) = engine.process_result(&res).await {
                            warn!("Stable check of {} failed: {}", res.key(), e);
                        }
                    }
                },
            )));
        }

        let interval = Duration::from_secs(self.ctx.worker().stable_interval_secs.max(1));
        loop {
            self.poll_once().await;
            if !self.ctx.shutdown.sleep(interval).await {
                break;
            }
        }
        join_all(consumers).await;
        info!("Stable engine stopped");
    }

    async fn poll_once(&self) {
        let since = self.ctx.since(self.ctx.worker().max_stable_lifetime_secs);
        let results = match self.ctx.store.find_results_to_stable(since).await {
            Ok(results) => results,
            Err(e) => {
                error!("Failed to find results to stable: {}", e);
                return;
            }
        };
        for res in results {
            if self.ctx.shutdown.is_triggered() {
                break;
            }
            let key = res.key().to_string();
            self.queue.push(res.to_chain_id, key, res);
        }
    }

    /// Advance one sent payout; returns the status it ends up in
    pub async fn process_result(&self, res: &SwapResult) -> RouterResult<ResultStatus> {
        let key = res.key();
        let bridge = self.ctx.registry.get(res.to_chain_id)?;
        if res.candidate_txs().is_empty() {
            return Ok(res.status);
        }

        let Some((tx, status)) = find_swap_tx_on_chain(bridge.as_ref(), res).await else {
            if res.swap_height != 0 {
                // seen once, now missing: wait for the chain to settle
                debug!("Payout of {} vanished at height {}", key, res.swap_height);
                return Ok(res.status);
            }
            if check_swap_nonce_passed(&self.ctx, bridge.as_ref(), res, false).await? {
                return Ok(ResultStatus::Failed);
            }
            if self.reswap.reswap_if_timeout(bridge.as_ref(), res).await? {
                return Ok(ResultStatus::NeedReswap);
            }
            return Ok(res.status);
        };

        let changed_tx = !tx.eq_ignore_ascii_case(&res.swap_tx);
        if res.swap_height == 0 {
            info!(
                "Payout {} of {} mined at height {}",
                tx, key, status.block_height
            );
            let update = SwapResultUpdate {
                swap_tx: changed_tx.then(|| tx.clone()),
                swap_height: Some(status.block_height),
                swap_time: Some(status.block_time),
                ..Default::default()
            };
            self.ctx.store.update_result(&key, &update).await?;
            return Ok(res.status);
        }

        let required = bridge.config().required_confirmations();
        if status.confirmations < required {
            debug!(
                "Payout {} of {} has {}/{} confirmations",
                tx, key, status.confirmations, required
            );
            return Ok(res.status);
        }

        if changed_tx {
            let update = SwapResultUpdate {
                swap_tx: Some(tx.clone()),
                swap_height: Some(status.block_height),
                swap_time: Some(status.block_time),
                ..Default::default()
            };
            self.ctx.store.update_result(&key, &update).await?;
        }
        let final_status = if status.success {
            ResultStatus::Stable
        } else {
            ResultStatus::Failed
        };
        self.ctx
            .store
            .update_result_status(&key, final_status, "")
            .await?;
        metrics::record_result_final(res.to_chain_id, final_status.as_str());
        info!("Payout {} of {} is {}", tx, key, final_status);
        Ok(final_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SwapStore;
    use crate::swap::{now, TxStatus};
    use crate::test_utils::{sample_result, TestHarness};

    fn mined(height: u64, confirmations: u64, success: bool) -> TxStatus {
        TxStatus {
            block_height: height,
            block_time: 1_700_000_000,
            confirmations,
            success,
        }
    }

    #[tokio::test]
    async fn test_payout_becomes_stable_after_confirmations() {
        let h = TestHarness::new();
        let mut res = sample_result(ResultStatus::NotStable);
        res.swap_tx = "0xpay".into();
        h.store.put_result(res.clone()).await;

        h.dst.set_tx_status("0xpay", mined(100, 1, true));
        h.workers.stable.process_result(&res).await.unwrap();
        let res = h.store.find_result(&res.key()).await.unwrap();
        assert_eq!(res.swap_height, 100);
        assert_eq!(res.status, ResultStatus::NotStable);

        h.workers.stable.process_result(&res).await.unwrap();
        assert_eq!(
            h.store.find_result(&res.key()).await.unwrap().status,
            ResultStatus::NotStable
        );

        h.dst.set_tx_status("0xpay", mined(100, 20, true));
        let status = h.workers.stable.process_result(&res).await.unwrap();
        assert_eq!(status, ResultStatus::Stable);
        assert_eq!(
            h.store.find_result(&res.key()).await.unwrap().status,
            ResultStatus::Stable
        );
    }

    #[tokio::test]
    async fn test_reverted_payout_is_failed() {
        let h = TestHarness::new();
        let mut res = sample_result(ResultStatus::NotStable);
        res.swap_tx = "0xpay".into();
        res.swap_height = 100;
        h.store.put_result(res.clone()).await;
        h.dst.set_tx_status("0xpay", mined(100, 20, false));

        let status = h.workers.stable.process_result(&res).await.unwrap();
        assert_eq!(status, ResultStatus::Failed);
    }

    #[tokio::test]
    async fn test_replacement_mined_instead_of_current() {
        let h = TestHarness::new();
        let mut res = sample_result(ResultStatus::NotStable);
        res.swap_tx = "0xb".into();
        res.old_swap_txs = vec!["0xa".into(), "0xb".into()];
        h.store.put_result(res.clone()).await;
        h.dst.set_tx_status("0xa", mined(100, 1, true));

        h.workers.stable.process_result(&res).await.unwrap();
        let res = h.store.find_result(&res.key()).await.unwrap();
        assert_eq!(res.swap_tx, "0xa");
        assert_eq!(res.swap_height, 100);
    }

    #[tokio::test]
    async fn test_vanished_payout_waits() {
        let h = TestHarness::new();
        let mut res = sample_result(ResultStatus::NotStable);
        res.swap_tx = "0xpay".into();
        res.swap_height = 100;
        h.store.put_result(res.clone()).await;

        let status = h.workers.stable.process_result(&res).await.unwrap();
        assert_eq!(status, ResultStatus::NotStable);
    }

    #[tokio::test]
    async fn test_expired_payout_needs_reswap() {
        let h = TestHarness::with_reswap_ttl(50);
        let mut res = sample_result(ResultStatus::NotStable);
        res.swap_tx = "0xpay".into();
        res.ttl = 150;
        h.store.put_result(res.clone()).await;

        h.dst.set_latest_block(120);
        let status = h.workers.stable.process_result(&res).await.unwrap();
        assert_eq!(status, ResultStatus::NotStable);

        h.dst.set_latest_block(151);
        let status = h.workers.stable.process_result(&res).await.unwrap();
        assert_eq!(status, ResultStatus::NeedReswap);
        let stored = h.store.find_result(&res.key()).await.unwrap();
        assert_eq!(stored.status, ResultStatus::NeedReswap);
        assert_eq!(stored.memo, "ttl:150 current:151");
    }

    #[tokio::test]
    async fn test_passed_nonce_fails_unmined_payout() {
        let h = TestHarness::new();
        let mut res = sample_result(ResultStatus::NotStable);
        res.swap_tx = "0xpay".into();
        res.swap_nonce = 4;
        res.timestamp = now() - 3600;
        h.store.put_result(res.clone()).await;
        h.dst.set_pool_nonce(7);

        let status = h.workers.stable.process_result(&res).await.unwrap();
        assert_eq!(status, ResultStatus::Failed);
    }
}
