//! Replace engine: re-sends stuck payouts under the same nonce at a higher price

use super::queue::{self, TaskQueue};
use super::verify::VerifyEngine;
use super::{check_swap_nonce_passed, WorkerContext};
use crate::chain::Bridge;
use crate::error::{BridgeError, RouterError, RouterResult};
use crate::metrics;
use crate::swap::{
    now, BuildTxArgs, RecordStatus, ResultStatus, SwapRecord, SwapResult, SwapResultUpdate,
};
use crate::tx::find_swap_tx_on_chain;

use dashmap::DashMap;
use ethers::types::U256;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Memo marking a result whose nonce was handed back at the replace cap
pub const REPLACE_LIMIT_MEMO: &str = "replace limit reached, nonce recycled";

/// Whether one more replacement would grow the hash list past `cap`
pub fn exceeds_replace_cap(res: &SwapResult, cap: usize) -> bool {
    let added = if res.old_swap_txs.is_empty() { 2 } else { 1 };
    res.old_swap_txs.len() + added > cap
}

pub struct ReplaceEngine {
    ctx: WorkerContext,
    verify: Arc<VerifyEngine>,
    queue: Arc<TaskQueue<SwapResult>>,
    chain_locks: DashMap<u64, Arc<Mutex<()>>>,
}

impl ReplaceEngine {
    pub fn new(ctx: WorkerContext, verify: Arc<VerifyEngine>) -> Self {
        Self {
            queue: Arc::new(TaskQueue::new("replace", ctx.worker().swap_queue_size)),
            chain_locks: DashMap::new(),
            verify,
            ctx,
        }
    }

    pub async fn run(self: Arc<Self>) {
        if !self.ctx.worker().enable_replace {
            info!("Replace engine disabled");
            return;
        }
        info!("Replace engine started");
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
                        if let Err(e) = engine.process(&res).await {
                            warn!("Replace of {} failed: {}", res.key(), e);
                        }
                    }
                },
            )));
        }

        let interval = Duration::from_secs(self.ctx.worker().replace_interval_secs.max(1));
        loop {
            self.poll_once().await;
            if !self.ctx.shutdown.sleep(interval).await {
                break;
            }
        }
        join_all(consumers).await;
        info!("Replace engine stopped");
    }

    async fn poll_once(&self) {
        let worker = self.ctx.worker();
        let since = self.ctx.since(worker.max_replace_lifetime_secs);
        let results = match self.ctx.store.find_results_to_replace(since).await {
            Ok(results) => results,
            Err(e) => {
                error!("Failed to find results to replace: {}", e);
                return;
            }
        };
        let wait_before = now() - worker.wait_time_to_replace_secs as i64;
        for res in results {
            if self.ctx.shutdown.is_triggered() {
                break;
            }
            if res.timestamp > wait_before {
                continue;
            }
            if exceeds_replace_cap(&res, worker.max_replace_count) {
                if let Err(e) = self.abandon(&res).await {
                    warn!("Failed to abandon replace of {}: {}", res.key(), e);
                }
                continue;
            }
            let key = res.key().to_string();
            self.queue.push(res.to_chain_id, key, res);
        }
    }

    async fn process(&self, res: &SwapResult) -> RouterResult<String> {
        let bridge = self.ctx.registry.get(res.to_chain_id)?;
        check_swap_nonce_passed(&self.ctx, bridge.as_ref(), res, true).await?;
        self.ctx.store.update_result_timestamp(&res.key()).await?;
        self.replace_swap(res, None).await
    }

    /// Give up replacing and let the nonce be reused
    ///
    /// The memo is written before the nonce is handed back, so a result is
    /// recycled at most once, restarts included.
    async fn abandon(&self, res: &SwapResult) -> RouterResult<()> {
        if res.memo == REPLACE_LIMIT_MEMO {
            return Ok(());
        }
        let key = res.key();
        warn!(
            "Swap {} reached {} replacements, stop replacing",
            key,
            res.old_swap_txs.len()
        );
        let bridge = self.ctx.registry.get(res.to_chain_id)?;
        let update = SwapResultUpdate {
            memo: Some(REPLACE_LIMIT_MEMO.to_string()),
            ..Default::default()
        };
        self.ctx.store.update_result(&key, &update).await?;

        if let (Some(setter), true) = (bridge.nonce_setter(), res.swap_nonce > 0) {
            let mpc = if res.mpc.is_empty() {
                bridge.config().router_mpc.to_lowercase()
            } else {
                res.mpc.clone()
            };
            setter.recycle_swap_nonce(&mpc, res.swap_nonce).await;
        }
        Ok(())
    }

    fn chain_lock(&self, chain_id: u64) -> Arc<Mutex<()>> {
        self.chain_locks
            .entry(chain_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Re-sign and re-send a payout under its original nonce
    ///
    /// `gas_price` overrides the bumped price the adapter would pick.
    pub async fn replace_swap(&self, res: &SwapResult, gas_price: Option<U256>) -> RouterResult<String> {
        let lock = self.chain_lock(res.to_chain_id);
        let _serial = lock.lock().await;

        let key = res.key();
        let res = self.ctx.store.find_result(&key).await?;
        let bridge = self.ctx.registry.get(res.to_chain_id)?;
        let record = self.check_replace(bridge.as_ref(), &res).await?;

        let cap = self.ctx.worker().max_replace_count;
        if exceeds_replace_cap(&res, cap) {
            self.abandon(&res).await?;
            return Err(RouterError::Admin(format!(
                "swap {} reached the replace limit {}",
                key, cap
            )));
        }

        let mpc = self.ctx.registry.router_mpc(res.to_chain_id)?;
        let mut args = BuildTxArgs::for_swap(self.ctx.identifier(), &record, &mpc);
        args.extra.nonce = Some(res.swap_nonce);
        args.extra.gas_price = gas_price;
        args.extra.replace_num = res.old_swap_txs.len().max(1) as u64;
        if res.ttl > 0 {
            args.extra.ttl = Some(res.ttl);
        }

        let raw = bridge.build_raw_transaction(&mut args).await?;
        let (signed, tx_hash) = match bridge.mpc_sign_transaction(&raw, &args).await {
            Ok(signed) => signed,
            Err(e) => {
                if e == BridgeError::SignDisagree {
                    self.verify.reverify(&args).await;
                }
                return Err(e.into());
            }
        };

        self.ctx.history.add(key.clone(), &tx_hash);
        self.ctx.store.update_old_swap_txs(&key, &tx_hash).await?;
        metrics::record_payout_sent(res.to_chain_id, "replace");
        info!(
            "Replaced payout of {} with {} (nonce {}, replace {})",
            key, tx_hash, res.swap_nonce, args.extra.replace_num
        );

        let sent = self.ctx.sender.send(&bridge, &signed, &args).await?;
        if !sent.eq_ignore_ascii_case(&tx_hash) {
            let latest = self.ctx.store.find_result(&key).await?;
            if latest.old_swap_txs.len() < cap {
                warn!("Replace of {} sent as {} instead of {}", key, sent, tx_hash);
                self.ctx.store.update_old_swap_txs(&key, &sent).await?;
            }
        }
        Ok(tx_hash)
    }

    async fn check_replace(&self, bridge: &dyn Bridge, res: &SwapResult) -> RouterResult<SwapRecord> {
        let record = self.ctx.store.find_swap(&res.key()).await?;
        if record.status != RecordStatus::Processed {
            return Err(RouterError::Admin(format!(
                "cannot replace swap with status {}",
                record.status
            )));
        }
        if res.swap_tx.is_empty() {
            return Err(RouterError::Admin("cannot replace swap without swap tx".into()));
        }
        if res.status != ResultStatus::NotStable {
            return Err(RouterError::Admin(format!(
                "cannot replace result with status {}",
                res.status
            )));
        }
        if res.swap_height != 0 {
            return Err(RouterError::Admin("cannot replace mined swap tx".into()));
        }
        if res.swap_nonce == 0 {
            return Err(RouterError::Admin("cannot replace swap without nonce".into()));
        }
        if let Some((tx, _)) = find_swap_tx_on_chain(bridge, res).await {
            return Err(RouterError::Admin(format!("swap tx {} exists on chain", tx)));
        }
        check_swap_nonce_passed(&self.ctx, bridge, res, true).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SwapStore;
    use crate::swap::TxStatus;
    use crate::test_utils::{sample_result, TestHarness};

    #[test]
    fn test_replace_cap() {
        let mut res = sample_result(ResultStatus::NotStable);
        res.swap_tx = "0xa".into();
        assert!(!exceeds_replace_cap(&res, 2));
        assert!(exceeds_replace_cap(&res, 1));

        res.old_swap_txs = vec!["0xa".into(), "0xb".into()];
        assert!(exceeds_replace_cap(&res, 2));
        assert!(!exceeds_replace_cap(&res, 3));
    }

    #[tokio::test]
    async fn test_replace_keeps_nonce_and_history() {
        let h = TestHarness::new();
        let res = h.sent_result("0xfirst", 7).await;

        let tx = h.workers.replace.replace_swap(&res, None).await.unwrap();
        let stored = h.store.find_result(&res.key()).await.unwrap();
        assert_eq!(stored.swap_tx, tx);
        assert_eq!(stored.swap_nonce, 7);
        assert_eq!(stored.old_swap_txs, vec!["0xfirst".to_string(), tx.clone()]);

        let built = h.dst.built_args();
        let last = built.last().unwrap();
        assert_eq!(last.extra.nonce, Some(7));
        assert_eq!(last.extra.replace_num, 1);
    }

    #[tokio::test]
    async fn test_replace_with_gas_price_override() {
        let h = TestHarness::new();
        let res = h.sent_result("0xfirst", 7).await;
        let price = U256::from(99_000_000_000u64);

        h.workers
            .replace
            .replace_swap(&res, Some(price))
            .await
            .unwrap();
        assert_eq!(h.dst.built_args().last().unwrap().extra.gas_price, Some(price));
    }

    #[tokio::test]
    async fn test_replace_refuses_mined_payout() {
        let h = TestHarness::new();
        let res = h.sent_result("0xfirst", 7).await;
        h.dst.set_tx_status(
            "0xfirst",
            TxStatus {
                block_height: 5,
                confirmations: 1,
                success: true,
                ..Default::default()
            },
        );
        assert!(h.workers.replace.replace_swap(&res, None).await.is_err());
        assert_eq!(h.dst.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_replace_stops_at_cap_and_recycles_nonce() {
        let h = TestHarness::with_max_replace_count(3);
        let res = h.sent_result("0xfirst", 7).await;

        h.workers.replace.replace_swap(&res, None).await.unwrap();
        h.workers.replace.replace_swap(&res, None).await.unwrap();
        let stored = h.store.find_result(&res.key()).await.unwrap();
        assert_eq!(stored.old_swap_txs.len(), 3);

        assert!(h.workers.replace.replace_swap(&res, None).await.is_err());
        let stored = h.store.find_result(&res.key()).await.unwrap();
        assert_eq!(stored.old_swap_txs.len(), 3);
        assert_eq!(h.dst.sent_count(), 2);
        assert_eq!(h.dst.recycled_nonces(), vec![7]);

        // asking again does not hand the nonce out twice
        assert!(h.workers.replace.replace_swap(&res, None).await.is_err());
        assert_eq!(h.dst.recycled_nonces(), vec![7]);
    }

    #[tokio::test]
    async fn test_capped_result_recycles_nonce_once_across_polls() {
        let h = TestHarness::with_max_replace_count(1);
        let res = h.sent_result("0xfirst", 7).await;

        for _ in 0..3 {
            let mut stale = h.store.find_result(&res.key()).await.unwrap();
            stale.timestamp = now() - 3600;
            h.store.put_result(stale).await;
            h.workers.replace.poll_once().await;
        }

        assert_eq!(h.dst.recycled_nonces(), vec![7]);
        assert_eq!(h.dst.sent_count(), 0);
        let stored = h.store.find_result(&res.key()).await.unwrap();
        assert_eq!(stored.memo, REPLACE_LIMIT_MEMO);
        assert_eq!(stored.status, ResultStatus::NotStable);
    }

    #[tokio::test]
    async fn test_replace_refuses_passed_nonce() {
        let h = TestHarness::new();
        let res = h.sent_result("0xfirst", 7).await;
        h.dst.set_pool_nonce(9);

        let err = h.workers.replace.replace_swap(&res, None).await.unwrap_err();
        assert!(matches!(err, RouterError::NoncePassed { nonce: 7, latest: 9 }));
    }
}
