//! Reswap engine: resends expired payouts from scratch with a fresh nonce
//!
//! Only chains whose adapter exposes a TTL support this. A payout whose TTL
//! passed without being mined is marked `need_reswap`; this engine moves it
//! through `reswapping` back to `not_stable` under a new hash.

use super::queue::{self, TaskQueue};
use super::verify::VerifyEngine;
use super::WorkerContext;
use crate::chain::Bridge;
use crate::error::{BridgeError, RouterError, RouterResult};
use crate::metrics;
use crate::swap::{
    now, BuildTxArgs, RecordStatus, ResultStatus, SwapRecord, SwapResult, SwapResultUpdate,
};
use crate::tx::find_swap_tx_on_chain;

use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub struct ReswapEngine {
    ctx: WorkerContext,
    verify: Arc<VerifyEngine>,
    queue: Arc<TaskQueue<SwapResult>>,
    chain_locks: DashMap<u64, Arc<Mutex<()>>>,
}

impl ReswapEngine {
    pub fn new(ctx: WorkerContext, verify: Arc<VerifyEngine>) -> Self {
        Self {
            queue: Arc::new(TaskQueue::new("reswap", ctx.worker().swap_queue_size)),
            chain_locks: DashMap::new(),
            verify,
            ctx,
        }
    }

    pub async fn run(self: Arc<Self>) {
        let chains: Vec<u64> = self
            .ctx
            .registry
            .chain_ids()
            .into_iter()
            .filter(|id| self.ctx.registry.is_reswap_supported(*id))
            .collect();
        if chains.is_empty() {
            info!("No chain supports reswap, reswap engine idle");
            return;
        }
        info!("Reswap engine started for chains {:?}", chains);

        let mut consumers = Vec::new();
        for chain_id in chains {
            let rx = self.queue.register(chain_id);
            let engine = self.clone();
            consumers.push(tokio::spawn(queue::consume(
                rx,
                self.queue.clone(),
                self.ctx.shutdown.clone(),
                move |res: SwapResult| {
                    let engine = engine.clone();
                    async move {
                        if let Err(e) = engine.reswap_swap(&res).await {
                            warn!("Reswap of {} failed: {}", res.key(), e);
                        }
                    }
                },
            )));
        }

        let interval = Duration::from_secs(self.ctx.worker().reswap_interval_secs.max(1));
        loop {
            self.poll_once().await;
            if !self.ctx.shutdown.sleep(interval).await {
                break;
            }
        }
        join_all(consumers).await;
        info!("Reswap engine stopped");
    }

    async fn poll_once(&self) {
        let worker = self.ctx.worker();
        let since = self.ctx.since(worker.max_replace_lifetime_secs);
        let stale_before = now() - worker.wait_time_to_replace_secs as i64;

        let mut results = Vec::new();
        match self
            .ctx
            .store
            .find_results_with_status(ResultStatus::NeedReswap, since)
            .await
        {
            Ok(found) => results.extend(found),
            Err(e) => error!("Failed to find results to reswap: {}", e),
        }
        // a reswap interrupted between build and send is picked up again
        match self
            .ctx
            .store
            .find_results_with_status(ResultStatus::Reswapping, since)
            .await
        {
            Ok(found) => results.extend(found.into_iter().filter(|r| r.timestamp < stale_before)),
            Err(e) => error!("Failed to find stale reswapping results: {}", e),
        }

        for res in results {
            if self.ctx.shutdown.is_triggered() {
                break;
            }
            if !self.ctx.registry.is_reswap_supported(res.to_chain_id) {
                continue;
            }
            let key = res.key().to_string();
            self.queue.push(res.to_chain_id, key, res);
        }
    }

    fn chain_lock(&self, chain_id: u64) -> Arc<Mutex<()>> {
        self.chain_locks
            .entry(chain_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Mark a payout `need_reswap` once its TTL has passed
    pub async fn reswap_if_timeout(&self, bridge: &dyn Bridge, res: &SwapResult) -> RouterResult<bool> {
        let Some(reswapable) = bridge.reswapable() else {
            return Ok(false);
        };
        let current = reswapable.get_current_threshold().await?;
        if !reswapable.is_tx_timeout(res.ttl, current) {
            return Ok(false);
        }
        let memo = format!("ttl:{} current:{}", res.ttl, current);
        info!("Payout of {} timed out ({}), need reswap", res.key(), memo);
        self.ctx
            .store
            .update_result_status(&res.key(), ResultStatus::NeedReswap, &memo)
            .await?;
        Ok(true)
    }

    /// Build, sign and send a brand new payout for an expired one
    pub async fn reswap_swap(&self, res: &SwapResult) -> RouterResult<String> {
        if !self.ctx.registry.is_reswap_supported(res.to_chain_id) {
            return Err(BridgeError::ReswapNotSupported.into());
        }
        let lock = self.chain_lock(res.to_chain_id);
        let _serial = lock.lock().await;

        let key = res.key();
        let res = self.ctx.store.find_result(&key).await?;
        let bridge = self.ctx.registry.get(res.to_chain_id)?;
        let record = self.check_reswap(bridge.as_ref(), &res).await?;

        let mpc = self.ctx.registry.router_mpc(res.to_chain_id)?;
        if !res.mpc.eq_ignore_ascii_case(&mpc) {
            return Err(BridgeError::SenderMismatch.into());
        }

        self.ctx.store.update_result_timestamp(&key).await?;
        if res.status == ResultStatus::NeedReswap {
            self.ctx
                .store
                .update_result_status(&key, ResultStatus::Reswapping, "")
                .await?;
        }

        let mut args = BuildTxArgs::for_swap(self.ctx.identifier(), &record, &mpc);
        let raw = bridge.build_raw_transaction(&mut args).await?;
        let (signed, tx_hash) = match bridge.mpc_sign_transaction(&raw, &args).await {
            Ok(signed) => signed,
            Err(e) => {
                if self.ctx.settings.router.parallel_swap {
                    if let (Some(setter), Some(nonce)) = (bridge.nonce_setter(), args.extra.nonce) {
                        setter.release_swap_nonce(&args.from, nonce).await;
                    }
                }
                if e == BridgeError::SignDisagree {
                    self.verify.reverify(&args).await;
                }
                return Err(e.into());
            }
        };

        self.ctx.history.add(key.clone(), &tx_hash);
        self.ctx.store.update_old_swap_txs(&key, &tx_hash).await?;
        let update = SwapResultUpdate {
            status: Some(ResultStatus::NotStable),
            swap_tx: Some(tx_hash.clone()),
            swap_nonce: args.extra.nonce,
            swap_value: args.swap_value.map(|v| v.to_string()),
            mpc: Some(args.from.clone()),
            ttl: args.extra.ttl,
            ..Default::default()
        };
        self.ctx.store.update_result(&key, &update).await?;
        metrics::record_payout_sent(res.to_chain_id, "reswap");
        info!(
            "Reswapped {} with {} (nonce {:?}, ttl {:?})",
            key, tx_hash, args.extra.nonce, args.extra.ttl
        );

        let sent = self.ctx.sender.send(&bridge, &signed, &args).await?;
        if !sent.eq_ignore_ascii_case(&tx_hash) {
            warn!("Reswap of {} sent as {} instead of {}", key, sent, tx_hash);
            self.ctx.store.update_old_swap_txs(&key, &sent).await?;
        }
        Ok(tx_hash)
    }

    async fn check_reswap(&self, bridge: &dyn Bridge, res: &SwapResult) -> RouterResult<SwapRecord> {
        let key = res.key();
        let record = self.ctx.store.find_swap(&key).await?;

        if self.ctx.policy.is_blacked(&record) {
            let memo = BridgeError::SwapInBlacklist.to_string();
            self.ctx
                .store
                .update_swap_status(&key, RecordStatus::InBlacklist, &memo)
                .await?;
            self.ctx
                .store
                .update_result_status(&key, ResultStatus::InBlacklist, &memo)
                .await?;
            return Err(BridgeError::SwapInBlacklist.into());
        }
        if record.status != RecordStatus::Processed {
            return Err(RouterError::Admin(format!(
                "cannot reswap swap with status {}",
                record.status
            )));
        }
        if res.status != ResultStatus::NeedReswap && res.status != ResultStatus::Reswapping {
            return Err(RouterError::Admin(format!(
                "cannot reswap result with status {}",
                res.status
            )));
        }
        if let Some((tx, status)) = find_swap_tx_on_chain(bridge, res).await {
            if status.success {
                return Err(RouterError::Admin(format!("swap succeed with swap tx {}", tx)));
            }
        }
        Ok(record)
    }
}
