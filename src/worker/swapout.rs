//! Swap dispatcher: builds, signs and broadcasts payouts for swappable records

use super::queue::{self, BoundedKeySet, KeyGuard, TaskQueue};
use super::verify::{record_status_for, VerifyEngine};
use super::WorkerContext;
use crate::chain::{Bridge, RawTx};
use crate::error::{BridgeError, ErrorClass, RouterError, RouterResult};
use crate::metrics;
use crate::swap::{
    BuildTxArgs, RecordStatus, ResultStatus, SwapRecord, SwapResult, SwapResultUpdate,
};

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct SwapDispatcher {
    ctx: WorkerContext,
    verify: Arc<VerifyEngine>,
    queue: Arc<TaskQueue<SwapRecord>>,
    in_flight: Arc<BoundedKeySet>,
}

impl SwapDispatcher {
    pub fn new(ctx: WorkerContext, verify: Arc<VerifyEngine>) -> Self {
        Self {
            queue: Arc::new(TaskQueue::new("swap", ctx.worker().swap_queue_size)),
            in_flight: Arc::new(BoundedKeySet::new(
                "swap tasks",
                ctx.worker().max_cached_swap_tasks,
            )),
            verify,
            ctx,
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!(
            "Swap dispatcher started (parallel: {})",
            self.ctx.settings.router.parallel_swap
        );
        let mut consumers = Vec::new();
        for chain_id in self.ctx.registry.chain_ids() {
            let rx = self.queue.register(chain_id);
            let dispatcher = self.clone();
            consumers.push(tokio::spawn(queue::consume(
                rx,
                self.queue.clone(),
                self.ctx.shutdown.clone(),
                move |record: SwapRecord| {
                    let dispatcher = dispatcher.clone();
                    async move { dispatcher.process(record).await }
                },
            )));
        }

        let interval = Duration::from_secs(self.ctx.worker().swap_interval_secs.max(1));
        loop {
            self.poll_once().await;
            if !self.ctx.shutdown.sleep(interval).await {
                break;
            }
        }
        join_all(consumers).await;
        info!("Swap dispatcher stopped");
    }

    async fn poll_once(&self) {
        let since = self.ctx.since(self.ctx.worker().max_swap_lifetime_secs);
        let records = match self
            .ctx
            .store
            .find_swaps_with_status(RecordStatus::Swappable, since)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to find swappable swaps: {}", e);
                return;
            }
        };
        for record in records {
            if self.ctx.shutdown.is_triggered() {
                break;
            }
            let registry = &self.ctx.registry;
            if registry.is_paused(record.from_chain_id) || registry.is_paused(record.to_chain_id) {
                continue;
            }
            let key = record.key().to_string();
            self.queue.push(record.to_chain_id, key, record);
        }
    }

    async fn process(&self, record: SwapRecord) {
        match self.dispatch(&record).await {
            Ok(()) => {}
            Err(e) if e.is_quiet() => debug!("Skip swap {}: {}", record.key(), e),
            Err(e) => warn!("Dispatch swap {} failed: {}", record.key(), e),
        }
    }

    /// Pay out one swappable record
    ///
    /// At most one dispatch per key runs at a time. In parallel mode the
    /// sign-and-send step is detached and keeps the key claimed until done.
    pub async fn dispatch(&self, record: &SwapRecord) -> RouterResult<()> {
        let key = record.key();
        let Some(guard) = self.in_flight.acquire(&key.to_string()) else {
            return Err(RouterError::AlreadySwapped);
        };

        if let Some(tx) = self.ctx.history.get(&key) {
            warn!("Swap {} was already sent in {}", key, tx);
            self.ctx
                .store
                .update_swap_status(&key, RecordStatus::Processed, "")
                .await?;
            return Err(RouterError::AlreadySwapped);
        }

        if self.ctx.policy.is_blacked(record) {
            let err = BridgeError::SwapInBlacklist;
            warn!("Swap {} is blacklisted", key);
            self.ctx
                .store
                .update_swap_status(&key, RecordStatus::InBlacklist, &err.to_string())
                .await?;
            if let Err(e) = self
                .ctx
                .store
                .update_result_status(&key, ResultStatus::InBlacklist, &err.to_string())
                .await
            {
                debug!("Skip blacklisting result of {}: {}", key, e);
            }
            return Err(err.into());
        }

        let result = self.find_or_create_result(record).await?;
        if result.has_payout() {
            info!("Swap {} already has a payout, mark processed", key);
            self.ctx
                .store
                .update_swap_status(&key, RecordStatus::Processed, "")
                .await?;
            return Err(RouterError::AlreadySwapped);
        }

        let bridge = self.ctx.registry.get(record.to_chain_id)?;
        let mpc = self.ctx.registry.router_mpc(record.to_chain_id)?;
        let mut args = BuildTxArgs::for_swap(self.ctx.identifier(), record, &mpc);
        let raw = match bridge.build_raw_transaction(&mut args).await {
            Ok(raw) => raw,
            Err(e) => return Err(self.handle_build_error(record, e).await),
        };

        let payout = Payout {
            ctx: self.ctx.clone(),
            verify: self.verify.clone(),
            bridge,
            raw,
            args,
        };
        if self.ctx.settings.router.parallel_swap {
            tokio::spawn(async move {
                let key = payout.args.key();
                if let Err(e) = payout.sign_and_send(guard).await {
                    warn!("Payout of {} failed: {}", key, e);
                }
            });
            return Ok(());
        }
        payout.sign_and_send(guard).await.map(|_| ())
    }

    async fn find_or_create_result(&self, record: &SwapRecord) -> RouterResult<SwapResult> {
        let key = record.key();
        match self.ctx.store.find_result(&key).await {
            Ok(res) => return Ok(res),
            Err(RouterError::ResultNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        let res = SwapResult::initial(record);
        match self.ctx.store.add_initial_result(&res).await {
            Ok(()) => Ok(res),
            Err(RouterError::ResultExists { .. }) => self.ctx.store.find_result(&key).await,
            Err(e) => Err(e),
        }
    }

    async fn handle_build_error(&self, record: &SwapRecord, err: BridgeError) -> RouterError {
        if err.class() != ErrorClass::Terminal {
            return err.into();
        }
        let key = record.key();
        let memo = err.to_string();
        warn!("Build payout of {} failed: {}", key, err);
        if let Err(e) = self
            .ctx
            .store
            .update_swap_status(&key, record_status_for(&err), &memo)
            .await
        {
            return e;
        }
        if matches!(err, BridgeError::EstimateGasFailed(_)) {
            if let Err(e) = self
                .ctx
                .store
                .update_result_status(&key, ResultStatus::EstimateGasFailed, &memo)
                .await
            {
                return e;
            }
        }
        err.into()
    }
}

/// A built payout waiting for its signature
struct Payout {
    ctx: WorkerContext,
    verify: Arc<VerifyEngine>,
    bridge: Arc<dyn Bridge>,
    raw: RawTx,
    args: BuildTxArgs,
}

impl Payout {
    /// Sign, persist, then broadcast; the result row is written before the send
    async fn sign_and_send(self, _guard: KeyGuard) -> RouterResult<String> {
        let Payout {
            ctx,
            verify,
            bridge,
            raw,
            args,
        } = self;
        let key = args.key();
        let parallel = ctx.settings.router.parallel_swap;

        let (signed, tx_hash) = match bridge.mpc_sign_transaction(&raw, &args).await {
            Ok(signed) => signed,
            Err(e) => {
                if parallel {
                    if let (Some(setter), Some(nonce)) = (bridge.nonce_setter(), args.extra.nonce) {
                        setter.release_swap_nonce(&args.from, nonce).await;
                    }
                }
                if e == BridgeError::SignDisagree {
                    verify.reverify(&args).await;
                }
                return Err(e.into());
            }
        };

        ctx.history.add(key.clone(), &tx_hash);
        ctx.store
            .update_swap_status(&key, RecordStatus::Processed, "")
            .await?;
        let update = SwapResultUpdate {
            status: Some(ResultStatus::NotStable),
            swap_tx: Some(tx_hash.clone()),
            swap_nonce: args.extra.nonce,
            swap_value: args.swap_value.map(|v| v.to_string()),
            mpc: Some(args.from.clone()),
            ttl: args.extra.ttl,
            ..Default::default()
        };
        ctx.store.update_result(&key, &update).await?;
        metrics::record_payout_sent(args.to_chain_id, "swap");
        info!(
            "Signed payout {} for {} (nonce {:?})",
            tx_hash, key, args.extra.nonce
        );

        let sent = ctx.sender.send(&bridge, &signed, &args).await?;
        if !sent.eq_ignore_ascii_case(&tx_hash) {
            warn!("Payout of {} sent as {} instead of {}", key, sent, tx_hash);
            ctx.store.update_old_swap_txs(&key, &sent).await?;
        }
        Ok(tx_hash)
    }
}
