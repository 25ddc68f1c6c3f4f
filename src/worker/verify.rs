//! Verify engine: re-validates detected deposits and admits them for payout

use super::queue::{self, BoundedKeySet, TaskQueue};
use super::WorkerContext;
use crate::chain::finality::is_deep_enough;
use crate::chain::RegisterArgs;
use crate::config::ChainConfig;
use crate::error::{BridgeError, Classified, RouterError, RouterResult};
use crate::metrics;
use crate::swap::{
    now, BuildTxArgs, RecordStatus, SwapInfo, SwapKey, SwapRecord, SwapResult, SwapType,
    VerifyArgs,
};

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Record status a terminal verification error maps to
pub fn record_status_for(err: &BridgeError) -> RecordStatus {
    match err {
        BridgeError::TxWithWrongValue => RecordStatus::WrongValue,
        BridgeError::TxWithWrongPath => RecordStatus::WrongPath,
        BridgeError::MissTokenConfig => RecordStatus::MissTokenConfig,
        BridgeError::NoUnderlyingToken => RecordStatus::NoUnderlyingToken,
        BridgeError::VerifyTxUnsafe => RecordStatus::VerifyTxUnsafe,
        BridgeError::SwapInBlacklist => RecordStatus::InBlacklist,
        BridgeError::EstimateGasFailed(_) => RecordStatus::EstimateGasFailed,
        _ => RecordStatus::VerifyFailed,
    }
}

/// Outcome of registering one swap out of a source transaction
#[derive(Debug, Clone)]
pub struct Registration {
    pub log_index: Option<u32>,
    pub key: Option<SwapKey>,
    /// `false` when the swap was registered before
    pub created: bool,
    pub error: Option<String>,
}

pub struct VerifyEngine {
    ctx: WorkerContext,
    queue: Arc<TaskQueue<SwapRecord>>,
    verifying: Arc<BoundedKeySet>,
}

impl VerifyEngine {
    pub fn new(ctx: WorkerContext) -> Self {
        let cap = ctx.worker().max_cached_verifying;
        Self {
            queue: Arc::new(TaskQueue::new("verify", cap)),
            verifying: Arc::new(BoundedKeySet::new("verifying", cap)),
            ctx,
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!("Verify engine started");
        let mut consumers = Vec::new();
        for chain_id in self.ctx.registry.chain_ids() {
            let rx = self.queue.register(chain_id);
            let engine = self.clone();
            consumers.push(tokio::spawn(queue::consume(
                rx,
                self.queue.clone(),
                self.ctx.shutdown.clone(),
                move |record: SwapRecord| {
                    let engine = engine.clone();
                    async move { engine.process(record).await }
                },
            )));
        }

        let interval = Duration::from_secs(self.ctx.worker().verify_interval_secs.max(1));
        loop {
            self.poll_once().await;
            if !self.ctx.shutdown.sleep(interval).await {
                break;
            }
        }
        join_all(consumers).await;
        info!("Verify engine stopped");
    }

    async fn poll_once(&self) {
        let since = self.ctx.since(self.ctx.worker().max_verify_lifetime_secs);
        let records = match self
            .ctx
            .store
            .find_swaps_with_status(RecordStatus::Detected, since)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to find swaps to verify: {}", e);
                return;
            }
        };
        for record in records {
            if self.ctx.shutdown.is_triggered() {
                break;
            }
            let key = record.key().to_string();
            self.queue.push(record.from_chain_id, key, record);
        }
    }

    async fn process(&self, record: SwapRecord) {
        match self.verify_record(&record).await {
            Ok(status) => debug!("Verified swap {}: {}", record.key(), status),
            Err(e) if e.is_quiet() => debug!("Skip verify of {}: {}", record.key(), e),
            Err(e) => warn!("Verify swap {} failed: {}", record.key(), e),
        }
    }

    /// Verify one detected record and move it to its next status
    pub async fn verify_record(&self, record: &SwapRecord) -> RouterResult<RecordStatus> {
        let key = record.key();
        let registry = &self.ctx.registry;
        if registry.is_paused(record.from_chain_id) || registry.is_paused(record.to_chain_id) {
            debug!("Skip verify of {}, chain paused", key);
            return Ok(record.status);
        }
        let bridge = registry.get(record.from_chain_id)?;
        if !registry.contains(record.to_chain_id) {
            return Err(RouterError::ChainNotFound {
                chain_id: record.to_chain_id,
            });
        }

        let Some(_guard) = self.verifying.acquire(&key.to_string()) else {
            return Ok(record.status);
        };

        if self.ctx.policy.is_blacked(record) {
            let err = BridgeError::SwapInBlacklist;
            self.mark(record, RecordStatus::InBlacklist, &err.to_string())
                .await?;
            return Ok(RecordStatus::InBlacklist);
        }

        let latest = registry.cached_latest_block(record.from_chain_id);
        let required = bridge.config().required_confirmations();
        if !is_deep_enough(record.tx_height, required, latest) {
            debug!(
                "Skip verify of {}, height {} latest {}",
                key, record.tx_height, latest
            );
            return Ok(record.status);
        }

        let args = VerifyArgs {
            log_index: record.log_index,
            allow_unstable: false,
        };
        match Classified::from(bridge.verify_transaction(&record.tx_id, &args).await) {
            Classified::Ok(info) => self.admit(record, &info, bridge.config()).await,
            Classified::Transient(e) | Classified::Disagreement(e) => {
                let expired = now() - record.init_time > self.ctx.worker().max_tx_not_found_secs as i64;
                if expired && matches!(e, BridgeError::TxNotFound | BridgeError::TxNotStable) {
                    warn!("Swap {} not verified in time: {}", key, e);
                    self.mark(record, RecordStatus::VerifyFailed, &e.to_string())
                        .await?;
                    return Ok(RecordStatus::VerifyFailed);
                }
                debug!("Verify of {} will retry: {}", key, e);
                Ok(record.status)
            }
            Classified::Terminal(e) => {
                let status = record_status_for(&e);
                warn!("Swap {} failed verification: {}", key, e);
                self.mark(record, status, &e.to_string()).await?;
                Ok(status)
            }
        }
    }

    /// Apply the post-verification rules to a chain-confirmed swap
    async fn admit(
        &self,
        record: &SwapRecord,
        info: &SwapInfo,
        source: &ChainConfig,
    ) -> RouterResult<RecordStatus> {
        if !matches_record(record, info) {
            let err = BridgeError::TxWithWrongValue;
            warn!("Swap {} differs from its source tx", record.key());
            self.mark(record, RecordStatus::WrongValue, &err.to_string())
                .await?;
            return Ok(RecordStatus::WrongValue);
        }

        if self.ctx.policy.is_big_value(record, source) {
            info!("Swap {} holds a big value {}", record.key(), record.value);
            self.mark(record, RecordStatus::BigValue, "big value").await?;
            return Ok(RecordStatus::BigValue);
        }

        self.make_swappable(record).await?;
        Ok(RecordStatus::Swappable)
    }

    /// Create the initial result and hand the swap to the dispatcher
    async fn make_swappable(&self, record: &SwapRecord) -> RouterResult<()> {
        let key = record.key();
        match self
            .ctx
            .store
            .add_initial_result(&SwapResult::initial(record))
            .await
        {
            Ok(()) | Err(RouterError::ResultExists { .. }) => {}
            Err(e) => return Err(e),
        }
        self.ctx
            .store
            .update_swap_status(&key, RecordStatus::Swappable, "")
            .await?;
        metrics::record_swap_verified(record.from_chain_id, RecordStatus::Swappable.as_str());
        info!("Swap {} is swappable", key);
        Ok(())
    }

    async fn mark(&self, record: &SwapRecord, status: RecordStatus, memo: &str) -> RouterResult<()> {
        self.ctx
            .store
            .update_swap_status(&record.key(), status, memo)
            .await?;
        metrics::record_swap_verified(record.from_chain_id, status.as_str());
        Ok(())
    }

    /// Release a big-value swap for payout after re-checking its source tx
    pub async fn pass_big_value(&self, key: &SwapKey) -> RouterResult<()> {
        let record = self.ctx.store.find_swap(key).await?;
        if record.status != RecordStatus::BigValue {
            return Err(RouterError::Admin(format!(
                "swap status is {}, not big_value",
                record.status
            )));
        }
        let bridge = self.ctx.registry.get(record.from_chain_id)?;
        let args = VerifyArgs {
            log_index: record.log_index,
            allow_unstable: false,
        };
        let info = bridge.verify_transaction(&record.tx_id, &args).await?;
        if !matches_record(&record, &info) {
            return Err(BridgeError::TxWithWrongValue.into());
        }
        info!("Pass big value swap {}", key);
        self.make_swappable(&record).await
    }

    /// Send a swap back to verification after its payout was refused
    ///
    /// RPC hiccups leave the record alone.
    pub async fn reverify(&self, args: &BuildTxArgs) {
        let key = args.key();
        let Ok(bridge) = self.ctx.registry.get(args.from_chain_id) else {
            return;
        };
        let verify_args = VerifyArgs {
            log_index: args.log_index,
            allow_unstable: false,
        };
        match bridge.verify_transaction(&args.swap_id, &verify_args).await {
            Ok(_) => info!("Reverify of {} passed", key),
            Err(BridgeError::Rpc(e)) => debug!("Reverify of {} skipped: {}", key, e),
            Err(e) => {
                warn!("Reverify of {} failed: {}", key, e);
                let memo = format!("reverify failed: {}", e);
                if let Err(e) = self
                    .ctx
                    .store
                    .update_swap_status(&key, RecordStatus::Detected, &memo)
                    .await
                {
                    error!("Failed to reset swap {}: {}", key, e);
                }
            }
        }
    }

    /// Decode and store every swap a source transaction carries
    pub async fn register(
        &self,
        chain_id: u64,
        tx_id: &str,
        log_index: Option<u32>,
    ) -> RouterResult<Vec<Registration>> {
        let bridge = self.ctx.registry.get(chain_id)?;
        let args = RegisterArgs {
            swap_type: SwapType::ErcSwap,
            log_index,
        };
        let mut registrations = Vec::new();
        for swap in bridge.register_swap(tx_id, &args).await {
            let registration = match swap {
                Ok(info) => {
                    let record = SwapRecord::from_info(&info, RecordStatus::Detected);
                    let created = self.ctx.store.add_swap(&record).await?;
                    if created {
                        info!("Registered swap {}", record.key());
                    }
                    Registration {
                        log_index: Some(info.log_index),
                        key: Some(record.key()),
                        created,
                        error: None,
                    }
                }
                Err(e) => {
                    debug!("Register {} on chain {} failed: {}", tx_id, chain_id, e);
                    Registration {
                        log_index,
                        key: None,
                        created: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            registrations.push(registration);
        }
        Ok(registrations)
    }
}

fn matches_record(record: &SwapRecord, info: &SwapInfo) -> bool {
    info.value == record.value
        && info.to_chain_id == record.to_chain_id
        && info.bind.eq_ignore_ascii_case(&record.bind)
        && info.token_id.eq_ignore_ascii_case(&record.token_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SwapStore;
    use crate::swap::ResultStatus;
    use crate::test_utils::{sample_record, TestHarness};
    use ethers::types::U256;

    #[tokio::test]
    async fn test_verified_swap_becomes_swappable_with_result() {
        let h = TestHarness::new();
        let record = sample_record(RecordStatus::Detected);
        h.src.add_swap(record.to_swap_info());
        h.store.put_swap(record.clone()).await;

        let status = h.workers.verify.verify_record(&record).await.unwrap();
        assert_eq!(status, RecordStatus::Swappable);
        let stored = h.store.find_swap(&record.key()).await.unwrap();
        assert_eq!(stored.status, RecordStatus::Swappable);
        let res = h.store.find_result(&record.key()).await.unwrap();
        assert_eq!(res.status, ResultStatus::Empty);
    }

    #[tokio::test]
    async fn test_terminal_error_maps_to_status() {
        let h = TestHarness::new();
        let record = sample_record(RecordStatus::Detected);
        h.src
            .set_swap_error(&record.tx_id, record.log_index, BridgeError::TxWithWrongPath);
        h.store.put_swap(record.clone()).await;

        let status = h.workers.verify.verify_record(&record).await.unwrap();
        assert_eq!(status, RecordStatus::WrongPath);
        let stored = h.store.find_swap(&record.key()).await.unwrap();
        assert_eq!(stored.memo, "tx with wrong path");
        assert!(h.store.find_result(&record.key()).await.is_err());
    }

    #[tokio::test]
    async fn test_not_found_fails_only_after_timeout() {
        let h = TestHarness::new();
        let mut record = sample_record(RecordStatus::Detected);
        h.store.put_swap(record.clone()).await;

        let status = h.workers.verify.verify_record(&record).await.unwrap();
        assert_eq!(status, RecordStatus::Detected);

        record.init_time = now() - 3 * 3600;
        let status = h.workers.verify.verify_record(&record).await.unwrap();
        assert_eq!(status, RecordStatus::VerifyFailed);
    }

    #[tokio::test]
    async fn test_big_value_held_then_passed() {
        let h = TestHarness::with_big_value_threshold(1);
        let mut record = sample_record(RecordStatus::Detected);
        record.value = U256::exp10(19);
        h.src.add_swap(record.to_swap_info());
        h.store.put_swap(record.clone()).await;

        let status = h.workers.verify.verify_record(&record).await.unwrap();
        assert_eq!(status, RecordStatus::BigValue);
        assert!(h.store.find_result(&record.key()).await.is_err());

        h.workers.verify.pass_big_value(&record.key()).await.unwrap();
        let stored = h.store.find_swap(&record.key()).await.unwrap();
        assert_eq!(stored.status, RecordStatus::Swappable);
        assert!(h.store.find_result(&record.key()).await.is_ok());

        assert!(h.workers.verify.pass_big_value(&record.key()).await.is_err());
    }

    #[tokio::test]
    async fn test_blacklisted_swap_is_not_verified() {
        let h = TestHarness::new();
        let record = sample_record(RecordStatus::Detected);
        h.src.add_swap(record.to_swap_info());
        h.store.put_swap(record.clone()).await;
        h.ctx.policy.set_account_blacked(&record.bind, true);

        let status = h.workers.verify.verify_record(&record).await.unwrap();
        assert_eq!(status, RecordStatus::InBlacklist);
    }

    #[tokio::test]
    async fn test_paused_chain_is_skipped() {
        let h = TestHarness::new();
        let record = sample_record(RecordStatus::Detected);
        h.src.add_swap(record.to_swap_info());
        h.ctx.registry.pause(record.to_chain_id);

        let status = h.workers.verify.verify_record(&record).await.unwrap();
        assert_eq!(status, RecordStatus::Detected);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let h = TestHarness::new();
        let record = sample_record(RecordStatus::Detected);
        h.src.add_swap(record.to_swap_info());

        let first = h
            .workers
            .verify
            .register(record.from_chain_id, &record.tx_id, Some(record.log_index))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].created);

        let second = h
            .workers
            .verify
            .register(record.from_chain_id, &record.tx_id, None)
            .await
            .unwrap();
        assert_eq!(second[0].key, Some(record.key()));
        assert!(!second[0].created);
    }
}
