//! Worker engines that drive swaps from detection to a stable payout
//!
//! Each engine is a producer loop that scans the store and pushes tasks into
//! per-chain FIFO queues, plus one consumer per chain draining them in order.
//! Engines share a `WorkerContext` and stop on the same `Shutdown` signal.

pub mod accept;
pub mod admin;
pub mod history;
pub mod passbigvalue;
pub mod policy;
pub mod queue;
pub mod replace;
pub mod reswap;
pub mod stable;
pub mod swapout;
pub mod verify;

pub use accept::AcceptEngine;
pub use admin::{AdminCall, AdminService};
pub use history::{AcceptHistory, SwapHistory};
pub use passbigvalue::PassBigValueJob;
pub use policy::SwapPolicy;
pub use replace::ReplaceEngine;
pub use reswap::ReswapEngine;
pub use stable::StableEngine;
pub use swapout::SwapDispatcher;
pub use verify::VerifyEngine;

use crate::chain::{Bridge, BridgeRegistry, NonceTag};
use crate::config::{NodeRole, Settings, WorkerConfig};
use crate::error::{RouterError, RouterResult};
use crate::metrics;
use crate::mpc::SignerService;
use crate::store::SwapStore;
use crate::swap::{now, ResultStatus, SwapResult};
use crate::tx::{SendPolicy, TransactionSender};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Process-wide stop signal shared by every loop
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is triggered
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration`; `false` if shutdown fired first
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_triggered(),
            _ = self.wait() => false,
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state handed to every engine
#[derive(Clone)]
pub struct WorkerContext {
    pub settings: Arc<Settings>,
    pub registry: Arc<BridgeRegistry>,
    pub store: Arc<dyn SwapStore>,
    pub signer: Arc<dyn SignerService>,
    pub policy: Arc<SwapPolicy>,
    pub history: Arc<SwapHistory>,
    pub sender: Arc<TransactionSender>,
    pub shutdown: Shutdown,
}

impl WorkerContext {
    pub fn new(
        settings: Arc<Settings>,
        registry: Arc<BridgeRegistry>,
        store: Arc<dyn SwapStore>,
        signer: Arc<dyn SignerService>,
        shutdown: Shutdown,
    ) -> Self {
        let policy = Arc::new(SwapPolicy::new(&settings));
        let history = Arc::new(SwapHistory::new(settings.worker.swap_history_size));
        let sender = Arc::new(TransactionSender::new(
            SendPolicy::from_config(&settings.worker),
            store.clone(),
        ));
        Self {
            settings,
            registry,
            store,
            signer,
            policy,
            history,
            sender,
            shutdown,
        }
    }

    pub fn worker(&self) -> &WorkerConfig {
        &self.settings.worker
    }

    pub fn identifier(&self) -> &str {
        &self.settings.router.identifier
    }

    /// Lower bound of a lookback window ending now
    pub fn since(&self, lifetime_secs: u64) -> i64 {
        now() - lifetime_secs as i64
    }
}

/// Mark `res` failed once the signer's confirmed nonce has moved past it
///
/// Returns whether the result was marked failed. When `for_replace` is set a
/// passed nonce is an error, since replacing it could never confirm.
pub(crate) async fn check_swap_nonce_passed(
    ctx: &WorkerContext,
    bridge: &dyn Bridge,
    res: &SwapResult,
    for_replace: bool,
) -> RouterResult<bool> {
    let Some(setter) = bridge.nonce_setter() else {
        return Ok(false);
    };
    if res.swap_nonce == 0 {
        return Ok(false);
    }
    let mpc = ctx.registry.router_mpc(res.to_chain_id)?;
    let latest = setter.get_pool_nonce(&mpc, NonceTag::Latest).await?;
    if latest <= res.swap_nonce {
        return Ok(false);
    }

    let key = res.key();
    let mut marked = false;
    if res.timestamp < now() - ctx.worker().nonce_passed_interval_secs as i64 {
        info!(
            "Mark swap {} failed, nonce {} passed (latest {})",
            key, res.swap_nonce, latest
        );
        ctx.store
            .update_result_status(&key, ResultStatus::Failed, "swap nonce passed")
            .await?;
        metrics::record_result_final(res.to_chain_id, ResultStatus::Failed.as_str());
        marked = true;
    }
    if for_replace {
        return Err(RouterError::NoncePassed {
            nonce: res.swap_nonce,
            latest,
        });
    }
    Ok(marked)
}

/// All engines of one node
pub struct Workers {
    ctx: WorkerContext,
    pub verify: Arc<VerifyEngine>,
    pub swap: Arc<SwapDispatcher>,
    pub stable: Arc<StableEngine>,
    pub replace: Arc<ReplaceEngine>,
    pub reswap: Arc<ReswapEngine>,
    pub accept: Arc<AcceptEngine>,
    pub pass_big_value: Arc<PassBigValueJob>,
    pub admin: Arc<AdminService>,
}

impl Workers {
    pub fn new(ctx: WorkerContext) -> Self {
        let verify = Arc::new(VerifyEngine::new(ctx.clone()));
        let reswap = Arc::new(ReswapEngine::new(ctx.clone(), verify.clone()));
        let replace = Arc::new(ReplaceEngine::new(ctx.clone(), verify.clone()));
        let admin = Arc::new(AdminService::new(
            ctx.clone(),
            verify.clone(),
            replace.clone(),
            reswap.clone(),
        ));
        Self {
            swap: Arc::new(SwapDispatcher::new(ctx.clone(), verify.clone())),
            stable: Arc::new(StableEngine::new(ctx.clone(), reswap.clone())),
            accept: Arc::new(AcceptEngine::new(ctx.clone())),
            pass_big_value: Arc::new(PassBigValueJob::new(ctx.clone(), verify.clone())),
            verify,
            replace,
            reswap,
            admin,
            ctx,
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    /// Spawn the loops this node's role runs
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let role = self.ctx.settings.router.role;
        info!("Starting workers for role {:?}", role);

        if role == NodeRole::Oracle {
            handles.push(tokio::spawn(self.accept.clone().run()));
            return handles;
        }

        handles.push(tokio::spawn(refresh_latest_blocks(self.ctx.clone())));
        handles.push(tokio::spawn(self.verify.clone().run()));
        handles.push(tokio::spawn(self.swap.clone().run()));
        handles.push(tokio::spawn(self.stable.clone().run()));
        handles.push(tokio::spawn(self.replace.clone().run()));
        handles.push(tokio::spawn(self.reswap.clone().run()));
        handles.push(tokio::spawn(self.pass_big_value.clone().run()));
        handles
    }
}

/// Keep the registry's tip cache warm for the verify skip check
async fn refresh_latest_blocks(ctx: WorkerContext) {
    let interval = Duration::from_secs(ctx.worker().latest_block_interval_secs.max(1));
    loop {
        ctx.registry.refresh_latest_blocks().await;
        if !ctx.shutdown.sleep(interval).await {
            break;
        }
    }
}
