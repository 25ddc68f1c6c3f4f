//! Accept engine: votes on co-sign requests started by other MPC nodes
//!
//! Every request is checked independently of the initiator: the source
//! deposit is re-verified and the payout rebuilt locally, and this node only
//! agrees when its own message hashes match the requested ones.

use super::history::{AcceptHistory, AcceptRecord};
use super::queue::BoundedKeySet;
use super::WorkerContext;
use crate::error::BridgeError;
use crate::metrics;
use crate::mpc::{AcceptResult, PendingSignRequest, SignVote};
use crate::swap::{BuildTxArgs, RecordStatus, SwapInfo, SwapRecord, VerifyArgs};

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Identifier carried by operator-triggered replacements
pub const REPLACE_SWAP_IDENTIFIER: &str = "replaceswap";

/// Why a request was not agreed to
#[derive(Debug)]
enum Rejection {
    /// Source tx not settled yet; look again next poll
    Retry(BridgeError),
    /// Not addressed to this deployment
    Ignore(String),
    Disagree(String),
}

pub struct AcceptEngine {
    ctx: WorkerContext,
    history: AcceptHistory,
    in_flight: Arc<BoundedKeySet>,
}

impl AcceptEngine {
    pub fn new(ctx: WorkerContext) -> Self {
        let worker = ctx.worker();
        Self {
            history: AcceptHistory::new(worker.accept_history_size),
            in_flight: Arc::new(BoundedKeySet::new(
                "accepting",
                worker.accept_history_size.max(worker.accept_workers),
            )),
            ctx,
        }
    }

    pub async fn run(self: Arc<Self>) {
        if !self.ctx.settings.mpc.enabled {
            info!("MPC disabled, accept engine idle");
            return;
        }
        let worker = self.ctx.worker();
        let workers = worker.accept_workers.max(1);
        info!("Accept engine started with {} workers", workers);

        let (tx, rx) = mpsc::channel::<PendingSignRequest>(workers * 2);
        let rx = Arc::new(Mutex::new(rx));
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let engine = self.clone();
                let rx = rx.clone();
                tokio::spawn(async move { engine.work(rx).await })
            })
            .collect();

        let poll_interval = Duration::from_secs(worker.accept_poll_interval_secs.max(1));
        let retry_interval = Duration::from_secs(worker.accept_retry_interval_secs.max(1));
        loop {
            let interval = match self.ctx.signer.poll_pending_sign_requests().await {
                Ok(requests) => {
                    debug!("{} pending sign requests", requests.len());
                    for req in requests {
                        if !self.in_flight.try_insert(&req.key_id) {
                            continue;
                        }
                        if tx.send(req).await.is_err() {
                            break;
                        }
                    }
                    poll_interval
                }
                Err(e) => {
                    warn!("Failed to get pending sign requests: {}", e);
                    retry_interval
                }
            };
            if !self.ctx.shutdown.sleep(interval).await {
                break;
            }
        }
        drop(tx);
        join_all(handles).await;
        info!("Accept engine stopped");
    }

    async fn work(&self, rx: Arc<Mutex<mpsc::Receiver<PendingSignRequest>>>) {
        loop {
            let req = rx.lock().await.recv().await;
            let Some(req) = req else { break };
            self.process(&req).await;
            self.in_flight.remove(&req.key_id);
        }
    }

    /// Decide on one request and cast the vote
    ///
    /// Returns `None` when the decision is postponed.
    pub async fn process(&self, req: &PendingSignRequest) -> Option<AcceptResult> {
        if let Some(previous) = self.history.get(&req.key_id) {
            if previous.result != AcceptResult::Ignore {
                debug!("Re-vote {} on {}", previous.result, req.key_id);
                self.vote(&req.key_id, previous.result, &previous.msg_hashes, &previous.msg_contexts)
                    .await;
            }
            return Some(previous.result);
        }

        let result = match self.check_request(req).await {
            Ok(()) => AcceptResult::Agree,
            Err(Rejection::Retry(e)) => {
                debug!("Postpone sign request {}: {}", req.key_id, e);
                return None;
            }
            Err(Rejection::Ignore(reason)) => {
                debug!("Ignore sign request {}: {}", req.key_id, reason);
                AcceptResult::Ignore
            }
            Err(Rejection::Disagree(reason)) => {
                warn!("Disagree with sign request {}: {}", req.key_id, reason);
                AcceptResult::Disagree
            }
        };

        if result != AcceptResult::Ignore
            && !self
                .vote(&req.key_id, result, &req.msg_hashes, &req.msg_contexts)
                .await
        {
            return None;
        }
        self.history.add(AcceptRecord {
            key_id: req.key_id.clone(),
            result,
            msg_hashes: req.msg_hashes.clone(),
            msg_contexts: req.msg_contexts.clone(),
        });
        metrics::record_accept_vote(result.as_str());
        Some(result)
    }

    async fn vote(
        &self,
        key_id: &str,
        result: AcceptResult,
        msg_hashes: &[String],
        msg_contexts: &[String],
    ) -> bool {
        let vote = SignVote {
            key_id: key_id.to_string(),
            result,
            msg_hashes: msg_hashes.to_vec(),
            msg_contexts: msg_contexts.to_vec(),
        };
        match self.ctx.signer.vote(&vote).await {
            Ok(()) => {
                info!("Voted {} on sign request {}", result, key_id);
                true
            }
            Err(e) => {
                warn!("Vote {} on {} failed: {}", result, key_id, e);
                false
            }
        }
    }

    async fn check_request(&self, req: &PendingSignRequest) -> Result<(), Rejection> {
        if !self.ctx.settings.router.is_initiator(&req.initiator) {
            return Err(Rejection::Ignore(format!(
                "initiator {} not allowed",
                req.initiator
            )));
        }
        let [context] = req.msg_contexts.as_slice() else {
            return Err(Rejection::Ignore(format!(
                "expected one msg context, got {}",
                req.msg_contexts.len()
            )));
        };
        let args: BuildTxArgs = serde_json::from_str(context)
            .map_err(|e| Rejection::Ignore(format!("wrong msg context: {}", e)))?;
        if args.identifier != self.ctx.identifier() && args.identifier != REPLACE_SWAP_IDENTIFIER {
            return Err(Rejection::Ignore(format!(
                "identifier {} mismatch",
                args.identifier
            )));
        }

        let info = self.verify_source(&args).await?;
        self.rebuild_and_compare(&args, &info, &req.msg_hashes).await
    }

    async fn verify_source(&self, args: &BuildTxArgs) -> Result<SwapInfo, Rejection> {
        let registry = &self.ctx.registry;
        let src = registry
            .get(args.from_chain_id)
            .map_err(|e| Rejection::Disagree(e.to_string()))?;
        let verify_args = VerifyArgs {
            log_index: args.log_index,
            allow_unstable: false,
        };
        let info = match src.verify_transaction(&args.swap_id, &verify_args).await {
            Ok(info) => info,
            Err(e @ (BridgeError::TxNotStable | BridgeError::TxNotFound)) => {
                return Err(Rejection::Retry(e))
            }
            Err(BridgeError::TxWithWrongContract) => {
                return Err(Rejection::Ignore(BridgeError::TxWithWrongContract.to_string()))
            }
            Err(e) => return Err(Rejection::Disagree(e.to_string())),
        };

        if info.to_chain_id != args.to_chain_id
            || !info.bind.eq_ignore_ascii_case(&args.bind)
            || info.value != args.origin_value
            || !info.token_id.eq_ignore_ascii_case(&args.token_id)
        {
            return Err(Rejection::Disagree("swap differs from source tx".into()));
        }
        if self
            .ctx
            .policy
            .is_blacked(&SwapRecord::from_info(&info, RecordStatus::Detected))
        {
            return Err(Rejection::Disagree(BridgeError::SwapInBlacklist.to_string()));
        }
        Ok(info)
    }

    async fn rebuild_and_compare(
        &self,
        args: &BuildTxArgs,
        info: &SwapInfo,
        msg_hashes: &[String],
    ) -> Result<(), Rejection> {
        let registry = &self.ctx.registry;
        let dst = registry
            .get(args.to_chain_id)
            .map_err(|e| Rejection::Disagree(e.to_string()))?;
        let mpc = registry
            .router_mpc(args.to_chain_id)
            .map_err(|e| Rejection::Disagree(e.to_string()))?;
        if !args.from.eq_ignore_ascii_case(&mpc) {
            return Err(Rejection::Disagree(BridgeError::SenderMismatch.to_string()));
        }

        let mut rebuilt = args.clone();
        rebuilt.from = mpc;
        rebuilt.origin_value = info.value;
        rebuilt.swap_value = None;
        rebuilt.to.clear();
        rebuilt.input.clear();
        let raw = dst
            .build_raw_transaction(&mut rebuilt)
            .await
            .map_err(|e| Rejection::Disagree(e.to_string()))?;
        dst.verify_msg_hash(&raw, msg_hashes)
            .map_err(|e| Rejection::Disagree(e.to_string()))
    }
}
