//! Payout broadcast with retry logic and the send-until-on-chain loop

use crate::chain::{Bridge, SignedTx};
use crate::config::WorkerConfig;
use crate::error::BridgeError;
use crate::store::SwapStore;
use crate::swap::{BuildTxArgs, SwapKey, SwapResult, SwapResultUpdate, TxStatus};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Retry knobs for broadcasting one signed payout
#[derive(Debug, Clone)]
pub struct SendPolicy {
    pub retry_loops: u32,
    pub retries: u32,
    pub retry_interval: Duration,
    pub loop_interval: Duration,
    pub enable_send_loop: bool,
    pub send_loop_count: u32,
    pub send_loop_interval: Duration,
}

impl SendPolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            retry_loops: config.retry_send_tx_loops.max(1),
            retries: config.send_tx_retries.max(1),
            retry_interval: Duration::from_millis(config.send_retry_interval_ms),
            loop_interval: Duration::from_millis(config.send_retry_loop_interval_ms),
            enable_send_loop: config.enable_send_tx_loop,
            send_loop_count: config.send_tx_loop_count,
            send_loop_interval: Duration::from_secs(config.send_tx_loop_interval_secs),
        }
    }
}

/// Whether a failed broadcast is worth another retry loop
///
/// Only timeouts qualify; anything else may mean the node accepted the tx
/// and resending would waste a nonce allocation.
pub fn needs_retry(err: &BridgeError) -> bool {
    let msg = match err {
        BridgeError::Send(msg) | BridgeError::Rpc(msg) => msg.to_lowercase(),
        _ => return false,
    };
    msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("json-rpc error -32000, internal")
        || msg.trim_end().ends_with("-32000,")
}

/// First payout hash of `result` the chain has mined, current hash first
pub async fn find_swap_tx_on_chain(
    bridge: &dyn Bridge,
    result: &SwapResult,
) -> Option<(String, TxStatus)> {
    for tx in result.candidate_txs() {
        match bridge.get_transaction_status(&tx).await {
            Ok(status) if status.block_height > 0 => return Some((tx, status)),
            Ok(_) => {}
            Err(e) => {
                debug!("Swap tx {} of {} not found: {}", tx, result.key(), e);
            }
        }
    }
    None
}

/// Broadcasts signed payouts
pub struct TransactionSender {
    policy: SendPolicy,
    store: Arc<dyn SwapStore>,
}

impl TransactionSender {
    pub fn new(policy: SendPolicy, store: Arc<dyn SwapStore>) -> Self {
        Self { policy, store }
    }

    /// Send with retry loops, then advance the signer nonce
    pub async fn send(
        &self,
        bridge: &Arc<dyn Bridge>,
        signed_tx: &SignedTx,
        args: &BuildTxArgs,
    ) -> Result<String, BridgeError> {
        let key = args.key();
        let mut result = Err(BridgeError::Send("no send attempt".to_string()));

        'send: for lp in 0..self.policy.retry_loops {
            for _ in 0..self.policy.retries {
                result = bridge.send_transaction(signed_tx).await;
                if let Ok(hash) = &result {
                    info!(
                        "Sent payout {} for {} to chain {} (nonce {:?}, replace {})",
                        hash, key, args.to_chain_id, args.extra.nonce, args.extra.replace_num
                    );
                    break 'send;
                }
                sleep(self.policy.retry_interval).await;
            }

            let Err(e) = &result else { break };
            if !needs_retry(e) || lp + 1 == self.policy.retry_loops {
                break;
            }
            warn!(
                "Send payout for {} failed and will retry (loop {}): {}",
                key, lp, e
            );
            sleep(self.policy.loop_interval).await;
        }

        let hash = match result {
            Ok(hash) => hash,
            Err(e) => {
                error!("Send payout for {} failed: {}", key, e);
                return Err(e);
            }
        };

        if let (Some(setter), Some(nonce)) = (bridge.nonce_setter(), args.extra.nonce) {
            setter.set_nonce(&args.from, nonce + 1).await;
        }

        if self.policy.enable_send_loop && self.policy.send_loop_count > 0 {
            tokio::spawn(send_until_on_chain(
                bridge.clone(),
                self.store.clone(),
                self.policy.clone(),
                signed_tx.clone(),
                key,
            ));
        }

        Ok(hash)
    }
}

/// Rebroadcast until one of the swap's hashes is mined, then record its height
async fn send_until_on_chain(
    bridge: Arc<dyn Bridge>,
    store: Arc<dyn SwapStore>,
    policy: SendPolicy,
    signed_tx: SignedTx,
    key: SwapKey,
) {
    for round in 1..=policy.send_loop_count {
        sleep(policy.send_loop_interval).await;

        let Ok(result) = store.find_result(&key).await else {
            continue;
        };
        if result.status.is_final() {
            break;
        }
        if let Some((tx, status)) = find_swap_tx_on_chain(bridge.as_ref(), &result).await {
            info!(
                "Payout {} of {} is on chain at height {} (round {})",
                tx, key, status.block_height, round
            );
            let update = SwapResultUpdate {
                swap_tx: Some(tx),
                swap_height: Some(status.block_height),
                swap_time: Some(status.block_time),
                ..Default::default()
            };
            if let Err(e) = store.update_result(&key, &update).await {
                warn!("Failed to record payout height of {}: {}", key, e);
            }
            break;
        }

        match bridge.send_transaction(&signed_tx).await {
            Ok(hash) => debug!("Resent payout {} for {} (round {})", hash, key, round),
            Err(e) => debug!("Resend payout for {} failed (round {}): {}", key, round, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySwapStore;
    use crate::test_utils::{sample_build_args, FakeBridge};

    fn fast_policy() -> SendPolicy {
        SendPolicy {
            retry_loops: 2,
            retries: 3,
            retry_interval: Duration::ZERO,
            loop_interval: Duration::ZERO,
            enable_send_loop: false,
            send_loop_count: 0,
            send_loop_interval: Duration::ZERO,
        }
    }

    #[test]
    fn test_needs_retry_only_on_timeouts() {
        assert!(needs_retry(&BridgeError::Send(
            "error sending request: operation timed out".into()
        )));
        assert!(needs_retry(&BridgeError::Send(
            "json-rpc error -32000, internal".into()
        )));
        assert!(!needs_retry(&BridgeError::Send("nonce too low".into())));
        assert!(!needs_retry(&BridgeError::TxNotFound));
    }

    #[tokio::test]
    async fn test_send_sets_next_nonce() {
        let fake = Arc::new(FakeBridge::new(56));
        let bridge: Arc<dyn Bridge> = fake.clone();
        let sender = TransactionSender::new(fast_policy(), Arc::new(MemorySwapStore::new()));

        let mut args = sample_build_args(56);
        args.extra.nonce = Some(9);
        let signed = SignedTx {
            bytes: b"payout".to_vec(),
        };
        sender.send(&bridge, &signed, &args).await.unwrap();

        assert_eq!(fake.sent_count(), 1);
        let setter = bridge.nonce_setter().unwrap();
        assert_eq!(setter.get_swap_nonce(&args.from).await, 10);
    }

    #[tokio::test]
    async fn test_send_stops_on_non_timeout_error() {
        let fake = Arc::new(FakeBridge::new(56));
        fake.fail_next_sends(vec![BridgeError::Send("nonce too low".into()); 3]);
        let bridge: Arc<dyn Bridge> = fake.clone();
        let sender = TransactionSender::new(fast_policy(), Arc::new(MemorySwapStore::new()));

        let args = sample_build_args(56);
        let signed = SignedTx { bytes: vec![1] };
        assert!(sender.send(&bridge, &signed, &args).await.is_err());
        assert_eq!(fake.send_attempts(), 3);
    }

    #[tokio::test]
    async fn test_send_retries_a_second_loop_on_timeout() {
        let fake = Arc::new(FakeBridge::new(56));
        fake.fail_next_sends(vec![BridgeError::Send("request timeout".into()); 4]);
        let bridge: Arc<dyn Bridge> = fake.clone();
        let sender = TransactionSender::new(fast_policy(), Arc::new(MemorySwapStore::new()));

        let args = sample_build_args(56);
        let signed = SignedTx { bytes: vec![1] };
        assert!(sender.send(&bridge, &signed, &args).await.is_ok());
        assert_eq!(fake.send_attempts(), 5);
    }
}
