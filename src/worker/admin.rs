//! Operator overrides: signed admin calls mapped onto the engines' entry points
//!
//! A call is `{method, params, timestamp, signature}` where the signature is an
//! Ethereum personal-sign over `keccak256("method:p1,p2:timestamp")`.

use super::replace::ReplaceEngine;
use super::reswap::ReswapEngine;
use super::verify::VerifyEngine;
use super::WorkerContext;
use crate::chain::NonceTag;
use crate::error::{BridgeError, RouterError, RouterResult};
use crate::metrics;
use crate::swap::{now, RecordStatus, ResultStatus, SwapKey};
use crate::tx::find_swap_tx_on_chain;

use ethers::types::{RecoveryMessage, Signature, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Admin calls older or newer than this are refused
pub const CALL_VALIDITY_SECS: i64 = 300;

pub const SUCCESS: &str = "Success";

/// A signed operator request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminCall {
    pub method: String,
    #[serde(default)]
    pub params: Vec<String>,
    pub timestamp: i64,
    pub signature: String,
}

impl AdminCall {
    /// Canonical text the caller signs
    pub fn message(&self) -> String {
        format!(
            "{}:{}:{}",
            self.method,
            self.params.join(","),
            self.timestamp
        )
    }

    pub fn message_hash(&self) -> [u8; 32] {
        Keccak256::digest(self.message().as_bytes()).into()
    }

    /// Lowercase address that produced `signature`
    pub fn recover_signer(&self) -> RouterResult<String> {
        let signature = Signature::from_str(&self.signature)
            .map_err(|e| RouterError::Unauthorized(format!("invalid signature: {}", e)))?;
        let address = signature
            .recover(RecoveryMessage::Data(self.message_hash().to_vec()))
            .map_err(|e| RouterError::Unauthorized(format!("invalid signature: {}", e)))?;
        Ok(format!("{:?}", address))
    }
}

pub struct AdminService {
    ctx: WorkerContext,
    verify: Arc<VerifyEngine>,
    replace: Arc<ReplaceEngine>,
    reswap: Arc<ReswapEngine>,
}

impl AdminService {
    pub fn new(
        ctx: WorkerContext,
        verify: Arc<VerifyEngine>,
        replace: Arc<ReplaceEngine>,
        reswap: Arc<ReswapEngine>,
    ) -> Self {
        Self {
            ctx,
            verify,
            replace,
            reswap,
        }
    }

    /// Authenticate and run a call, answering `Success` or the error
    pub async fn call(&self, call: &AdminCall) -> RouterResult<String> {
        let outcome = self.dispatch(call).await;
        metrics::record_admin_call(&call.method, outcome.is_ok());
        if let Err(e) = &outcome {
            warn!("Admin call {} failed: {}", call.method, e);
        }
        outcome
    }

    async fn dispatch(&self, call: &AdminCall) -> RouterResult<String> {
        let sender = self.authorize(call)?;
        info!(
            "Admin call {} {:?} from {}",
            call.method, call.params, sender
        );
        match call.method.as_str() {
            "maintain" => self.maintain(&call.params)?,
            "passbigvalue" => {
                let key = parse_key(&call.params)?;
                self.verify.pass_big_value(&key).await?;
            }
            "reswap" => {
                let key = parse_key(&call.params)?;
                self.reswap(&key).await?;
            }
            "replaceswap" => {
                let key = parse_key(&call.params)?;
                let gas_price = parse_gas_price(call.params.get(3))?;
                let res = self.ctx.store.find_result(&key).await?;
                self.replace.replace_swap(&res, gas_price).await?;
            }
            "forbidswap" => {
                let key = parse_key(&call.params)?;
                let memo = call.params.get(3).map(String::as_str).unwrap_or_default();
                self.forbid(&key, memo).await?;
            }
            other => {
                return Err(RouterError::Admin(format!(
                    "unknown admin method '{}'",
                    other
                )))
            }
        }
        Ok(SUCCESS.to_string())
    }

    /// Check freshness and signer rights; returns the signer
    fn authorize(&self, call: &AdminCall) -> RouterResult<String> {
        let router = &self.ctx.settings.router;
        if router.admins.is_empty() {
            return Err(RouterError::Unauthorized("no admin is configured".into()));
        }
        if (now() - call.timestamp).abs() > CALL_VALIDITY_SECS {
            return Err(RouterError::Unauthorized(format!(
                "admin call timestamp {} expired",
                call.timestamp
            )));
        }

        let sender = call.recover_signer()?;
        if router.is_admin(&sender) {
            return Ok(sender);
        }
        let admin_only = match call.method.as_str() {
            "reswap" => true,
            "maintain" => matches!(
                call.params.first().map(String::as_str),
                Some("pause" | "unpause")
            ),
            "passbigvalue" | "replaceswap" | "forbidswap" => false,
            other => {
                return Err(RouterError::Admin(format!(
                    "unknown admin method '{}'",
                    other
                )))
            }
        };
        if admin_only {
            return Err(RouterError::Unauthorized(format!(
                "sender {} is not admin",
                sender
            )));
        }
        if !router.is_assistant(&sender) {
            return Err(RouterError::Unauthorized(format!(
                "sender {} is not assistant",
                sender
            )));
        }
        Ok(sender)
    }

    fn maintain(&self, params: &[String]) -> RouterResult<()> {
        let [action, arguments] = params else {
            return Err(RouterError::Admin(format!(
                "wrong number of params, have {} want 2",
                params.len()
            )));
        };
        let args: Vec<&str> = arguments.split(',').map(str::trim).collect();
        let registry = &self.ctx.registry;
        let policy = &self.ctx.policy;

        match action.as_str() {
            "pause" | "unpause" => {
                for id in &args {
                    let chain_id = parse_chain_id(id)?;
                    if action == "pause" {
                        registry.pause(chain_id);
                    } else {
                        registry.unpause(chain_id);
                    }
                }
                info!("Paused chains are now {:?}", registry.paused_chains());
            }
            "blacklist" | "unblacklist" => {
                let add = action == "blacklist";
                let [kind, values @ ..] = args.as_slice() else {
                    return Err(RouterError::Admin("miss arguments".into()));
                };
                if values.is_empty() {
                    return Err(RouterError::Admin("miss arguments".into()));
                }
                match kind.to_lowercase().as_str() {
                    "chainid" => {
                        for id in values {
                            policy.set_chain_blacked(parse_chain_id(id)?, add);
                        }
                    }
                    "tokenid" => values.iter().for_each(|t| policy.set_token_blacked(t, add)),
                    "account" => values.iter().for_each(|a| policy.set_account_blacked(a, add)),
                    other => {
                        return Err(RouterError::Admin(format!(
                            "unknown blacklist type '{}'",
                            other
                        )))
                    }
                }
            }
            "whitelist" | "unwhitelist" => {
                let add = action == "whitelist";
                let [kind, token_id, accounts @ ..] = args.as_slice() else {
                    return Err(RouterError::Admin("miss arguments".into()));
                };
                if accounts.is_empty() {
                    return Err(RouterError::Admin("miss arguments".into()));
                }
                if !kind.eq_ignore_ascii_case("bigvalue") {
                    return Err(RouterError::Admin(format!(
                        "unknown whitelist type '{}'",
                        kind
                    )));
                }
                for account in accounts {
                    policy.set_big_value_whitelisted(token_id, account, add);
                }
            }
            other => {
                return Err(RouterError::Admin(format!(
                    "unknown maintain action '{}'",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Retry a failed payout from scratch
    async fn reswap(&self, key: &SwapKey) -> RouterResult<()> {
        let record = self.ctx.store.find_swap(key).await?;
        if record.status != RecordStatus::Processed {
            return Err(RouterError::Admin(format!(
                "swap status is {}, can not reswap",
                record.status
            )));
        }
        let res = self.ctx.store.find_result(key).await?;
        if res.status != ResultStatus::Failed {
            return Err(RouterError::Admin(format!(
                "swap result status is {}, can not reswap",
                res.status
            )));
        }
        if res.swap_tx.is_empty() {
            return Err(RouterError::Admin("swap without swap tx".into()));
        }
        if !self.ctx.registry.is_reswap_supported(res.to_chain_id) {
            return Err(BridgeError::ReswapNotSupported.into());
        }
        let bridge = self.ctx.registry.get(res.to_chain_id)?;

        if let Some((tx, status)) = find_swap_tx_on_chain(bridge.as_ref(), &res).await {
            if status.success {
                self.ctx
                    .store
                    .override_result_status(key, ResultStatus::NotStable, "")
                    .await?;
                return Err(RouterError::Admin(format!(
                    "swap succeed with swap tx {}",
                    tx
                )));
            }
        }
        if let Some(setter) = bridge.nonce_setter() {
            let mpc = if res.mpc.is_empty() {
                self.ctx.registry.router_mpc(res.to_chain_id)?
            } else {
                res.mpc.clone()
            };
            let latest = setter.get_pool_nonce(&mpc, NonceTag::Latest).await?;
            if latest <= res.swap_nonce {
                return Err(RouterError::Admin(
                    "can not retry swap with lower nonce".into(),
                ));
            }
        }

        warn!("Manual reswap of {} (was {})", key, res.swap_tx);
        self.ctx
            .store
            .override_result_status(key, ResultStatus::NeedReswap, "manual reswap")
            .await?;
        self.reswap.reswap_swap(&res).await?;
        Ok(())
    }

    async fn forbid(&self, key: &SwapKey, memo: &str) -> RouterResult<()> {
        warn!("Forbid swap {}: {}", key, memo);
        let result = self
            .ctx
            .store
            .update_result_status(key, ResultStatus::ManualMakeFail, memo)
            .await;
        let record = self
            .ctx
            .store
            .update_swap_status(key, RecordStatus::ManualMakeFail, memo)
            .await;
        match (result, record) {
            (Err(e), Err(_)) => Err(e),
            _ => Ok(()),
        }
    }
}

fn parse_chain_id(value: &str) -> RouterResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| RouterError::Admin(format!("wrong chain id '{}'", value)))
}

/// `chain_id, txid, log_index` from the front of `params`
fn parse_key(params: &[String]) -> RouterResult<SwapKey> {
    let [chain_id, tx_id, log_index, ..] = params else {
        return Err(RouterError::Admin(format!(
            "wrong number of params, have {} want at least 3",
            params.len()
        )));
    };
    let chain_id = parse_chain_id(chain_id)?;
    let well_formed = match tx_id.strip_prefix("0x") {
        Some(hex) => hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()),
        None => !tx_id.is_empty(),
    };
    if !well_formed {
        return Err(RouterError::Admin(format!("wrong tx id '{}'", tx_id)));
    }
    let log_index = log_index
        .parse()
        .map_err(|_| RouterError::Admin(format!("wrong log index '{}'", log_index)))?;
    Ok(SwapKey::new(chain_id, tx_id, log_index))
}

fn parse_gas_price(value: Option<&String>) -> RouterResult<Option<U256>> {
    match value.map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(v) => U256::from_dec_str(v)
            .map(Some)
            .map_err(|_| RouterError::Admin(format!("wrong gas price '{}'", v))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SwapStore;
    use crate::swap::TxStatus;
    use crate::test_utils::{sample_record, TestHarness, TEST_ADMIN_KEY, TEST_ASSISTANT_KEY};
    use ethers::signers::{LocalWallet, Signer};

    async fn signed(key: &str, method: &str, params: &[&str], timestamp: i64) -> AdminCall {
        let wallet: LocalWallet = key.parse().unwrap();
        let mut call = AdminCall {
            method: method.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            timestamp,
            signature: String::new(),
        };
        let signature = wallet.sign_message(call.message_hash()).await.unwrap();
        call.signature = signature.to_string();
        call
    }

    #[tokio::test]
    async fn test_recover_signer_matches_wallet() {
        let wallet: LocalWallet = TEST_ADMIN_KEY.parse().unwrap();
        let call = signed(TEST_ADMIN_KEY, "maintain", &["pause", "56"], now()).await;
        assert_eq!(call.message(), format!("maintain:pause,56:{}", call.timestamp));
        assert_eq!(
            call.recover_signer().unwrap(),
            format!("{:?}", wallet.address())
        );
    }

    #[tokio::test]
    async fn test_admin_can_pause_and_blacklist() {
        let h = TestHarness::new();
        let admin = &h.workers.admin;

        let call = signed(TEST_ADMIN_KEY, "maintain", &["pause", "56,1"], now()).await;
        assert_eq!(admin.call(&call).await.unwrap(), SUCCESS);
        assert_eq!(h.ctx.registry.paused_chains(), vec![1, 56]);

        let call = signed(TEST_ADMIN_KEY, "maintain", &["blacklist", "tokenid,USDT"], now()).await;
        admin.call(&call).await.unwrap();
        assert!(h.ctx.policy.is_token_blacked("usdt"));
    }

    #[tokio::test]
    async fn test_assistant_rights_are_limited() {
        let h = TestHarness::new();
        let admin = &h.workers.admin;

        let call = signed(TEST_ASSISTANT_KEY, "maintain", &["pause", "56"], now()).await;
        let err = admin.call(&call).await.unwrap_err();
        assert!(err.to_string().contains("is not admin"));
        assert!(!h.ctx.registry.is_paused(56));

        let key = "0x0000000000000000000000000000000000000000000000000000000000000001";
        let call = signed(TEST_ASSISTANT_KEY, "reswap", &["1", key, "0"], now()).await;
        assert!(matches!(
            admin.call(&call).await,
            Err(RouterError::Unauthorized(_))
        ));

        let call = signed(
            TEST_ASSISTANT_KEY,
            "maintain",
            &["whitelist", "bigvalue,USDC,0x0000000000000000000000000000000000000abc"],
            now(),
        )
        .await;
        admin.call(&call).await.unwrap();
        assert!(h
            .ctx
            .policy
            .is_big_value_whitelisted("USDC", "0x0000000000000000000000000000000000000ABC"));
    }

    #[tokio::test]
    async fn test_unknown_signer_and_stale_calls_rejected() {
        let h = TestHarness::new();
        let stranger = "1111111111111111111111111111111111111111111111111111111111111111";
        let call = signed(stranger, "forbidswap", &["1", "0xaa", "0"], now()).await;
        assert!(matches!(
            h.workers.admin.call(&call).await,
            Err(RouterError::Unauthorized(_))
        ));

        let call = signed(TEST_ADMIN_KEY, "maintain", &["pause", "56"], now() - 600).await;
        assert!(matches!(
            h.workers.admin.call(&call).await,
            Err(RouterError::Unauthorized(_))
        ));

        let mut call = signed(TEST_ADMIN_KEY, "maintain", &["pause", "56"], now()).await;
        call.params = vec!["pause".into(), "1".into()];
        assert!(h.workers.admin.call(&call).await.is_err());
        assert!(!h.ctx.registry.is_paused(1));
    }

    #[tokio::test]
    async fn test_forbid_swap_marks_manual_fail() {
        let h = TestHarness::new();
        let record = h.swappable_record().await;
        let params = [
            record.from_chain_id.to_string(),
            record.tx_id.clone(),
            record.log_index.to_string(),
            "fraud".to_string(),
        ];
        let params: Vec<&str> = params.iter().map(String::as_str).collect();
        let call = signed(TEST_ASSISTANT_KEY, "forbidswap", &params, now()).await;
        h.workers.admin.call(&call).await.unwrap();

        let stored = h.store.find_swap(&record.key()).await.unwrap();
        assert_eq!(stored.status, RecordStatus::ManualMakeFail);
        let res = h.store.find_result(&record.key()).await.unwrap();
        assert_eq!(res.status, ResultStatus::ManualMakeFail);
        assert_eq!(res.memo, "fraud");
    }

    #[tokio::test]
    async fn test_manual_reswap_of_failed_payout() {
        let h = TestHarness::with_reswap_ttl(50);
        let mut res = h.need_reswap_result("0xold", 3).await;
        res.status = ResultStatus::Failed;
        h.store.put_result(res.clone()).await;
        h.dst.set_tx_status(
            "0xold",
            TxStatus {
                block_height: 10,
                confirmations: 20,
                success: false,
                ..Default::default()
            },
        );
        h.dst.set_pool_nonce(4);

        let params = [
            res.from_chain_id.to_string(),
            res.tx_id.clone(),
            res.log_index.to_string(),
        ];
        let params: Vec<&str> = params.iter().map(String::as_str).collect();
        let call = signed(TEST_ADMIN_KEY, "reswap", &params, now()).await;
        h.workers.admin.call(&call).await.unwrap();

        let stored = h.store.find_result(&res.key()).await.unwrap();
        assert_eq!(stored.status, ResultStatus::NotStable);
        assert_ne!(stored.swap_tx, "0xold");
        assert_eq!(h.dst.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_manual_reswap_needs_passed_nonce() {
        let h = TestHarness::with_reswap_ttl(50);
        let mut res = h.need_reswap_result("0xold", 3).await;
        res.status = ResultStatus::Failed;
        h.store.put_result(res.clone()).await;
        h.dst.set_pool_nonce(3);

        let record = sample_record(RecordStatus::Processed);
        let params = [
            record.from_chain_id.to_string(),
            record.tx_id.clone(),
            record.log_index.to_string(),
        ];
        let params: Vec<&str> = params.iter().map(String::as_str).collect();
        let call = signed(TEST_ADMIN_KEY, "reswap", &params, now()).await;
        let err = h.workers.admin.call(&call).await.unwrap_err();
        assert!(err.to_string().contains("lower nonce"));
    }

    #[test]
    fn test_parse_key_validates_params() {
        let ok = ["1".to_string(), "0xABCD".to_string(), "2".to_string()];
        assert!(parse_key(&ok).is_err());

        let hash = format!("0x{}", "ab".repeat(32));
        let ok = ["56".to_string(), hash.clone(), "2".to_string()];
        assert_eq!(parse_key(&ok).unwrap(), SwapKey::new(56, &hash, 2));
        assert!(parse_key(&ok[..2]).is_err());
        assert_eq!(parse_gas_price(None).unwrap(), None);
        assert_eq!(
            parse_gas_price(Some(&"1000".to_string())).unwrap(),
            Some(U256::from(1000))
        );
    }
}
