//! JSON-RPC client for an MPC signing node

use super::{PendingSignRequest, SignRequest, SignVote, SignerService};
use crate::config::MpcConfig;
use crate::error::BridgeError;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Destination of the wrapper transactions the MPC network accepts
const MPC_TO_ADDRESS: &str = "0x00000000000000000000000000000000000000dc";

/// Envelope every `smpc_*` method answers with
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MpcResponse<T> {
    status: String,
    #[serde(default)]
    tip: String,
    #[serde(default)]
    error: String,
    data: Option<T>,
}

impl<T> MpcResponse<T> {
    fn into_data(self, method: &str) -> Result<T, BridgeError> {
        if self.status != "Success" {
            return Err(BridgeError::Sign(format!(
                "{} status {}: {} {}",
                method, self.status, self.error, self.tip
            )));
        }
        self.data
            .ok_or_else(|| BridgeError::Sign(format!("{} returned no data", method)))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SignData<'a> {
    tx_type: &'static str,
    pub_key: &'a str,
    msg_hash: &'a [String],
    msg_context: &'a [String],
    keytype: &'static str,
    #[serde(rename = "GroupID")]
    group_id: &'a str,
    thres_hold: &'a str,
    mode: String,
    time_stamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AcceptData<'a> {
    tx_type: &'static str,
    key: &'a str,
    accept: &'static str,
    msg_hash: &'a [String],
    msg_context: &'a [String],
    time_stamp: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SignStatus {
    status: String,
    #[serde(default)]
    rsv: Vec<String>,
    #[serde(default)]
    error: String,
    #[serde(default)]
    all_reply: Vec<SignReply>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SignReply {
    #[serde(default)]
    enode: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SignInfo {
    account: String,
    key: String,
    #[serde(default)]
    pub_key: String,
    #[serde(default)]
    msg_hash: Vec<String>,
    #[serde(default)]
    msg_context: Vec<String>,
    #[serde(default)]
    time_stamp: String,
}

/// Signer backed by a remote MPC node
pub struct MpcClient {
    /// RPC connection to the MPC node
    provider: Provider<Http>,
    /// This node's user key, signs the wrapper transactions
    wallet: LocalWallet,
    /// Group and polling settings
    config: MpcConfig,
}

impl MpcClient {
    /// Create a client, loading the user key from the configured env var
    pub fn new(config: MpcConfig) -> Result<Self, BridgeError> {
        let key = std::env::var(&config.key_env).map_err(|_| {
            BridgeError::Sign(format!("mpc user key env {} is not set", config.key_env))
        })?;
        let wallet = key
            .parse::<LocalWallet>()
            .map_err(|e| BridgeError::Sign(format!("invalid mpc user key: {}", e)))?
            .with_chain_id(config.chain_id);
        Self::with_wallet(config, wallet)
    }

    pub fn with_wallet(config: MpcConfig, wallet: LocalWallet) -> Result<Self, BridgeError> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| BridgeError::Rpc(format!("invalid mpc rpc url: {}", e)))?;

        info!("MPC client initialized with user {:?}", wallet.address());

        Ok(Self {
            provider,
            wallet,
            config,
        })
    }

    /// MPC user account, lowercase hex
    pub fn user(&self) -> String {
        format!("{:?}", self.wallet.address())
    }

    async fn call<T: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<T, BridgeError> {
        let raw: serde_json::Value = self
            .provider
            .request(method, params)
            .await
            .map_err(|e| BridgeError::Rpc(format!("{}: {}", method, e)))?;
        let response: MpcResponse<T> = serde_json::from_value(raw)
            .map_err(|e| BridgeError::Rpc(format!("{} bad response: {}", method, e)))?;
        response.into_data(method)
    }

    async fn get_sign_nonce(&self) -> Result<u64, BridgeError> {
        let nonce: serde_json::Value = self
            .call("smpc_getSignNonce", vec![self.user().into()])
            .await?;
        match nonce {
            serde_json::Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| BridgeError::Sign("bad sign nonce".to_string())),
            serde_json::Value::String(s) => s
                .parse()
                .map_err(|_| BridgeError::Sign(format!("bad sign nonce {}", s))),
            other => Err(BridgeError::Sign(format!("bad sign nonce {}", other))),
        }
    }

    /// Wrap a JSON payload in a signed legacy transaction, hex encoded
    fn build_raw_tx(&self, nonce: u64, payload: Vec<u8>) -> Result<String, BridgeError> {
        let to: Address = MPC_TO_ADDRESS
            .parse()
            .map_err(|_| BridgeError::Sign("bad mpc to address".to_string()))?;
        let tx: TypedTransaction = TransactionRequest::new()
            .nonce(nonce)
            .to(to)
            .value(0u64)
            .gas(100_000u64)
            .gas_price(80_000u64)
            .data(payload)
            .chain_id(self.config.chain_id)
            .into();
        let signature = self
            .wallet
            .sign_transaction_sync(&tx)
            .map_err(|e| BridgeError::Sign(e.to_string()))?;
        Ok(format!("0x{}", hex::encode(tx.rlp_signed(&signature))))
    }

    async fn get_sign_status(&self, key_id: &str) -> Result<Vec<String>, BridgeError> {
        let status: SignStatus = self
            .call("smpc_getSignStatus", vec![key_id.into()])
            .await?;

        if status
            .all_reply
            .iter()
            .any(|r| r.status.eq_ignore_ascii_case("DISAGREE"))
        {
            let disagreeing: Vec<&str> = status
                .all_reply
                .iter()
                .filter(|r| r.status.eq_ignore_ascii_case("DISAGREE"))
                .map(|r| r.enode.as_str())
                .collect();
            warn!("MPC sign {} has disagree from {:?}", key_id, disagreeing);
            return Err(BridgeError::SignDisagree);
        }

        match status.status.as_str() {
            "Success" if !status.rsv.is_empty() => Ok(status.rsv),
            "Failure" | "Timeout" => Err(BridgeError::Sign(format!(
                "sign status {}: {}",
                status.status, status.error
            ))),
            other => Err(BridgeError::Rpc(format!("sign status {}", other))),
        }
    }
}

fn now_millis() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}

#[async_trait]
impl SignerService for MpcClient {
    async fn sign(&self, request: &SignRequest) -> Result<Vec<String>, BridgeError> {
        if request.pubkey.is_empty() {
            return Err(BridgeError::Sign("mpc sign with empty public key".to_string()));
        }

        let nonce = self.get_sign_nonce().await?;
        let data = SignData {
            tx_type: "SIGN",
            pub_key: &request.pubkey,
            msg_hash: &request.msg_hashes,
            msg_context: &request.msg_contexts,
            keytype: "ECDSA",
            group_id: &self.config.group_id,
            thres_hold: &self.config.threshold,
            mode: self.config.mode.to_string(),
            time_stamp: now_millis(),
        };
        let payload = serde_json::to_vec(&data).map_err(|e| BridgeError::Sign(e.to_string()))?;
        let raw_tx = self.build_raw_tx(nonce, payload)?;

        let key_id: String = self.call("smpc_sign", vec![raw_tx.into()]).await?;
        info!("MPC sign request {} submitted for {:?}", key_id, request.msg_hashes);

        let interval = Duration::from_secs(self.config.sign_status_interval_secs);
        let mut last_error = BridgeError::Sign("get sign status failed".to_string());
        for attempt in 0..self.config.sign_status_retries {
            tokio::time::sleep(interval).await;
            match self.get_sign_status(&key_id).await {
                Ok(rsvs) => return Ok(rsvs),
                Err(e @ BridgeError::SignDisagree) | Err(e @ BridgeError::Sign(_)) => return Err(e),
                Err(e) => {
                    debug!(
                        "Retry get sign status of {} (attempt {}): {}",
                        key_id, attempt, e
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn poll_pending_sign_requests(&self) -> Result<Vec<PendingSignRequest>, BridgeError> {
        let infos: Vec<SignInfo> = self
            .call("smpc_getCurNodeSignInfo", vec![0.into()])
            .await?;

        Ok(infos
            .into_iter()
            .map(|info| PendingSignRequest {
                key_id: info.key,
                initiator: info.account.to_lowercase(),
                pubkey: info.pub_key,
                msg_hashes: info.msg_hash,
                msg_contexts: info.msg_context,
                timestamp: info.time_stamp,
            })
            .collect())
    }

    async fn vote(&self, vote: &SignVote) -> Result<(), BridgeError> {
        let data = AcceptData {
            tx_type: "ACCEPTSIGN",
            key: &vote.key_id,
            accept: vote.result.as_str(),
            msg_hash: &vote.msg_hashes,
            msg_context: &vote.msg_contexts,
            time_stamp: now_millis(),
        };
        let payload = serde_json::to_vec(&data).map_err(|e| BridgeError::Sign(e.to_string()))?;
        let raw_tx = self.build_raw_tx(0, payload)?;

        let _: serde_json::Value = self.call("smpc_acceptSigning", vec![raw_tx.into()]).await?;
        debug!("Voted {} on sign request {}", vote.result, vote.key_id);
        Ok(())
    }
}
