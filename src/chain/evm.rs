//! EVM bridge: deposits through the router contract, payouts via `anySwapIn`

use super::finality::confirmations;
use super::router::{decode_swap_out, encode_swap_in};
use super::{
    Bridge, ChainProvider, NonceSetter, NonceTag, RawTx, RegisterArgs, Reswapable,
    SignedTx,
};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::BridgeError;
use crate::mpc::{SignRequest, SignerService};
use crate::swap::{BuildTxArgs, SwapInfo, SwapType, TxStatus, VerifyArgs};
use crate::tx::{GasEstimator, NonceCache};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockNumber, Bytes, Eip1559TransactionRequest, Signature, TransactionReceipt,
    TransactionRequest, H256, U256,
};
use ethers::utils::keccak256;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Priority fee before replacement bumps
const BASE_PRIORITY_FEE_WEI: u64 = 2_000_000_000;

/// Full lowercase hex of an address
fn hex_address(address: Address) -> String {
    format!("{:?}", address)
}

fn parse_address(value: &str) -> Option<Address> {
    if value.len() != 42 || !value.starts_with("0x") {
        return None;
    }
    value.parse().ok()
}

fn parse_hash(value: &str) -> Result<H256, BridgeError> {
    value
        .parse()
        .map_err(|_| BridgeError::Rpc(format!("invalid tx hash {}", value)))
}

/// Turn a 65-byte rsv from the signer into an EIP-155 signature
pub fn assemble_signature(rsv: &str, chain_id: u64) -> Result<Signature, BridgeError> {
    let bytes = hex::decode(rsv.trim_start_matches("0x"))
        .map_err(|e| BridgeError::Sign(format!("bad rsv hex: {}", e)))?;
    if bytes.len() != 65 {
        return Err(BridgeError::Sign(format!(
            "wrong rsv length {}",
            bytes.len()
        )));
    }
    let recid = match bytes[64] {
        v @ 0..=1 => v as u64,
        v @ 27..=28 => v as u64 - 27,
        v => return Err(BridgeError::Sign(format!("wrong recovery id {}", v))),
    };
    Ok(Signature {
        r: U256::from_big_endian(&bytes[..32]),
        s: U256::from_big_endian(&bytes[32..64]),
        v: recid + 35 + chain_id * 2,
    })
}

/// Bridge for one EVM chain
pub struct EvmBridge {
    config: ChainConfig,
    provider: ChainProvider,
    signer: Arc<dyn SignerService>,
    nonces: NonceCache,
    gas: GasEstimator,
    /// Reserve nonces at build time so sign and send can run detached
    parallel: bool,
}

impl EvmBridge {
    pub fn new(
        config: ChainConfig,
        signer: Arc<dyn SignerService>,
        parallel: bool,
        nonce_recycle_ack_secs: u64,
    ) -> Result<Self, BridgeError> {
        let provider = ChainProvider::new(&config)?;
        let nonces = NonceCache::new(config.chain_id, nonce_recycle_ack_secs);
        let gas = GasEstimator::new(config.replace_gas_bump_percent, config.max_gas_price_gwei);
        Ok(Self {
            config,
            provider,
            signer,
            nonces,
            gas,
            parallel,
        })
    }

    /// Seed the nonce cache of the router MPC account from the pool
    pub async fn init_nonce(&self) -> Result<(), BridgeError> {
        let mpc = self.config.router_mpc.to_lowercase();
        if mpc.is_empty() {
            return Ok(());
        }
        let pending = self.get_pool_nonce(&mpc, NonceTag::Pending).await?;
        self.nonces.init(&mpc, 0, Some(pending)).await;
        Ok(())
    }

    fn router_contract(&self) -> Result<Address, BridgeError> {
        parse_address(&self.config.router_contract).ok_or_else(|| {
            BridgeError::Build(format!(
                "chain {} has invalid router contract",
                self.config.chain_id
            ))
        })
    }

    async fn get_receipt(&self, tx_id: &str) -> Result<TransactionReceipt, BridgeError> {
        let hash = parse_hash(tx_id)?;
        self.provider
            .get_transaction_receipt(hash)
            .await?
            .ok_or(BridgeError::TxNotFound)
    }

    async fn get_block_time(&self, height: u64) -> Result<u64, BridgeError> {
        Ok(self
            .provider
            .get_block(height)
            .await?
            .map(|b| b.timestamp.low_u64())
            .unwrap_or(0))
    }

    /// Decode and check the deposit at `log_index` of a receipt
    pub fn parse_swap_log(
        &self,
        receipt: &TransactionReceipt,
        log_index: u32,
        tx_time: u64,
    ) -> Result<SwapInfo, BridgeError> {
        if receipt.status.map(|s| s.as_u64()) != Some(1) {
            return Err(BridgeError::TxWithWrongReceipt);
        }
        let log = receipt
            .logs
            .get(log_index as usize)
            .ok_or(BridgeError::SwapoutLogNotFound)?;
        if Some(log.address) != parse_address(&self.config.router_contract) {
            return Err(BridgeError::TxWithWrongContract);
        }
        let swap = decode_swap_out(log)?;

        if swap.from_chain_id != U256::from(self.config.chain_id)
            || swap.to_chain_id.is_zero()
            || swap.to_chain_id == swap.from_chain_id
            || swap.to_chain_id > U256::from(u64::MAX)
        {
            return Err(BridgeError::TxWithWrongPath);
        }
        let token = hex_address(swap.token);
        let token_config = self
            .config
            .token_config(&token)
            .ok_or(BridgeError::MissTokenConfig)?;
        if swap.amount.is_zero() {
            return Err(BridgeError::TxWithWrongValue);
        }
        if swap.to.is_zero() {
            return Err(BridgeError::WrongBindAddress);
        }

        Ok(SwapInfo {
            swap_type: SwapType::ErcSwap,
            from_chain_id: self.config.chain_id,
            to_chain_id: swap.to_chain_id.as_u64(),
            tx_id: format!("{:?}", receipt.transaction_hash),
            log_index,
            tx_height: receipt.block_number.map(|n| n.as_u64()).unwrap_or(0),
            tx_time,
            from: hex_address(receipt.from),
            tx_to: receipt.to.map(hex_address).unwrap_or_default(),
            bind: hex_address(swap.to),
            token,
            token_id: token_config.token_id.clone(),
            value: swap.amount,
        })
    }

    /// Gas price for a build, bumped by the replace count
    async fn build_gas_price(&self, args: &BuildTxArgs) -> Result<U256, BridgeError> {
        if let Some(price) = args.extra.gas_price {
            return Ok(price);
        }
        let current = self.provider.get_gas_price().await?;
        let price = self.gas.gas_price(&current);
        Ok(self.gas.replace_gas_price(price, args.extra.replace_num))
    }

    async fn build_nonce(&self, from: &str) -> Result<u64, BridgeError> {
        if self.parallel {
            return Ok(self.nonces.allocate(from).await);
        }
        let pending = self.get_pool_nonce(from, NonceTag::Pending).await?;
        if self.nonces.get(from).await == 0 {
            self.nonces.init(from, 0, Some(pending)).await;
        }
        Ok(self.nonces.adjust(from, pending).await)
    }

    fn typed_tx(
        &self,
        from: Address,
        to: Address,
        input: Vec<u8>,
        nonce: u64,
        gas_price: U256,
        replace_num: u64,
    ) -> TypedTransaction {
        let chain_id = self.config.chain_id;
        match self.provider.gas_price_strategy() {
            GasPriceStrategy::Legacy => TransactionRequest::new()
                .from(from)
                .to(to)
                .data(input)
                .value(U256::zero())
                .nonce(nonce)
                .gas_price(gas_price)
                .chain_id(chain_id)
                .into(),
            GasPriceStrategy::Eip1559 => {
                let tip = self
                    .gas
                    .replace_gas_price(U256::from(BASE_PRIORITY_FEE_WEI), replace_num)
                    .min(gas_price);
                Eip1559TransactionRequest::new()
                    .from(from)
                    .to(to)
                    .data(input)
                    .value(U256::zero())
                    .nonce(nonce)
                    .max_fee_per_gas(gas_price)
                    .max_priority_fee_per_gas(tip)
                    .chain_id(chain_id)
                    .into()
            }
        }
    }
}

#[async_trait]
impl Bridge for EvmBridge {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn is_valid_address(&self, address: &str) -> bool {
        parse_address(address).is_some()
    }

    async fn register_swap(
        &self,
        tx_id: &str,
        args: &RegisterArgs,
    ) -> Vec<Result<SwapInfo, BridgeError>> {
        if args.swap_type != SwapType::ErcSwap {
            return vec![Err(BridgeError::SwapTypeNotSupported(
                args.swap_type.to_string(),
            ))];
        }
        let receipt = match self.get_receipt(tx_id).await {
            Ok(receipt) => receipt,
            Err(e) => return vec![Err(e)],
        };
        let height = receipt.block_number.map(|n| n.as_u64()).unwrap_or(0);
        let tx_time = match self.get_block_time(height).await {
            Ok(time) => time,
            Err(e) => return vec![Err(e)],
        };

        if let Some(log_index) = args.log_index {
            return vec![self.parse_swap_log(&receipt, log_index, tx_time)];
        }

        let topic = super::router::swap_out_topic();
        let results: Vec<_> = receipt
            .logs
            .iter()
            .enumerate()
            .filter(|(_, log)| log.topics.first() == Some(&topic))
            .map(|(idx, _)| self.parse_swap_log(&receipt, idx as u32, tx_time))
            .collect();

        if results.is_empty() {
            return vec![Err(BridgeError::SwapoutLogNotFound)];
        }
        debug!(
            "Registered {} swap(s) from {} on chain {}",
            results.len(),
            tx_id,
            self.config.chain_id
        );
        results
    }

    async fn verify_transaction(
        &self,
        tx_id: &str,
        args: &VerifyArgs,
    ) -> Result<SwapInfo, BridgeError> {
        let receipt = self.get_receipt(tx_id).await?;
        let height = receipt
            .block_number
            .map(|n| n.as_u64())
            .ok_or(BridgeError::TxNotStable)?;

        if !args.allow_unstable {
            let latest = self.provider.get_block_number().await?;
            if confirmations(height, latest) < self.config.required_confirmations() {
                return Err(BridgeError::TxNotStable);
            }
        }

        let tx_time = self.get_block_time(height).await?;
        self.parse_swap_log(&receipt, args.log_index, tx_time)
    }

    async fn build_raw_transaction(&self, args: &mut BuildTxArgs) -> Result<RawTx, BridgeError> {
        if args.swap_type != SwapType::ErcSwap {
            return Err(BridgeError::SwapTypeNotSupported(args.swap_type.to_string()));
        }
        if args.to_chain_id != self.config.chain_id {
            return Err(BridgeError::TxWithWrongPath);
        }
        let token = self
            .config
            .token_address(&args.token_id)
            .and_then(parse_address)
            .ok_or(BridgeError::MissTokenConfig)?;
        let bind = parse_address(&args.bind).ok_or(BridgeError::WrongBindAddress)?;
        let from = parse_address(&args.from)
            .ok_or_else(|| BridgeError::Build(format!("invalid signer {}", args.from)))?;
        let tx_id: H256 = args
            .swap_id
            .parse()
            .map_err(|_| BridgeError::Build(format!("invalid swap id {}", args.swap_id)))?;
        let router = self.router_contract()?;

        let swap_value = args.origin_value;
        let input = encode_swap_in(tx_id, token, bind, swap_value, args.from_chain_id);

        let nonce = match args.extra.nonce {
            Some(nonce) => nonce,
            None => self.build_nonce(&args.from).await?,
        };
        let gas_price = self.build_gas_price(args).await?;
        let mut tx = self.typed_tx(
            from,
            router,
            input.clone(),
            nonce,
            gas_price,
            args.extra.replace_num,
        );

        let gas = match args.extra.gas {
            Some(gas) => gas,
            None => {
                let estimated = self.provider.estimate_gas(&tx).await;
                match estimated {
                    Ok(estimated) => self.gas.gas_limit(estimated),
                    Err(e) => {
                        if self.parallel && args.extra.nonce.is_none() {
                            self.nonces.release(&args.from, nonce).await;
                        }
                        return Err(e);
                    }
                }
            }
        };
        tx.set_gas(gas);

        if args.extra.ttl.is_none() && self.config.reswap_ttl > 0 {
            let latest = self.provider.get_block_number().await?;
            args.extra.ttl = Some(latest + self.config.reswap_ttl);
        }

        args.extra.nonce = Some(nonce);
        args.extra.gas = Some(gas);
        args.extra.gas_price = Some(gas_price);
        args.swap_value = Some(swap_value);
        args.to = hex_address(router);
        args.input = format!("0x{}", hex::encode(&input));

        info!(
            "Built payout for {} on chain {}: nonce {} gas {} price {}",
            args.key(),
            self.config.chain_id,
            nonce,
            gas,
            gas_price
        );
        Ok(RawTx::new(tx))
    }

    async fn mpc_sign_transaction(
        &self,
        raw_tx: &RawTx,
        args: &BuildTxArgs,
    ) -> Result<(SignedTx, String), BridgeError> {
        let tx = raw_tx
            .downcast_ref::<TypedTransaction>()
            .ok_or(BridgeError::WrongRawTx)?;
        let sighash = tx.sighash();
        let context =
            serde_json::to_string(args).map_err(|e| BridgeError::Sign(e.to_string()))?;

        let rsvs = self
            .signer
            .sign(&SignRequest {
                pubkey: self.config.router_mpc_pubkey.clone(),
                msg_hashes: vec![format!("{:?}", sighash)],
                msg_contexts: vec![context],
            })
            .await?;
        let rsv = rsvs
            .first()
            .ok_or_else(|| BridgeError::Sign("empty signature list".to_string()))?;

        let signature = assemble_signature(rsv, self.config.chain_id)?;
        let signer = signature
            .recover(sighash)
            .map_err(|e| BridgeError::Sign(e.to_string()))?;
        if !hex_address(signer).eq_ignore_ascii_case(&args.from) {
            warn!(
                "Signature of {} recovers to {:?}, expected {}",
                args.key(),
                signer,
                args.from
            );
            return Err(BridgeError::SenderMismatch);
        }

        let bytes = tx.rlp_signed(&signature);
        let hash = format!("0x{}", hex::encode(keccak256(&bytes)));
        info!("Signed payout {} for {}", hash, args.key());
        Ok((
            SignedTx {
                bytes: bytes.to_vec(),
            },
            hash,
        ))
    }

    fn verify_msg_hash(&self, raw_tx: &RawTx, msg_hashes: &[String]) -> Result<(), BridgeError> {
        let tx = raw_tx
            .downcast_ref::<TypedTransaction>()
            .ok_or(BridgeError::WrongRawTx)?;
        if msg_hashes.len() != 1 {
            return Err(BridgeError::WrongCountOfMsgHashes);
        }
        let expected = format!("{:?}", tx.sighash());
        if !expected.eq_ignore_ascii_case(&msg_hashes[0]) {
            return Err(BridgeError::MsgHashMismatch);
        }
        Ok(())
    }

    async fn send_transaction(&self, signed_tx: &SignedTx) -> Result<String, BridgeError> {
        let hash = self
            .provider
            .send_raw_transaction(Bytes::from(signed_tx.bytes.clone()))
            .await?;
        Ok(format!("{:?}", hash))
    }

    async fn get_transaction_status(&self, tx_hash: &str) -> Result<TxStatus, BridgeError> {
        let hash = parse_hash(tx_hash)?;
        let Some(receipt) = self.provider.get_transaction_receipt(hash).await? else {
            return match self.provider.get_transaction(hash).await? {
                Some(_) => Ok(TxStatus::default()),
                None => Err(BridgeError::TxNotFound),
            };
        };

        let height = receipt.block_number.map(|n| n.as_u64()).unwrap_or(0);
        if height == 0 {
            return Ok(TxStatus::default());
        }
        let latest = self.provider.get_block_number().await?;
        let block_time = self.get_block_time(height).await.unwrap_or(0);
        Ok(TxStatus {
            block_height: height,
            block_time,
            confirmations: confirmations(height, latest),
            success: receipt.status.map(|s| s.as_u64()) == Some(1),
        })
    }

    async fn get_latest_block_number(&self) -> Result<u64, BridgeError> {
        self.provider.get_block_number().await
    }

    fn nonce_setter(&self) -> Option<&dyn NonceSetter> {
        Some(self)
    }

    fn reswapable(&self) -> Option<&dyn Reswapable> {
        if self.config.is_reswap_capable() {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl NonceSetter for EvmBridge {
    async fn get_pool_nonce(&self, address: &str, tag: NonceTag) -> Result<u64, BridgeError> {
        let account = parse_address(address)
            .ok_or_else(|| BridgeError::Rpc(format!("invalid address {}", address)))?;
        let block = match tag {
            NonceTag::Pending => BlockNumber::Pending,
            NonceTag::Latest => BlockNumber::Latest,
        };
        self.provider.get_transaction_count(account, block).await
    }

    async fn get_swap_nonce(&self, address: &str) -> u64 {
        self.nonces.get(address).await
    }

    async fn adjust_nonce(&self, address: &str, value: u64) -> u64 {
        self.nonces.adjust(address, value).await
    }

    async fn set_nonce(&self, address: &str, value: u64) {
        self.nonces.set(address, value).await
    }

    async fn recycle_swap_nonce(&self, address: &str, nonce: u64) {
        self.nonces.recycle(address, nonce).await
    }

    async fn release_swap_nonce(&self, address: &str, nonce: u64) {
        self.nonces.release(address, nonce).await
    }
}

#[async_trait]
impl Reswapable for EvmBridge {
    async fn get_current_threshold(&self) -> Result<u64, BridgeError> {
        self.provider.get_block_number().await
    }
}
