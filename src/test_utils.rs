//! Shared fixtures: an in-process chain double and a wired-up node

use crate::chain::{
    Bridge, BridgeRegistry, NonceSetter, NonceTag, RawTx, RegisterArgs, Reswapable, SignedTx,
};
use crate::config::{
    ApiConfig, ChainConfig, ChainTokenConfig, DatabaseConfig, MetricsConfig, RouterConfig,
    Settings, StoreBackend, TokenConfig, WorkerConfig,
};
use crate::error::BridgeError;
use crate::mpc::{MockSignerService, SignerService};
use crate::store::{MemorySwapStore, SwapStore};
use crate::swap::{
    now, BuildTxArgs, RecordStatus, ResultStatus, SwapInfo, SwapRecord, SwapResult, SwapType,
    TxStatus, VerifyArgs,
};
use crate::worker::{Shutdown, WorkerContext, Workers};

use async_trait::async_trait;
use ethers::signers::LocalWallet;
use ethers::types::U256;
use sha3::{Digest, Keccak256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const SRC_CHAIN: u64 = 1;
pub const DST_CHAIN: u64 = 56;
pub const ROUTER_CONTRACT: &str = "0x1111111111111111111111111111111111111111";
pub const ROUTER_MPC: &str = "0x2222222222222222222222222222222222222222";
pub const TOKEN: &str = "0x3333333333333333333333333333333333333333";
pub const SAMPLE_TX: &str = "0x5a3f00000000000000000000000000000000000000000000000000000000c0de";
/// MPC account of a peer node whose sign requests we vote on
pub const TEST_INITIATOR: &str = "0x00000000000000000000000000000000000000a1";
pub const TEST_ADMIN_KEY: &str =
    "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
pub const TEST_ASSISTANT_KEY: &str =
    "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

const BASE_GAS_PRICE: u64 = 1_000_000_000;

pub fn chain_config(chain_id: u64) -> ChainConfig {
    let mut tokens = HashMap::new();
    tokens.insert(
        TOKEN.to_string(),
        ChainTokenConfig {
            token_id: "USDC".to_string(),
            decimals: 18,
        },
    );
    ChainConfig {
        chain_id,
        name: format!("chain-{}", chain_id),
        rpc_urls: vec!["http://localhost:8545".to_string()],
        router_contract: ROUTER_CONTRACT.to_string(),
        router_mpc: ROUTER_MPC.to_string(),
        confirmations: Some(10),
        max_gas_price_gwei: 500,
        replace_gas_bump_percent: 10,
        tokens,
        enabled: true,
        ..Default::default()
    }
}

fn wallet_address(key: &str) -> String {
    let wallet: LocalWallet = key.parse().unwrap();
    format!("{:?}", ethers::signers::Signer::address(&wallet))
}

pub fn test_settings() -> Settings {
    let worker = WorkerConfig {
        retry_send_tx_loops: 1,
        send_tx_retries: 1,
        send_retry_interval_ms: 0,
        send_retry_loop_interval_ms: 0,
        enable_send_tx_loop: false,
        ..Default::default()
    };
    let mut chains = HashMap::new();
    chains.insert("ethereum".to_string(), chain_config(SRC_CHAIN));
    chains.insert("bsc".to_string(), chain_config(DST_CHAIN));
    Settings {
        router: RouterConfig {
            identifier: "SWAP_ROUTER_TEST".to_string(),
            admins: vec![wallet_address(TEST_ADMIN_KEY)],
            assistants: vec![wallet_address(TEST_ASSISTANT_KEY)],
            initiators: vec![TEST_INITIATOR.to_string()],
            ..Default::default()
        },
        worker,
        blacklist: Default::default(),
        tokens: HashMap::new(),
        chains,
        mpc: Default::default(),
        database: DatabaseConfig {
            backend: StoreBackend::Memory,
            url: String::new(),
            max_connections: 1,
            min_connections: 1,
        },
        api: ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        metrics: MetricsConfig {
            enabled: false,
            port: 0,
        },
    }
}

pub fn sample_record(status: RecordStatus) -> SwapRecord {
    let ts = now();
    SwapRecord {
        from_chain_id: SRC_CHAIN,
        tx_id: SAMPLE_TX.to_string(),
        log_index: 1,
        to_chain_id: DST_CHAIN,
        swap_type: SwapType::ErcSwap,
        from: "0x00000000000000000000000000000000000000f1".to_string(),
        tx_to: ROUTER_CONTRACT.to_string(),
        bind: "0x00000000000000000000000000000000000000b1".to_string(),
        token: TOKEN.to_string(),
        token_id: "USDC".to_string(),
        value: U256::from(500_000_000_000_000_000u64),
        tx_height: 100,
        tx_time: ts as u64,
        status,
        init_time: ts,
        timestamp: ts,
        memo: String::new(),
    }
}

pub fn sample_result(status: ResultStatus) -> SwapResult {
    let mut res = SwapResult::initial(&sample_record(RecordStatus::Processed));
    res.status = status;
    res
}

pub fn sample_build_args(to_chain_id: u64) -> BuildTxArgs {
    let mut record = sample_record(RecordStatus::Processed);
    record.to_chain_id = to_chain_id;
    BuildTxArgs::for_swap("SWAP_ROUTER_TEST", &record, ROUTER_MPC)
}

#[derive(Default)]
struct FakeState {
    latest_block: u64,
    pool_nonce: u64,
    swap_nonces: HashMap<String, u64>,
    swaps: HashMap<(String, u32), Result<SwapInfo, BridgeError>>,
    tx_statuses: HashMap<String, TxStatus>,
    build_failures: VecDeque<BridgeError>,
    sign_failures: VecDeque<BridgeError>,
    send_failures: VecDeque<BridgeError>,
    send_attempts: usize,
    sent: Vec<String>,
    built: Vec<BuildTxArgs>,
    recycled: Vec<u64>,
}

/// Chain double with scriptable deposits, receipts and failures
pub struct FakeBridge {
    config: ChainConfig,
    parallel: bool,
    state: Mutex<FakeState>,
}

impl FakeBridge {
    pub fn new(chain_id: u64) -> Self {
        Self {
            config: chain_config(chain_id),
            parallel: false,
            state: Mutex::new(FakeState {
                pool_nonce: 1,
                ..Default::default()
            }),
        }
    }

    pub fn with_reswap_ttl(mut self, ttl: u64) -> Self {
        self.config.reswap_ttl = ttl;
        self
    }

    pub fn with_parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn set_latest_block(&self, height: u64) {
        self.state().latest_block = height;
    }

    pub fn set_pool_nonce(&self, nonce: u64) {
        self.state().pool_nonce = nonce;
    }

    pub fn add_swap(&self, info: SwapInfo) {
        let key = (info.tx_id.to_lowercase(), info.log_index);
        self.state().swaps.insert(key, Ok(info));
    }

    pub fn set_swap_error(&self, tx_id: &str, log_index: u32, err: BridgeError) {
        let key = (tx_id.to_lowercase(), log_index);
        self.state().swaps.insert(key, Err(err));
    }

    pub fn set_tx_status(&self, tx_hash: &str, status: TxStatus) {
        self.state()
            .tx_statuses
            .insert(tx_hash.to_lowercase(), status);
    }

    pub fn fail_next_sends(&self, errors: Vec<BridgeError>) {
        self.state().send_failures.extend(errors);
    }

    pub fn fail_next_build(&self, err: BridgeError) {
        self.state().build_failures.push_back(err);
    }

    pub fn fail_next_sign(&self, err: BridgeError) {
        self.state().sign_failures.push_back(err);
    }

    pub fn sent_count(&self) -> usize {
        self.state().sent.len()
    }

    pub fn send_attempts(&self) -> usize {
        self.state().send_attempts
    }

    pub fn sent_hashes(&self) -> Vec<String> {
        self.state().sent.clone()
    }

    pub fn built_args(&self) -> Vec<BuildTxArgs> {
        self.state().built.clone()
    }

    pub fn built_nonces(&self) -> Vec<u64> {
        self.state()
            .built
            .iter()
            .filter_map(|a| a.extra.nonce)
            .collect()
    }

    pub fn recycled_nonces(&self) -> Vec<u64> {
        self.state().recycled.clone()
    }

    /// Hash a co-signer would be asked to sign for `raw`
    pub fn msg_hash(&self, raw: &RawTx) -> String {
        let args = raw.downcast_ref::<BuildTxArgs>().unwrap();
        format!("0x{}", hex::encode(sighash(args)))
    }
}

fn sighash(args: &BuildTxArgs) -> [u8; 32] {
    let fields = (
        args.to_chain_id,
        &args.swap_id,
        args.log_index,
        args.bind.to_lowercase(),
        args.origin_value,
        args.extra.nonce,
        args.extra.gas_price,
        args.extra.ttl,
    );
    let encoded = serde_json::to_vec(&fields).unwrap_or_default();
    Keccak256::digest(encoded).into()
}

#[async_trait]
impl Bridge for FakeBridge {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn is_valid_address(&self, address: &str) -> bool {
        address.len() == 42
            && address.starts_with("0x")
            && address[2..].chars().all(|c| c.is_ascii_hexdigit())
    }

    async fn register_swap(
        &self,
        tx_id: &str,
        args: &RegisterArgs,
    ) -> Vec<Result<SwapInfo, BridgeError>> {
        let tx_id = tx_id.to_lowercase();
        let state = self.state();
        let mut found: Vec<_> = state
            .swaps
            .iter()
            .filter(|((tx, index), _)| {
                *tx == tx_id && args.log_index.map_or(true, |wanted| wanted == *index)
            })
            .map(|((_, index), swap)| (*index, swap.clone()))
            .collect();
        if found.is_empty() {
            return vec![Err(BridgeError::TxNotFound)];
        }
        found.sort_by_key(|(index, _)| *index);
        found.into_iter().map(|(_, swap)| swap).collect()
    }

    async fn verify_transaction(
        &self,
        tx_id: &str,
        args: &VerifyArgs,
    ) -> Result<SwapInfo, BridgeError> {
        self.state()
            .swaps
            .get(&(tx_id.to_lowercase(), args.log_index))
            .cloned()
            .unwrap_or(Err(BridgeError::TxNotFound))
    }

    async fn build_raw_transaction(&self, args: &mut BuildTxArgs) -> Result<RawTx, BridgeError> {
        if let Some(err) = self.state().build_failures.pop_front() {
            return Err(err);
        }
        let nonce = match args.extra.nonce {
            Some(nonce) => nonce,
            None if self.parallel => {
                let mut state = self.state();
                let pool = state.pool_nonce;
                let next = state.swap_nonces.entry(args.from.clone()).or_insert(pool);
                let nonce = *next;
                *next += 1;
                nonce
            }
            None => {
                let pool = self.state().pool_nonce;
                self.adjust_nonce(&args.from, pool).await
            }
        };
        let bump = 100 + self.config.replace_gas_bump_percent * args.extra.replace_num;
        let gas_price = args
            .extra
            .gas_price
            .unwrap_or_else(|| U256::from(BASE_GAS_PRICE) * U256::from(bump) / U256::from(100));

        args.extra.nonce = Some(nonce);
        args.extra.gas_price = Some(gas_price);
        args.extra.gas.get_or_insert(90_000);
        if args.extra.ttl.is_none() && self.config.reswap_ttl > 0 {
            args.extra.ttl = Some(self.state().latest_block + self.config.reswap_ttl);
        }
        args.swap_value = Some(args.origin_value);
        args.to = ROUTER_CONTRACT.to_string();
        args.input = format!("0x{}", hex::encode(args.swap_id.as_bytes()));

        self.state().built.push(args.clone());
        Ok(RawTx::new(args.clone()))
    }

    async fn mpc_sign_transaction(
        &self,
        raw_tx: &RawTx,
        _args: &BuildTxArgs,
    ) -> Result<(SignedTx, String), BridgeError> {
        if let Some(err) = self.state().sign_failures.pop_front() {
            return Err(err);
        }
        let built = raw_tx
            .downcast_ref::<BuildTxArgs>()
            .ok_or(BridgeError::WrongRawTx)?;
        let hash = sighash(built);
        Ok((
            SignedTx {
                bytes: hash.to_vec(),
            },
            format!("0x{}", hex::encode(hash)),
        ))
    }

    fn verify_msg_hash(&self, raw_tx: &RawTx, msg_hashes: &[String]) -> Result<(), BridgeError> {
        let [hash] = msg_hashes else {
            return Err(BridgeError::WrongCountOfMsgHashes);
        };
        if self.msg_hash(raw_tx).eq_ignore_ascii_case(hash) {
            Ok(())
        } else {
            Err(BridgeError::MsgHashMismatch)
        }
    }

    async fn send_transaction(&self, signed_tx: &SignedTx) -> Result<String, BridgeError> {
        let mut state = self.state();
        state.send_attempts += 1;
        if let Some(err) = state.send_failures.pop_front() {
            return Err(err);
        }
        let hash = format!("0x{}", hex::encode(&signed_tx.bytes));
        state.sent.push(hash.clone());
        Ok(hash)
    }

    async fn get_transaction_status(&self, tx_hash: &str) -> Result<TxStatus, BridgeError> {
        self.state()
            .tx_statuses
            .get(&tx_hash.to_lowercase())
            .copied()
            .ok_or(BridgeError::TxNotFound)
    }

    async fn get_latest_block_number(&self) -> Result<u64, BridgeError> {
        Ok(self.state().latest_block)
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
impl NonceSetter for FakeBridge {
    async fn get_pool_nonce(&self, _address: &str, _tag: NonceTag) -> Result<u64, BridgeError> {
        Ok(self.state().pool_nonce)
    }

    async fn get_swap_nonce(&self, address: &str) -> u64 {
        self.state()
            .swap_nonces
            .get(&address.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    async fn adjust_nonce(&self, address: &str, value: u64) -> u64 {
        let mut state = self.state();
        let nonce = state.swap_nonces.entry(address.to_lowercase()).or_insert(0);
        *nonce = (*nonce).max(value);
        *nonce
    }

    async fn set_nonce(&self, address: &str, value: u64) {
        self.state()
            .swap_nonces
            .insert(address.to_lowercase(), value);
    }

    async fn recycle_swap_nonce(&self, _address: &str, nonce: u64) {
        self.state().recycled.push(nonce);
    }
}

#[async_trait]
impl Reswapable for FakeBridge {
    async fn get_current_threshold(&self) -> Result<u64, BridgeError> {
        Ok(self.state().latest_block)
    }
}

/// A server node over two fake chains and an in-memory store
pub struct TestHarness {
    pub ctx: WorkerContext,
    pub store: Arc<MemorySwapStore>,
    pub src: Arc<FakeBridge>,
    pub dst: Arc<FakeBridge>,
    pub workers: Workers,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::build(test_settings(), Arc::new(MockSignerService::new()), FakeBridge::new(DST_CHAIN))
    }

    pub fn with_signer(signer: Arc<dyn SignerService>) -> Self {
        Self::build(test_settings(), signer, FakeBridge::new(DST_CHAIN))
    }

    /// Hold swaps of the sample token above `threshold` whole units
    pub fn with_big_value_threshold(threshold: u64) -> Self {
        let mut settings = test_settings();
        settings.tokens.insert(
            "USDC".to_string(),
            TokenConfig {
                big_value_threshold: threshold,
                big_value_whitelist: Vec::new(),
            },
        );
        Self::build(settings, Arc::new(MockSignerService::new()), FakeBridge::new(DST_CHAIN))
    }

    /// Destination chain supports reswap with the given TTL
    pub fn with_reswap_ttl(ttl: u64) -> Self {
        Self::build(
            test_settings(),
            Arc::new(MockSignerService::new()),
            FakeBridge::new(DST_CHAIN).with_reswap_ttl(ttl),
        )
    }

    /// Nonces are reserved at build time and payouts signed off the queue
    pub fn with_parallel_swap() -> Self {
        let mut settings = test_settings();
        settings.router.parallel_swap = true;
        Self::build(
            settings,
            Arc::new(MockSignerService::new()),
            FakeBridge::new(DST_CHAIN).with_parallel(),
        )
    }

    pub fn with_max_replace_count(count: usize) -> Self {
        let mut settings = test_settings();
        settings.worker.max_replace_count = count;
        Self::build(settings, Arc::new(MockSignerService::new()), FakeBridge::new(DST_CHAIN))
    }

    fn build(settings: Settings, signer: Arc<dyn SignerService>, dst: FakeBridge) -> Self {
        let store = Arc::new(MemorySwapStore::new());
        let src = Arc::new(FakeBridge::new(SRC_CHAIN));
        let dst = Arc::new(dst);
        let registry = Arc::new(BridgeRegistry::new());
        registry.insert(src.clone());
        registry.insert(dst.clone());

        let ctx = WorkerContext::new(
            Arc::new(settings),
            registry,
            store.clone(),
            signer,
            Shutdown::new(),
        );
        let workers = Workers::new(ctx.clone());
        Self {
            ctx,
            store,
            src,
            dst,
            workers,
        }
    }

    /// Same store and chains, fresh in-process state
    pub fn restart(&self) -> Self {
        let ctx = WorkerContext::new(
            self.ctx.settings.clone(),
            self.ctx.registry.clone(),
            self.store.clone(),
            self.ctx.signer.clone(),
            Shutdown::new(),
        );
        Self {
            workers: Workers::new(ctx.clone()),
            ctx,
            store: self.store.clone(),
            src: self.src.clone(),
            dst: self.dst.clone(),
        }
    }

    /// A verified swap with its empty result, ready for dispatch
    pub async fn swappable_record(&self) -> SwapRecord {
        let record = sample_record(RecordStatus::Swappable);
        self.src.add_swap(record.to_swap_info());
        self.store.put_swap(record.clone()).await;
        self.store
            .add_initial_result(&SwapResult::initial(&record))
            .await
            .unwrap();
        record
    }

    async fn processed_record(&self) {
        let record = sample_record(RecordStatus::Processed);
        self.src.add_swap(record.to_swap_info());
        self.store.put_swap(record).await;
    }

    /// A payout sent as `swap_tx` and not yet mined
    pub async fn sent_result(&self, swap_tx: &str, nonce: u64) -> SwapResult {
        self.processed_record().await;
        let mut res = sample_result(ResultStatus::NotStable);
        res.swap_tx = swap_tx.to_string();
        res.swap_nonce = nonce;
        res.mpc = ROUTER_MPC.to_lowercase();
        self.store.put_result(res.clone()).await;
        res
    }

    /// A payout whose TTL expired
    pub async fn need_reswap_result(&self, swap_tx: &str, nonce: u64) -> SwapResult {
        self.processed_record().await;
        let mut res = sample_result(ResultStatus::NeedReswap);
        res.swap_tx = swap_tx.to_string();
        res.swap_nonce = nonce;
        res.mpc = ROUTER_MPC.to_lowercase();
        res.ttl = 100;
        self.store.put_result(res.clone()).await;
        res
    }
}
