//! Swap records, results and the status machines they move through
//!
//! A swap is keyed by `(from_chain_id, tx_id, log_index)`. The `SwapRecord`
//! is the audit row written when a deposit is detected; the `SwapResult` is
//! created exactly once when the swap becomes payable and caches what the
//! destination chain says about the payout.

use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current unix time in seconds
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Unique identity of one logical swap
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwapKey {
    pub from_chain_id: u64,
    pub tx_id: String,
    pub log_index: u32,
}

impl SwapKey {
    pub fn new(from_chain_id: u64, tx_id: impl AsRef<str>, log_index: u32) -> Self {
        Self {
            from_chain_id,
            tx_id: tx_id.as_ref().to_lowercase(),
            log_index,
        }
    }
}

impl fmt::Display for SwapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.from_chain_id, self.tx_id, self.log_index)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapType {
    #[default]
    ErcSwap,
    NftSwap,
    AnyCallSwap,
}

impl SwapType {
    pub fn code(self) -> i32 {
        match self {
            SwapType::ErcSwap => 1,
            SwapType::NftSwap => 2,
            SwapType::AnyCallSwap => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(SwapType::ErcSwap),
            2 => Some(SwapType::NftSwap),
            3 => Some(SwapType::AnyCallSwap),
            _ => None,
        }
    }
}

impl fmt::Display for SwapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SwapType::ErcSwap => "erc_swap",
            SwapType::NftSwap => "nft_swap",
            SwapType::AnyCallSwap => "any_call_swap",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a detected deposit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Detected,
    VerifyFailed,
    WrongValue,
    Swappable,
    Processed,
    BigValue,
    InBlacklist,
    ManualMakeFail,
    WrongPath,
    MissTokenConfig,
    NoUnderlyingToken,
    VerifyTxUnsafe,
    EstimateGasFailed,
}

impl RecordStatus {
    pub const ALL: [RecordStatus; 13] = [
        RecordStatus::Detected,
        RecordStatus::VerifyFailed,
        RecordStatus::WrongValue,
        RecordStatus::Swappable,
        RecordStatus::Processed,
        RecordStatus::BigValue,
        RecordStatus::InBlacklist,
        RecordStatus::ManualMakeFail,
        RecordStatus::WrongPath,
        RecordStatus::MissTokenConfig,
        RecordStatus::NoUnderlyingToken,
        RecordStatus::VerifyTxUnsafe,
        RecordStatus::EstimateGasFailed,
    ];

    /// Stable numeric code used by the persistent store
    pub fn code(self) -> i32 {
        match self {
            RecordStatus::Detected => 0,
            RecordStatus::VerifyFailed => 1,
            RecordStatus::WrongValue => 3,
            RecordStatus::Swappable => 5,
            RecordStatus::Processed => 7,
            RecordStatus::BigValue => 12,
            RecordStatus::InBlacklist => 15,
            RecordStatus::ManualMakeFail => 16,
            RecordStatus::WrongPath => 19,
            RecordStatus::MissTokenConfig => 20,
            RecordStatus::NoUnderlyingToken => 21,
            RecordStatus::VerifyTxUnsafe => 22,
            RecordStatus::EstimateGasFailed => 127,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Detected => "detected",
            RecordStatus::VerifyFailed => "verify_failed",
            RecordStatus::WrongValue => "wrong_value",
            RecordStatus::Swappable => "swappable",
            RecordStatus::Processed => "processed",
            RecordStatus::BigValue => "big_value",
            RecordStatus::InBlacklist => "in_blacklist",
            RecordStatus::ManualMakeFail => "manual_make_fail",
            RecordStatus::WrongPath => "wrong_path",
            RecordStatus::MissTokenConfig => "miss_token_config",
            RecordStatus::NoUnderlyingToken => "no_underlying_token",
            RecordStatus::VerifyTxUnsafe => "verify_tx_unsafe",
            RecordStatus::EstimateGasFailed => "estimate_gas_failed",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a payout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Empty,
    NotStable,
    Stable,
    Failed,
    NeedReswap,
    Reswapping,
    EstimateGasFailed,
    ManualMakeFail,
    VerifyFailed,
    InBlacklist,
}

impl ResultStatus {
    pub const ALL: [ResultStatus; 10] = [
        ResultStatus::Empty,
        ResultStatus::NotStable,
        ResultStatus::Stable,
        ResultStatus::Failed,
        ResultStatus::NeedReswap,
        ResultStatus::Reswapping,
        ResultStatus::EstimateGasFailed,
        ResultStatus::ManualMakeFail,
        ResultStatus::VerifyFailed,
        ResultStatus::InBlacklist,
    ];

    pub fn code(self) -> i32 {
        match self {
            ResultStatus::VerifyFailed => 1,
            ResultStatus::Empty => 8,
            ResultStatus::NotStable => 9,
            ResultStatus::Stable => 10,
            ResultStatus::Failed => 14,
            ResultStatus::InBlacklist => 15,
            ResultStatus::ManualMakeFail => 16,
            ResultStatus::NeedReswap => 18,
            ResultStatus::EstimateGasFailed => 127,
            ResultStatus::Reswapping => 256,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Empty => "empty",
            ResultStatus::NotStable => "not_stable",
            ResultStatus::Stable => "stable",
            ResultStatus::Failed => "failed",
            ResultStatus::NeedReswap => "need_reswap",
            ResultStatus::Reswapping => "reswapping",
            ResultStatus::EstimateGasFailed => "estimate_gas_failed",
            ResultStatus::ManualMakeFail => "manual_make_fail",
            ResultStatus::VerifyFailed => "verify_failed",
            ResultStatus::InBlacklist => "in_blacklist",
        }
    }

    /// No engine moves a result out of these states
    pub fn is_final(self) -> bool {
        matches!(
            self,
            ResultStatus::Stable
                | ResultStatus::Failed
                | ResultStatus::EstimateGasFailed
                | ResultStatus::ManualMakeFail
                | ResultStatus::VerifyFailed
                | ResultStatus::InBlacklist
        )
    }

    /// Transitions the engines may perform without an admin override
    ///
    /// `Empty -> NotStable -> {Stable | Failed | NeedReswap -> Reswapping -> NotStable}`,
    /// plus terminal markings from any non-final state. `NotStable` and
    /// `Reswapping` may be rewritten in place (field updates, stale pickup).
    pub fn can_transition_to(self, next: ResultStatus) -> bool {
        use ResultStatus::*;

        match (self, next) {
            (NotStable, NotStable) | (Reswapping, Reswapping) => true,
            (Empty, NotStable) => true,
            (NotStable, Stable | Failed | NeedReswap) => true,
            (NeedReswap, Reswapping) => true,
            (Reswapping, NotStable) => true,
            (
                Empty | NotStable | NeedReswap | Reswapping,
                EstimateGasFailed | ManualMakeFail | VerifyFailed | InBlacklist,
            ) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical swap decoded from a source transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapInfo {
    pub swap_type: SwapType,
    pub from_chain_id: u64,
    pub to_chain_id: u64,
    pub tx_id: String,
    pub log_index: u32,
    pub tx_height: u64,
    pub tx_time: u64,
    /// Sender of the source transaction
    pub from: String,
    /// Contract the source transaction called
    pub tx_to: String,
    /// Receiver on the destination chain
    pub bind: String,
    /// Token address on the source chain
    pub token: String,
    pub token_id: String,
    pub value: U256,
}

impl SwapInfo {
    pub fn key(&self) -> SwapKey {
        SwapKey::new(self.from_chain_id, &self.tx_id, self.log_index)
    }
}

/// Audit row for a detected deposit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapRecord {
    pub from_chain_id: u64,
    pub tx_id: String,
    pub log_index: u32,
    pub to_chain_id: u64,
    pub swap_type: SwapType,
    pub from: String,
    pub tx_to: String,
    pub bind: String,
    pub token: String,
    pub token_id: String,
    pub value: U256,
    pub tx_height: u64,
    pub tx_time: u64,
    pub status: RecordStatus,
    pub init_time: i64,
    pub timestamp: i64,
    pub memo: String,
}

impl SwapRecord {
    pub fn from_info(info: &SwapInfo, status: RecordStatus) -> Self {
        let ts = now();
        Self {
            from_chain_id: info.from_chain_id,
            tx_id: info.tx_id.to_lowercase(),
            log_index: info.log_index,
            to_chain_id: info.to_chain_id,
            swap_type: info.swap_type,
            from: info.from.to_lowercase(),
            tx_to: info.tx_to.to_lowercase(),
            bind: info.bind.clone(),
            token: info.token.to_lowercase(),
            token_id: info.token_id.clone(),
            value: info.value,
            tx_height: info.tx_height,
            tx_time: info.tx_time,
            status,
            init_time: ts,
            timestamp: ts,
            memo: String::new(),
        }
    }

    pub fn key(&self) -> SwapKey {
        SwapKey::new(self.from_chain_id, &self.tx_id, self.log_index)
    }

    pub fn to_swap_info(&self) -> SwapInfo {
        SwapInfo {
            swap_type: self.swap_type,
            from_chain_id: self.from_chain_id,
            to_chain_id: self.to_chain_id,
            tx_id: self.tx_id.clone(),
            log_index: self.log_index,
            tx_height: self.tx_height,
            tx_time: self.tx_time,
            from: self.from.clone(),
            tx_to: self.tx_to.clone(),
            bind: self.bind.clone(),
            token: self.token.clone(),
            token_id: self.token_id.clone(),
            value: self.value,
        }
    }
}

/// Payout state for a swap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapResult {
    pub from_chain_id: u64,
    pub tx_id: String,
    pub log_index: u32,
    pub to_chain_id: u64,
    pub swap_type: SwapType,
    pub from: String,
    pub bind: String,
    pub token_id: String,
    pub value: U256,
    pub swap_tx: String,
    pub swap_nonce: u64,
    pub swap_height: u64,
    pub swap_time: u64,
    pub swap_value: String,
    /// Every hash this payout was ever sent under, oldest first
    pub old_swap_txs: Vec<String>,
    pub status: ResultStatus,
    /// Signer of the payout
    pub mpc: String,
    /// Reswap TTL captured at build time, 0 if unused
    pub ttl: u64,
    pub proof: Option<String>,
    pub init_time: i64,
    pub timestamp: i64,
    pub memo: String,
}

impl SwapResult {
    /// Fresh `Empty` result for a record that just became payable
    pub fn initial(record: &SwapRecord) -> Self {
        let ts = now();
        Self {
            from_chain_id: record.from_chain_id,
            tx_id: record.tx_id.clone(),
            log_index: record.log_index,
            to_chain_id: record.to_chain_id,
            swap_type: record.swap_type,
            from: record.from.clone(),
            bind: record.bind.clone(),
            token_id: record.token_id.clone(),
            value: record.value,
            swap_tx: String::new(),
            swap_nonce: 0,
            swap_height: 0,
            swap_time: 0,
            swap_value: String::new(),
            old_swap_txs: Vec::new(),
            status: ResultStatus::Empty,
            mpc: String::new(),
            ttl: 0,
            proof: None,
            init_time: ts,
            timestamp: ts,
            memo: String::new(),
        }
    }

    pub fn key(&self) -> SwapKey {
        SwapKey::new(self.from_chain_id, &self.tx_id, self.log_index)
    }

    /// Whether anything suggests a payout was already attempted
    pub fn has_payout(&self) -> bool {
        self.swap_nonce > 0
            || self.status != ResultStatus::Empty
            || !self.swap_tx.is_empty()
            || self.swap_height != 0
            || !self.old_swap_txs.is_empty()
    }

    /// Hashes to look up on chain, current first, without duplicates
    pub fn candidate_txs(&self) -> Vec<String> {
        let mut txs = Vec::with_capacity(self.old_swap_txs.len() + 1);
        if !self.swap_tx.is_empty() {
            txs.push(self.swap_tx.clone());
        }
        for tx in &self.old_swap_txs {
            if !tx.is_empty() && !txs.iter().any(|t: &String| t.eq_ignore_ascii_case(tx)) {
                txs.push(tx.clone());
            }
        }
        txs
    }
}

/// Partial update applied to a `SwapResult`; `None` fields are kept
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwapResultUpdate {
    pub status: Option<ResultStatus>,
    pub swap_tx: Option<String>,
    pub swap_nonce: Option<u64>,
    pub swap_height: Option<u64>,
    pub swap_time: Option<u64>,
    pub swap_value: Option<String>,
    pub mpc: Option<String>,
    pub ttl: Option<u64>,
    pub memo: Option<String>,
}

/// Gas, nonce and sequence overrides threaded through one build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<U256>,
    #[serde(default)]
    pub replace_num: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

/// Everything an adapter needs to build one payout; never persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTxArgs {
    pub identifier: String,
    pub swap_id: String,
    pub swap_type: SwapType,
    pub log_index: u32,
    pub from_chain_id: u64,
    pub to_chain_id: u64,
    pub bind: String,
    pub token_id: String,
    /// Signer on the destination chain
    pub from: String,
    pub origin_from: String,
    pub origin_tx_to: String,
    pub origin_value: U256,
    /// Filled by the adapter during build
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_value: Option<U256>,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub extra: ExtraArgs,
}

impl BuildTxArgs {
    /// Arguments for paying out `swap` from `signer`
    pub fn for_swap(identifier: &str, swap: &SwapRecord, signer: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            swap_id: swap.tx_id.clone(),
            swap_type: swap.swap_type,
            log_index: swap.log_index,
            from_chain_id: swap.from_chain_id,
            to_chain_id: swap.to_chain_id,
            bind: swap.bind.clone(),
            token_id: swap.token_id.clone(),
            from: signer.to_lowercase(),
            origin_from: swap.from.clone(),
            origin_tx_to: swap.tx_to.clone(),
            origin_value: swap.value,
            swap_value: None,
            to: String::new(),
            input: String::new(),
            extra: ExtraArgs::default(),
        }
    }

    pub fn key(&self) -> SwapKey {
        SwapKey::new(self.from_chain_id, &self.swap_id, self.log_index)
    }
}

/// Options for re-validating a source transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyArgs {
    pub log_index: u32,
    pub allow_unstable: bool,
}

/// What the destination chain says about a payout hash
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStatus {
    /// 0 while the tx sits in the pool
    pub block_height: u64,
    pub block_time: u64,
    pub confirmations: u64,
    pub success: bool,
}
