//! Error types for the swap router
//!
//! Adapter outcomes are a closed set (`BridgeError`) that engines classify
//! into transient, terminal, infrastructure or disagreement buckets instead
//! of comparing against sentinel values.

use thiserror::Error;

/// Outcome of a per-chain adapter call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("tx not stable")]
    TxNotStable,

    #[error("tx not found")]
    TxNotFound,

    #[error("rpc query error: {0}")]
    Rpc(String),

    #[error("tx with wrong value")]
    TxWithWrongValue,

    #[error("tx with wrong path")]
    TxWithWrongPath,

    #[error("miss token config")]
    MissTokenConfig,

    #[error("no underlying token")]
    NoUnderlyingToken,

    #[error("maybe unsafe tx")]
    VerifyTxUnsafe,

    #[error("tx with wrong contract")]
    TxWithWrongContract,

    #[error("swap is in black list")]
    SwapInBlacklist,

    #[error("wrong bind address")]
    WrongBindAddress,

    #[error("swap type not supported: {0}")]
    SwapTypeNotSupported(String),

    #[error("swapout log not found or removed")]
    SwapoutLogNotFound,

    #[error("tx with wrong receipt")]
    TxWithWrongReceipt,

    #[error("estimate gas failed: {0}")]
    EstimateGasFailed(String),

    #[error("message hash mismatch")]
    MsgHashMismatch,

    #[error("wrong count of message hashes")]
    WrongCountOfMsgHashes,

    #[error("wrong raw tx")]
    WrongRawTx,

    #[error("sender mismatch")]
    SenderMismatch,

    #[error("reswap not supported")]
    ReswapNotSupported,

    #[error("mpc sign status has disagree")]
    SignDisagree,

    #[error("mpc sign failed: {0}")]
    Sign(String),

    #[error("send tx failed: {0}")]
    Send(String),

    #[error("build tx failed: {0}")]
    Build(String),
}

/// How an engine should react to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry silently on the next poll, no state change
    Transient,
    /// Record a final status with the error text as memo
    Terminal,
    /// Skip the task this cycle, retry next cycle
    Infrastructure,
    /// MPC co-signers refused; re-verify the source transaction
    Disagreement,
}

impl BridgeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BridgeError::TxNotStable | BridgeError::TxNotFound | BridgeError::Rpc(_) => {
                ErrorClass::Transient
            }
            BridgeError::SignDisagree => ErrorClass::Disagreement,
            BridgeError::Sign(_) | BridgeError::Send(_) | BridgeError::Build(_) => {
                ErrorClass::Infrastructure
            }
            BridgeError::TxWithWrongValue
            | BridgeError::TxWithWrongPath
            | BridgeError::MissTokenConfig
            | BridgeError::NoUnderlyingToken
            | BridgeError::VerifyTxUnsafe
            | BridgeError::TxWithWrongContract
            | BridgeError::SwapInBlacklist
            | BridgeError::WrongBindAddress
            | BridgeError::SwapTypeNotSupported(_)
            | BridgeError::SwapoutLogNotFound
            | BridgeError::TxWithWrongReceipt
            | BridgeError::EstimateGasFailed(_)
            | BridgeError::MsgHashMismatch
            | BridgeError::WrongCountOfMsgHashes
            | BridgeError::WrongRawTx
            | BridgeError::SenderMismatch
            | BridgeError::ReswapNotSupported => ErrorClass::Terminal,
        }
    }
}

/// Tagged result of an adapter call, branched on exhaustively by the engines
#[derive(Debug)]
pub enum Classified<T> {
    Ok(T),
    Transient(BridgeError),
    Terminal(BridgeError),
    Disagreement(BridgeError),
}

impl<T> From<Result<T, BridgeError>> for Classified<T> {
    fn from(result: Result<T, BridgeError>) -> Self {
        match result {
            Ok(value) => Classified::Ok(value),
            Err(e) => match e.class() {
                ErrorClass::Transient => Classified::Transient(e),
                ErrorClass::Disagreement => Classified::Disagreement(e),
                // build/sign/send hiccups are not verdicts on the swap itself
                ErrorClass::Infrastructure => Classified::Transient(e),
                ErrorClass::Terminal => Classified::Terminal(e),
            },
        }
    }
}

/// Main error type for the router
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("no bridge for chain id {chain_id}")]
    ChainNotFound { chain_id: u64 },

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("swap {key} not found")]
    SwapNotFound { key: String },

    #[error("swap result {key} not found")]
    ResultNotFound { key: String },

    #[error("swap result {key} already exists")]
    ResultExists { key: String },

    #[error("already swapped")]
    AlreadySwapped,

    #[error("swap nonce ({nonce}) is lower than latest nonce ({latest})")]
    NoncePassed { nonce: u64, latest: u64 },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Admin(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RouterError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RouterError::Bridge(e) => e.class(),
            RouterError::Database(_)
            | RouterError::Store(_)
            | RouterError::ChainNotFound { .. }
            | RouterError::Signer(_)
            | RouterError::Internal(_) => ErrorClass::Infrastructure,
            _ => ErrorClass::Terminal,
        }
    }

    /// Check if error is retryable on the next poll
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient | ErrorClass::Infrastructure
        )
    }

    /// Errors that are expected control flow and should not be logged as failures
    pub fn is_quiet(&self) -> bool {
        matches!(
            self,
            RouterError::AlreadySwapped | RouterError::ChainNotFound { .. }
        )
    }
}

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;
