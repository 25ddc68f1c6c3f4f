//! Transaction submission module with nonce management and gas pricing

mod gas;
mod nonce;
mod sender;

pub use gas::GasEstimator;
pub use nonce::NonceCache;
pub use sender::{find_swap_tx_on_chain, needs_retry, SendPolicy, TransactionSender};
