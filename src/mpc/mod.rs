//! MPC signer service
//!
//! Payouts are signed by a threshold group; every co-signing node votes on
//! each request before the group signature exists.

mod client;
mod local;

pub use client::MpcClient;
pub use local::LocalSigner;

use crate::error::BridgeError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A request to sign message hashes with the group key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignRequest {
    pub pubkey: String,
    pub msg_hashes: Vec<String>,
    /// JSON-encoded build arguments, one per hash
    pub msg_contexts: Vec<String>,
}

/// A sign request started by another node and awaiting our vote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSignRequest {
    pub key_id: String,
    /// MPC account of the initiating node
    pub initiator: String,
    pub pubkey: String,
    pub msg_hashes: Vec<String>,
    pub msg_contexts: Vec<String>,
    pub timestamp: String,
}

/// Outcome of validating a co-sign request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AcceptResult {
    Agree,
    Disagree,
    /// Not ours to vote on; remembered so it is not re-examined
    Ignore,
}

impl AcceptResult {
    pub fn as_str(self) -> &'static str {
        match self {
            AcceptResult::Agree => "AGREE",
            AcceptResult::Disagree => "DISAGREE",
            AcceptResult::Ignore => "IGNORE",
        }
    }
}

impl fmt::Display for AcceptResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vote on a pending sign request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignVote {
    pub key_id: String,
    pub result: AcceptResult,
    pub msg_hashes: Vec<String>,
    pub msg_contexts: Vec<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignerService: Send + Sync {
    /// Sign and wait for the group signature; one 65-byte rsv hex per hash
    async fn sign(&self, request: &SignRequest) -> Result<Vec<String>, BridgeError>;

    async fn poll_pending_sign_requests(&self) -> Result<Vec<PendingSignRequest>, BridgeError>;

    async fn vote(&self, vote: &SignVote) -> Result<(), BridgeError>;
}
