//! Single-key signer for development deployments
//!
//! Signs with a local wallet instead of an MPC group. There are no peers,
//! so there is nothing to poll or vote on.

use super::{PendingSignRequest, SignRequest, SignVote, SignerService};
use crate::error::BridgeError;

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256};
use tracing::{info, warn};

/// Signer holding the full key locally
pub struct LocalSigner {
    wallet: LocalWallet,
}

impl LocalSigner {
    /// Load the key from `SWAP_ROUTER_PRIVATE_KEY`
    pub fn from_env() -> Result<Self, BridgeError> {
        let key = std::env::var("SWAP_ROUTER_PRIVATE_KEY").map_err(|_| {
            BridgeError::Sign(
                "No signer configured. Enable [mpc] or set SWAP_ROUTER_PRIVATE_KEY".to_string(),
            )
        })?;
        let wallet = key
            .parse::<LocalWallet>()
            .map_err(|e| BridgeError::Sign(format!("Invalid private key: {}", e)))?;
        warn!("Using local single-key signer {:?}", wallet.address());
        Ok(Self::new(wallet))
    }

    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }
}

#[async_trait]
impl SignerService for LocalSigner {
    async fn sign(&self, request: &SignRequest) -> Result<Vec<String>, BridgeError> {
        let mut rsvs = Vec::with_capacity(request.msg_hashes.len());
        for msg_hash in &request.msg_hashes {
            let digest: H256 = msg_hash
                .parse()
                .map_err(|_| BridgeError::Sign(format!("bad message hash {}", msg_hash)))?;
            let sig = self
                .wallet
                .sign_hash(digest)
                .map_err(|e| BridgeError::Sign(e.to_string()))?;

            let mut rsv = [0u8; 65];
            sig.r.to_big_endian(&mut rsv[..32]);
            sig.s.to_big_endian(&mut rsv[32..64]);
            rsv[64] = (sig.v.saturating_sub(27)) as u8;
            rsvs.push(hex::encode(rsv));
        }
        info!("Locally signed {} message hash(es)", rsvs.len());
        Ok(rsvs)
    }

    async fn poll_pending_sign_requests(&self) -> Result<Vec<PendingSignRequest>, BridgeError> {
        Ok(Vec::new())
    }

    async fn vote(&self, _vote: &SignVote) -> Result<(), BridgeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Signature;

    #[tokio::test]
    async fn test_rsv_recovers_to_wallet() {
        let wallet: LocalWallet =
            "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
                .parse()
                .unwrap();
        let signer = LocalSigner::new(wallet);
        let digest = H256::repeat_byte(7);

        let rsvs = signer
            .sign(&SignRequest {
                pubkey: String::new(),
                msg_hashes: vec![format!("{:?}", digest)],
                msg_contexts: vec!["{}".into()],
            })
            .await
            .unwrap();

        let bytes = hex::decode(&rsvs[0]).unwrap();
        assert_eq!(bytes.len(), 65);
        let mut sig_bytes = bytes.clone();
        sig_bytes[64] += 27;
        let sig = Signature::try_from(sig_bytes.as_slice()).unwrap();
        assert_eq!(sig.recover(digest).unwrap(), signer.address());
    }
}
