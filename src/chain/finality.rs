//! Confirmation depth for different L1/L2 networks
//!
//! Different chains have different finality models:
//! - Ethereum: Probabilistic (32 blocks for practical finality, ~6 min)
//! - Polygon: Probabilistic (128 blocks)
//! - Arbitrum/Optimism/Base: soft finality from the sequencer
//! - Avalanche: Instant finality (1 block)
//!
//! A chain's `confirmations` setting overrides the recommendation.

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 5 => 12,
        // BNB chain
        56 | 97 => 15,
        // Polygon mainnet
        137 => 128,
        // Polygon testnets
        80001 | 80002 => 32,
        // Arbitrum
        42161 | 421614 => 64,
        // Optimism
        10 | 11155420 => 64,
        // Base
        8453 | 84532 => 64,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Local dev chains
        1337 | 31337 => 1,
        // Default conservative
        _ => 64,
    }
}

/// Confirmations of a tx mined at `tx_block` when the tip is `latest`
///
/// The mined block itself counts as the first confirmation.
pub fn confirmations(tx_block: u64, latest: u64) -> u64 {
    if tx_block == 0 || latest < tx_block {
        return 0;
    }
    latest - tx_block + 1
}

/// Whether a source tx at `tx_height` can be verified given the cached tip
///
/// An unknown height or tip never blocks verification; the adapter decides.
pub fn is_deep_enough(tx_height: u64, required: u64, latest: u64) -> bool {
    if tx_height == 0 || latest == 0 {
        return true;
    }
    tx_height + required <= latest
}
