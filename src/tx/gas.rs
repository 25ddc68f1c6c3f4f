//! Gas estimation and replacement pricing

use crate::chain::GasPrice;

use ethers::types::U256;
use tracing::debug;

/// Gas estimator for payouts
#[derive(Debug, Clone)]
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
    /// Extra percent per replace attempt
    replace_bump_percent: u64,
    /// Cap in wei, zero disables it
    max_gas_price: U256,
}

impl GasEstimator {
    /// Create a new gas estimator
    pub fn new(replace_bump_percent: u64, max_gas_price_gwei: u64) -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
            replace_bump_percent,
            max_gas_price: U256::from(max_gas_price_gwei) * U256::exp10(9),
        }
    }

    /// Default gas limit when estimation is skipped
    pub fn default_gas_limit(&self) -> u64 {
        let base_gas = 90_000u64;
        base_gas + base_gas * self.gas_limit_buffer_percent / 100
    }

    /// Add the safety buffer to an estimate
    pub fn gas_limit(&self, estimated: U256) -> u64 {
        let buffered = estimated + estimated * self.gas_limit_buffer_percent / 100;
        buffered.min(U256::from(u64::MAX)).as_u64()
    }

    /// Buffered gas price for a first attempt
    pub fn gas_price(&self, current: &GasPrice) -> U256 {
        let price = current.effective();
        let buffered = price + price * self.gas_price_buffer_percent / 100;
        self.cap(buffered)
    }

    /// Price for the `replace_num`-th replacement of a stuck payout
    ///
    /// Nodes must agree on this value, so it depends only on its inputs.
    pub fn replace_gas_price(&self, base: U256, replace_num: u64) -> U256 {
        if replace_num == 0 {
            return self.cap(base);
        }
        let percent = 100 + self.replace_bump_percent * replace_num;
        let bumped = base * percent / 100;
        debug!(
            "Replace #{} bumps gas price {} -> {}",
            replace_num, base, bumped
        );
        self.cap(bumped)
    }

    fn cap(&self, price: U256) -> U256 {
        if self.max_gas_price.is_zero() {
            price
        } else {
            price.min(self.max_gas_price)
        }
    }
}
