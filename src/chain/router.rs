//! Router contract ABI: the deposit event and the payout call

use crate::error::BridgeError;

use alloy_primitives::{Address as AlloyAddress, B256, U256 as AlloyU256};
use alloy_sol_types::{sol, SolCall, SolEvent};
use ethers::types::{Address, Log, H256, U256};

sol! {
    event LogAnySwapOut(
        address indexed token,
        address indexed from,
        address indexed to,
        uint256 amount,
        uint256 fromChainID,
        uint256 toChainID
    );

    function anySwapIn(
        bytes32 txs,
        address token,
        address to,
        uint256 amount,
        uint256 fromChainID
    );
}

/// Topic of `LogAnySwapOut`
pub fn swap_out_topic() -> H256 {
    H256::from(LogAnySwapOut::SIGNATURE_HASH.0)
}

/// A decoded deposit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapOut {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub from_chain_id: U256,
    pub to_chain_id: U256,
}

fn to_ethers_u256(v: AlloyU256) -> U256 {
    U256::from_big_endian(&v.to_be_bytes::<32>())
}

fn to_alloy_u256(v: U256) -> AlloyU256 {
    let mut buf = [0u8; 32];
    v.to_big_endian(&mut buf);
    AlloyU256::from_be_bytes(buf)
}

fn to_ethers_address(a: AlloyAddress) -> Address {
    Address::from_slice(a.as_slice())
}

fn to_alloy_address(a: Address) -> AlloyAddress {
    AlloyAddress::from_slice(a.as_bytes())
}

/// Decode a receipt log as `LogAnySwapOut`
pub fn decode_swap_out(log: &Log) -> Result<SwapOut, BridgeError> {
    if log.topics.first() != Some(&swap_out_topic()) {
        return Err(BridgeError::SwapoutLogNotFound);
    }
    if log.removed == Some(true) {
        return Err(BridgeError::SwapoutLogNotFound);
    }
    let topics = log.topics.iter().map(|t| B256::from(t.0));
    let event = LogAnySwapOut::decode_raw_log(topics, &log.data, true)
        .map_err(|_| BridgeError::SwapoutLogNotFound)?;

    Ok(SwapOut {
        token: to_ethers_address(event.token),
        from: to_ethers_address(event.from),
        to: to_ethers_address(event.to),
        amount: to_ethers_u256(event.amount),
        from_chain_id: to_ethers_u256(event.fromChainID),
        to_chain_id: to_ethers_u256(event.toChainID),
    })
}

/// Calldata of `anySwapIn`
pub fn encode_swap_in(
    tx_id: H256,
    token: Address,
    to: Address,
    amount: U256,
    from_chain_id: u64,
) -> Vec<u8> {
    anySwapInCall {
        txs: B256::from(tx_id.0),
        token: to_alloy_address(token),
        to: to_alloy_address(to),
        amount: to_alloy_u256(amount),
        fromChainID: AlloyU256::from(from_chain_id),
    }
    .abi_encode()
}

/// Selector of `anySwapIn`
pub fn swap_in_selector() -> [u8; 4] {
    anySwapInCall::SELECTOR
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Bytes;

    fn topic_of(addr: Address) -> H256 {
        H256::from(addr)
    }

    #[test]
    fn test_constants() {
        assert_eq!(
            format!("{:?}", swap_out_topic()),
            "0x97116cf6cd4f6412bb47914d6db18da9e16ab2142f543b86e207c24fbd16b23a"
        );
        assert_eq!(swap_in_selector(), [0x82, 0x5b, 0xb1, 0x3c]);
    }

    #[test]
    fn test_decode_swap_out() {
        let token = Address::repeat_byte(0x11);
        let from = Address::repeat_byte(0x22);
        let to = Address::repeat_byte(0x33);
        let mut data = vec![0u8; 96];
        U256::from(1_000u64).to_big_endian(&mut data[0..32]);
        U256::from(1u64).to_big_endian(&mut data[32..64]);
        U256::from(56u64).to_big_endian(&mut data[64..96]);

        let log = Log {
            topics: vec![swap_out_topic(), topic_of(token), topic_of(from), topic_of(to)],
            data: Bytes::from(data),
            ..Default::default()
        };
        let swap = decode_swap_out(&log).unwrap();
        assert_eq!(swap.token, token);
        assert_eq!(swap.to, to);
        assert_eq!(swap.amount, U256::from(1_000u64));
        assert_eq!(swap.to_chain_id, U256::from(56u64));

        let other = Log {
            topics: vec![H256::zero()],
            ..Default::default()
        };
        assert_eq!(decode_swap_out(&other), Err(BridgeError::SwapoutLogNotFound));
    }

    #[test]
    fn test_encode_swap_in() {
        let input = encode_swap_in(
            H256::repeat_byte(0xaa),
            Address::repeat_byte(0x11),
            Address::repeat_byte(0x33),
            U256::from(990u64),
            1,
        );
        assert_eq!(input.len(), 4 + 5 * 32);
        assert_eq!(&input[..4], &swap_in_selector());
        assert_eq!(&input[4..36], &[0xaa; 32]);
        assert_eq!(input[4 + 5 * 32 - 1], 1);
    }
}
