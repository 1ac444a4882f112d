use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent};
use chrono::{DateTime, Utc};

use super::types::{TokenTransfer, TransferStatus};

// Transfer event plus the two transfer-shaped ERC-20 calls seen in the mempool.
sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);

    function transfer(address to, uint256 value) external returns (bool);
    function transferFrom(address from, address to, uint256 value) external returns (bool);
}

/// A Transfer log from the monitored token, before block info is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTransfer {
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub tx_hash: B256,
    pub block_number: u64,
    pub log_index: u64,
}

impl DecodedTransfer {
    pub fn into_transfer(self, timestamp: DateTime<Utc>) -> TokenTransfer {
        TokenTransfer {
            hash: self.tx_hash,
            from: self.from,
            to: self.to,
            amount: self.amount,
            block_number: self.block_number,
            timestamp,
            status: TransferStatus::Confirmed,
        }
    }
}

/// Attempt to decode a log as a Transfer event of the monitored token.
///
/// Returns `None` if:
/// - The log was emitted by a different contract
/// - The log was removed by a reorg
/// - The log doesn't match the Transfer event signature
/// - Decoding fails (malformed log, missing tx hash or block number)
pub fn decode_transfer_log(log: &Log, token: Address) -> Option<DecodedTransfer> {
    let inner = &log.inner;

    if inner.address != token || log.removed {
        return None;
    }

    // Check topic[0] matches Transfer event signature
    let topics = inner.data.topics();
    if topics.is_empty() || topics[0] != Transfer::SIGNATURE_HASH {
        return None;
    }

    // Exactly 3 topics (signature + from + to) and 32 bytes of data (value)
    if topics.len() != 3 {
        return None;
    }

    let from = Address::from_word(topics[1]);
    let to = Address::from_word(topics[2]);

    let data = inner.data.data.as_ref();
    if data.len() < 32 {
        return None;
    }
    let amount = U256::from_be_slice(&data[..32]);

    Some(DecodedTransfer {
        from,
        to,
        amount,
        tx_hash: log.transaction_hash?,
        block_number: log.block_number?,
        log_index: log.log_index.unwrap_or(0),
    })
}

/// (from, to, amount) extracted from transaction calldata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCall {
    pub from: Address,
    pub to: Address,
    pub amount: U256,
}

/// Decode `transfer`/`transferFrom` calldata. `sender` is the transaction
/// signer, which is the token holder for a plain `transfer`.
pub fn decode_transfer_call(input: &[u8], sender: Address) -> Option<DecodedCall> {
    if input.len() < 4 {
        return None;
    }

    let selector = &input[..4];
    if selector == transferCall::SELECTOR {
        let call = transferCall::abi_decode(input).ok()?;
        Some(DecodedCall {
            from: sender,
            to: call.to,
            amount: call.value,
        })
    } else if selector == transferFromCall::SELECTOR {
        let call = transferFromCall::abi_decode(input).ok()?;
        Some(DecodedCall {
            from: call.from,
            to: call.to,
            amount: call.value,
        })
    } else {
        None
    }
}
