use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};

/// Where a transfer was observed: in the mempool or in a mined block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Pending,
    Confirmed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
        }
    }
}

/// A normalized token transfer, ready for persistence and analysis.
///
/// For pending transfers `block_number` is the chain tip at the time the
/// transaction was seen; the confirmed observation carries the real block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    pub hash: B256,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub status: TransferStatus,
}

impl TokenTransfer {
    pub fn is_pending(&self) -> bool {
        self.status == TransferStatus::Pending
    }
}
