use alloy::primitives::{Address, B256, U256};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::str::FromStr;

use crate::indexer::types::{TokenTransfer, TransferStatus};

/// A persisted transfer row (confirmed or pending table).
#[derive(Debug, Clone)]
pub struct TransferRecord {
    pub id: i64,
    pub hash: B256,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub analyzed: bool,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TransferRecord {
    pub fn to_transfer(&self) -> TokenTransfer {
        TokenTransfer {
            hash: self.hash,
            from: self.from,
            to: self.to,
            amount: self.amount,
            block_number: self.block_number,
            timestamp: self.timestamp,
            status: self.status,
        }
    }
}

/// A compliance rule as configured in the `rules` table.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub status: String,
    pub severity: String,
    pub parameters: JsonValue,
    pub actions: JsonValue,
    pub violations: i64,
    pub last_violation_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Rule {
    pub fn is_active(&self) -> bool {
        self.status == "active" && self.deleted_at.is_none()
    }
}

/// Rule definition used for seeding.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub name: String,
    pub description: String,
    pub status: String,
    pub severity: String,
    pub parameters: JsonValue,
    pub actions: JsonValue,
}

#[derive(Debug, Clone)]
pub struct SuspiciousTransfer {
    pub id: i64,
    pub tx_hash: B256,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub rule_name: String,
    pub severity: String,
    pub reason: String,
    pub flagged_address: Address,
    pub details: JsonValue,
    pub enforcement_applied: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RuleViolation {
    pub id: i64,
    pub rule_id: Option<i64>,
    pub rule_name: String,
    pub tx_hash: B256,
    pub block_number: u64,
    pub details: JsonValue,
    pub action_taken: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct BlacklistedAddress {
    pub id: i64,
    pub address: Address,
    pub tx_hash: B256,
    pub block_number: u64,
    pub reason: String,
    pub severity: String,
    pub details: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Blacklist row to insert after a successful restriction submission.
#[derive(Debug, Clone)]
pub struct NewBlacklistEntry {
    pub address: Address,
    pub tx_hash: B256,
    pub block_number: u64,
    pub reason: String,
    pub severity: String,
    pub details: JsonValue,
}

// ============================================================
// Column conversions
// ============================================================

pub fn amount_to_numeric(amount: U256) -> BigDecimal {
    // U256's decimal rendering is always a valid integer literal
    BigDecimal::from_str(&amount.to_string()).unwrap_or_default()
}

pub fn numeric_to_amount(value: &BigDecimal) -> eyre::Result<U256> {
    let (digits, _) = value.with_scale(0).into_bigint_and_exponent();
    U256::from_str_radix(&digits.to_string(), 10)
        .map_err(|e| eyre::eyre!("Amount '{}' does not fit a uint256: {}", value, e))
}

pub fn bytes_to_address(bytes: &[u8]) -> eyre::Result<Address> {
    if bytes.len() != 20 {
        return Err(eyre::eyre!("Expected 20-byte address, got {} bytes", bytes.len()));
    }
    Ok(Address::from_slice(bytes))
}

pub fn bytes_to_hash(bytes: &[u8]) -> eyre::Result<B256> {
    if bytes.len() != 32 {
        return Err(eyre::eyre!("Expected 32-byte hash, got {} bytes", bytes.len()));
    }
    Ok(B256::from_slice(bytes))
}

pub fn block_to_column(block: u64) -> i64 {
    i64::try_from(block).unwrap_or(i64::MAX)
}

pub fn column_to_block(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_amount_is_exact() {
        let amount = U256::MAX - U256::from(7u64);
        let numeric = amount_to_numeric(amount);
        assert_eq!(numeric_to_amount(&numeric).unwrap(), amount);
    }

    #[test]
    fn test_negative_numeric_rejected() {
        let numeric = BigDecimal::from(-5);
        assert!(numeric_to_amount(&numeric).is_err());
    }

    #[test]
    fn test_byte_columns() {
        let address = Address::repeat_byte(0x11);
        assert_eq!(bytes_to_address(address.as_slice()).unwrap(), address);
        assert!(bytes_to_address(&[1, 2, 3]).is_err());
        assert!(bytes_to_hash(&[0u8; 31]).is_err());
    }
}
