use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

/// The compliance rules the analyzer evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    LargeAmount,
    SuspiciousInteraction,
    MultipleOutgoing,
    MultipleIncoming,
}

impl RuleKind {
    pub const ALL: [RuleKind; 4] = [
        Self::LargeAmount,
        Self::SuspiciousInteraction,
        Self::MultipleOutgoing,
        Self::MultipleIncoming,
    ];

    /// Rule name as stored in the `rules` table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LargeAmount => "large-amount",
            Self::SuspiciousInteraction => "suspicious-interaction",
            Self::MultipleOutgoing => "multiple-outgoing",
            Self::MultipleIncoming => "multiple-incoming",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::LargeAmount => "Large amount transfer detected",
            Self::SuspiciousInteraction => "Transaction involves suspicious address",
            Self::MultipleOutgoing => "Multiple transfers in short time",
            Self::MultipleIncoming => {
                "Address received multiple transfers exceeding threshold in short time"
            }
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            Self::MultipleOutgoing => Severity::Medium,
            _ => Severity::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// A rule firing for one transfer, ready for database insertion.
#[derive(Debug, Clone)]
pub struct Violation {
    pub rule: RuleKind,
    pub severity: Severity,
    pub tx_hash: B256,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    /// The address an enforcement request would restrict.
    pub flagged_address: Address,
    pub details: JsonValue,
    /// Whether the rule's actions ask for on-chain enforcement.
    pub enforce: bool,
}

impl Violation {
    pub fn reason(&self) -> &'static str {
        self.rule.as_str()
    }

    pub fn action_taken(&self) -> JsonValue {
        if self.enforce {
            serde_json::json!({ "action": "enforcement_requested", "address": self.flagged_address.to_string() })
        } else {
            serde_json::json!({ "action": "recorded" })
        }
    }
}

/// Request to restrict an address, sent from the analyzer to the enforcement engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforcementRequest {
    pub address: Address,
    pub reason: String,
    pub severity: Severity,
}
