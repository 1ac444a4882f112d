use alloy::primitives::{Address, U256};
use serde_json::Value as JsonValue;

use crate::config::{parse_address, Thresholds};
use crate::db::models::Rule;
use crate::indexer::types::TokenTransfer;
use crate::watchlist::Watchlist;

use super::types::{RuleKind, Severity, Violation};
use super::window::SpanStats;

/// How a rule reports a firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RulePolicy {
    pub severity: Severity,
    pub enforce: bool,
}

/// An enabled window rule: its threshold plus the block range an operator stored
/// on the rule row, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRule<T> {
    pub policy: RulePolicy,
    pub threshold: T,
    pub block_range: Option<u64>,
}

/// The rules the analyzer evaluates, resolved from the `rules` table.
/// A rule that is missing or not active is `None` and never fires.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub large_amount: Option<(RulePolicy, U256)>,
    pub suspicious: Option<(RulePolicy, Watchlist)>,
    pub outgoing: Option<WindowRule<u64>>,
    pub incoming: Option<WindowRule<U256>>,
}

impl RuleSet {
    /// Build from rule rows. Row parameters override the configured defaults;
    /// the watchlist is extended with the row's `addresses`.
    pub fn from_rows(rows: &[Rule], defaults: &Thresholds, watchlist: &Watchlist) -> Self {
        let mut set = RuleSet::default();

        for row in rows.iter().filter(|r| r.is_active()) {
            let Some(kind) = RuleKind::from_name(&row.name) else {
                tracing::debug!(rule = %row.name, "Ignoring unknown rule");
                continue;
            };

            let policy = RulePolicy {
                severity: Severity::parse(&row.severity).unwrap_or_else(|| {
                    tracing::warn!(rule = %row.name, severity = %row.severity, "Unknown severity, using default");
                    kind.default_severity()
                }),
                enforce: row
                    .actions
                    .get("enforce")
                    .and_then(JsonValue::as_bool)
                    .unwrap_or(true),
            };
            let params = &row.parameters;

            match kind {
                RuleKind::LargeAmount => {
                    let threshold = amount_param(&row.name, params, "threshold")
                        .unwrap_or(defaults.large_amount);
                    set.large_amount = Some((policy, threshold));
                }
                RuleKind::SuspiciousInteraction => {
                    let mut list = watchlist.clone();
                    for address in address_list_param(&row.name, params, "addresses") {
                        list.insert(address, None);
                    }
                    set.suspicious = Some((policy, list));
                }
                RuleKind::MultipleOutgoing => {
                    set.outgoing = Some(WindowRule {
                        policy,
                        threshold: u64_param(params, "min_transfers")
                            .filter(|n| *n > 0)
                            .unwrap_or(defaults.outgoing_count),
                        block_range: u64_param(params, "block_range"),
                    });
                }
                RuleKind::MultipleIncoming => {
                    set.incoming = Some(WindowRule {
                        policy,
                        threshold: amount_param(&row.name, params, "threshold")
                            .unwrap_or(defaults.incoming_amount),
                        block_range: u64_param(params, "block_range"),
                    });
                }
            }
        }

        set
    }

    /// Evaluate the rules that need no window state.
    pub fn check_immediate(&self, transfer: &TokenTransfer) -> Vec<Violation> {
        let mut violations = Vec::new();
        if let Some((policy, threshold)) = &self.large_amount {
            violations.extend(check_large_amount(transfer, *policy, *threshold));
        }
        if let Some((policy, list)) = &self.suspicious {
            violations.extend(check_suspicious_interaction(transfer, *policy, list));
        }
        violations
    }
}

fn u64_param(params: &JsonValue, key: &str) -> Option<u64> {
    match params.get(key)? {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Base-unit amount stored either as a JSON integer or a decimal string.
fn amount_param(rule: &str, params: &JsonValue, key: &str) -> Option<U256> {
    let parsed = match params.get(key)? {
        JsonValue::Number(n) => n.as_u64().map(U256::from),
        JsonValue::String(s) => U256::from_str_radix(s.trim(), 10).ok(),
        _ => None,
    };
    if parsed.is_none() {
        tracing::warn!(rule = %rule, param = %key, "Unparseable amount parameter, using configured default");
    }
    parsed
}

fn address_list_param(rule: &str, params: &JsonValue, key: &str) -> Vec<Address> {
    let Some(JsonValue::Array(values)) = params.get(key) else {
        return Vec::new();
    };
    values
        .iter()
        .filter_map(|v| {
            let raw = v.as_str()?;
            match parse_address(raw) {
                Ok(a) => Some(a),
                Err(e) => {
                    tracing::warn!(rule = %rule, address = %raw, error = %e, "Invalid address in rule parameters, skipping");
                    None
                }
            }
        })
        .collect()
}

fn violation(
    transfer: &TokenTransfer,
    rule: RuleKind,
    policy: RulePolicy,
    flagged_address: Address,
    details: JsonValue,
) -> Violation {
    Violation {
        rule,
        severity: policy.severity,
        tx_hash: transfer.hash,
        from: transfer.from,
        to: transfer.to,
        amount: transfer.amount,
        block_number: transfer.block_number,
        timestamp: transfer.timestamp,
        flagged_address,
        details,
        enforce: policy.enforce,
    }
}

/// Fires when the amount reaches the threshold (inclusive).
pub fn check_large_amount(
    transfer: &TokenTransfer,
    policy: RulePolicy,
    threshold: U256,
) -> Option<Violation> {
    if transfer.amount < threshold {
        return None;
    }
    Some(violation(
        transfer,
        RuleKind::LargeAmount,
        policy,
        transfer.from,
        serde_json::json!({
            "amount": transfer.amount.to_string(),
            "threshold": threshold.to_string(),
            "status": transfer.status.as_str(),
        }),
    ))
}

/// Fires when either counterparty is on the watchlist, whatever the amount.
pub fn check_suspicious_interaction(
    transfer: &TokenTransfer,
    policy: RulePolicy,
    watchlist: &Watchlist,
) -> Option<Violation> {
    let from_listed = watchlist.contains(&transfer.from);
    let to_listed = watchlist.contains(&transfer.to);
    if !from_listed && !to_listed {
        return None;
    }

    let (side, listed) = if from_listed {
        ("from", transfer.from)
    } else {
        ("to", transfer.to)
    };
    Some(violation(
        transfer,
        RuleKind::SuspiciousInteraction,
        policy,
        transfer.from,
        serde_json::json!({
            "side": side,
            "listed_address": listed.to_string(),
            "label": watchlist.label(&listed),
            "amount": transfer.amount.to_string(),
        }),
    ))
}

/// Fires when the sender's transfer count within the window reaches the threshold.
pub fn check_multiple_outgoing(
    transfer: &TokenTransfer,
    rule: &WindowRule<u64>,
    span: SpanStats,
    width: u64,
) -> Option<Violation> {
    if span.count < rule.threshold {
        return None;
    }
    Some(violation(
        transfer,
        RuleKind::MultipleOutgoing,
        rule.policy,
        transfer.from,
        serde_json::json!({
            "transfer_count": span.count,
            "min_transfers": rule.threshold,
            "block_range": width,
        }),
    ))
}

/// Fires when the recipient's incoming total within the window reaches the threshold.
pub fn check_multiple_incoming(
    transfer: &TokenTransfer,
    rule: &WindowRule<U256>,
    span: SpanStats,
    width: u64,
) -> Option<Violation> {
    if span.total < rule.threshold {
        return None;
    }
    Some(violation(
        transfer,
        RuleKind::MultipleIncoming,
        rule.policy,
        transfer.to,
        serde_json::json!({
            "total_received": span.total.to_string(),
            "transfer_count": span.count,
            "threshold": rule.threshold.to_string(),
            "block_range": width,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::types::TransferStatus;
    use alloy::primitives::B256;
    use chrono::Utc;

    const HIGH: RulePolicy = RulePolicy {
        severity: Severity::High,
        enforce: true,
    };

    fn transfer(amount: u64) -> TokenTransfer {
        TokenTransfer {
            hash: B256::repeat_byte(0xee),
            from: Address::repeat_byte(0x01),
            to: Address::repeat_byte(0x02),
            amount: U256::from(amount),
            block_number: 10,
            timestamp: Utc::now(),
            status: TransferStatus::Confirmed,
        }
    }

    fn thresholds() -> Thresholds {
        Thresholds {
            large_amount: U256::from(1000u64),
            outgoing_window_blocks: 10,
            outgoing_count: 5,
            incoming_window_blocks: 10,
            incoming_amount: U256::from(1000u64),
        }
    }

    fn row(name: &str, status: &str, parameters: JsonValue, actions: JsonValue) -> Rule {
        let now = Utc::now();
        Rule {
            id: 1,
            name: name.to_string(),
            description: String::new(),
            status: status.to_string(),
            severity: "high".to_string(),
            parameters,
            actions,
            violations: 0,
            last_violation_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn test_large_amount_boundary_is_inclusive() {
        let threshold = U256::from(1000u64);
        let fired = check_large_amount(&transfer(1000), HIGH, threshold).unwrap();
        assert_eq!(fired.rule, RuleKind::LargeAmount);
        assert_eq!(fired.flagged_address, Address::repeat_byte(0x01));
        assert!(check_large_amount(&transfer(999), HIGH, threshold).is_none());
    }

    #[test]
    fn test_suspicious_fires_at_zero_amount() {
        let list: Watchlist = [Address::repeat_byte(0x02)].into_iter().collect();
        let fired = check_suspicious_interaction(&transfer(0), HIGH, &list).unwrap();
        assert_eq!(fired.details["side"], "to");
        assert_eq!(fired.flagged_address, Address::repeat_byte(0x01));

        let empty = Watchlist::new();
        assert!(check_suspicious_interaction(&transfer(0), HIGH, &empty).is_none());
    }

    #[test]
    fn test_window_checks_use_span_stats() {
        let outgoing = WindowRule {
            policy: HIGH,
            threshold: 5u64,
            block_range: None,
        };
        let four = SpanStats {
            count: 4,
            total: U256::ZERO,
        };
        let five = SpanStats {
            count: 5,
            total: U256::ZERO,
        };
        assert!(check_multiple_outgoing(&transfer(1), &outgoing, four, 10).is_none());
        assert!(check_multiple_outgoing(&transfer(1), &outgoing, five, 10).is_some());

        let incoming = WindowRule {
            policy: HIGH,
            threshold: U256::from(1000u64),
            block_range: None,
        };
        let reached = SpanStats {
            count: 2,
            total: U256::from(1000u64),
        };
        let fired = check_multiple_incoming(&transfer(500), &incoming, reached, 10).unwrap();
        assert_eq!(fired.flagged_address, Address::repeat_byte(0x02));
        assert_eq!(fired.details["total_received"], "1000");
    }

    #[test]
    fn test_rule_rows_override_defaults() {
        let rows = vec![
            row(
                "large-amount",
                "active",
                serde_json::json!({ "threshold": "5000" }),
                serde_json::json!({ "enforce": false }),
            ),
            row(
                "multiple-outgoing",
                "active",
                serde_json::json!({ "min_transfers": 3, "block_range": 20 }),
                serde_json::json!({}),
            ),
            row(
                "suspicious-interaction",
                "active",
                serde_json::json!({ "addresses": ["0x3333333333333333333333333333333333333333", "bogus"] }),
                serde_json::json!({}),
            ),
        ];

        let set = RuleSet::from_rows(&rows, &thresholds(), &Watchlist::new());
        let (policy, threshold) = set.large_amount.unwrap();
        assert_eq!(threshold, U256::from(5000u64));
        assert!(!policy.enforce);

        let outgoing = set.outgoing.unwrap();
        assert_eq!(outgoing.threshold, 3);
        assert_eq!(outgoing.block_range, Some(20));

        let (_, list) = set.suspicious.unwrap();
        assert_eq!(list.len(), 1);
        assert!(set.incoming.is_none());
    }

    #[test]
    fn test_disabled_rule_never_fires() {
        let rows = vec![row(
            "large-amount",
            "disabled",
            serde_json::json!({}),
            serde_json::json!({}),
        )];
        let set = RuleSet::from_rows(&rows, &thresholds(), &Watchlist::new());
        assert!(set.large_amount.is_none());
        assert!(set.check_immediate(&transfer(1_000_000)).is_empty());
    }

    #[test]
    fn test_bad_parameter_falls_back_to_config() {
        let rows = vec![row(
            "multiple-incoming",
            "active",
            serde_json::json!({ "threshold": "12.5" }),
            serde_json::json!({}),
        )];
        let set = RuleSet::from_rows(&rows, &thresholds(), &Watchlist::new());
        assert_eq!(set.incoming.unwrap().threshold, U256::from(1000u64));
    }
}
