use crate::anomaly::types::RuleKind;
use crate::config::Thresholds;
use crate::db::models::NewRule;
use crate::db::Store;

/// Default rule rows built from the configured thresholds.
pub fn default_rules(thresholds: &Thresholds, suspicious_addresses: &[String]) -> Vec<NewRule> {
    RuleKind::ALL
        .into_iter()
        .map(|kind| {
            let parameters = match kind {
                RuleKind::LargeAmount => serde_json::json!({
                    "threshold": thresholds.large_amount.to_string(),
                }),
                RuleKind::SuspiciousInteraction => serde_json::json!({
                    "addresses": suspicious_addresses,
                }),
                RuleKind::MultipleOutgoing => serde_json::json!({
                    "min_transfers": thresholds.outgoing_count,
                    "block_range": thresholds.outgoing_window_blocks,
                }),
                RuleKind::MultipleIncoming => serde_json::json!({
                    "threshold": thresholds.incoming_amount.to_string(),
                    "block_range": thresholds.incoming_window_blocks,
                }),
            };

            NewRule {
                name: kind.as_str().to_string(),
                description: kind.description().to_string(),
                status: "active".to_string(),
                severity: kind.default_severity().as_str().to_string(),
                parameters,
                actions: serde_json::json!({ "enforce": true }),
            }
        })
        .collect()
}

/// Seed the rules table at startup (idempotent). Rows an operator already
/// created or edited are left untouched.
pub async fn seed_rules(
    store: &dyn Store,
    thresholds: &Thresholds,
    suspicious_addresses: &[String],
) -> eyre::Result<usize> {
    let mut seeded = 0;
    for rule in default_rules(thresholds, suspicious_addresses) {
        if store.seed_rule(&rule).await? {
            tracing::info!(rule = %rule.name, severity = %rule.severity, "Seeded rule");
            seeded += 1;
        } else {
            tracing::debug!(rule = %rule.name, "Rule already present");
        }
    }
    Ok(seeded)
}
