use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;

use crate::anomaly::types::Violation;
use crate::db::models::{
    amount_to_numeric, block_to_column, bytes_to_address, bytes_to_hash, column_to_block,
    numeric_to_amount, BlacklistedAddress, NewBlacklistEntry, NewRule, Rule, RuleViolation,
    SuspiciousTransfer, TransferRecord,
};
use crate::indexer::types::{TokenTransfer, TransferStatus};

/// Durable, idempotent record keeping shared by every component.
///
/// Writes that hit an existing unique key are no-ops and report `false`
/// rather than failing. Soft-deleted rows are invisible to every read.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a confirmed transfer keyed by hash. Returns true if newly written.
    async fn upsert_transfer(&self, transfer: &TokenTransfer) -> eyre::Result<bool>;

    /// Insert a pending transfer keyed by hash, unless that hash is already confirmed.
    async fn upsert_pending(&self, transfer: &TokenTransfer) -> eyre::Result<bool>;

    /// Mark the pending row for `hash` superseded by its confirmed transfer.
    async fn resolve_pending(&self, hash: B256) -> eyre::Result<bool>;

    /// Supersede every live pending row whose hash already has a confirmed transfer.
    async fn resolve_confirmed_pending(&self) -> eyre::Result<u64>;

    /// Expire live pending rows first seen before `cutoff`.
    async fn reap_stale_pending(&self, cutoff: DateTime<Utc>) -> eyre::Result<u64>;

    async fn mark_transfer_analyzed(&self, hash: B256) -> eyre::Result<()>;
    async fn mark_pending_analyzed(&self, hash: B256) -> eyre::Result<()>;

    /// Oldest unanalyzed confirmed transfers, in block order.
    async fn unanalyzed_transfers(&self, limit: i64) -> eyre::Result<Vec<TransferRecord>>;

    /// Oldest unanalyzed live pending transfers, in block order.
    async fn unanalyzed_pending(&self, limit: i64) -> eyre::Result<Vec<TransferRecord>>;

    async fn find_transfer(&self, hash: B256) -> eyre::Result<Option<TransferRecord>>;
    async fn find_pending(&self, hash: B256) -> eyre::Result<Option<TransferRecord>>;

    /// Highest block among confirmed and live pending transfers.
    async fn latest_block(&self) -> eyre::Result<Option<u64>>;

    /// Confirmed transfers, then live pending transfers, at or above
    /// `since_block`, each in block order. Analyzed or not.
    async fn recent_transfers(&self, since_block: u64) -> eyre::Result<Vec<TransferRecord>>;

    /// All live rules, active or not.
    async fn active_rules(&self) -> eyre::Result<Vec<Rule>>;

    /// Insert a rule unless one with the same name exists.
    async fn seed_rule(&self, rule: &NewRule) -> eyre::Result<bool>;

    /// Atomically record a SuspiciousTransfer and its RuleViolation, keyed by
    /// (hash, rule). Bumps the rule's violation counter on first write.
    async fn record_violation(&self, violation: &Violation) -> eyre::Result<bool>;

    async fn suspicious_for_transfer(&self, hash: B256) -> eyre::Result<Vec<SuspiciousTransfer>>;
    async fn violations_for_transfer(&self, hash: B256) -> eyre::Result<Vec<RuleViolation>>;

    /// Suspicious transfers whose rule asked for enforcement that has not been applied.
    async fn unenforced_suspicious(&self, limit: i64) -> eyre::Result<Vec<SuspiciousTransfer>>;

    async fn find_blacklisted(&self, address: Address) -> eyre::Result<Option<BlacklistedAddress>>;

    async fn is_blacklisted(&self, address: Address) -> eyre::Result<bool> {
        Ok(self.find_blacklisted(address).await?.is_some())
    }

    /// Insert a blacklist row unless the address is already present.
    async fn record_blacklisted(&self, entry: &NewBlacklistEntry) -> eyre::Result<bool>;

    /// Flag every unenforced suspicious row naming `address` as enforced.
    async fn mark_enforced(&self, address: Address) -> eyre::Result<u64>;

    async fn checkpoint(&self, watcher: &str) -> eyre::Result<Option<u64>>;
    async fn save_checkpoint(&self, watcher: &str, block: u64) -> eyre::Result<()>;
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

type TransferRow = (
    i64,
    Vec<u8>,
    Vec<u8>,
    Vec<u8>,
    BigDecimal,
    i64,
    DateTime<Utc>,
    bool,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

const TRANSFER_COLUMNS: &str = "id, hash, from_address, to_address, amount, block_number, \
     timestamp, analyzed, status, created_at, updated_at, deleted_at";

fn transfer_from_row(row: TransferRow, status: TransferStatus) -> eyre::Result<TransferRecord> {
    let (id, hash, from, to, amount, block, timestamp, analyzed, _, created_at, updated_at, deleted_at) =
        row;
    Ok(TransferRecord {
        id,
        hash: bytes_to_hash(&hash)?,
        from: bytes_to_address(&from)?,
        to: bytes_to_address(&to)?,
        amount: numeric_to_amount(&amount)?,
        block_number: column_to_block(block),
        timestamp,
        analyzed,
        status,
        created_at,
        updated_at,
        deleted_at,
    })
}

type RuleRow = (
    i64,
    String,
    String,
    String,
    String,
    JsonValue,
    JsonValue,
    i64,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

fn rule_from_row(row: RuleRow) -> Rule {
    let (
        id,
        name,
        description,
        status,
        severity,
        parameters,
        actions,
        violations,
        last_violation_at,
        created_at,
        updated_at,
        deleted_at,
    ) = row;
    Rule {
        id,
        name,
        description,
        status,
        severity,
        parameters,
        actions,
        violations,
        last_violation_at,
        created_at,
        updated_at,
        deleted_at,
    }
}

type SuspiciousRow = (
    i64,
    Vec<u8>,
    Vec<u8>,
    Vec<u8>,
    BigDecimal,
    i64,
    DateTime<Utc>,
    String,
    String,
    String,
    Vec<u8>,
    JsonValue,
    bool,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

const SUSPICIOUS_COLUMNS: &str = "id, tx_hash, from_address, to_address, amount, block_number, \
     timestamp, rule_name, severity, reason, flagged_address, details, enforcement_applied, \
     created_at, updated_at, deleted_at";

fn suspicious_from_row(row: SuspiciousRow) -> eyre::Result<SuspiciousTransfer> {
    let (
        id,
        tx_hash,
        from,
        to,
        amount,
        block,
        timestamp,
        rule_name,
        severity,
        reason,
        flagged,
        details,
        enforcement_applied,
        created_at,
        updated_at,
        deleted_at,
    ) = row;
    Ok(SuspiciousTransfer {
        id,
        tx_hash: bytes_to_hash(&tx_hash)?,
        from: bytes_to_address(&from)?,
        to: bytes_to_address(&to)?,
        amount: numeric_to_amount(&amount)?,
        block_number: column_to_block(block),
        timestamp,
        rule_name,
        severity,
        reason,
        flagged_address: bytes_to_address(&flagged)?,
        details,
        enforcement_applied,
        created_at,
        updated_at,
        deleted_at,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_transfer(&self, transfer: &TokenTransfer) -> eyre::Result<bool> {
        let result = sqlx::query(
            "INSERT INTO transfers (hash, from_address, to_address, amount, block_number, timestamp, status)
             VALUES ($1, $2, $3, $4, $5, $6, 'confirmed')
             ON CONFLICT (hash) DO NOTHING",
        )
        .bind(transfer.hash.as_slice())
        .bind(transfer.from.as_slice())
        .bind(transfer.to.as_slice())
        .bind(amount_to_numeric(transfer.amount))
        .bind(block_to_column(transfer.block_number))
        .bind(transfer.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn upsert_pending(&self, transfer: &TokenTransfer) -> eyre::Result<bool> {
        let result = sqlx::query(
            "INSERT INTO pending_transfers (hash, from_address, to_address, amount, block_number, timestamp, status)
             SELECT $1, $2, $3, $4, $5, $6, 'pending'
             WHERE NOT EXISTS (SELECT 1 FROM transfers WHERE hash = $1)
             ON CONFLICT (hash) DO NOTHING",
        )
        .bind(transfer.hash.as_slice())
        .bind(transfer.from.as_slice())
        .bind(transfer.to.as_slice())
        .bind(amount_to_numeric(transfer.amount))
        .bind(block_to_column(transfer.block_number))
        .bind(transfer.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn resolve_pending(&self, hash: B256) -> eyre::Result<bool> {
        let result = sqlx::query(
            "UPDATE pending_transfers
             SET status = 'superseded', deleted_at = NOW(), updated_at = NOW()
             WHERE hash = $1 AND deleted_at IS NULL",
        )
        .bind(hash.as_slice())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn resolve_confirmed_pending(&self) -> eyre::Result<u64> {
        let result = sqlx::query(
            "UPDATE pending_transfers p
             SET status = 'superseded', deleted_at = NOW(), updated_at = NOW()
             FROM transfers t
             WHERE t.hash = p.hash AND p.deleted_at IS NULL",
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn reap_stale_pending(&self, cutoff: DateTime<Utc>) -> eyre::Result<u64> {
        let result = sqlx::query(
            "UPDATE pending_transfers
             SET status = 'expired', deleted_at = NOW(), updated_at = NOW()
             WHERE deleted_at IS NULL AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mark_transfer_analyzed(&self, hash: B256) -> eyre::Result<()> {
        sqlx::query(
            "UPDATE transfers SET analyzed = TRUE, updated_at = NOW()
             WHERE hash = $1 AND NOT analyzed",
        )
        .bind(hash.as_slice())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_pending_analyzed(&self, hash: B256) -> eyre::Result<()> {
        sqlx::query(
            "UPDATE pending_transfers SET analyzed = TRUE, updated_at = NOW()
             WHERE hash = $1 AND NOT analyzed AND deleted_at IS NULL",
        )
        .bind(hash.as_slice())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn unanalyzed_transfers(&self, limit: i64) -> eyre::Result<Vec<TransferRecord>> {
        let rows: Vec<TransferRow> = sqlx::query_as(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers
             WHERE NOT analyzed AND deleted_at IS NULL
             ORDER BY block_number, id
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| transfer_from_row(row, TransferStatus::Confirmed))
            .collect()
    }

    async fn unanalyzed_pending(&self, limit: i64) -> eyre::Result<Vec<TransferRecord>> {
        let rows: Vec<TransferRow> = sqlx::query_as(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM pending_transfers
             WHERE NOT analyzed AND deleted_at IS NULL
             ORDER BY block_number, id
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| transfer_from_row(row, TransferStatus::Pending))
            .collect()
    }

    async fn find_transfer(&self, hash: B256) -> eyre::Result<Option<TransferRecord>> {
        let row: Option<TransferRow> = sqlx::query_as(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE hash = $1 AND deleted_at IS NULL"
        ))
        .bind(hash.as_slice())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| transfer_from_row(r, TransferStatus::Confirmed))
            .transpose()
    }

    async fn find_pending(&self, hash: B256) -> eyre::Result<Option<TransferRecord>> {
        let row: Option<TransferRow> = sqlx::query_as(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM pending_transfers WHERE hash = $1 AND deleted_at IS NULL"
        ))
        .bind(hash.as_slice())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| transfer_from_row(r, TransferStatus::Pending))
            .transpose()
    }

    async fn latest_block(&self) -> eyre::Result<Option<u64>> {
        let (latest,): (Option<i64>,) = sqlx::query_as(
            "SELECT MAX(block_number) FROM (
                 SELECT block_number FROM transfers WHERE deleted_at IS NULL
                 UNION ALL
                 SELECT block_number FROM pending_transfers WHERE deleted_at IS NULL
             ) blocks",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(latest.map(column_to_block))
    }

    async fn recent_transfers(&self, since_block: u64) -> eyre::Result<Vec<TransferRecord>> {
        let since = block_to_column(since_block);

        let confirmed: Vec<TransferRow> = sqlx::query_as(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers
             WHERE block_number >= $1 AND deleted_at IS NULL
             ORDER BY block_number, id"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let pending: Vec<TransferRow> = sqlx::query_as(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM pending_transfers
             WHERE block_number >= $1 AND deleted_at IS NULL
             ORDER BY block_number, id"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        confirmed
            .into_iter()
            .map(|row| transfer_from_row(row, TransferStatus::Confirmed))
            .chain(
                pending
                    .into_iter()
                    .map(|row| transfer_from_row(row, TransferStatus::Pending)),
            )
            .collect()
    }

    async fn active_rules(&self) -> eyre::Result<Vec<Rule>> {
        let rows: Vec<RuleRow> = sqlx::query_as(
            "SELECT id, name, description, status, severity, parameters, actions, violations,
                    last_violation_at, created_at, updated_at, deleted_at
             FROM rules WHERE deleted_at IS NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(rule_from_row).collect())
    }

    async fn seed_rule(&self, rule: &NewRule) -> eyre::Result<bool> {
        let result = sqlx::query(
            "INSERT INTO rules (name, description, status, severity, parameters, actions)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(&rule.status)
        .bind(&rule.severity)
        .bind(&rule.parameters)
        .bind(&rule.actions)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_violation(&self, violation: &Violation) -> eyre::Result<bool> {
        let mut tx = self.pool.begin().await?;
        let rule_name = violation.rule.as_str();

        let inserted = sqlx::query(
            "INSERT INTO suspicious_transfers
                (tx_hash, rule_name, from_address, to_address, amount, block_number, timestamp,
                 severity, reason, flagged_address, details, enforcement_requested)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (tx_hash, rule_name) DO NOTHING",
        )
        .bind(violation.tx_hash.as_slice())
        .bind(rule_name)
        .bind(violation.from.as_slice())
        .bind(violation.to.as_slice())
        .bind(amount_to_numeric(violation.amount))
        .bind(block_to_column(violation.block_number))
        .bind(violation.timestamp)
        .bind(violation.severity.as_str())
        .bind(violation.reason())
        .bind(violation.flagged_address.as_slice())
        .bind(&violation.details)
        .bind(violation.enforce)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let rule_id: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM rules WHERE name = $1 AND deleted_at IS NULL")
                .bind(rule_name)
                .fetch_optional(&mut *tx)
                .await?;
        let rule_id = rule_id.map(|(id,)| id);

        sqlx::query(
            "INSERT INTO rule_violations (rule_id, rule_name, tx_hash, block_number, details, action_taken)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (tx_hash, rule_name) DO NOTHING",
        )
        .bind(rule_id)
        .bind(rule_name)
        .bind(violation.tx_hash.as_slice())
        .bind(block_to_column(violation.block_number))
        .bind(&violation.details)
        .bind(violation.action_taken())
        .execute(&mut *tx)
        .await?;

        if let Some(id) = rule_id {
            sqlx::query(
                "UPDATE rules SET violations = violations + 1, last_violation_at = NOW(), updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn suspicious_for_transfer(&self, hash: B256) -> eyre::Result<Vec<SuspiciousTransfer>> {
        let rows: Vec<SuspiciousRow> = sqlx::query_as(&format!(
            "SELECT {SUSPICIOUS_COLUMNS} FROM suspicious_transfers
             WHERE tx_hash = $1 AND deleted_at IS NULL ORDER BY id"
        ))
        .bind(hash.as_slice())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(suspicious_from_row).collect()
    }

    async fn violations_for_transfer(&self, hash: B256) -> eyre::Result<Vec<RuleViolation>> {
        let rows: Vec<(
            i64,
            Option<i64>,
            String,
            Vec<u8>,
            i64,
            JsonValue,
            JsonValue,
            DateTime<Utc>,
            DateTime<Utc>,
            Option<DateTime<Utc>>,
        )> = sqlx::query_as(
            "SELECT id, rule_id, rule_name, tx_hash, block_number, details, action_taken,
                    created_at, updated_at, deleted_at
             FROM rule_violations WHERE tx_hash = $1 AND deleted_at IS NULL ORDER BY id",
        )
        .bind(hash.as_slice())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(id, rule_id, rule_name, tx_hash, block, details, action_taken, created_at, updated_at, deleted_at)| {
                    Ok(RuleViolation {
                        id,
                        rule_id,
                        rule_name,
                        tx_hash: bytes_to_hash(&tx_hash)?,
                        block_number: column_to_block(block),
                        details,
                        action_taken,
                        created_at,
                        updated_at,
                        deleted_at,
                    })
                },
            )
            .collect()
    }

    async fn unenforced_suspicious(&self, limit: i64) -> eyre::Result<Vec<SuspiciousTransfer>> {
        let rows: Vec<SuspiciousRow> = sqlx::query_as(&format!(
            "SELECT {SUSPICIOUS_COLUMNS} FROM suspicious_transfers
             WHERE enforcement_requested AND NOT enforcement_applied AND deleted_at IS NULL
             ORDER BY id
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(suspicious_from_row).collect()
    }

    async fn find_blacklisted(&self, address: Address) -> eyre::Result<Option<BlacklistedAddress>> {
        let row: Option<(
            i64,
            Vec<u8>,
            Vec<u8>,
            i64,
            String,
            String,
            JsonValue,
            DateTime<Utc>,
            DateTime<Utc>,
            Option<DateTime<Utc>>,
        )> = sqlx::query_as(
            "SELECT id, address, tx_hash, block_number, reason, severity, details,
                    created_at, updated_at, deleted_at
             FROM blacklisted_addresses WHERE address = $1 AND deleted_at IS NULL",
        )
        .bind(address.as_slice())
        .fetch_optional(&self.pool)
        .await?;

        row.map(
            |(id, address, tx_hash, block, reason, severity, details, created_at, updated_at, deleted_at)| {
                Ok(BlacklistedAddress {
                    id,
                    address: bytes_to_address(&address)?,
                    tx_hash: bytes_to_hash(&tx_hash)?,
                    block_number: column_to_block(block),
                    reason,
                    severity,
                    details,
                    created_at,
                    updated_at,
                    deleted_at,
                })
            },
        )
        .transpose()
    }

    async fn record_blacklisted(&self, entry: &NewBlacklistEntry) -> eyre::Result<bool> {
        let result = sqlx::query(
            "INSERT INTO blacklisted_addresses (address, tx_hash, block_number, reason, severity, details)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (address) DO NOTHING",
        )
        .bind(entry.address.as_slice())
        .bind(entry.tx_hash.as_slice())
        .bind(block_to_column(entry.block_number))
        .bind(&entry.reason)
        .bind(&entry.severity)
        .bind(&entry.details)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_enforced(&self, address: Address) -> eyre::Result<u64> {
        let result = sqlx::query(
            "UPDATE suspicious_transfers
             SET enforcement_applied = TRUE, updated_at = NOW()
             WHERE flagged_address = $1 AND NOT enforcement_applied AND deleted_at IS NULL",
        )
        .bind(address.as_slice())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn checkpoint(&self, watcher: &str) -> eyre::Result<Option<u64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_block FROM watcher_state WHERE name = $1")
                .bind(watcher)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(b,)| column_to_block(b)))
    }

    async fn save_checkpoint(&self, watcher: &str, block: u64) -> eyre::Result<()> {
        sqlx::query(
            "INSERT INTO watcher_state (name, last_block, updated_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (name) DO UPDATE
             SET last_block = GREATEST(watcher_state.last_block, $2), updated_at = NOW()",
        )
        .bind(watcher)
        .bind(block_to_column(block))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
