use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::anomaly::types::Violation;
use crate::db::models::{
    BlacklistedAddress, NewBlacklistEntry, NewRule, Rule, RuleViolation, SuspiciousTransfer,
    TransferRecord,
};
use crate::db::repository::Store;
use crate::indexer::types::{TokenTransfer, TransferStatus};

/// In-process `Store` with the same conflict and visibility rules as `PgStore`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    next_id: i64,
    transfers: Vec<TransferRecord>,
    pending: Vec<TransferRecord>,
    rules: Vec<Rule>,
    suspicious: Vec<(SuspiciousTransfer, bool)>,
    violations: Vec<RuleViolation>,
    blacklist: Vec<BlacklistedAddress>,
    checkpoints: HashMap<String, u64>,
    rejected_blacklist: HashSet<Address>,
}

impl Tables {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

fn record(id: i64, transfer: &TokenTransfer, status: TransferStatus) -> TransferRecord {
    let now = Utc::now();
    TransferRecord {
        id,
        hash: transfer.hash,
        from: transfer.from,
        to: transfer.to,
        amount: transfer.amount,
        block_number: transfer.block_number,
        timestamp: transfer.timestamp,
        analyzed: false,
        status,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn transfer_count(&self) -> usize {
        self.tables().transfers.len()
    }

    pub fn live_pending_count(&self) -> usize {
        self.tables()
            .pending
            .iter()
            .filter(|p| p.deleted_at.is_none())
            .count()
    }

    pub fn suspicious_count(&self) -> usize {
        self.tables().suspicious.len()
    }

    pub fn violation_count(&self) -> usize {
        self.tables().violations.len()
    }

    /// Make `record_blacklisted` fail for `address`.
    pub fn reject_blacklist_writes(&self, address: Address) {
        self.tables().rejected_blacklist.insert(address);
    }

    /// Backdate a pending row's creation time.
    pub fn age_pending(&self, hash: B256, created_at: DateTime<Utc>) {
        let mut t = self.tables();
        for p in t.pending.iter_mut().filter(|p| p.hash == hash) {
            p.created_at = created_at;
        }
    }
}

fn unanalyzed(rows: &[TransferRecord], limit: i64) -> Vec<TransferRecord> {
    let mut out: Vec<TransferRecord> = rows
        .iter()
        .filter(|r| !r.analyzed && r.deleted_at.is_none())
        .cloned()
        .collect();
    out.sort_by_key(|r| (r.block_number, r.id));
    out.truncate(usize::try_from(limit).unwrap_or(0));
    out
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_transfer(&self, transfer: &TokenTransfer) -> eyre::Result<bool> {
        let mut t = self.tables();
        if t.transfers.iter().any(|r| r.hash == transfer.hash) {
            return Ok(false);
        }
        let id = t.id();
        t.transfers
            .push(record(id, transfer, TransferStatus::Confirmed));
        Ok(true)
    }

    async fn upsert_pending(&self, transfer: &TokenTransfer) -> eyre::Result<bool> {
        let mut t = self.tables();
        if t.transfers.iter().any(|r| r.hash == transfer.hash)
            || t.pending.iter().any(|r| r.hash == transfer.hash)
        {
            return Ok(false);
        }
        let id = t.id();
        t.pending.push(record(id, transfer, TransferStatus::Pending));
        Ok(true)
    }

    async fn resolve_pending(&self, hash: B256) -> eyre::Result<bool> {
        let mut t = self.tables();
        let now = Utc::now();
        let mut resolved = false;
        for p in t
            .pending
            .iter_mut()
            .filter(|p| p.hash == hash && p.deleted_at.is_none())
        {
            p.deleted_at = Some(now);
            p.updated_at = now;
            resolved = true;
        }
        Ok(resolved)
    }

    async fn resolve_confirmed_pending(&self) -> eyre::Result<u64> {
        let mut t = self.tables();
        let now = Utc::now();
        let confirmed: Vec<B256> = t.transfers.iter().map(|r| r.hash).collect();
        let mut count = 0;
        for p in t
            .pending
            .iter_mut()
            .filter(|p| p.deleted_at.is_none() && confirmed.contains(&p.hash))
        {
            p.deleted_at = Some(now);
            p.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn reap_stale_pending(&self, cutoff: DateTime<Utc>) -> eyre::Result<u64> {
        let mut t = self.tables();
        let now = Utc::now();
        let mut count = 0;
        for p in t
            .pending
            .iter_mut()
            .filter(|p| p.deleted_at.is_none() && p.created_at < cutoff)
        {
            p.deleted_at = Some(now);
            p.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn mark_transfer_analyzed(&self, hash: B256) -> eyre::Result<()> {
        let mut t = self.tables();
        for r in t.transfers.iter_mut().filter(|r| r.hash == hash) {
            r.analyzed = true;
        }
        Ok(())
    }

    async fn mark_pending_analyzed(&self, hash: B256) -> eyre::Result<()> {
        let mut t = self.tables();
        for r in t
            .pending
            .iter_mut()
            .filter(|r| r.hash == hash && r.deleted_at.is_none())
        {
            r.analyzed = true;
        }
        Ok(())
    }

    async fn unanalyzed_transfers(&self, limit: i64) -> eyre::Result<Vec<TransferRecord>> {
        Ok(unanalyzed(&self.tables().transfers, limit))
    }

    async fn unanalyzed_pending(&self, limit: i64) -> eyre::Result<Vec<TransferRecord>> {
        Ok(unanalyzed(&self.tables().pending, limit))
    }

    async fn find_transfer(&self, hash: B256) -> eyre::Result<Option<TransferRecord>> {
        Ok(self
            .tables()
            .transfers
            .iter()
            .find(|r| r.hash == hash && r.deleted_at.is_none())
            .cloned())
    }

    async fn find_pending(&self, hash: B256) -> eyre::Result<Option<TransferRecord>> {
        Ok(self
            .tables()
            .pending
            .iter()
            .find(|r| r.hash == hash && r.deleted_at.is_none())
            .cloned())
    }

    async fn latest_block(&self) -> eyre::Result<Option<u64>> {
        let t = self.tables();
        Ok(t.transfers
            .iter()
            .chain(&t.pending)
            .filter(|r| r.deleted_at.is_none())
            .map(|r| r.block_number)
            .max())
    }

    async fn recent_transfers(&self, since_block: u64) -> eyre::Result<Vec<TransferRecord>> {
        let t = self.tables();
        let live = |rows: &[TransferRecord]| {
            let mut out: Vec<TransferRecord> = rows
                .iter()
                .filter(|r| r.deleted_at.is_none() && r.block_number >= since_block)
                .cloned()
                .collect();
            out.sort_by_key(|r| (r.block_number, r.id));
            out
        };
        let mut rows = live(&t.transfers);
        rows.extend(live(&t.pending));
        Ok(rows)
    }

    async fn active_rules(&self) -> eyre::Result<Vec<Rule>> {
        Ok(self
            .tables()
            .rules
            .iter()
            .filter(|r| r.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn seed_rule(&self, rule: &NewRule) -> eyre::Result<bool> {
        let mut t = self.tables();
        if t.rules.iter().any(|r| r.name == rule.name) {
            return Ok(false);
        }
        let id = t.id();
        let now = Utc::now();
        t.rules.push(Rule {
            id,
            name: rule.name.clone(),
            description: rule.description.clone(),
            status: rule.status.clone(),
            severity: rule.severity.clone(),
            parameters: rule.parameters.clone(),
            actions: rule.actions.clone(),
            violations: 0,
            last_violation_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        });
        Ok(true)
    }

    async fn record_violation(&self, violation: &Violation) -> eyre::Result<bool> {
        let mut t = self.tables();
        let rule_name = violation.rule.as_str();
        if t
            .suspicious
            .iter()
            .any(|(s, _)| s.tx_hash == violation.tx_hash && s.rule_name == rule_name)
        {
            return Ok(false);
        }

        let now = Utc::now();
        let suspicious_id = t.id();
        t.suspicious.push((
            SuspiciousTransfer {
                id: suspicious_id,
                tx_hash: violation.tx_hash,
                from: violation.from,
                to: violation.to,
                amount: violation.amount,
                block_number: violation.block_number,
                timestamp: violation.timestamp,
                rule_name: rule_name.to_string(),
                severity: violation.severity.as_str().to_string(),
                reason: violation.reason().to_string(),
                flagged_address: violation.flagged_address,
                details: violation.details.clone(),
                enforcement_applied: false,
                created_at: now,
                updated_at: now,
                deleted_at: None,
            },
            violation.enforce,
        ));

        let rule_id = t.rules.iter_mut().find(|r| r.name == rule_name).map(|r| {
            r.violations += 1;
            r.last_violation_at = Some(now);
            r.id
        });

        let violation_id = t.id();
        t.violations.push(RuleViolation {
            id: violation_id,
            rule_id,
            rule_name: rule_name.to_string(),
            tx_hash: violation.tx_hash,
            block_number: violation.block_number,
            details: violation.details.clone(),
            action_taken: violation.action_taken(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        });
        Ok(true)
    }

    async fn suspicious_for_transfer(&self, hash: B256) -> eyre::Result<Vec<SuspiciousTransfer>> {
        Ok(self
            .tables()
            .suspicious
            .iter()
            .filter(|(s, _)| s.tx_hash == hash)
            .map(|(s, _)| s.clone())
            .collect())
    }

    async fn violations_for_transfer(&self, hash: B256) -> eyre::Result<Vec<RuleViolation>> {
        Ok(self
            .tables()
            .violations
            .iter()
            .filter(|v| v.tx_hash == hash)
            .cloned()
            .collect())
    }

    async fn unenforced_suspicious(&self, limit: i64) -> eyre::Result<Vec<SuspiciousTransfer>> {
        Ok(self
            .tables()
            .suspicious
            .iter()
            .filter(|(s, requested)| *requested && !s.enforcement_applied)
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|(s, _)| s.clone())
            .collect())
    }

    async fn find_blacklisted(&self, address: Address) -> eyre::Result<Option<BlacklistedAddress>> {
        Ok(self
            .tables()
            .blacklist
            .iter()
            .find(|b| b.address == address)
            .cloned())
    }

    async fn record_blacklisted(&self, entry: &NewBlacklistEntry) -> eyre::Result<bool> {
        let mut t = self.tables();
        if t.rejected_blacklist.contains(&entry.address) {
            return Err(eyre::eyre!("connection reset while writing blacklist row"));
        }
        if t.blacklist.iter().any(|b| b.address == entry.address) {
            return Ok(false);
        }
        let id = t.id();
        let now = Utc::now();
        t.blacklist.push(BlacklistedAddress {
            id,
            address: entry.address,
            tx_hash: entry.tx_hash,
            block_number: entry.block_number,
            reason: entry.reason.clone(),
            severity: entry.severity.clone(),
            details: entry.details.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        });
        Ok(true)
    }

    async fn mark_enforced(&self, address: Address) -> eyre::Result<u64> {
        let mut t = self.tables();
        let now = Utc::now();
        let mut count = 0;
        for (s, _) in t
            .suspicious
            .iter_mut()
            .filter(|(s, _)| s.flagged_address == address && !s.enforcement_applied)
        {
            s.enforcement_applied = true;
            s.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn checkpoint(&self, watcher: &str) -> eyre::Result<Option<u64>> {
        Ok(self.tables().checkpoints.get(watcher).copied())
    }

    async fn save_checkpoint(&self, watcher: &str, block: u64) -> eyre::Result<()> {
        let mut t = self.tables();
        let entry = t.checkpoints.entry(watcher.to_string()).or_insert(block);
        *entry = (*entry).max(block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;

    fn transfer(byte: u8, status: TransferStatus) -> TokenTransfer {
        TokenTransfer {
            hash: B256::repeat_byte(byte),
            from: Address::repeat_byte(1),
            to: Address::repeat_byte(2),
            amount: U256::from(10u64),
            block_number: 100,
            timestamp: Utc::now(),
            status,
        }
    }

    #[tokio::test]
    async fn test_pending_suppressed_once_confirmed() {
        let store = MemoryStore::new();
        assert!(store.upsert_transfer(&transfer(9, TransferStatus::Confirmed)).await.unwrap());
        assert!(!store.upsert_pending(&transfer(9, TransferStatus::Pending)).await.unwrap());
        assert_eq!(store.live_pending_count(), 0);
    }

    #[tokio::test]
    async fn test_recent_transfers_skip_old_and_expired_rows() {
        let store = MemoryStore::new();
        assert_eq!(store.latest_block().await.unwrap(), None);

        let mut old = transfer(1, TransferStatus::Confirmed);
        old.block_number = 80;
        store.upsert_transfer(&old).await.unwrap();
        store.upsert_transfer(&transfer(2, TransferStatus::Confirmed)).await.unwrap();

        let mut pending = transfer(3, TransferStatus::Pending);
        pending.block_number = 104;
        store.upsert_pending(&pending).await.unwrap();
        let mut expired = transfer(4, TransferStatus::Pending);
        expired.block_number = 110;
        store.upsert_pending(&expired).await.unwrap();
        store.age_pending(expired.hash, Utc::now() - chrono::Duration::hours(2));
        store
            .reap_stale_pending(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(store.latest_block().await.unwrap(), Some(104));
        let recent: Vec<(B256, TransferStatus)> = store
            .recent_transfers(90)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.hash, r.status))
            .collect();
        assert_eq!(
            recent,
            vec![
                (B256::repeat_byte(2), TransferStatus::Confirmed),
                (B256::repeat_byte(3), TransferStatus::Pending),
            ]
        );
    }

    #[tokio::test]
    async fn test_checkpoint_never_moves_backwards() {
        let store = MemoryStore::new();
        store.save_checkpoint("confirmed", 50).await.unwrap();
        store.save_checkpoint("confirmed", 40).await.unwrap();
        assert_eq!(store.checkpoint("confirmed").await.unwrap(), Some(50));
        assert_eq!(store.checkpoint("other").await.unwrap(), None);
    }
}
