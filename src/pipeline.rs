use std::sync::Arc;

use crate::anomaly::engine::WindowAnalyzer;
use crate::db::Store;
use crate::indexer::types::TokenTransfer;

/// What ingesting one transfer did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestResult {
    pub persisted: bool,
    pub resolved_pending: bool,
    pub violations: usize,
}

/// Shared ingestion path for both watchers: persist idempotently, reconcile
/// the pending table, then hand the transfer to the analyzer.
#[derive(Clone)]
pub struct TransferPipeline {
    store: Arc<dyn Store>,
    analyzer: Arc<WindowAnalyzer>,
}

impl TransferPipeline {
    pub fn new(store: Arc<dyn Store>, analyzer: Arc<WindowAnalyzer>) -> Self {
        Self { store, analyzer }
    }

    /// A transfer seen in the mempool. Skipped entirely when its hash is
    /// already known, either as confirmed or as an earlier sighting.
    pub async fn ingest_pending(&self, transfer: &TokenTransfer) -> eyre::Result<IngestResult> {
        if !self.store.upsert_pending(transfer).await? {
            tracing::debug!(hash = %transfer.hash, "Pending transfer already known");
            return Ok(IngestResult::default());
        }

        let violations = self.analyzer.observe(transfer).await?;
        Ok(IngestResult {
            persisted: true,
            resolved_pending: false,
            violations,
        })
    }

    /// A transfer mined in a block. Re-delivery of a known hash persists
    /// nothing new and records no new violations.
    pub async fn ingest_confirmed(&self, transfer: &TokenTransfer) -> eyre::Result<IngestResult> {
        let persisted = self.store.upsert_transfer(transfer).await?;
        let resolved_pending = self.store.resolve_pending(transfer.hash).await?;
        if resolved_pending {
            tracing::debug!(hash = %transfer.hash, block = transfer.block_number, "Pending transfer confirmed");
        }

        if !persisted {
            tracing::debug!(hash = %transfer.hash, "Confirmed transfer already stored");
            return Ok(IngestResult {
                persisted,
                resolved_pending,
                violations: 0,
            });
        }

        let violations = self.analyzer.observe(transfer).await?;
        Ok(IngestResult {
            persisted,
            resolved_pending,
            violations,
        })
    }

    /// Ingest a batch of confirmed transfers, logging per-transfer failures.
    /// Returns how many transfers failed so the caller can decide whether to
    /// advance its checkpoint.
    pub async fn ingest_confirmed_batch(&self, transfers: &[TokenTransfer]) -> usize {
        let mut failed = 0;
        for transfer in transfers {
            if let Err(e) = self.ingest_confirmed(transfer).await {
                tracing::error!(
                    hash = %transfer.hash,
                    block = transfer.block_number,
                    error = %e,
                    "Failed to ingest confirmed transfer"
                );
                failed += 1;
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Thresholds;
    use crate::db::memory::MemoryStore;
    use crate::indexer::types::TransferStatus;
    use crate::rules::registry::seed_rules;
    use crate::watchlist::Watchlist;
    use alloy::primitives::{Address, B256, U256};
    use chrono::Utc;

    fn thresholds() -> Thresholds {
        Thresholds {
            large_amount: U256::from(1000u64),
            outgoing_window_blocks: 10,
            outgoing_count: 5,
            incoming_window_blocks: 10,
            incoming_amount: U256::from(1000u64),
        }
    }

    async fn pipeline() -> (Arc<MemoryStore>, TransferPipeline) {
        let store = Arc::new(MemoryStore::new());
        seed_rules(store.as_ref(), &thresholds(), &[]).await.unwrap();
        let analyzer = Arc::new(WindowAnalyzer::new(
            store.clone(),
            thresholds(),
            Watchlist::new(),
            None,
            100,
        ));
        analyzer.refresh_rules().await.unwrap();
        (store.clone(), TransferPipeline::new(store, analyzer))
    }

    fn transfer(amount: u64, block: u64, status: TransferStatus) -> TokenTransfer {
        TokenTransfer {
            hash: B256::repeat_byte(0x42),
            from: Address::repeat_byte(0x01),
            to: Address::repeat_byte(0x02),
            amount: U256::from(amount),
            block_number: block,
            timestamp: Utc::now(),
            status,
        }
    }

    #[tokio::test]
    async fn test_replayed_confirmed_transfer_is_idempotent() {
        let (store, pipeline) = pipeline().await;
        let t = transfer(5000, 10, TransferStatus::Confirmed);

        let first = pipeline.ingest_confirmed(&t).await.unwrap();
        assert!(first.persisted);
        assert_eq!(first.violations, 2);

        let second = pipeline.ingest_confirmed(&t).await.unwrap();
        assert_eq!(second, IngestResult::default());

        assert_eq!(store.transfer_count(), 1);
        assert_eq!(store.suspicious_count(), 2);
        assert_eq!(store.violation_count(), 2);
    }

    #[tokio::test]
    async fn test_pending_then_confirmed_leaves_one_confirmed_row() {
        let (store, pipeline) = pipeline().await;

        let pending = transfer(5000, 9, TransferStatus::Pending);
        let seen = pipeline.ingest_pending(&pending).await.unwrap();
        assert!(seen.persisted);
        assert_eq!(store.live_pending_count(), 1);

        let confirmed = transfer(5000, 11, TransferStatus::Confirmed);
        let mined = pipeline.ingest_confirmed(&confirmed).await.unwrap();
        assert!(mined.persisted);
        assert!(mined.resolved_pending);
        // Violations from the pending sighting are not duplicated
        assert_eq!(mined.violations, 0);

        assert_eq!(store.transfer_count(), 1);
        assert_eq!(store.live_pending_count(), 0);
        let row = store.find_transfer(confirmed.hash).await.unwrap().unwrap();
        assert_eq!(row.status, TransferStatus::Confirmed);
        assert_eq!(row.block_number, 11);
        assert_eq!(store.suspicious_count(), 2);
    }

    #[tokio::test]
    async fn test_pending_after_confirmed_is_ignored() {
        let (store, pipeline) = pipeline().await;
        pipeline
            .ingest_confirmed(&transfer(1, 11, TransferStatus::Confirmed))
            .await
            .unwrap();

        let late = pipeline
            .ingest_pending(&transfer(1, 12, TransferStatus::Pending))
            .await
            .unwrap();
        assert!(!late.persisted);
        assert_eq!(store.live_pending_count(), 0);
    }

    #[tokio::test]
    async fn test_confirmed_move_keeps_window_single_entry() {
        let (_store, pipeline) = pipeline().await;
        pipeline
            .ingest_pending(&transfer(1, 9, TransferStatus::Pending))
            .await
            .unwrap();
        pipeline
            .ingest_confirmed(&transfer(1, 11, TransferStatus::Confirmed))
            .await
            .unwrap();

        let activity = pipeline
            .analyzer
            .windows()
            .activity(Address::repeat_byte(0x01))
            .await
            .unwrap();
        let snapshot = activity.outgoing.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, 11);
    }
}
