use alloy::consensus::Transaction as _;
use alloy::primitives::{Address, B256};
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use chrono::Utc;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{ChainConfig, PendingConfig};
use crate::db::Store;
use crate::indexer::chain::{reconnect_loop, Backoff};
use crate::indexer::decoder;
use crate::indexer::types::{TokenTransfer, TransferStatus};
use crate::pipeline::TransferPipeline;

/// Follows the node's pending-transaction feed for calls into the token contract.
pub struct PendingWatcher {
    chain: ChainConfig,
    settings: PendingConfig,
    ws_url: String,
    token: Address,
    store: Arc<dyn Store>,
    pipeline: TransferPipeline,
}

impl PendingWatcher {
    pub fn new(
        chain: ChainConfig,
        settings: PendingConfig,
        store: Arc<dyn Store>,
        pipeline: TransferPipeline,
    ) -> eyre::Result<Self> {
        let token = chain.token()?;
        let ws_url = chain
            .rpc_ws
            .clone()
            .ok_or_else(|| eyre::eyre!("Pending watcher requires chain.rpc_ws"))?;
        Ok(Self {
            chain,
            settings,
            ws_url,
            token,
            store,
            pipeline,
        })
    }

    /// Follow the mempool and reap orphaned pending rows until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(chain = %self.chain.name, token = %self.token, "Starting pending watcher");
        let backoff = Backoff::from_config(&self.chain);
        tokio::join!(
            reconnect_loop("pending", backoff, &shutdown, |healthy| self.session(healthy)),
            self.reap_loop(&shutdown),
        );
    }

    async fn session(&self, healthy: Arc<AtomicBool>) -> eyre::Result<()> {
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(self.ws_url.as_str()))
            .await?;
        let mut stream = provider.subscribe_pending_transactions().await?.into_stream();

        tracing::info!(chain = %self.chain.name, "Pending transaction subscription active");
        healthy.store(true, Ordering::Release);

        while let Some(hash) = stream.next().await {
            if let Err(e) = self.handle_pending(&provider, hash).await {
                tracing::warn!(chain = %self.chain.name, hash = %hash, error = %e, "Failed to handle pending transaction");
            }
        }

        tracing::warn!(chain = %self.chain.name, "Pending transaction stream ended");
        Ok(())
    }

    async fn handle_pending<P: Provider>(&self, provider: &P, hash: B256) -> eyre::Result<()> {
        // Dropped or already mined before we asked.
        let Some(tx) = provider.get_transaction_by_hash(hash).await? else {
            return Ok(());
        };
        if tx.to() != Some(self.token) {
            return Ok(());
        }

        let sender = tx.inner.signer();
        let Some(call) = decoder::decode_transfer_call(tx.input(), sender) else {
            tracing::debug!(hash = %hash, "Call to token is not a transfer, skipping");
            return Ok(());
        };

        let tip = provider.get_block_number().await?;
        let transfer = TokenTransfer {
            hash,
            from: call.from,
            to: call.to,
            amount: call.amount,
            block_number: tip,
            timestamp: Utc::now(),
            status: TransferStatus::Pending,
        };

        let result = self.pipeline.ingest_pending(&transfer).await?;
        if result.persisted {
            tracing::debug!(
                hash = %hash,
                from = %transfer.from,
                to = %transfer.to,
                amount = %transfer.amount,
                provisional_block = tip,
                violations = result.violations,
                "Pending transfer observed"
            );
        }
        Ok(())
    }

    async fn reap_loop(&self, shutdown: &CancellationToken) {
        let timeout = Duration::from_secs(self.settings.timeout_secs);
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.settings.reap_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = reap_orphans(self.store.as_ref(), timeout).await {
                tracing::error!(error = %e, "Failed to reap stale pending transfers");
            }
        }
    }
}

/// Expire pending rows that were never confirmed within `timeout`.
pub async fn reap_orphans(store: &dyn Store, timeout: Duration) -> eyre::Result<u64> {
    let age = chrono::Duration::from_std(timeout)
        .map_err(|e| eyre::eyre!("Invalid pending timeout: {}", e))?;
    let reaped = store.reap_stale_pending(Utc::now() - age).await?;
    if reaped > 0 {
        tracing::info!(reaped, timeout_secs = timeout.as_secs(), "Expired orphaned pending transfers");
    }
    Ok(reaped)
}
