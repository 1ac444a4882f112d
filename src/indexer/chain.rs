use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{BlockNumberOrTag, Filter};
use alloy::sol_types::SolEvent;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::ChainConfig;
use crate::db::Store;
use crate::indexer::decoder::{self, Transfer};
use crate::pipeline::TransferPipeline;

/// Checkpoint name of the confirmed watcher in `watcher_state`.
pub const CONFIRMED_CHECKPOINT: &str = "confirmed";

/// Reconnect delay that doubles on every failure up to a cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    pub fn from_config(config: &ChainConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_initial_ms),
            Duration::from_millis(config.reconnect_max_ms),
        )
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Run `session` until cancelled, reconnecting with backoff whenever it fails
/// or ends. `session` sets the flag once it has made progress, which resets
/// the backoff.
pub async fn reconnect_loop<F, Fut>(
    name: &str,
    mut backoff: Backoff,
    shutdown: &CancellationToken,
    mut session: F,
) where
    F: FnMut(Arc<AtomicBool>) -> Fut,
    Fut: std::future::Future<Output = eyre::Result<()>>,
{
    while !shutdown.is_cancelled() {
        let healthy = Arc::new(AtomicBool::new(false));
        let result = tokio::select! {
            r = session(healthy.clone()) => r,
            _ = shutdown.cancelled() => break,
        };

        if healthy.load(Ordering::Acquire) {
            backoff.reset();
        }
        let delay = backoff.next_delay();
        match result {
            Ok(()) => tracing::warn!(
                watcher = name,
                delay_ms = delay.as_millis() as u64,
                "Subscription ended, reconnecting"
            ),
            Err(e) => tracing::warn!(
                watcher = name,
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "Watcher session failed, reconnecting"
            ),
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    tracing::info!(watcher = name, "Watcher stopped");
}

/// Follows mined blocks and ingests every Transfer log of the monitored token.
pub struct ConfirmedWatcher {
    config: ChainConfig,
    token: Address,
    store: Arc<dyn Store>,
    pipeline: TransferPipeline,
}

impl ConfirmedWatcher {
    pub fn new(
        config: ChainConfig,
        store: Arc<dyn Store>,
        pipeline: TransferPipeline,
    ) -> eyre::Result<Self> {
        let token = config.token()?;
        Ok(Self {
            config,
            token,
            store,
            pipeline,
        })
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(chain = %self.config.name, token = %self.token, "Starting confirmed watcher");
        let backoff = Backoff::from_config(&self.config);
        reconnect_loop("confirmed", backoff, &shutdown, |healthy| self.session(healthy)).await;
    }

    /// One connection lifetime: catch up from the checkpoint, then follow the head.
    async fn session(&self, healthy: Arc<AtomicBool>) -> eyre::Result<()> {
        let provider = ProviderBuilder::new().connect_http(
            self.config
                .rpc_http
                .parse()
                .map_err(|e| eyre::eyre!("Invalid RPC URL: {}", e))?,
        );

        let tip = retry_rpc(|| provider.get_block_number()).await?;
        let next = self.resume_block(tip).await?;
        if next <= tip {
            tracing::info!(chain = %self.config.name, from = next, to = tip, "Catching up");
            self.catch_up(&provider, next, tip, &healthy).await?;
        }

        if let Some(ws_url) = &self.config.rpc_ws {
            match self.follow_ws(ws_url, &healthy).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        chain = %self.config.name,
                        error = %e,
                        "WebSocket subscription failed, falling back to HTTP polling"
                    );
                }
            }
        }

        self.follow_http(&provider, &healthy).await
    }

    /// First block not yet processed: after the checkpoint, else the configured
    /// start block, else the current tip.
    async fn resume_block(&self, tip: u64) -> eyre::Result<u64> {
        Ok(match self.store.checkpoint(CONFIRMED_CHECKPOINT).await? {
            Some(last) => last + 1,
            None => self.config.start_block.unwrap_or(tip),
        })
    }

    async fn catch_up<P: Provider>(
        &self,
        provider: &P,
        from: u64,
        to: u64,
        healthy: &AtomicBool,
    ) -> eyre::Result<()> {
        let batch = self.config.log_batch_size.max(1);
        let mut current = from;
        while current <= to {
            let end = std::cmp::min(current.saturating_add(batch - 1), to);
            self.process_range(provider, current, end, None).await?;
            healthy.store(true, Ordering::Release);
            current = end + 1;
        }
        Ok(())
    }

    async fn follow_ws(&self, ws_url: &str, healthy: &AtomicBool) -> eyre::Result<()> {
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(ws_url))
            .await?;
        let mut stream = provider.subscribe_blocks().await?.into_stream();

        tracing::info!(chain = %self.config.name, "WebSocket block subscription active");

        while let Some(header) = stream.next().await {
            let next = self.resume_block(header.number).await?;
            if header.number < next {
                continue;
            }

            let timestamp = DateTime::from_timestamp(header.timestamp as i64, 0);
            if header.number - next >= self.config.log_batch_size {
                // Missed heads: fetch the gap in batches first.
                self.catch_up(&provider, next, header.number - 1, healthy).await?;
                self.process_range(&provider, header.number, header.number, timestamp.map(|t| (header.number, t)))
                    .await?;
            } else {
                self.process_range(&provider, next, header.number, timestamp.map(|t| (header.number, t)))
                    .await?;
            }
            healthy.store(true, Ordering::Release);
        }

        tracing::warn!(chain = %self.config.name, "Block stream ended");
        Ok(())
    }

    async fn follow_http<P: Provider>(&self, provider: &P, healthy: &AtomicBool) -> eyre::Result<()> {
        let poll_interval = self.config.poll_interval();
        tracing::info!(
            chain = %self.config.name,
            poll_interval_ms = self.config.poll_interval_ms,
            "HTTP polling active"
        );

        loop {
            tokio::time::sleep(poll_interval).await;

            let tip = retry_rpc(|| provider.get_block_number()).await?;
            let next = self.resume_block(tip).await?;
            if next <= tip {
                self.catch_up(provider, next, tip, healthy).await?;
            }
        }
    }

    /// Fetch, decode and ingest the token's Transfer logs in `[from, to]`, then
    /// advance the checkpoint. `known` carries a timestamp already in hand.
    async fn process_range<P: Provider>(
        &self,
        provider: &P,
        from: u64,
        to: u64,
        known: Option<(u64, DateTime<Utc>)>,
    ) -> eyre::Result<()> {
        let filter = Filter::new()
            .address(self.token)
            .event_signature(Transfer::SIGNATURE_HASH)
            .from_block(from)
            .to_block(to);

        let logs = retry_rpc(|| provider.get_logs(&filter)).await?;

        let mut timestamps: HashMap<u64, DateTime<Utc>> = known.into_iter().collect();
        let mut transfers = Vec::with_capacity(logs.len());
        for log in &logs {
            let Some(decoded) = decoder::decode_transfer_log(log, self.token) else {
                if !log.removed {
                    tracing::warn!(
                        chain = %self.config.name,
                        tx = ?log.transaction_hash,
                        block = ?log.block_number,
                        "Skipping undecodable Transfer log"
                    );
                }
                continue;
            };

            let block_num = decoded.block_number;
            if !timestamps.contains_key(&block_num) {
                let block = retry_rpc(|| async {
                    provider
                        .get_block_by_number(BlockNumberOrTag::Number(block_num))
                        .await
                })
                .await?;
                let ts = block
                    .and_then(|b| DateTime::from_timestamp(b.header.timestamp as i64, 0))
                    .unwrap_or_else(Utc::now);
                timestamps.insert(block_num, ts);
            }

            let timestamp = timestamps.get(&block_num).copied().unwrap_or_else(Utc::now);
            transfers.push(decoded.into_transfer(timestamp));
        }

        let failed = self.pipeline.ingest_confirmed_batch(&transfers).await;
        if failed > 0 {
            return Err(eyre::eyre!(
                "{} of {} transfers in blocks {}..={} failed to ingest",
                failed,
                transfers.len(),
                from,
                to
            ));
        }

        self.store.save_checkpoint(CONFIRMED_CHECKPOINT, to).await?;

        if transfers.is_empty() {
            tracing::debug!(chain = %self.config.name, from, to, "Processed blocks");
        } else {
            tracing::info!(
                chain = %self.config.name,
                from,
                to,
                transfers = transfers.len(),
                "Processed blocks"
            );
        }
        Ok(())
    }
}

/// Retry an async operation with exponential backoff.
/// Handles transient RPC errors (rate limits, network issues).
pub async fn retry_rpc<F, Fut, T, E>(mut f: F) -> eyre::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = Duration::from_millis(500);
    let max_retries = 5;

    for attempt in 0..max_retries {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                tracing::warn!(
                    attempt = attempt + 1,
                    max_retries,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "RPC call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(30));
            }
        }
    }

    f().await.map_err(|e| eyre::eyre!("RPC call failed after {} retries: {}", max_retries, e))
}
