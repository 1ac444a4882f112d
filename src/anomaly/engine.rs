use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::Thresholds;
use crate::db::Store;
use crate::indexer::types::TokenTransfer;
use crate::watchlist::Watchlist;

use super::rules::{self, RuleSet};
use super::types::{EnforcementRequest, Violation};
use super::window::{Direction, WindowBook};

/// Counts from one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub transfers: usize,
    pub pending: usize,
    pub violations: usize,
    pub resolved_pending: u64,
    pub pruned_addresses: usize,
}

/// Evaluates compliance rules per transfer over per-address block windows.
pub struct WindowAnalyzer {
    store: Arc<dyn Store>,
    defaults: Thresholds,
    watchlist: Watchlist,
    whitelist: Watchlist,
    rules: RwLock<RuleSet>,
    windows: WindowBook,
    warmed: AtomicBool,
    enforcement: Option<mpsc::Sender<EnforcementRequest>>,
    sweep_batch_size: i64,
}

impl WindowAnalyzer {
    pub fn new(
        store: Arc<dyn Store>,
        defaults: Thresholds,
        watchlist: Watchlist,
        enforcement: Option<mpsc::Sender<EnforcementRequest>>,
        sweep_batch_size: i64,
    ) -> Self {
        let windows = WindowBook::new(defaults.outgoing_window_blocks, defaults.incoming_window_blocks);
        Self {
            store,
            defaults,
            watchlist,
            whitelist: Watchlist::new(),
            rules: RwLock::new(RuleSet::default()),
            windows,
            warmed: AtomicBool::new(false),
            enforcement,
            sweep_batch_size,
        }
    }

    /// Transfers touching any of these addresses are never flagged.
    pub fn with_whitelist(mut self, whitelist: Watchlist) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn windows(&self) -> &WindowBook {
        &self.windows
    }

    /// Reload the rule set from the store.
    pub async fn refresh_rules(&self) -> eyre::Result<()> {
        let rows = self.store.active_rules().await?;
        let fresh = RuleSet::from_rows(&rows, &self.defaults, &self.watchlist);

        let mut current = self.rules.write().await;
        let ranges = [
            (
                "multiple-outgoing",
                Direction::Outgoing,
                fresh.outgoing.as_ref().and_then(|r| r.block_range),
                current.outgoing.as_ref().and_then(|r| r.block_range),
            ),
            (
                "multiple-incoming",
                Direction::Incoming,
                fresh.incoming.as_ref().and_then(|r| r.block_range),
                current.incoming.as_ref().and_then(|r| r.block_range),
            ),
        ];
        for (rule, direction, stored, previous) in ranges {
            let width = self.windows.width(direction);
            if let Some(stored) = stored {
                if stored != width && previous != Some(stored) {
                    tracing::warn!(
                        rule,
                        block_range = stored,
                        active_width = width,
                        "Rule block_range differs from the running window width; restart to apply"
                    );
                }
            }
        }

        *current = fresh;
        Ok(())
    }

    /// Rebuild the windows from persisted transfers within the widest window
    /// of the latest stored block. No rules are evaluated. Returns how many
    /// transfers were loaded.
    pub async fn warm_up(&self) -> eyre::Result<usize> {
        let Some(latest) = self.store.latest_block().await? else {
            self.warmed.store(true, Ordering::Release);
            return Ok(0);
        };

        let reach = self
            .windows
            .width(Direction::Outgoing)
            .max(self.windows.width(Direction::Incoming));
        let since = latest.saturating_sub(reach);
        let records = self.store.recent_transfers(since).await?;
        for record in &records {
            let transfer = record.to_transfer();
            self.windows.record(&transfer, Direction::Outgoing).await;
            self.windows.record(&transfer, Direction::Incoming).await;
        }

        self.warmed.store(true, Ordering::Release);
        tracing::info!(
            transfers = records.len(),
            from_block = since,
            to_block = latest,
            "Window history restored"
        );
        Ok(records.len())
    }

    /// Evaluate every rule against one transfer, record violations, enqueue
    /// enforcement, and mark the transfer analyzed. Returns how many violations
    /// were newly recorded.
    pub async fn observe(&self, transfer: &TokenTransfer) -> eyre::Result<usize> {
        let violations = self.evaluate(transfer).await;

        let mut recorded = 0;
        for violation in &violations {
            if !self.store.record_violation(violation).await? {
                continue;
            }
            recorded += 1;
            tracing::warn!(
                rule = violation.rule.as_str(),
                severity = violation.severity.as_str(),
                hash = %violation.tx_hash,
                block = violation.block_number,
                flagged = %violation.flagged_address,
                status = transfer.status.as_str(),
                "Rule violation"
            );
            if violation.enforce {
                self.enqueue(violation);
            }
        }

        if transfer.is_pending() {
            self.store.mark_pending_analyzed(transfer.hash).await?;
        } else {
            self.store.mark_transfer_analyzed(transfer.hash).await?;
        }

        Ok(recorded)
    }

    async fn evaluate(&self, transfer: &TokenTransfer) -> Vec<Violation> {
        // Windows are kept up to date even while a window rule is disabled.
        let outgoing = self.windows.record(transfer, Direction::Outgoing).await;
        let incoming = self.windows.record(transfer, Direction::Incoming).await;

        if self.whitelist.contains(&transfer.from) || self.whitelist.contains(&transfer.to) {
            tracing::debug!(hash = %transfer.hash, "Whitelisted address involved, rules skipped");
            return Vec::new();
        }

        let rules = self.rules.read().await;
        let mut violations = rules.check_immediate(transfer);

        if let (Some(rule), Some(span)) = (&rules.outgoing, outgoing) {
            let width = self.windows.width(Direction::Outgoing);
            violations.extend(rules::check_multiple_outgoing(transfer, rule, span, width));
        }
        if let (Some(rule), Some(span)) = (&rules.incoming, incoming) {
            let width = self.windows.width(Direction::Incoming);
            violations.extend(rules::check_multiple_incoming(transfer, rule, span, width));
        }
        if outgoing.is_none() || incoming.is_none() {
            tracing::debug!(
                hash = %transfer.hash,
                block = transfer.block_number,
                max_block_seen = self.windows.max_block_seen(),
                "Transfer below window horizon, window rules skipped"
            );
        }

        violations
    }

    fn enqueue(&self, violation: &Violation) {
        let Some(tx) = &self.enforcement else {
            return;
        };
        let request = EnforcementRequest {
            address: violation.flagged_address,
            reason: violation.reason().to_string(),
            severity: violation.severity,
        };
        match tx.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(request)) => {
                tracing::warn!(
                    address = %request.address,
                    "Enforcement queue full, request left for store discovery"
                );
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                tracing::debug!(address = %request.address, "Enforcement queue closed");
            }
        }
    }

    /// One batch pass over persisted transfers that have not been analyzed yet.
    pub async fn sweep(&self) -> eyre::Result<SweepReport> {
        if !self.warmed.load(Ordering::Acquire) {
            self.warm_up().await?;
        }
        self.refresh_rules().await?;

        let mut report = SweepReport {
            resolved_pending: self.store.resolve_confirmed_pending().await?,
            ..SweepReport::default()
        };

        for record in self.store.unanalyzed_transfers(self.sweep_batch_size).await? {
            match self.observe(&record.to_transfer()).await {
                Ok(n) => {
                    report.transfers += 1;
                    report.violations += n;
                }
                Err(e) => {
                    tracing::error!(hash = %record.hash, error = %e, "Failed to analyze transfer");
                }
            }
        }

        for record in self.store.unanalyzed_pending(self.sweep_batch_size).await? {
            match self.observe(&record.to_transfer()).await {
                Ok(n) => {
                    report.pending += 1;
                    report.violations += n;
                }
                Err(e) => {
                    tracing::error!(hash = %record.hash, error = %e, "Failed to analyze pending transfer");
                }
            }
        }

        report.pruned_addresses = self.windows.prune().await;
        Ok(report)
    }

    /// Sweep every `interval` until cancelled.
    pub async fn run_sweep_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = interval.as_secs(), "Analyzer sweep loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.sweep() => match result {
                    Ok(report) if report.transfers + report.pending > 0 => {
                        tracing::info!(
                            transfers = report.transfers,
                            pending = report.pending,
                            violations = report.violations,
                            resolved_pending = report.resolved_pending,
                            "Sweep complete"
                        );
                    }
                    Ok(report) => {
                        tracing::debug!(pruned = report.pruned_addresses, "Sweep found nothing to analyze");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Sweep failed");
                    }
                },
            }
        }

        tracing::info!("Analyzer sweep loop stopped");
    }
}
