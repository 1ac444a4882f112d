use alloy::primitives::Address;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::anomaly::types::{EnforcementRequest, Severity};
use crate::db::models::NewBlacklistEntry;
use crate::db::Store;

use super::submitter::{RestrictionSubmitter, Submission};

/// Rows pulled from the store per cycle when discovering unenforced violations.
const DISCOVERY_LIMIT: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingRestriction {
    reason: String,
    severity: Severity,
}

/// Counts from one enforcement cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Addresses found already blacklisted and settled without a chain call.
    pub settled: usize,
    pub submitted: usize,
    pub failed: usize,
    /// Submitted addresses whose outcome could not be written to the store.
    pub unrecorded: usize,
}

/// Restricts flagged addresses on-chain, at most once per address.
///
/// Work comes from the analyzer's queue and from unenforced rows in the
/// store; both converge on the same blacklist check before anything is sent.
pub struct EnforcementEngine {
    store: Arc<dyn Store>,
    submitter: Arc<dyn RestrictionSubmitter>,
    batch_size: usize,
    retry_interval: Duration,
    pending: BTreeMap<Address, PendingRestriction>,
}

impl EnforcementEngine {
    pub fn new(
        store: Arc<dyn Store>,
        submitter: Arc<dyn RestrictionSubmitter>,
        batch_size: usize,
        retry_interval: Duration,
    ) -> Self {
        Self {
            store,
            submitter,
            batch_size: batch_size.max(1),
            retry_interval,
            pending: BTreeMap::new(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Add a request to the pending set, keeping the highest severity seen.
    pub fn queue(&mut self, request: EnforcementRequest) {
        let entry = self
            .pending
            .entry(request.address)
            .or_insert_with(|| PendingRestriction {
                reason: request.reason.clone(),
                severity: request.severity,
            });
        if request.severity > entry.severity {
            entry.severity = request.severity;
            entry.reason = request.reason;
        }
    }

    async fn discover(&mut self) -> eyre::Result<()> {
        for row in self.store.unenforced_suspicious(DISCOVERY_LIMIT).await? {
            let severity = Severity::parse(&row.severity).unwrap_or(Severity::High);
            self.queue(EnforcementRequest {
                address: row.flagged_address,
                reason: row.reason,
                severity,
            });
        }
        Ok(())
    }

    /// Settle or submit everything pending. Failed batches stay pending.
    pub async fn cycle(&mut self) -> eyre::Result<CycleReport> {
        self.discover().await?;

        let mut report = CycleReport::default();
        if self.pending.is_empty() {
            return Ok(report);
        }

        let mut to_submit = Vec::new();
        let candidates: Vec<Address> = self.pending.keys().copied().collect();
        for address in candidates {
            if let Some(existing) = self.store.find_blacklisted(address).await? {
                let marked = self.store.mark_enforced(address).await?;
                self.pending.remove(&address);
                report.settled += 1;
                tracing::info!(
                    address = %address,
                    tx = %existing.tx_hash,
                    rows = marked,
                    "Address already blacklisted, no submission needed"
                );
            } else {
                to_submit.push(address);
            }
        }

        for batch in to_submit.chunks(self.batch_size) {
            let submission = match self.submitter.submit(batch).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(
                        addresses = batch.len(),
                        error = %e,
                        "Restriction submission failed, will retry"
                    );
                    report.failed += batch.len();
                    continue;
                }
            };

            tracing::info!(
                tx = %submission.tx_hash,
                block = submission.block_number,
                addresses = batch.len(),
                "Restriction transaction submitted"
            );

            for address in batch {
                let Some(request) = self.pending.get(address).cloned() else {
                    continue;
                };
                // A failed write leaves only this address pending.
                match self.record_enforced(*address, &request, &submission, batch).await {
                    Ok(marked) => {
                        self.pending.remove(address);
                        report.submitted += 1;
                        tracing::info!(
                            address = %address,
                            reason = %request.reason,
                            severity = request.severity.as_str(),
                            rows = marked,
                            "Address blacklisted"
                        );
                    }
                    Err(e) => {
                        report.unrecorded += 1;
                        tracing::error!(
                            address = %address,
                            tx = %submission.tx_hash,
                            error = %e,
                            "Restriction submitted but not recorded, address stays pending"
                        );
                    }
                }
            }
        }

        Ok(report)
    }

    async fn record_enforced(
        &self,
        address: Address,
        request: &PendingRestriction,
        submission: &Submission,
        batch: &[Address],
    ) -> eyre::Result<u64> {
        self.store
            .record_blacklisted(&NewBlacklistEntry {
                address,
                tx_hash: submission.tx_hash,
                block_number: submission.block_number,
                reason: request.reason.clone(),
                severity: request.severity.as_str().to_string(),
                details: serde_json::json!({
                    "batch_size": batch.len(),
                    "batch": batch.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
                }),
            })
            .await?;
        self.store.mark_enforced(address).await
    }

    /// Run cycles on every queued request and every `retry_interval` until cancelled.
    pub async fn run(mut self, mut requests: mpsc::Receiver<EnforcementRequest>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.retry_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut queue_open = true;

        tracing::info!(
            batch_size = self.batch_size,
            retry_interval_secs = self.retry_interval.as_secs(),
            "Enforcement engine started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                maybe = requests.recv(), if queue_open => match maybe {
                    Some(request) => self.queue(request),
                    None => {
                        tracing::debug!("Enforcement queue closed, relying on store discovery");
                        queue_open = false;
                    }
                },
                _ = ticker.tick() => {}
            }

            while let Ok(request) = requests.try_recv() {
                self.queue(request);
            }

            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.cycle() => r,
            };
            match result {
                Ok(report) if report.submitted + report.settled + report.failed + report.unrecorded > 0 => {
                    tracing::info!(
                        submitted = report.submitted,
                        settled = report.settled,
                        failed = report.failed,
                        unrecorded = report.unrecorded,
                        pending = self.pending.len(),
                        "Enforcement cycle complete"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Enforcement cycle failed"),
            }
        }

        if !self.pending.is_empty() {
            tracing::warn!(
                pending = self.pending.len(),
                "Enforcement engine stopping with unsubmitted addresses; they remain recorded"
            );
        }
        tracing::info!("Enforcement engine stopped");
    }
}
