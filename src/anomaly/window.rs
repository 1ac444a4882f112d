use alloy::primitives::{Address, B256, U256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::indexer::types::{TokenTransfer, TransferStatus};

/// Outcome of placing a transfer into a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Inserted,
    /// A provisional pending entry was moved to its confirmed block.
    Moved,
    Unchanged,
}

/// Aggregate over the busiest `width`-block span around a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpanStats {
    pub count: u64,
    pub total: U256,
}

/// Transfers of one address, ordered by block number and deduplicated by hash.
///
/// Insertion is a sorted-set insert, so the contents never depend on the order
/// in which transfers arrive.
#[derive(Debug, Clone)]
pub struct BlockWindow {
    width: u64,
    entries: BTreeMap<(u64, B256), U256>,
    positions: HashMap<B256, (u64, TransferStatus)>,
}

impl BlockWindow {
    pub fn new(width: u64) -> Self {
        Self {
            width: width.max(1),
            entries: BTreeMap::new(),
            positions: HashMap::new(),
        }
    }

    pub fn width(&self) -> u64 {
        self.width
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &B256) -> bool {
        self.positions.contains_key(hash)
    }

    pub fn insert(
        &mut self,
        block: u64,
        hash: B256,
        amount: U256,
        status: TransferStatus,
    ) -> Placement {
        match self.positions.get(&hash).copied() {
            None => {
                self.entries.insert((block, hash), amount);
                self.positions.insert(hash, (block, status));
                Placement::Inserted
            }
            // A confirmed sighting is authoritative; a pending one never moves it.
            Some((old_block, TransferStatus::Pending)) if status == TransferStatus::Confirmed => {
                self.entries.remove(&(old_block, hash));
                self.entries.insert((block, hash), amount);
                self.positions.insert(hash, (block, status));
                if old_block == block {
                    Placement::Unchanged
                } else {
                    Placement::Moved
                }
            }
            Some(_) => Placement::Unchanged,
        }
    }

    /// Drop every entry whose block is below `horizon`. Returns how many were dropped.
    pub fn evict_below(&mut self, horizon: u64) -> usize {
        let kept = self.entries.split_off(&(horizon, B256::ZERO));
        let evicted = std::mem::replace(&mut self.entries, kept);
        for (_, hash) in evicted.keys() {
            self.positions.remove(hash);
        }
        evicted.len()
    }

    /// Highest count and highest total over all `width`-block spans that contain `block`.
    ///
    /// In block order this is the trailing window ending at `block`; when a transfer
    /// arrives late it also sees the later transfers it clusters with.
    pub fn busiest_span_containing(&self, block: u64) -> SpanStats {
        let reach = self.width - 1;
        let lo = block.saturating_sub(reach);
        let hi = block.saturating_add(reach);

        let in_reach: Vec<(u64, U256)> = self
            .entries
            .range((lo, B256::ZERO)..=(hi, B256::repeat_byte(0xff)))
            .map(|(&(b, _), &amount)| (b, amount))
            .collect();

        let mut best = SpanStats::default();
        let mut end = 0usize;
        let mut count = 0u64;
        let mut total = U256::ZERO;

        // Spans start at an entry at or before `block`; each covers `width` blocks.
        for &(start_block, start_amount) in &in_reach {
            if start_block > block {
                break;
            }
            let span_end = start_block.saturating_add(reach);
            while end < in_reach.len() && in_reach[end].0 <= span_end {
                count += 1;
                total = total.saturating_add(in_reach[end].1);
                end += 1;
            }

            best.count = best.count.max(count);
            best.total = best.total.max(total);

            count -= 1;
            total = total.saturating_sub(start_amount);
        }

        best
    }

    /// Sorted `(block, hash, amount)` view of the window.
    pub fn snapshot(&self) -> Vec<(u64, B256, U256)> {
        self.entries
            .iter()
            .map(|(&(block, hash), &amount)| (block, hash, amount))
            .collect()
    }
}

/// Outgoing and incoming windows of a single address.
#[derive(Debug, Clone)]
pub struct AddressActivity {
    pub outgoing: BlockWindow,
    pub incoming: BlockWindow,
}

/// Which side of a transfer an address is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Per-address sliding windows shared by all `observe` callers.
///
/// Each address has its own lock, so insert-then-evict for an address is atomic
/// with respect to concurrent observations of the same address, while unrelated
/// addresses proceed in parallel. At most one address lock is held at a time.
pub struct WindowBook {
    outgoing_width: u64,
    incoming_width: u64,
    max_block_seen: AtomicU64,
    accounts: Mutex<HashMap<Address, Arc<Mutex<AddressActivity>>>>,
}

impl WindowBook {
    pub fn new(outgoing_width: u64, incoming_width: u64) -> Self {
        Self {
            outgoing_width: outgoing_width.max(1),
            incoming_width: incoming_width.max(1),
            max_block_seen: AtomicU64::new(0),
            accounts: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_block_seen(&self) -> u64 {
        self.max_block_seen.load(Ordering::Acquire)
    }

    pub fn width(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Outgoing => self.outgoing_width,
            Direction::Incoming => self.incoming_width,
        }
    }

    async fn account(&self, address: Address) -> Arc<Mutex<AddressActivity>> {
        let mut accounts = self.accounts.lock().await;
        accounts
            .entry(address)
            .or_insert_with(|| {
                Arc::new(Mutex::new(AddressActivity {
                    outgoing: BlockWindow::new(self.outgoing_width),
                    incoming: BlockWindow::new(self.incoming_width),
                }))
            })
            .clone()
    }

    /// Insert the transfer into the address's window for `direction`, evict stale
    /// entries, and return the busiest span around the transfer. Returns `None`
    /// when the transfer is already outside the live window.
    pub async fn record(&self, transfer: &TokenTransfer, direction: Direction) -> Option<SpanStats> {
        let max_seen = self
            .max_block_seen
            .fetch_max(transfer.block_number, Ordering::AcqRel)
            .max(transfer.block_number);

        let address = match direction {
            Direction::Outgoing => transfer.from,
            Direction::Incoming => transfer.to,
        };
        let account = self.account(address).await;
        let mut activity = account.lock().await;
        let window = match direction {
            Direction::Outgoing => &mut activity.outgoing,
            Direction::Incoming => &mut activity.incoming,
        };

        window.insert(
            transfer.block_number,
            transfer.hash,
            transfer.amount,
            transfer.status,
        );
        window.evict_below(max_seen.saturating_sub(window.width()));

        if !window.contains(&transfer.hash) {
            return None;
        }
        Some(window.busiest_span_containing(transfer.block_number))
    }

    /// Evict stale entries everywhere and forget addresses with no live entries.
    pub async fn prune(&self) -> usize {
        let max_seen = self.max_block_seen();
        let mut accounts = self.accounts.lock().await;
        let before = accounts.len();

        let mut idle = Vec::new();
        for (address, account) in accounts.iter() {
            let mut activity = account.lock().await;
            let outgoing_horizon = max_seen.saturating_sub(activity.outgoing.width());
            let incoming_horizon = max_seen.saturating_sub(activity.incoming.width());
            activity.outgoing.evict_below(outgoing_horizon);
            activity.incoming.evict_below(incoming_horizon);
            if activity.outgoing.is_empty() && activity.incoming.is_empty() {
                idle.push(*address);
            }
        }
        for address in idle {
            accounts.remove(&address);
        }

        before - accounts.len()
    }

    pub async fn activity(&self, address: Address) -> Option<AddressActivity> {
        let account = self.accounts.lock().await.get(&address).cloned()?;
        let activity = account.lock().await;
        Some(activity.clone())
    }
}
