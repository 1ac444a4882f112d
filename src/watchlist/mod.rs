pub mod loader;

use alloy::primitives::Address;
use std::collections::HashMap;

/// A labelled address set. Used both for suspicious addresses, whose
/// involvement in a transfer is a violation, and for whitelisted addresses,
/// whose transfers are never flagged.
#[derive(Debug, Clone, Default)]
pub struct Watchlist {
    entries: HashMap<Address, Option<String>>,
}

impl Watchlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an address. An existing label is kept unless the new entry has one.
    pub fn insert(&mut self, address: Address, label: Option<String>) {
        let slot = self.entries.entry(address).or_insert(None);
        if label.is_some() {
            *slot = label;
        }
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.entries.contains_key(address)
    }

    pub fn label(&self, address: &Address) -> Option<&str> {
        self.entries.get(address).and_then(|l| l.as_deref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<Address> for Watchlist {
    fn from_iter<I: IntoIterator<Item = Address>>(iter: I) -> Self {
        let mut list = Watchlist::new();
        for address in iter {
            list.insert(address, None);
        }
        list
    }
}
