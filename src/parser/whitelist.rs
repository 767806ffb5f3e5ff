//! Sender whitelist.
//!
//! Membership is exact equality on normalized addresses. There is no domain,
//! prefix, suffix or substring matching.

use std::collections::HashSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    addresses: HashSet<String>,
}

impl Whitelist {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            addresses: addresses
                .into_iter()
                .map(|a| normalize_address(a.as_ref()))
                .filter(|a| !a.is_empty())
                .collect(),
        }
    }

    /// An empty whitelist admits every sender.
    pub fn is_open(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.is_open() || self.addresses.contains(&normalize_address(address))
    }
}

/// Trim and case-fold an email address.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}
