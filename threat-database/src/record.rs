/*!
Record types flowing into and out of the store
*/

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

/// Separator used for the persisted source list.
pub const SOURCE_SEPARATOR: char = ',';

/// One sighting of an address, as produced by a feed collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedEntry {
    pub ip: String,
    /// Identifier of the collector that reported the address
    pub source: String,
    /// Severity on the collector's own scale
    pub score: u32,
    pub observed_at: DateTime<Utc>,
}

impl CollectedEntry {
    pub fn new(
        ip: impl Into<String>,
        source: impl Into<String>,
        score: u32,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            ip: ip.into(),
            source: source.into(),
            score,
            observed_at,
        }
    }
}

/// The merged view of one address across every source that reported it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRecord {
    pub ip: String,
    pub sources: BTreeSet<String>,
    /// Highest score ever reported for this address
    pub score: u32,
    pub last_seen: DateTime<Utc>,
    /// Set at first insertion, never updated
    pub created_at: DateTime<Utc>,
}

impl IpRecord {
    /// Normalized source list, identical for any insertion order.
    pub fn sources_key(&self) -> String {
        join_sources(&self.sources)
    }
}

pub fn join_sources(sources: &BTreeSet<String>) -> String {
    sources
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(&SOURCE_SEPARATOR.to_string())
}

pub fn split_sources(joined: &str) -> BTreeSet<String> {
    joined
        .split(SOURCE_SEPARATOR)
        .map(str::trim)
        .filter(|source| !source.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether a source identifier can round-trip through the persisted list.
pub fn is_valid_source(source: &str) -> bool {
    !source.trim().is_empty() && source.trim() == source && !source.contains(SOURCE_SEPARATOR)
}
