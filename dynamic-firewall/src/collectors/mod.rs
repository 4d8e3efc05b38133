//! Threat-intelligence feed collectors.

pub mod abuseipdb;
pub mod cncert;
pub mod ipsum;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use threat_database::CollectedEntry;

use crate::core::config::ConfigError;
use crate::core::registry::{Factory, Registry, build_registered};

pub use abuseipdb::AbuseIpdbCollector;
pub use cncert::CncertCollector;
pub use ipsum::IpsumCollector;

/// Error from a feed fetch.
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// A source of candidate malicious addresses.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Identifier recorded as the source of every entry this collector yields.
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool {
        true
    }

    /// Fetch the feed's current entries.
    async fn fetch(&self) -> Result<Vec<CollectedEntry>, CollectorError>;
}

pub type CollectorFactory = Factory<dyn Collector>;

/// Every collector that can be named in `[collectors.<name>]`.
pub fn registry() -> Registry<dyn Collector> {
    let mut registry: Registry<dyn Collector> = BTreeMap::new();
    registry.insert(ipsum::NAME, IpsumCollector::from_section as CollectorFactory);
    registry.insert(abuseipdb::NAME, AbuseIpdbCollector::from_section as CollectorFactory);
    registry.insert(cncert::NAME, CncertCollector::from_section as CollectorFactory);
    registry
}

/// Instantiate the enabled collectors from their config sections.
pub fn build_collectors(
    sections: &BTreeMap<String, toml::Value>,
    timeout: Duration,
) -> Vec<Arc<dyn Collector>> {
    build_registered("collector", sections, &registry(), timeout)
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, ConfigError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("dynamic-firewall/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ConfigError::Invalid(format!("failed to create HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_names() {
        let names: Vec<&str> = registry().keys().copied().collect();
        assert_eq!(names, vec!["abuseipdb", "cncert", "ipsum"]);
    }

    #[test]
    fn test_abuseipdb_without_key_is_not_registered() {
        let sections: BTreeMap<String, toml::Value> = r#"
            [ipsum]
            enabled = true
            [abuseipdb]
            enabled = true
        "#
        .parse::<toml::Table>()
        .unwrap()
        .into_iter()
        .collect();

        let collectors = build_collectors(&sections, Duration::from_secs(5));
        let names: Vec<&str> = collectors.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["ipsum"]);
    }
}
