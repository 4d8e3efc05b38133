//! AbuseIPDB blacklist collector.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use threat_database::CollectedEntry;
use tracing::info;

use super::{Collector, CollectorError, http_client};
use crate::core::config::{ConfigError, require_setting};

pub const NAME: &str = "abuseipdb";

pub const API_URL: &str = "https://api.abuseipdb.com/api/v2/blacklist";

#[derive(Debug, Clone, Deserialize)]
pub struct AbuseIpdbConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_confidence_minimum")]
    pub confidence_minimum: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_confidence_minimum() -> u32 {
    90
}

fn default_limit() -> u32 {
    10_000
}

fn default_api_url() -> String {
    API_URL.to_string()
}

/// Blacklist endpoint response.
#[derive(Debug, Deserialize)]
pub struct BlacklistResponse {
    #[serde(default)]
    pub data: Vec<BlacklistEntry>,
}

#[derive(Debug, Deserialize)]
pub struct BlacklistEntry {
    #[serde(rename = "ipAddress", default)]
    pub ip_address: Option<String>,

    /// Abuse confidence score (0-100).
    #[serde(rename = "abuseConfidenceScore", default)]
    pub abuse_confidence_score: u32,
}

pub struct AbuseIpdbCollector {
    config: AbuseIpdbConfig,
    api_key: String,
    client: Client,
}

impl AbuseIpdbCollector {
    pub fn new(config: AbuseIpdbConfig, timeout: Duration) -> Result<Self, ConfigError> {
        let api_key = require_setting(config.api_key.as_deref(), NAME, "api_key")?;
        Ok(Self {
            config,
            api_key,
            client: http_client(timeout)?,
        })
    }

    pub fn from_section(
        section: &toml::Value,
        timeout: Duration,
    ) -> Result<Arc<dyn Collector>, ConfigError> {
        let config: AbuseIpdbConfig = section.clone().try_into()?;
        Ok(Arc::new(Self::new(config, timeout)?))
    }
}

#[async_trait]
impl Collector for AbuseIpdbCollector {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch(&self) -> Result<Vec<CollectedEntry>, CollectorError> {
        let response: BlacklistResponse = self
            .client
            .get(&self.config.api_url)
            .header("Key", &self.api_key)
            .header("Accept", "application/json")
            .query(&[
                ("confidenceMinimum", self.config.confidence_minimum),
                ("limit", self.config.limit),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let entries = blacklist_entries(response, Utc::now());
        info!(
            "[{}] Fetched {} IPs (confidence>={})",
            NAME,
            entries.len(),
            self.config.confidence_minimum
        );
        Ok(entries)
    }
}

/// Entries without an address are dropped.
pub fn blacklist_entries(response: BlacklistResponse, observed_at: DateTime<Utc>) -> Vec<CollectedEntry> {
    response
        .data
        .into_iter()
        .filter_map(|entry| {
            let ip = entry.ip_address.filter(|ip| !ip.trim().is_empty())?;
            Some(CollectedEntry::new(ip, NAME, entry.abuse_confidence_score, observed_at))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blacklist_response_parsing() {
        let body = r#"{
            "meta": {"generatedAt": "2025-01-01T00:00:00+00:00"},
            "data": [
                {"ipAddress": "198.51.100.4", "countryCode": "US", "abuseConfidenceScore": 100},
                {"ipAddress": "203.0.113.77", "abuseConfidenceScore": 92},
                {"countryCode": "NL", "abuseConfidenceScore": 95},
                {"ipAddress": "192.0.2.1"}
            ]
        }"#;

        let response: BlacklistResponse = serde_json::from_str(body).unwrap();
        let entries = blacklist_entries(response, Utc::now());

        let got: Vec<(&str, u32)> = entries.iter().map(|e| (e.ip.as_str(), e.score)).collect();
        assert_eq!(got, vec![("198.51.100.4", 100), ("203.0.113.77", 92), ("192.0.2.1", 0)]);
        assert!(entries.iter().all(|e| e.source == NAME));
    }

    #[test]
    fn test_missing_data_is_empty() {
        let response: BlacklistResponse = serde_json::from_str("{}").unwrap();
        assert!(blacklist_entries(response, Utc::now()).is_empty());
    }

    #[test]
    fn test_requires_api_key() {
        let config = AbuseIpdbConfig {
            api_key: Some("${ABUSEIPDB_API_KEY}".into()),
            confidence_minimum: 90,
            limit: 10,
            api_url: API_URL.into(),
        };
        assert!(matches!(
            AbuseIpdbCollector::new(config, Duration::from_secs(5)),
            Err(ConfigError::MissingSetting { .. })
        ));
    }
}
