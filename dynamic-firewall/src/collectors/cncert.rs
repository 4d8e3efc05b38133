//! CNCERT advisory collector (https://www.cert.org.cn).
//!
//! CNCERT publishes no machine-readable feed; addresses are scraped from the
//! most recent advisory articles linked from the announcement index.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use threat_database::CollectedEntry;
use tracing::{debug, info};

use super::{Collector, CollectorError, http_client};
use crate::core::config::ConfigError;

pub const NAME: &str = "cncert";

pub const BASE_URL: &str = "https://www.cert.org.cn";

pub const INDEX_URL: &str = "https://www.cert.org.cn/publish/main/9/index.html";

/// Advisories carry no severity, so every address gets the same score
pub const SCORE: u32 = 5;

const LINK_PATTERN: &str = r#"href\s*=\s*["']([^"']+)["']"#;
const IPV4_PATTERN: &str = r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b";

#[derive(Debug, Clone, Deserialize)]
pub struct CncertConfig {
    /// Number of advisory articles read per fetch
    #[serde(default = "default_max_articles")]
    pub max_articles: usize,
    #[serde(default = "default_index_url")]
    pub index_url: String,
    /// Prefix for relative article links
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_max_articles() -> usize {
    5
}

fn default_index_url() -> String {
    INDEX_URL.to_string()
}

fn default_base_url() -> String {
    BASE_URL.to_string()
}

/// Compiled patterns for pulling article links and addresses out of HTML.
pub struct AdvisoryScanner {
    link: Regex,
    ipv4: Regex,
}

impl AdvisoryScanner {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            link: Regex::new(LINK_PATTERN)?,
            ipv4: Regex::new(IPV4_PATTERN)?,
        })
    }

    /// Absolute URLs of advisory articles on an index page, in page order, without repeats.
    pub fn article_links(&self, html: &str, base_url: &str) -> Vec<String> {
        let base_url = base_url.trim_end_matches('/');
        let mut seen = HashSet::new();

        self.link
            .captures_iter(html)
            .filter_map(|caps| caps.get(1))
            .map(|href| href.as_str().trim())
            .filter(|href| href.contains("ARTI") || href.to_lowercase().contains("article"))
            .map(|href| {
                if href.starts_with("http") {
                    href.to_string()
                } else if href.starts_with('/') {
                    format!("{}{}", base_url, href)
                } else {
                    format!("{}/{}", base_url, href)
                }
            })
            .filter(|url| seen.insert(url.clone()))
            .collect()
    }

    /// Public IPv4 addresses mentioned in an article, in order of first mention.
    pub fn addresses<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut seen = HashSet::new();
        self.ipv4
            .find_iter(text)
            .map(|m| m.as_str())
            .filter(|candidate| is_public_ipv4(candidate))
            .filter(|candidate| seen.insert(*candidate))
            .collect()
    }
}

/// Rejects malformed addresses and the private, loopback, link-local,
/// multicast, `0.0.0.0/8` and `255.0.0.0/8` ranges.
pub fn is_public_ipv4(candidate: &str) -> bool {
    let Ok(addr) = candidate.parse::<Ipv4Addr>() else {
        return false;
    };
    let first_octet = addr.octets()[0];

    !(addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_multicast()
        || first_octet == 0
        || first_octet == 255)
}

/// One entry per distinct address across all articles, first mention wins.
pub fn advisory_entries<'a, I>(
    articles: I,
    scanner: &AdvisoryScanner,
    observed_at: DateTime<Utc>,
) -> Vec<CollectedEntry>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for article in articles {
        for ip in scanner.addresses(article) {
            if seen.insert(ip.to_string()) {
                entries.push(CollectedEntry::new(ip, NAME, SCORE, observed_at));
            }
        }
    }

    entries
}

pub struct CncertCollector {
    config: CncertConfig,
    scanner: AdvisoryScanner,
    client: Client,
}

impl CncertCollector {
    pub fn new(config: CncertConfig, timeout: Duration) -> Result<Self, ConfigError> {
        let scanner = AdvisoryScanner::new()
            .map_err(|e| ConfigError::Invalid(format!("cncert patterns failed to compile: {}", e)))?;
        Ok(Self {
            config,
            scanner,
            client: http_client(timeout)?,
        })
    }

    pub fn from_section(
        section: &toml::Value,
        timeout: Duration,
    ) -> Result<Arc<dyn Collector>, ConfigError> {
        let config: CncertConfig = section.clone().try_into()?;
        Ok(Arc::new(Self::new(config, timeout)?))
    }

    async fn get_text(&self, url: &str) -> Result<String, reqwest::Error> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

#[async_trait]
impl Collector for CncertCollector {
    fn name(&self) -> &str {
        NAME
    }

    async fn fetch(&self) -> Result<Vec<CollectedEntry>, CollectorError> {
        let index = self.get_text(&self.config.index_url).await?;
        let links = self.scanner.article_links(&index, &self.config.base_url);
        debug!("[{}] Found {} advisory links", NAME, links.len());

        // Unreachable articles are skipped and do not count towards the limit
        let mut articles = Vec::new();
        for url in links {
            if articles.len() >= self.config.max_articles {
                break;
            }
            match self.get_text(&url).await {
                Ok(body) => articles.push(body),
                Err(e) => debug!("[{}] Failed to fetch article {}: {}", NAME, url, e),
            }
        }

        let entries =
            advisory_entries(articles.iter().map(String::as_str), &self.scanner, Utc::now());
        info!(
            "[{}] Fetched {} unique IPs from {} articles",
            NAME,
            entries.len(),
            articles.len()
        );
        Ok(entries)
    }
}
