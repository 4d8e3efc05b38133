//! UniFi Network gateway backend.
//!
//! Uses the Network integration API: firewall groups under
//! `/v1/sites/{site}/firewall/groups`, authenticated with an `X-API-KEY` token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Backend, BackendError};
use crate::core::config::{ConfigError, require_setting};

pub const NAME: &str = "unifi";

const GROUP_TYPE: &str = "ipv4-address-group";

#[derive(Debug, Clone, Deserialize)]
pub struct UnifiConfig {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default = "default_group_name")]
    pub group_name: String,
    /// Gateways usually ship self-signed certificates
    #[serde(default)]
    pub verify_ssl: bool,
}

fn default_group_name() -> String {
    "d-firewall-blacklist".to_string()
}

/// A firewall group as returned by the API.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FirewallGroup {
    #[serde(default)]
    pub id: Option<String>,
    /// Older controllers use the Mongo-style key
    #[serde(rename = "_id", default)]
    pub legacy_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl FirewallGroup {
    pub fn group_id(&self) -> Option<&str> {
        self.id
            .as_deref()
            .or(self.legacy_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Serialize)]
struct GroupPayload<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    group_type: &'a str,
    members: &'a [String],
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    data: serde_json::Value,
}

pub struct UnifiBackend {
    base_url: String,
    site_id: String,
    group_name: String,
    client: Client,
}

impl UnifiBackend {
    pub fn new(config: UnifiConfig, timeout: Duration) -> Result<Self, ConfigError> {
        let api_url = require_setting(config.api_url.as_deref(), NAME, "api_url")?;
        let api_token = require_setting(config.api_token.as_deref(), NAME, "api_token")?;
        let site_id = require_setting(config.site_id.as_deref(), NAME, "site_id")?;

        let mut headers = HeaderMap::new();
        let mut token = HeaderValue::from_str(&api_token)
            .map_err(|_| ConfigError::Invalid("unifi api_token is not a valid header value".into()))?;
        token.set_sensitive(true);
        headers.insert(HeaderName::from_static("x-api-key"), token);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: api_url.trim_end_matches('/').to_string(),
            site_id,
            group_name: config.group_name,
            client,
        })
    }

    pub fn from_section(
        section: &toml::Value,
        timeout: Duration,
    ) -> Result<Arc<dyn Backend>, ConfigError> {
        let config: UnifiConfig = section.clone().try_into()?;
        Ok(Arc::new(Self::new(config, timeout)?))
    }

    fn groups_url(&self) -> String {
        format!("{}/v1/sites/{}/firewall/groups", self.base_url, self.site_id)
    }

    async fn find_or_create_group(&self, group_name: &str) -> Result<FirewallGroup, BackendError> {
        let listing: Envelope = self
            .client
            .get(self.groups_url())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(group) = find_group(&listing.data, group_name) {
            debug!("[{}] Found existing firewall group: {}", NAME, group_name);
            return Ok(group);
        }

        info!("[{}] Creating new firewall group: {}", NAME, group_name);
        let created: Envelope = self
            .client
            .post(self.groups_url())
            .json(&GroupPayload {
                name: group_name,
                group_type: GROUP_TYPE,
                members: &[],
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        first_group(created.data)
            .ok_or_else(|| BackendError::Api(format!("creating group {} returned no group", group_name)))
    }

    async fn replace_members(
        &self,
        group_id: &str,
        group_name: &str,
        members: &[String],
    ) -> Result<(), BackendError> {
        self.client
            .put(format!("{}/{}", self.groups_url(), group_id))
            .json(&GroupPayload {
                name: group_name,
                group_type: GROUP_TYPE,
                members,
            })
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}

#[async_trait]
impl Backend for UnifiBackend {
    fn name(&self) -> &str {
        NAME
    }

    fn group_name(&self) -> &str {
        &self.group_name
    }

    async fn converge(&self, group_name: &str, target_ips: &[String]) -> Result<(), BackendError> {
        info!("[{}] Starting sync of {} IPs to UniFi Gateway...", NAME, target_ips.len());

        let group = self.find_or_create_group(group_name).await?;
        let group_id = group
            .group_id()
            .ok_or_else(|| BackendError::Api(format!("firewall group {} has no id", group_name)))?;

        self.replace_members(group_id, group_name, target_ips).await?;
        info!("[{}] Updated firewall group {} with {} IPs", NAME, group_name, target_ips.len());
        Ok(())
    }
}

/// Look up a group by name in a listing's `data` array.
fn find_group(data: &serde_json::Value, group_name: &str) -> Option<FirewallGroup> {
    data.as_array()?
        .iter()
        .filter_map(|item| serde_json::from_value::<FirewallGroup>(item.clone()).ok())
        .find(|group| group.name.as_deref() == Some(group_name))
}

/// The group in a create response; some controllers wrap it in a one-element array.
fn first_group(data: serde_json::Value) -> Option<FirewallGroup> {
    let item = match data {
        serde_json::Value::Array(items) => items.into_iter().next()?,
        object @ serde_json::Value::Object(_) => object,
        _ => return None,
    };
    serde_json::from_value(item).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> UnifiConfig {
        UnifiConfig {
            api_url: Some("https://192.168.1.1/proxy/network/integration/".into()),
            api_token: Some("token".into()),
            site_id: Some("default".into()),
            group_name: default_group_name(),
            verify_ssl: false,
        }
    }

    #[test]
    fn test_find_group_by_name() {
        let data = json!([
            {"id": "a1", "name": "other"},
            {"_id": "b2", "name": "d-firewall-blacklist", "members": ["1.1.1.1"]},
        ]);

        let group = find_group(&data, "d-firewall-blacklist").unwrap();
        assert_eq!(group.group_id(), Some("b2"));
        assert!(find_group(&data, "missing").is_none());
        assert!(find_group(&json!({}), "other").is_none());
    }

    #[test]
    fn test_first_group_shapes() {
        let object = first_group(json!({"id": "x", "name": "g"})).unwrap();
        assert_eq!(object.group_id(), Some("x"));

        let array = first_group(json!([{"_id": "y", "name": "g"}])).unwrap();
        assert_eq!(array.group_id(), Some("y"));

        assert!(first_group(json!([])).is_none());
        assert!(first_group(serde_json::Value::Null).is_none());
    }

    #[test]
    fn test_payload_shape() {
        let members = vec!["203.0.113.1".to_string()];
        let payload = GroupPayload {
            name: "g",
            group_type: GROUP_TYPE,
            members: &members,
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"name": "g", "type": "ipv4-address-group", "members": ["203.0.113.1"]})
        );
    }

    #[test]
    fn test_urls_and_group_name() {
        let backend = UnifiBackend::new(config(), Duration::from_secs(5)).unwrap();
        assert_eq!(
            backend.groups_url(),
            "https://192.168.1.1/proxy/network/integration/v1/sites/default/firewall/groups"
        );
        assert_eq!(backend.group_name(), "d-firewall-blacklist");
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let mut config = config();
        config.api_token = None;
        assert!(matches!(
            UnifiBackend::new(config, Duration::from_secs(5)),
            Err(ConfigError::MissingSetting { .. })
        ));
    }
}
