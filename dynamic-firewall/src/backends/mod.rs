//! Firewall backends that hold the blocked address group.

pub mod unifi;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::registry::{Factory, Registry, build_registered};

pub use unifi::UnifiBackend;

/// Error from a backend converge call.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The firewall API answered, but not with what we need.
    #[error("API error: {0}")]
    Api(String),
}

/// A firewall whose address group is kept equal to the qualifying address set.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool {
        true
    }

    /// Name of the address group this backend manages.
    fn group_name(&self) -> &str;

    /// Make the group named `group_name` contain exactly `target_ips`.
    ///
    /// The group is looked up by name and created when absent, then its
    /// membership is replaced wholesale. Calling this again with the same list
    /// leaves the firewall unchanged.
    async fn converge(&self, group_name: &str, target_ips: &[String]) -> Result<(), BackendError>;
}

pub type BackendFactory = Factory<dyn Backend>;

/// Every backend that can be named in `[backends.<name>]`.
pub fn registry() -> Registry<dyn Backend> {
    let mut registry: Registry<dyn Backend> = BTreeMap::new();
    registry.insert(unifi::NAME, UnifiBackend::from_section as BackendFactory);
    registry
}

pub fn build_backends(
    sections: &BTreeMap<String, toml::Value>,
    timeout: Duration,
) -> Vec<Arc<dyn Backend>> {
    build_registered("backend", sections, &registry(), timeout)
}
