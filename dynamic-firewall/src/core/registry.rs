/*!
Name-keyed registries turning configuration sections into collectors and backends
*/

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::core::config::{ConfigError, section_enabled};

/// Builds one component from its config section and the request timeout.
pub type Factory<T> = fn(&toml::Value, Duration) -> Result<Arc<T>, ConfigError>;

pub type Registry<T> = BTreeMap<&'static str, Factory<T>>;

/// Instantiate every enabled section that has a registered constructor.
///
/// Sections that are disabled, unknown, or fail to construct (missing
/// credentials, malformed settings) are left out; they are logged once here
/// and never retried.
pub fn build_registered<T: ?Sized>(
    kind: &str,
    sections: &BTreeMap<String, toml::Value>,
    registry: &Registry<T>,
    timeout: Duration,
) -> Vec<Arc<T>> {
    let mut built = Vec::new();

    for (name, section) in sections {
        if !section_enabled(section) {
            debug!("Skipping disabled {} {}", kind, name);
            continue;
        }

        let Some(factory) = registry.get(name.as_str()) else {
            error!("Unknown {} '{}' in configuration", kind, name);
            continue;
        };

        match factory(section, timeout) {
            Ok(component) => {
                info!("Initialized {}: {}", kind, name);
                built.push(component);
            }
            Err(e) => {
                error!("Failed to initialize {} {}: {}", kind, name, e);
            }
        }
    }

    built
}
