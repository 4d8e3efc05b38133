/*!
Aggregates malicious IPs from threat-intelligence feeds and keeps firewall address groups in sync
*/

pub mod backends;
pub mod collectors;
pub mod core;

pub use crate::core::config::{ConfigError, FirewallConfig, GlobalConfig};
pub use crate::core::engine::{CycleReport, Engine, EngineState};
