/*!
Core collection, reconciliation and scheduling for the firewall sync daemon
*/

pub mod collection;
pub mod config;
pub mod engine;
pub mod reconciliation;
pub mod registry;

use std::sync::Arc;

use threat_database::RecordStore;
use tokio::sync::Mutex;

/// The record store shared by both pipelines; the mutex gives single-writer access.
pub type SharedStore = Arc<Mutex<RecordStore>>;

pub fn shared_store(store: RecordStore) -> SharedStore {
    Arc::new(Mutex::new(store))
}
