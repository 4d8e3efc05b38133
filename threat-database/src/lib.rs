/*!
Persistent, deduplicated store of malicious IP addresses reported by
threat-intelligence feeds.

Every address is kept as a single [`IpRecord`]: the sources that reported it,
the highest score any of them assigned, and when it was first and last seen.
*/

pub mod error;
pub mod record;
pub mod store;

pub use error::{Result, StoreError};
pub use record::{CollectedEntry, IpRecord};
pub use store::{RecordStore, StoreStats};
