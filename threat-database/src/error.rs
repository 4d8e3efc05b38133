/*!
Errors raised by the record store
*/

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The underlying SQLite database failed.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A source identifier that cannot be stored in the normalized source list.
    #[error("Invalid source identifier {0:?}")]
    InvalidSource(String),

    /// A persisted row could not be turned back into a record.
    #[error("Corrupt record for {ip}: {reason}")]
    CorruptRecord { ip: String, reason: String },
}
