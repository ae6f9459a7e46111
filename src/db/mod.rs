//! SQLite-backed storage: connection handling, the business-transaction binding
//! and the lock-holding delivery handle.

macro_rules! published_columns {
    () => {
        "id, name, content, added, expires_at, last_warned_time, retries, status_name, \
         message_id, transaction_id"
    };
}

macro_rules! received_columns {
    () => {
        "id, name, group_name, content, added, expires_at, last_warned_time, retries, \
         status_name, message_id, transaction_id"
    };
}

pub mod connection;
pub mod locked;
pub mod transaction;

pub use connection::StorageConnection;
pub use locked::LockedMessage;
pub use transaction::StorageTransaction;
