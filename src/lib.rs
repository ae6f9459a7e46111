//! Storage core of a transactional outbox.
//!
//! Messages produced or consumed by a business transaction are written to the
//! same database, in the same transaction, as the business state change. A
//! delivery driver then claims queued records one at a time through
//! [`StorageConnection::fetch_next_message`], delivers them, and records the
//! outcome through the returned [`LockedMessage`]. A crash before commit rolls
//! the claim back, so delivery is at-least-once and consumers deduplicate on
//! `message_id`.
//!
//! ```no_run
//! # async fn demo() -> capstore::error::Result<()> {
//! use capstore::{Config, PublishedMessage, State, StorageConnection, StorageTransaction};
//!
//! let storage = StorageConnection::connect_with()
//!     .config(Config::for_path("outbox.db"))
//!     .call()
//!     .await?;
//!
//! // Producer: the outbox write shares the business transaction.
//! let mut tx = storage.create_transaction().await?;
//! let mut outbox = StorageTransaction::new(&mut tx);
//! let mut message = PublishedMessage::new("order.created", r#"{"order":42}"#);
//! outbox.store_published_message(&mut message).await?;
//! storage
//!     .state_changer()
//!     .change_published_state(&mut message, State::Enqueued, &mut outbox)
//!     .await?;
//! tx.commit()
//!     .await
//!     .map_err(|source| capstore::Error::TransactionFailed { operation: "commit", source })?;
//!
//! // Driver: claim, deliver, record the outcome.
//! if let Some(mut locked) = storage.fetch_next_message().await? {
//!     locked.change_state(State::Succeeded).await?;
//!     locked.commit().await?;
//!     locked.dispose().await;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod id;
pub mod logger;
pub mod message;
pub mod state;

pub use config::{Config, OptionsProvider};
pub use db::{LockedMessage, StorageConnection, StorageTransaction};
pub use error::{Error, Result};
pub use logger::{init_tracing, LogDelegate, LogRecord, Logger, TracingLogger};
pub use message::{Message, MessageKind, PublishedMessage, ReceivedMessage, StatusName};
pub use state::{State, StateChanger};
