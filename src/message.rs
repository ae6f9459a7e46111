//! Message records and their lifecycle status.
//!
//! Two kinds of record are stored: messages produced by a business transaction
//! (`published`) and messages consumed by one (`received`). Both share the same
//! shape, the received kind additionally carries the consumer group.
//!
//! # Lifecycle
//!
//! 1. Records are created in `Scheduled` status inside the producing transaction
//! 2. Moving to `Enqueued` places the record on the delivery queue
//! 3. A delivery attempt ends in `Succeeded` (terminal) or `Failed` (retried later)
//!
//! Only [`StateChanger`](crate::state::StateChanger) writes the status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::error::{Error, Result};

/// Lifecycle stage of a record, stored as its name.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[sqlx(type_name = "text")]
pub enum StatusName {
    /// Created, not yet handed to the delivery queue
    Scheduled,
    /// Waiting in (or claimed from) the delivery queue
    Enqueued,
    /// Delivered; terminal
    Succeeded,
    /// Last delivery attempt failed; eligible for retry
    Failed,
}

impl StatusName {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Discriminates the two record tables. Stored as an integer in the queue.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageKind {
    Published,
    Received,
}

impl MessageKind {
    pub fn tag(self) -> i64 {
        match self {
            Self::Published => 0,
            Self::Received => 1,
        }
    }
}

impl TryFrom<i64> for MessageKind {
    type Error = Error;

    fn try_from(tag: i64) -> Result<Self> {
        match tag {
            0 => Ok(Self::Published),
            1 => Ok(Self::Received),
            tag => Err(Error::UnknownMessageKind { tag }),
        }
    }
}

/// A message produced inside a business transaction, waiting to be sent out.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    /// Storage identity, assigned on insert
    pub id: i64,
    /// Logical topic name
    pub name: String,
    /// Serialized payload; never changes after the record is stored
    pub content: String,
    pub added: DateTime<Utc>,
    /// After this point the record may be removed by cleanup
    pub expires_at: Option<DateTime<Utc>>,
    pub last_warned_time: Option<DateTime<Utc>>,
    /// Number of failed delivery attempts
    pub retries: u32,
    pub status_name: StatusName,
    /// Idempotency key downstream consumers deduplicate on
    pub message_id: String,
    /// Correlates the record with the business transaction that stored it
    pub transaction_id: String,
}

/// A message taken in from the transport, waiting to be handled by a consumer group.
#[derive(Serialize, Deserialize, FromRow, Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub id: i64,
    pub name: String,
    #[sqlx(rename = "group_name")]
    pub group: String,
    pub content: String,
    pub added: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_warned_time: Option<DateTime<Utc>>,
    pub retries: u32,
    pub status_name: StatusName,
    pub message_id: String,
    pub transaction_id: String,
}

impl PublishedMessage {
    /// A new `Scheduled` record. `id`, `message_id` and `transaction_id` are
    /// assigned when the record is stored.
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            content: content.into(),
            added: Utc::now(),
            expires_at: None,
            last_warned_time: None,
            retries: 0,
            status_name: StatusName::Scheduled,
            message_id: String::new(),
            transaction_id: String::new(),
        }
    }
}

impl ReceivedMessage {
    pub fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            group: group.into(),
            content: content.into(),
            added: Utc::now(),
            expires_at: None,
            last_warned_time: None,
            retries: 0,
            status_name: StatusName::Scheduled,
            message_id: String::new(),
            transaction_id: String::new(),
        }
    }
}

/// A record of either kind.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Published(PublishedMessage),
    Received(ReceivedMessage),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Published(_) => MessageKind::Published,
            Self::Received(_) => MessageKind::Received,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Self::Published(m) => m.id,
            Self::Received(m) => m.id,
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            Self::Published(m) => &m.message_id,
            Self::Received(m) => &m.message_id,
        }
    }

    pub fn status_name(&self) -> StatusName {
        match self {
            Self::Published(m) => m.status_name,
            Self::Received(m) => m.status_name,
        }
    }

    pub fn retries(&self) -> u32 {
        match self {
            Self::Published(m) => m.retries,
            Self::Received(m) => m.retries,
        }
    }

    pub fn as_published(&self) -> Option<&PublishedMessage> {
        match self {
            Self::Published(m) => Some(m),
            Self::Received(_) => None,
        }
    }

    pub fn as_received(&self) -> Option<&ReceivedMessage> {
        match self {
            Self::Received(m) => Some(m),
            Self::Published(_) => None,
        }
    }
}

impl From<PublishedMessage> for Message {
    fn from(m: PublishedMessage) -> Self {
        Self::Published(m)
    }
}

impl From<ReceivedMessage> for Message {
    fn from(m: ReceivedMessage) -> Self {
        Self::Received(m)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn kind_tags() {
        assert_eq!(MessageKind::try_from(0).unwrap(), MessageKind::Published);
        assert_eq!(MessageKind::try_from(1).unwrap(), MessageKind::Received);
        assert_eq!(MessageKind::Received.tag(), 1);

        let err = MessageKind::try_from(2).unwrap_err();
        assert!(matches!(err, Error::UnknownMessageKind { tag: 2 }));
    }

    #[test]
    fn status_names_round_trip_as_text() {
        assert_eq!(StatusName::Succeeded.to_string(), "Succeeded");
        assert_eq!(StatusName::from_str("Failed").unwrap(), StatusName::Failed);
        assert!(StatusName::from_str("Delivered").is_err());
        assert!(StatusName::Succeeded.is_terminal());
        assert!(!StatusName::Failed.is_terminal());
    }

    #[test]
    fn new_records_start_scheduled() {
        let m = ReceivedMessage::new("order.created", "billing", "{}");
        assert_eq!(m.status_name, StatusName::Scheduled);
        assert_eq!(m.retries, 0);
        assert!(m.expires_at.is_none());

        let m = Message::from(PublishedMessage::new("order.created", "{}"));
        assert_eq!(m.kind(), MessageKind::Published);
        assert!(m.as_received().is_none());
    }

    #[test]
    fn message_serializes_with_kind_tag() {
        let m = Message::from(PublishedMessage::new("order.created", "{\"id\":1}"));
        let value = serde_json::to_value(&m).unwrap();
        assert_eq!(value["kind"], "published");
        assert_eq!(value["name"], "order.created");
    }
}
