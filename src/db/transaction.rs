use snafu::ResultExt;
use sqlx::SqliteConnection;

use crate::{
    error::{NoRowsAffectedSnafu, Result, StoreQueryFailedSnafu},
    id::new_id,
    message::{MessageKind, PublishedMessage, ReceivedMessage, StatusName},
};

const INSERT_PUBLISHED: &str = "INSERT INTO published \
     (name, content, added, expires_at, last_warned_time, retries, status_name, message_id, transaction_id) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)";

// Both updates only apply over the row the caller read: a copy whose status or
// retry count has since moved on affects no rows.
const UPDATE_PUBLISHED: &str = "UPDATE published \
     SET status_name = $1, retries = $2, expires_at = $3, last_warned_time = $4 \
     WHERE id = $5 AND status_name = $6 AND retries = $7 AND status_name <> 'Succeeded'";

const UPDATE_RECEIVED: &str = "UPDATE received \
     SET status_name = $1, retries = $2, expires_at = $3, last_warned_time = $4 \
     WHERE id = $5 AND status_name = $6 AND retries = $7 AND status_name <> 'Succeeded'";

const ENQUEUE: &str = "INSERT INTO queue (record_id, message_type) VALUES ($1, $2)";

/// Binds message writes to a transaction someone else opened and will finish.
///
/// Wrap the connection of a business transaction (`&mut *tx`) to store outbox
/// records atomically with the business writes, or the transaction held by a
/// [`LockedMessage`](super::LockedMessage) to record a delivery outcome. This
/// type never commits or rolls back.
pub struct StorageTransaction<'c> {
    conn: &'c mut SqliteConnection,
    transaction_id: String,
}

impl<'c> StorageTransaction<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self {
            conn,
            transaction_id: new_id(),
        }
    }

    /// Correlation id stamped on every record stored through this scope.
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut *self.conn
    }

    /// Stores a new `Scheduled` record, filling in its `id`, `message_id` and
    /// `transaction_id`.
    pub async fn store_published_message(&mut self, message: &mut PublishedMessage) -> Result<()> {
        let message_id = new_id();

        let result = sqlx::query(INSERT_PUBLISHED)
            .bind(&message.name)
            .bind(&message.content)
            .bind(message.added)
            .bind(message.expires_at)
            .bind(message.last_warned_time)
            .bind(message.retries)
            .bind(StatusName::Scheduled)
            .bind(&message_id)
            .bind(&self.transaction_id)
            .execute(&mut *self.conn)
            .await
            .context(StoreQueryFailedSnafu {
                operation: "store_published_message",
            })?;

        if result.rows_affected() == 0 {
            return NoRowsAffectedSnafu {
                operation: "store_published_message",
            }
            .fail();
        }

        message.id = result.last_insert_rowid();
        message.status_name = StatusName::Scheduled;
        message.message_id = message_id;
        message.transaction_id = self.transaction_id.clone();

        Ok(())
    }

    /// Writes the lifecycle fields of `next` over the stored row, provided the
    /// row still matches `prior`.
    pub(crate) async fn update_published_message(
        &mut self,
        prior: &PublishedMessage,
        next: &PublishedMessage,
    ) -> Result<()> {
        let result = sqlx::query(UPDATE_PUBLISHED)
            .bind(next.status_name)
            .bind(next.retries)
            .bind(next.expires_at)
            .bind(next.last_warned_time)
            .bind(next.id)
            .bind(prior.status_name)
            .bind(prior.retries)
            .execute(&mut *self.conn)
            .await
            .context(StoreQueryFailedSnafu {
                operation: "update_published_message",
            })?;

        if result.rows_affected() == 0 {
            return NoRowsAffectedSnafu {
                operation: "update_published_message",
            }
            .fail();
        }

        Ok(())
    }

    /// Writes the lifecycle fields of `next` over the stored row, provided the
    /// row still matches `prior`.
    pub(crate) async fn update_received_message(
        &mut self,
        prior: &ReceivedMessage,
        next: &ReceivedMessage,
    ) -> Result<()> {
        let result = sqlx::query(UPDATE_RECEIVED)
            .bind(next.status_name)
            .bind(next.retries)
            .bind(next.expires_at)
            .bind(next.last_warned_time)
            .bind(next.id)
            .bind(prior.status_name)
            .bind(prior.retries)
            .execute(&mut *self.conn)
            .await
            .context(StoreQueryFailedSnafu {
                operation: "update_received_message",
            })?;

        if result.rows_affected() == 0 {
            return NoRowsAffectedSnafu {
                operation: "update_received_message",
            }
            .fail();
        }

        Ok(())
    }

    /// Puts a record on the delivery queue.
    pub(crate) async fn enqueue(&mut self, kind: MessageKind, record_id: i64) -> Result<()> {
        let result = sqlx::query(ENQUEUE)
            .bind(record_id)
            .bind(kind.tag())
            .execute(&mut *self.conn)
            .await
            .context(StoreQueryFailedSnafu {
                operation: "enqueue",
            })?;

        if result.rows_affected() == 0 {
            return NoRowsAffectedSnafu {
                operation: "enqueue",
            }
            .fail();
        }

        Ok(())
    }
}
