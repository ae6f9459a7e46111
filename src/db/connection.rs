use std::{str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde_json::json;
use snafu::ResultExt;
use sqlx::{
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions},
    Sqlite, SqliteConnection, SqlitePool, Transaction,
};
use tokio_stream::StreamExt;
use tracing::Level;

use super::locked::LockedMessage;
use crate::{
    config::{Config, OptionsProvider},
    error::{
        ConnectionFailedSnafu, Error, NoRowsAffectedSnafu, Result, StoreQueryFailedSnafu,
        TransactionFailedSnafu,
    },
    id::new_id,
    logger::{log_with, Logger, TracingLogger},
    message::{Message, MessageKind, PublishedMessage, ReceivedMessage, StatusName},
    state::StateChanger,
};

/// Claims the oldest queue entry. The candidate is picked and removed by key in
/// a single statement, so the row deleted is always the row selected.
const DEQUEUE: &str = "DELETE FROM queue \
     WHERE id = (SELECT id FROM queue ORDER BY id LIMIT 1) \
     RETURNING record_id, message_type";

const GET_PUBLISHED: &str = concat!("SELECT ", published_columns!(), " FROM published WHERE id = $1");

const GET_RECEIVED: &str = concat!("SELECT ", received_columns!(), " FROM received WHERE id = $1");

const GET_FAILED_PUBLISHED: &str = concat!(
    "SELECT ",
    published_columns!(),
    " FROM published WHERE status_name = 'Failed' ORDER BY id"
);

const GET_FAILED_RECEIVED: &str = concat!(
    "SELECT ",
    received_columns!(),
    " FROM received WHERE status_name = 'Failed' ORDER BY id"
);

const GET_NEXT_SCHEDULED_PUBLISHED: &str = concat!(
    "SELECT ",
    published_columns!(),
    " FROM published WHERE status_name = 'Scheduled' ORDER BY id LIMIT 1"
);

const GET_NEXT_SCHEDULED_RECEIVED: &str = concat!(
    "SELECT ",
    received_columns!(),
    " FROM received WHERE status_name = 'Scheduled' ORDER BY id LIMIT 1"
);

const INSERT_RECEIVED: &str = "INSERT INTO received \
     (name, group_name, content, added, expires_at, last_warned_time, retries, status_name, message_id, transaction_id) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)";

const DELETE_EXPIRED_PUBLISHED: &str = "DELETE FROM published WHERE id IN \
     (SELECT id FROM published WHERE expires_at IS NOT NULL AND expires_at < $1 LIMIT $2)";

const DELETE_EXPIRED_RECEIVED: &str = "DELETE FROM received WHERE id IN \
     (SELECT id FROM received WHERE expires_at IS NOT NULL AND expires_at < $1 LIMIT $2)";

/// The only component that talks to the database.
///
/// Owns a connection pool; every operation that needs a connection takes one
/// from the pool and hands it back when the returned guard or transaction drops,
/// whichever way the operation exits.
pub struct StorageConnection {
    db: SqlitePool,
    config: Config,
    changer: Arc<StateChanger>,
    logger: Arc<dyn Logger>,
}

#[bon::bon]
impl StorageConnection {
    /// Connects using configuration from the environment.
    pub async fn connect() -> Result<Self> {
        Self::connect_with().config(Config::load()?).call().await
    }

    #[builder]
    pub async fn connect_with(config: Config, logger: Option<Arc<dyn Logger>>) -> Result<Self> {
        let logger = logger.unwrap_or_else(TracingLogger::shared);
        let url = config.connection_string()?;
        let changer = Arc::new(StateChanger::new(&config, logger.clone())?);

        let opts = SqliteConnectOptions::from_str(&url)
            .context(ConnectionFailedSnafu)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .busy_timeout(config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections())
            .connect_with(opts)
            .await
            .context(ConnectionFailedSnafu)?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::debug!(url = %url, "storage connection ready");

        Ok(Self {
            db: pool,
            changer,
            config,
            logger,
        })
    }
}

impl StorageConnection {
    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }

    pub fn state_changer(&self) -> &StateChanger {
        &self.changer
    }

    /// Takes a connection from the pool. It goes back when the guard drops.
    pub async fn open_connection(&self) -> Result<PoolConnection<Sqlite>> {
        let res = self.db.acquire().await.context(ConnectionFailedSnafu);
        self.logged("open_connection", res)
    }

    /// Opens a transaction for business writes. Wrap it in a
    /// [`StorageTransaction`](super::StorageTransaction) to store or change
    /// messages inside it; the caller commits or rolls back.
    pub async fn create_transaction(&self) -> Result<Transaction<'static, Sqlite>> {
        let res = self.db.begin().await.context(TransactionFailedSnafu {
            operation: "begin",
        });
        self.logged("create_transaction", res)
    }

    /// Claims the next queued record.
    ///
    /// Returns `None` when the queue is empty. The claim lives in a transaction
    /// owned by the returned handle: concurrent callers block on the store's
    /// write lock until it is committed or rolled back, and a rollback (or a
    /// crash) leaves the queue entry in place.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_next_message(&self) -> Result<Option<LockedMessage>> {
        let res = self.fetch_next_message_inner().await;
        self.logged("fetch_next_message", res)
    }

    async fn fetch_next_message_inner(&self) -> Result<Option<LockedMessage>> {
        let mut tx = self.db.begin().await.context(TransactionFailedSnafu {
            operation: "begin",
        })?;

        let mut discarded = 0u64;

        loop {
            let claimed: Option<(i64, i64)> = sqlx::query_as(DEQUEUE)
                .fetch_optional(&mut *tx)
                .await
                .context(StoreQueryFailedSnafu {
                    operation: "fetch_next_message",
                })?;

            let Some((record_id, tag)) = claimed else {
                // Entries pointing at deleted or finished records were dropped on the way.
                if discarded > 0 {
                    tx.commit().await.context(TransactionFailedSnafu {
                        operation: "commit",
                    })?;
                } else {
                    tx.rollback().await.context(TransactionFailedSnafu {
                        operation: "rollback",
                    })?;
                }
                return Ok(None);
            };

            // Returning here drops `tx`, which rolls the claim back.
            let kind = MessageKind::try_from(tag)?;

            match load_message(&mut tx, kind, record_id).await? {
                Some(message) if message.status_name().is_terminal() => {
                    self.logger.log(
                        Level::WARN,
                        &format!(
                            "[FetchNextMessage] queued {kind} record {record_id} is already {}, dropping entry",
                            message.status_name()
                        ),
                    );
                    discarded += 1;
                }
                Some(message) => {
                    tracing::debug!(%kind, record_id, "claimed queued message");
                    return Ok(Some(LockedMessage::new(
                        message,
                        tx,
                        self.changer.clone(),
                        self.logger.clone(),
                    )));
                }
                None => {
                    self.logger.log(
                        Level::WARN,
                        &format!("[FetchNextMessage] queued {kind} record {record_id} no longer exists"),
                    );
                    discarded += 1;
                }
            }
        }
    }

    pub async fn get_failed_published_messages(&self) -> Result<Vec<PublishedMessage>> {
        let res = async {
            let mut conn = self.db.acquire().await.context(ConnectionFailedSnafu)?;
            fetch_all::<PublishedMessage>(&mut conn, GET_FAILED_PUBLISHED, "get_failed_published_messages").await
        }
        .await;
        self.logged("get_failed_published_messages", res)
    }

    pub async fn get_failed_received_messages(&self) -> Result<Vec<ReceivedMessage>> {
        let res = async {
            let mut conn = self.db.acquire().await.context(ConnectionFailedSnafu)?;
            fetch_all::<ReceivedMessage>(&mut conn, GET_FAILED_RECEIVED, "get_failed_received_messages").await
        }
        .await;
        self.logged("get_failed_received_messages", res)
    }

    pub async fn get_next_published_message_to_be_enqueued(
        &self,
    ) -> Result<Option<PublishedMessage>> {
        let res = sqlx::query_as(GET_NEXT_SCHEDULED_PUBLISHED)
            .fetch_optional(&self.db)
            .await
            .context(StoreQueryFailedSnafu {
                operation: "get_next_published_message_to_be_enqueued",
            });
        self.logged("get_next_published_message_to_be_enqueued", res)
    }

    pub async fn get_next_received_message_to_be_enqueued(
        &self,
    ) -> Result<Option<ReceivedMessage>> {
        let res = sqlx::query_as(GET_NEXT_SCHEDULED_RECEIVED)
            .fetch_optional(&self.db)
            .await
            .context(StoreQueryFailedSnafu {
                operation: "get_next_received_message_to_be_enqueued",
            });
        self.logged("get_next_received_message_to_be_enqueued", res)
    }

    pub async fn get_published_message(&self, id: i64) -> Result<Option<PublishedMessage>> {
        let res = sqlx::query_as(GET_PUBLISHED)
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .context(StoreQueryFailedSnafu {
                operation: "get_published_message",
            });
        self.logged("get_published_message", res)
    }

    pub async fn get_received_message(&self, id: i64) -> Result<Option<ReceivedMessage>> {
        let res = sqlx::query_as(GET_RECEIVED)
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .context(StoreQueryFailedSnafu {
                operation: "get_received_message",
            });
        self.logged("get_received_message", res)
    }

    /// Inserts `message` as a new `Scheduled` record with freshly generated
    /// `message_id` and `transaction_id`, writing the assigned values back.
    #[tracing::instrument(skip_all, fields(name = %message.name, group = %message.group))]
    pub async fn store_received_message(&self, message: &mut ReceivedMessage) -> Result<()> {
        let message_id = new_id();
        let transaction_id = new_id();

        let res = async {
            let mut conn = self.db.acquire().await.context(ConnectionFailedSnafu)?;

            let result = sqlx::query(INSERT_RECEIVED)
                .bind(&message.name)
                .bind(&message.group)
                .bind(&message.content)
                .bind(message.added)
                .bind(message.expires_at)
                .bind(message.last_warned_time)
                .bind(message.retries)
                .bind(StatusName::Scheduled)
                .bind(&message_id)
                .bind(&transaction_id)
                .execute(&mut *conn)
                .await
                .context(StoreQueryFailedSnafu {
                    operation: "store_received_message",
                })?;

            if result.rows_affected() == 0 {
                return NoRowsAffectedSnafu {
                    operation: "store_received_message",
                }
                .fail();
            }

            Ok::<_, Error>(result.last_insert_rowid())
        }
        .await;

        match res {
            Ok(id) => {
                message.id = id;
                message.status_name = StatusName::Scheduled;
                message.message_id = message_id;
                message.transaction_id = transaction_id;
                Ok(())
            }
            Err(e) => {
                log_with(
                    self.logger.as_ref(),
                    Level::ERROR,
                    &format!("[StoreReceivedMessage] {e}"),
                    &json!({
                        "operation": "store_received_message",
                        "error": e.kind(),
                        "message_kind": MessageKind::Received,
                        "message": &*message,
                    }),
                );
                Err(e)
            }
        }
    }

    /// Removes up to `batch` records of `kind` whose retention ended before
    /// `now`. Returns the number of records removed.
    pub async fn delete_expired_messages(
        &self,
        kind: MessageKind,
        now: DateTime<Utc>,
        batch: u32,
    ) -> Result<u64> {
        let statement = match kind {
            MessageKind::Published => DELETE_EXPIRED_PUBLISHED,
            MessageKind::Received => DELETE_EXPIRED_RECEIVED,
        };

        let res = sqlx::query(statement)
            .bind(now)
            .bind(batch)
            .execute(&self.db)
            .await
            .map(|r| r.rows_affected())
            .context(StoreQueryFailedSnafu {
                operation: "delete_expired_messages",
            });

        if let Ok(removed) = &res {
            tracing::debug!(%kind, removed, "deleted expired messages");
        }

        self.logged("delete_expired_messages", res)
    }

    fn logged<T>(&self, operation: &'static str, res: Result<T>) -> Result<T> {
        if let Err(e) = &res {
            log_with(
                self.logger.as_ref(),
                Level::ERROR,
                &format!("[{operation}] {e}"),
                &json!({ "operation": operation, "error": e.kind() }),
            );
        }
        res
    }
}

async fn load_message(
    conn: &mut SqliteConnection,
    kind: MessageKind,
    id: i64,
) -> Result<Option<Message>> {
    let message = match kind {
        MessageKind::Published => sqlx::query_as::<_, PublishedMessage>(GET_PUBLISHED)
            .bind(id)
            .fetch_optional(conn)
            .await
            .map(|m| m.map(Message::Published)),
        MessageKind::Received => sqlx::query_as::<_, ReceivedMessage>(GET_RECEIVED)
            .bind(id)
            .fetch_optional(conn)
            .await
            .map(|m| m.map(Message::Received)),
    };

    message.context(StoreQueryFailedSnafu {
        operation: "load_message",
    })
}

async fn fetch_all<T>(
    conn: &mut SqliteConnection,
    statement: &'static str,
    operation: &'static str,
) -> Result<Vec<T>>
where
    T: for<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> + Send + Unpin,
{
    let mut stream = sqlx::query_as::<_, T>(statement).fetch(conn);

    let mut records = Vec::new();

    while let Some(res) = stream.next().await.transpose().context(StoreQueryFailedSnafu {
        operation,
    })? {
        records.push(res);
    }

    Ok(records)
}

impl std::fmt::Debug for StorageConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConnection")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
