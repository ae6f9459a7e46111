use std::sync::Arc;

use serde_json::json;
use snafu::ResultExt;
use sqlx::{sqlite::SqliteStatement, Executor, Sqlite, SqliteConnection, Transaction};
use tracing::Level;

use super::transaction::StorageTransaction;
use crate::{
    error::{Error, HandleClosedSnafu, Result, StoreQueryFailedSnafu, TransactionFailedSnafu},
    logger::{log_with, Logger},
    message::{Message, MessageKind},
    state::{State, StateChanger},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Open,
    Committed,
    RolledBack,
    /// Commit failed; only `dispose` remains meaningful.
    Broken,
}

impl HandleState {
    fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
            Self::Broken => "broken",
        }
    }
}

/// Exclusive hold on one dequeued record for the duration of a delivery attempt.
///
/// The handle owns the transaction the record was claimed in; the claim stays
/// invisible to other fetchers until [`commit`](Self::commit). Rolling back, or
/// dropping the handle while it is open, puts the record back on the queue.
pub struct LockedMessage {
    message: Message,
    tx: Option<Transaction<'static, Sqlite>>,
    state: HandleState,
    changer: Arc<StateChanger>,
    logger: Arc<dyn Logger>,
}

impl LockedMessage {
    pub(crate) fn new(
        message: Message,
        tx: Transaction<'static, Sqlite>,
        changer: Arc<StateChanger>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            message,
            tx: Some(tx),
            state: HandleState::Open,
            changer,
            logger,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn is_open(&self) -> bool {
        self.state == HandleState::Open
    }

    /// Connection of the held transaction, for delivery-scoped writes.
    pub fn connection(&mut self) -> Result<&mut SqliteConnection> {
        match self.tx.as_mut() {
            Some(tx) if self.state == HandleState::Open => Ok(&mut **tx),
            _ => HandleClosedSnafu {
                state: self.state.name(),
            }
            .fail(),
        }
    }

    /// Prepares `query` on the held transaction. Execute the statement against
    /// [`connection`](Self::connection) before committing.
    pub async fn prepare<'q>(&mut self, query: &'q str) -> Result<SqliteStatement<'q>> {
        let res = match self.connection() {
            Ok(conn) => conn.prepare(query).await.context(StoreQueryFailedSnafu {
                operation: "prepare",
            }),
            Err(e) => Err(e),
        };

        if let Err(e) = &res {
            self.logger.log(Level::ERROR, &format!("[Prepare] {e}"));
        }

        res
    }

    pub async fn commit(&mut self) -> Result<()> {
        let tx = self.take_open()?;

        match tx.commit().await {
            Ok(()) => {
                self.state = HandleState::Committed;
                Ok(())
            }
            Err(source) => {
                self.state = HandleState::Broken;
                let err = Error::TransactionFailed {
                    operation: "commit",
                    source,
                };
                self.log_error("[Commit]", &err);
                Err(err)
            }
        }
    }

    pub async fn rollback(&mut self) -> Result<()> {
        let tx = self.take_open()?;
        self.state = HandleState::RolledBack;

        let res = tx.rollback().await.context(TransactionFailedSnafu {
            operation: "rollback",
        });

        if let Err(e) = &res {
            self.log_error("[Rollback]", e);
        }

        res
    }

    /// Moves the held record into `state` inside the held transaction. The
    /// change becomes durable on [`commit`](Self::commit).
    ///
    /// Failures inside the change are logged by the state changer.
    pub async fn change_state(&mut self, state: State) -> Result<()> {
        match self.tx.as_mut() {
            Some(tx) if self.state == HandleState::Open => {
                let mut storage = StorageTransaction::new(&mut **tx);
                self.changer
                    .change_state(&mut self.message, state, &mut storage)
                    .await
            }
            _ => {
                let err = Error::HandleClosed {
                    state: self.state.name(),
                };
                self.log_error("[ChangeState]", &err);
                Err(err)
            }
        }
    }

    /// Releases the connection. An open transaction is rolled back first; a
    /// failure there is logged and otherwise ignored.
    pub async fn dispose(mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                self.logger.log(Level::ERROR, &format!("[Dispose] {e}"));
            }
            self.state = HandleState::RolledBack;
        }
    }

    fn take_open(&mut self) -> Result<Transaction<'static, Sqlite>> {
        if self.state != HandleState::Open {
            return HandleClosedSnafu {
                state: self.state.name(),
            }
            .fail();
        }

        self.tx.take().ok_or_else(|| Error::HandleClosed {
            state: self.state.name(),
        })
    }

    fn log_error(&self, operation: &str, err: &Error) {
        log_with(
            self.logger.as_ref(),
            Level::ERROR,
            &format!("{operation} {err}"),
            &json!({
                "error": err.kind(),
                "message_kind": self.message.kind(),
                "message": &self.message,
            }),
        );
    }
}

impl std::fmt::Debug for LockedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedMessage")
            .field("message", &self.message)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for LockedMessage {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.logger.log(
                Level::WARN,
                &format!(
                    "[Dispose] locked {} message {} dropped while open, rolling back",
                    self.message.kind(),
                    self.message.id()
                ),
            );
        }
    }
}
