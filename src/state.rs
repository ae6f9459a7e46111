//! Lifecycle states and the single component allowed to move records between them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::Level;

use crate::{
    config::Config,
    db::transaction::StorageTransaction,
    error::{Error, Result},
    logger::{log_with, Logger},
    message::{Message, MessageKind, PublishedMessage, ReceivedMessage, StatusName},
};

/// Target of a state change. Each state has an entry action applied to the
/// record before it is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Scheduled,
    /// Entry places the record on the delivery queue.
    Enqueued,
    /// Entry stamps the retention deadline.
    Succeeded,
    /// Entry counts the attempt and stamps the warning time.
    Failed,
}

impl State {
    pub fn name(self) -> StatusName {
        match self {
            Self::Scheduled => StatusName::Scheduled,
            Self::Enqueued => StatusName::Enqueued,
            Self::Succeeded => StatusName::Succeeded,
            Self::Failed => StatusName::Failed,
        }
    }

    /// Applies the in-memory part of entering this state.
    pub(crate) fn enter(self, record: &mut impl Tracked, now: DateTime<Utc>, expiry: &Expiry) {
        let lifecycle = record.lifecycle();

        *lifecycle.status_name = self.name();
        *lifecycle.expires_at = match self {
            Self::Scheduled | Self::Enqueued => None,
            Self::Succeeded => Some(now + expiry.succeeded),
            Self::Failed => Some(now + expiry.failed),
        };

        if self == Self::Failed {
            *lifecycle.retries += 1;
            *lifecycle.last_warned_time = Some(now);
        }
    }
}

/// Mutable view of the fields a state change may touch.
pub(crate) struct Lifecycle<'a> {
    status_name: &'a mut StatusName,
    expires_at: &'a mut Option<DateTime<Utc>>,
    last_warned_time: &'a mut Option<DateTime<Utc>>,
    retries: &'a mut u32,
}

pub(crate) trait Tracked {
    fn lifecycle(&mut self) -> Lifecycle<'_>;
}

macro_rules! tracked {
    ($($ty:ty),+) => {
        $(
            impl Tracked for $ty {
                fn lifecycle(&mut self) -> Lifecycle<'_> {
                    Lifecycle {
                        status_name: &mut self.status_name,
                        expires_at: &mut self.expires_at,
                        last_warned_time: &mut self.last_warned_time,
                        retries: &mut self.retries,
                    }
                }
            }
        )+
    };
}

tracked!(PublishedMessage, ReceivedMessage);

#[derive(Debug, Clone, Copy)]
pub(crate) struct Expiry {
    succeeded: chrono::Duration,
    failed: chrono::Duration,
}

pub struct StateChanger {
    expiry: Expiry,
    logger: Arc<dyn Logger>,
}

impl StateChanger {
    pub fn new(config: &Config, logger: Arc<dyn Logger>) -> Result<Self> {
        Ok(Self {
            expiry: Expiry {
                succeeded: config.succeeded_expiry()?,
                failed: config.failed_expiry()?,
            },
            logger,
        })
    }

    /// Moves `message` into `state` and persists it through `transaction`.
    ///
    /// The record is only updated in memory once the write went through, so on
    /// error it still reflects what is stored.
    pub async fn change_state(
        &self,
        message: &mut Message,
        state: State,
        transaction: &mut StorageTransaction<'_>,
    ) -> Result<()> {
        match message {
            Message::Published(m) => self.change_published_state(m, state, transaction).await,
            Message::Received(m) => self.change_received_state(m, state, transaction).await,
        }
    }

    pub async fn change_published_state(
        &self,
        message: &mut PublishedMessage,
        state: State,
        transaction: &mut StorageTransaction<'_>,
    ) -> Result<()> {
        self.check_transition(message.status_name, state, MessageKind::Published, &*message)?;

        let mut next = message.clone();
        state.enter(&mut next, Utc::now(), &self.expiry);

        let res = async {
            transaction.update_published_message(&*message, &next).await?;
            if state == State::Enqueued {
                transaction.enqueue(MessageKind::Published, next.id).await?;
            }
            Ok::<_, Error>(())
        }
        .await;

        self.finish(res, MessageKind::Published, &next)?;
        *message = next;
        Ok(())
    }

    pub async fn change_received_state(
        &self,
        message: &mut ReceivedMessage,
        state: State,
        transaction: &mut StorageTransaction<'_>,
    ) -> Result<()> {
        self.check_transition(message.status_name, state, MessageKind::Received, &*message)?;

        let mut next = message.clone();
        state.enter(&mut next, Utc::now(), &self.expiry);

        let res = async {
            transaction.update_received_message(&*message, &next).await?;
            if state == State::Enqueued {
                transaction.enqueue(MessageKind::Received, next.id).await?;
            }
            Ok::<_, Error>(())
        }
        .await;

        self.finish(res, MessageKind::Received, &next)?;
        *message = next;
        Ok(())
    }

    fn check_transition<T: serde::Serialize>(
        &self,
        from: StatusName,
        to: State,
        kind: MessageKind,
        message: &T,
    ) -> Result<()> {
        if !from.is_terminal() {
            return Ok(());
        }

        let err = Error::InvalidTransition { from, to: to.name() };
        self.log_failure(&err, kind, message);
        Err(err)
    }

    fn finish<T: serde::Serialize>(
        &self,
        res: Result<()>,
        kind: MessageKind,
        message: &T,
    ) -> Result<()> {
        if let Err(e) = &res {
            self.log_failure(e, kind, message);
        }
        res
    }

    fn log_failure<T: serde::Serialize>(&self, err: &Error, kind: MessageKind, message: &T) {
        log_with(
            self.logger.as_ref(),
            Level::ERROR,
            &format!("[ChangeState] {err}"),
            &json!({
                "operation": "change_state",
                "error": err.kind(),
                "message_kind": kind,
                "message": message,
            }),
        );
    }
}
