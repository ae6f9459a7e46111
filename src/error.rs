use snafu::Snafu;

use crate::message::StatusName;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to connect to the message store"))]
    ConnectionFailed {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Transaction error during {operation}"))]
    TransactionFailed {
        operation: &'static str,
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("{operation} should affect 1 row but affected 0 rows"))]
    NoRowsAffected { operation: &'static str },

    #[snafu(display("Unknown message kind: {tag}"))]
    UnknownMessageKind { tag: i64 },

    #[snafu(display("Query failed during {operation}"))]
    StoreQueryFailed {
        operation: &'static str,
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Cannot change message state from {from} to {to}"))]
    InvalidTransition { from: StatusName, to: StatusName },

    #[snafu(display("Locked message is already {state}"))]
    HandleClosed { state: &'static str },

    #[snafu(display("Invalid configuration: {message}"))]
    Configuration { message: String },

    #[snafu(display("Error running migrations"))]
    Migration {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migration { source }
    }
}

impl From<envy::Error> for Error {
    fn from(e: envy::Error) -> Self {
        Self::Configuration {
            message: e.to_string(),
        }
    }
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Short, stable name of the error class, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionFailed { .. } => "connection_failed",
            Self::TransactionFailed { .. } => "transaction_failed",
            Self::NoRowsAffected { .. } => "no_rows_affected",
            Self::UnknownMessageKind { .. } => "unknown_message_kind",
            Self::StoreQueryFailed { .. } => "store_query_failed",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::HandleClosed { .. } => "handle_closed",
            Self::Configuration { .. } => "configuration",
            Self::Migration { .. } => "migration",
        }
    }
}
