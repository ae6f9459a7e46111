//! Logging capability handed to every component that reports errors.
//!
//! Components never reach for a process-wide logger registry: they receive an
//! `Arc<dyn Logger>` when they are built and keep it for their own lifetime.
//! The default [`TracingLogger`] turns every call into a `tracing` event and
//! additionally fans it out to any registered [`LogDelegate`].

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, RwLock},
};

use serde::Serialize;
use tracing::{level_filters::LevelFilter, Level};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

/// Callback receiving every record logged through a [`TracingLogger`].
pub type LogDelegate = Arc<dyn Fn(&LogRecord) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

pub trait Logger: Send + Sync {
    fn log(&self, level: Level, message: &str);

    fn log_data(&self, level: Level, message: &str, data: serde_json::Value);

    fn register(&self, delegate: LogDelegate);
}

/// Serialises `data` and logs it as structured context. Serialisation failures
/// are logged in place of the context and never reach the caller.
pub fn log_with<T: Serialize>(logger: &dyn Logger, level: Level, message: &str, data: &T) {
    match serde_json::to_value(data) {
        Ok(value) => logger.log_data(level, message, value),
        Err(e) => logger.log(level, &format!("{message} (context unavailable: {e})")),
    }
}

#[derive(Default)]
pub struct TracingLogger {
    delegates: RwLock<Vec<LogDelegate>>,
}

impl TracingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn Logger> {
        Arc::new(Self::new())
    }

    fn dispatch(&self, record: LogRecord) {
        let Ok(delegates) = self.delegates.read() else {
            return;
        };

        for delegate in delegates.iter() {
            if catch_unwind(AssertUnwindSafe(|| delegate(&record))).is_err() {
                tracing::warn!("log delegate panicked");
            }
        }
    }
}

macro_rules! emit {
    ($level:expr, $($field:tt)+) => {
        match $level {
            Level::ERROR => tracing::error!($($field)+),
            Level::WARN => tracing::warn!($($field)+),
            Level::INFO => tracing::info!($($field)+),
            Level::DEBUG => tracing::debug!($($field)+),
            _ => tracing::trace!($($field)+),
        }
    };
}

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &str) {
        emit!(level, "{message}");

        self.dispatch(LogRecord {
            level,
            message: message.to_owned(),
            data: None,
        });
    }

    fn log_data(&self, level: Level, message: &str, data: serde_json::Value) {
        emit!(level, data = %data, "{message}");

        self.dispatch(LogRecord {
            level,
            message: message.to_owned(),
            data: Some(data),
        });
    }

    fn register(&self, delegate: LogDelegate) {
        if let Ok(mut delegates) = self.delegates.write() {
            delegates.push(delegate);
        }
    }
}

/// Installs a global `tracing` subscriber filtered by `CAPSTORE_LOG`.
///
/// Pretty output in debug builds, JSON in release builds.
pub fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("CAPSTORE_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}
