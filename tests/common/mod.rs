#![allow(dead_code)]

use std::{ops::Deref, sync::Arc};

use capstore::{
    Config, Logger, PublishedMessage, ReceivedMessage, State, StorageConnection,
    StorageTransaction, TracingLogger,
};
use tempfile::TempDir;

pub struct TmpStorage {
    storage: Arc<StorageConnection>,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl TmpStorage {
    pub fn shared(&self) -> Arc<StorageConnection> {
        self.storage.clone()
    }
}

impl Deref for TmpStorage {
    type Target = StorageConnection;

    fn deref(&self) -> &Self::Target {
        &self.storage
    }
}

pub async fn setup() -> TmpStorage {
    setup_with_logger(TracingLogger::shared()).await
}

pub async fn setup_with_logger(logger: Arc<dyn Logger>) -> TmpStorage {
    let path = tempfile::tempdir().unwrap();

    let storage = StorageConnection::connect_with()
        .config(Config::for_path(path.path().join("capstore.db")))
        .logger(logger)
        .call()
        .await
        .unwrap();

    TmpStorage {
        storage: Arc::new(storage),
        tmpdir: path,
    }
}

/// Stores a `Scheduled` published record in its own business transaction.
pub async fn store_published(storage: &StorageConnection, name: &str, content: &str) -> PublishedMessage {
    let mut tx = storage.create_transaction().await.unwrap();
    let mut message = PublishedMessage::new(name, content);

    StorageTransaction::new(&mut tx)
        .store_published_message(&mut message)
        .await
        .unwrap();

    tx.commit().await.unwrap();
    message
}

pub async fn store_received(storage: &StorageConnection, name: &str, group: &str) -> ReceivedMessage {
    let mut message = ReceivedMessage::new(name, group, "{}");
    storage.store_received_message(&mut message).await.unwrap();
    message
}

/// Moves a published record onto the delivery queue, the way the scheduled sweep does.
pub async fn enqueue_published(storage: &StorageConnection, message: &mut PublishedMessage) {
    let mut tx = storage.create_transaction().await.unwrap();

    storage
        .state_changer()
        .change_published_state(message, State::Enqueued, &mut StorageTransaction::new(&mut tx))
        .await
        .unwrap();

    tx.commit().await.unwrap();
}

pub async fn enqueue_received(storage: &StorageConnection, message: &mut ReceivedMessage) {
    let mut tx = storage.create_transaction().await.unwrap();

    storage
        .state_changer()
        .change_received_state(message, State::Enqueued, &mut StorageTransaction::new(&mut tx))
        .await
        .unwrap();

    tx.commit().await.unwrap();
}

pub async fn count(storage: &StorageConnection, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(storage.db())
        .await
        .unwrap()
}
