use std::sync::Arc;

use capstore::{State, StatusName, StorageConnection, StorageTransaction};
use tokio::task::JoinSet;

mod common;

use common::*;

async fn claim_and_commit(storage: Arc<StorageConnection>, state: Option<State>) -> bool {
    match storage.fetch_next_message().await.unwrap() {
        Some(mut locked) => {
            if let Some(state) = state {
                locked.change_state(state).await.unwrap();
            }
            locked.commit().await.unwrap();
            locked.dispose().await;
            true
        }
        None => false,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_only_one_fetcher_claims_a_message() {
    let storage = setup().await;

    let mut message = store_published(&storage, "order.created", "{}").await;
    enqueue_published(&storage, &mut message).await;

    let mut fetchers = JoinSet::new();
    for _ in 0..6 {
        fetchers.spawn(claim_and_commit(storage.shared(), None));
    }

    let mut claimed = 0;
    while let Some(res) = fetchers.join_next().await {
        if res.unwrap() {
            claimed += 1;
        }
    }

    assert_eq!(claimed, 1);
    assert_eq!(count(&storage, "queue").await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_message_is_claimed_once() {
    let storage = setup().await;

    for i in 0..5 {
        let mut message = store_published(&storage, &format!("order.{i}"), "{}").await;
        enqueue_published(&storage, &mut message).await;
    }

    let mut fetchers = JoinSet::new();
    for _ in 0..8 {
        fetchers.spawn(claim_and_commit(storage.shared(), Some(State::Succeeded)));
    }

    let mut claimed = 0;
    while let Some(res) = fetchers.join_next().await {
        if res.unwrap() {
            claimed += 1;
        }
    }

    assert_eq!(claimed, 5);

    let succeeded: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM published WHERE status_name = 'Succeeded'")
            .fetch_one(storage.db())
            .await
            .unwrap();
    assert_eq!(succeeded, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_failures_count_each_attempt_once() {
    let storage = setup().await;

    let mut message = store_published(&storage, "order.created", "{}").await;
    enqueue_published(&storage, &mut message).await;

    for attempt in 1..=3u32 {
        let mut fetchers = JoinSet::new();
        for _ in 0..2 {
            fetchers.spawn(claim_and_commit(storage.shared(), Some(State::Failed)));
        }

        let mut winners = 0;
        while let Some(res) = fetchers.join_next().await {
            if res.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let stored = storage.get_published_message(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status_name, StatusName::Failed);
        assert_eq!(stored.retries, attempt);

        // Retry sweep: resubmit everything that failed.
        let failed = storage.get_failed_published_messages().await.unwrap();
        assert_eq!(failed.len(), 1);

        let mut tx = storage.create_transaction().await.unwrap();
        for mut failed in failed {
            storage
                .state_changer()
                .change_published_state(
                    &mut failed,
                    State::Enqueued,
                    &mut StorageTransaction::new(&mut tx),
                )
                .await
                .unwrap();
            assert_eq!(failed.retries, attempt);
        }
        tx.commit().await.unwrap();
    }

    let stored = storage.get_published_message(message.id).await.unwrap().unwrap();
    assert_eq!(stored.status_name, StatusName::Enqueued);
    assert_eq!(stored.retries, 3);
}
