// ============================================================================
// Redis Queue Store Tests
// ============================================================================
//
// These tests require a running Redis instance (default redis://127.0.0.1/,
// override with REDIS_URL). Run with: cargo test -- --ignored

use fanout_server::config::RedisKeys;
use fanout_server::message::QueueMessage;
use fanout_server::queue::{QueueStore, RedisQueue};
use serial_test::serial;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
}

fn test_keys(suffix: &str) -> RedisKeys {
    RedisKeys {
        queue: format!("test:broadcast:queue:{}", suffix),
        stats: format!("test:broadcast:stats:{}", suffix),
        lock: format!("test:broadcast:lock:{}", suffix),
    }
}

async fn connect(suffix: &str) -> RedisQueue {
    let queue = RedisQueue::connect(&redis_url(), test_keys(suffix))
        .await
        .expect("Redis must be reachable for ignored tests");
    cleanup(suffix).await;
    queue
}

async fn cleanup(suffix: &str) {
    let client = redis::Client::open(redis_url().as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let keys = test_keys(suffix);
    let _: () = redis::cmd("DEL")
        .arg(&keys.queue)
        .arg(&keys.stats)
        .arg(&keys.lock)
        .query_async(&mut conn)
        .await
        .unwrap();
}

fn message(id: &str, chat_id: &str, priority: f64) -> QueueMessage {
    QueueMessage {
        id: id.to_string(),
        chat_id: chat_id.to_string(),
        text: format!("text for {}", id),
        parse_mode: None,
        keyboard: None,
        image_url: None,
        priority,
        created_at: 0,
        batch_id: None,
    }
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn enqueue_peek_remove_round_trip() {
    let queue = connect("round_trip").await;

    queue.enqueue(&message("m2", "2", 2.0)).await.unwrap();
    queue.enqueue(&message("m1", "1", 1.0)).await.unwrap();
    queue.enqueue(&message("m3", "3", 3.0)).await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 3);

    // Peeking returns entries in ascending priority order and removes nothing
    let batch = queue.peek_batch(2).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert!(batch[0].contains(r#""id":"m1""#));
    assert!(batch[1].contains(r#""id":"m2""#));
    assert_eq!(queue.len().await.unwrap(), 3);

    queue.remove(&batch[0]).await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 2);

    // Removing an entry that is already gone is a no-op
    queue.remove(&batch[0]).await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 2);

    cleanup("round_trip").await;
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn lock_is_exclusive_until_released() {
    let queue = connect("lock_exclusive").await;

    let token = queue
        .try_acquire_lock(30)
        .await
        .unwrap()
        .expect("first acquire must succeed");
    assert!(queue.is_locked().await.unwrap());

    // Second acquire is refused while the lock is held
    assert!(queue.try_acquire_lock(30).await.unwrap().is_none());

    assert!(queue.release_lock(&token).await.unwrap());
    assert!(!queue.is_locked().await.unwrap());

    // After release the lock is free for the next worker
    let second = queue.try_acquire_lock(30).await.unwrap();
    assert!(second.is_some());
    assert_ne!(second.as_deref(), Some(token.as_str()));

    cleanup("lock_exclusive").await;
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn extend_and_release_are_guarded_by_owner_token() {
    let queue = connect("lock_token").await;

    let token = queue
        .try_acquire_lock(30)
        .await
        .unwrap()
        .expect("acquire must succeed");

    // The owner can refresh, a stale token cannot
    assert!(queue.extend_lock(&token, 30).await.unwrap());
    assert!(!queue.extend_lock("stale-token", 30).await.unwrap());

    // A stale token cannot release either; the lock survives
    assert!(!queue.release_lock("stale-token").await.unwrap());
    assert!(queue.is_locked().await.unwrap());

    assert!(queue.release_lock(&token).await.unwrap());
    // Releasing twice reports that we no longer own the lock
    assert!(!queue.release_lock(&token).await.unwrap());

    cleanup("lock_token").await;
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn stats_accumulate_across_drains() {
    let queue = connect("stats").await;

    assert_eq!(queue.fetch_stats().await.unwrap().total_sent, 0);

    queue.record_stats(10, 2, 1_700_000_000_000).await.unwrap();
    queue.record_stats(5, 1, 1_700_000_060_000).await.unwrap();

    let stats = queue.fetch_stats().await.unwrap();
    assert_eq!(stats.total_sent, 15);
    assert_eq!(stats.total_failed, 3);
    assert_eq!(stats.last_processed_at, 1_700_000_060_000);

    cleanup("stats").await;
}
