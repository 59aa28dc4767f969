//! Redis integration tests.
//!
//! These tests require a running Redis instance.
//! Run with: `cargo test --test redis_integration -- --ignored`
//!
//! Set `REDIS_URL` environment variable to point to your Redis instance.
//! Default: <redis://localhost:6379>

use std::sync::Arc;
use std::time::Duration;

use blockfeed_common::IdGenerator;
use blockfeed_queue::{
    Broker, DeadLetterEntry, DistributedLock, JobMessage, JobOptions, PublishStatus, QueueDescriptor,
    RedisBroker, RedisBrokerConfig, RedisCache,
};
use fred::clients::Client;
use fred::interfaces::ClientLike;
use fred::types::config::Config as RedisConfig;
use serde_json::json;

fn get_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

async fn client() -> Client {
    let config = RedisConfig::from_url(&get_redis_url()).expect("Invalid Redis URL");
    let client = Client::new(config, None, None, None);
    client.init().await.expect("Failed to connect to Redis");
    client
}

/// Each test gets its own key space.
fn test_prefix() -> String {
    format!("blockfeed-test-{}", IdGenerator::new().generate())
}

async fn broker() -> RedisBroker {
    RedisBroker::new(
        client().await,
        RedisBrokerConfig {
            prefix: test_prefix(),
            ..RedisBrokerConfig::default()
        },
    )
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_publish_reserve_ack() {
    let broker = broker().await;
    broker.declare(&QueueDescriptor::new("q")).await.unwrap();

    let message = JobMessage::new("q", json!({ "contract": "0xa" }));
    assert_eq!(broker.publish(message.clone()).await.unwrap(), PublishStatus::Queued);

    let reserved = broker.reserve("q").await.unwrap().unwrap();
    assert_eq!(reserved, message);
    assert_eq!(broker.depth("q").await.unwrap().in_flight, 1);

    broker.ack(&reserved).await.unwrap();
    let depth = broker.depth("q").await.unwrap();
    assert_eq!(depth.in_flight, 0);
    assert_eq!(depth.ready, 0);
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_job_id_dedup_and_release() {
    let broker = broker().await;
    let options = JobOptions::with_job_id("token:0xa");

    let first = JobMessage::new("q", json!(1)).with_options(&options);
    let second = JobMessage::new("q", json!(2)).with_options(&options);
    assert_eq!(broker.publish(first).await.unwrap(), PublishStatus::Queued);
    assert_eq!(broker.publish(second.clone()).await.unwrap(), PublishStatus::Duplicate);

    let reserved = broker.reserve("q").await.unwrap().unwrap();
    broker.ack(&reserved).await.unwrap();
    assert_eq!(broker.publish(second).await.unwrap(), PublishStatus::Queued);
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_lazy_queue_and_delay() {
    let broker = broker().await;
    broker.declare(&QueueDescriptor::new("lazy").lazy()).await.unwrap();

    let message = JobMessage::new("lazy", json!({ "big": true }))
        .with_options(&JobOptions::delayed(Duration::from_millis(300)));
    broker.publish(message.clone()).await.unwrap();

    assert!(broker.reserve("lazy").await.unwrap().is_none());
    assert_eq!(broker.depth("lazy").await.unwrap().delayed, 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let reserved = broker.reserve("lazy").await.unwrap().unwrap();
    assert_eq!(reserved.id, message.id);
    broker.ack(&reserved).await.unwrap();
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_retry_then_dead_letter() {
    let broker = broker().await;
    let message = JobMessage::new("q", json!(1)).with_options(&JobOptions::with_job_id("j"));
    broker.publish(message).await.unwrap();

    let mut reserved = broker.reserve("q").await.unwrap().unwrap();
    reserved.attempts = 1;
    broker.retry(reserved, Duration::ZERO).await.unwrap();

    let reserved = broker.reserve("q").await.unwrap().unwrap();
    assert_eq!(reserved.attempts, 1);

    broker
        .dead_letter(DeadLetterEntry::new(reserved, 2, "boom".to_string()))
        .await
        .unwrap();

    let dead = broker.dead_letters("q", 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].last_error, "boom");

    let again = JobMessage::new("q", json!(1)).with_options(&JobOptions::with_job_id("j"));
    assert_eq!(broker.publish(again).await.unwrap(), PublishStatus::Queued);
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_consumer_lease() {
    let broker = broker().await;
    let ttl = Duration::from_secs(5);

    assert!(broker.claim_consumer("q", "a", ttl).await.unwrap());
    assert!(!broker.claim_consumer("q", "b", ttl).await.unwrap());
    broker.release_consumer("q", "a").await.unwrap();
    assert!(broker.claim_consumer("q", "b", ttl).await.unwrap());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_distributed_lock() {
    let cache = Arc::new(RedisCache::new(client().await, test_prefix()));
    let lock = DistributedLock::new(cache);
    let keys = vec!["outbox:recovery".to_string()];

    let lease = lock
        .acquire(&keys, Duration::from_secs(10))
        .await
        .unwrap()
        .unwrap();
    assert!(lock.acquire(&keys, Duration::from_secs(10)).await.unwrap().is_none());

    lock.release(lease).await;
    assert!(lock.acquire(&keys, Duration::from_secs(10)).await.unwrap().is_some());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_stale_ack_keeps_newer_job_id() {
    let broker = broker().await;
    let options = JobOptions::with_job_id("token:0xb");

    broker
        .publish(JobMessage::new("q", json!(1)).with_options(&options))
        .await
        .unwrap();
    let first = broker.reserve("q").await.unwrap().unwrap();
    broker.ack(&first).await.unwrap();

    broker
        .publish(JobMessage::new("q", json!(2)).with_options(&options))
        .await
        .unwrap();
    broker.ack(&first).await.unwrap();

    assert_eq!(
        broker
            .publish(JobMessage::new("q", json!(3)).with_options(&options))
            .await
            .unwrap(),
        PublishStatus::Duplicate
    );
}
