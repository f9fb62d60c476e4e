use std::time::{Duration, Instant};

use graph_indexer::{BlockQueue, WorkQueue};
use testcontainers::{clients, core::WaitFor, GenericImage};

pub fn new_redis_image() -> GenericImage {
    GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout(
            "Ready to accept connections tcp",
        ))
}

async fn new_queue(port: u16) -> BlockQueue {
    let queue = BlockQueue::connect(&format!("redis://localhost:{}", port))
        .await
        .unwrap();
    queue.initialize().await.unwrap();
    queue
}

#[tokio::test]
#[ignore]
async fn test_enqueued_blocks_are_claimed_in_order() {
    let docker = clients::Cli::default();
    let redis = docker.run(new_redis_image());
    let queue = new_queue(redis.get_host_port_ipv4(6379)).await;

    queue.enqueue(&[1001, 1003]).await.unwrap();

    let batch = queue
        .claim("replica-0-consumer-0", 10, Duration::from_millis(100))
        .await
        .unwrap();

    let slots = batch.iter().map(|entry| entry.slot).collect::<Vec<_>>();
    assert_eq!(slots, vec![1001, 1003]);

    // Already delivered to this group.
    let empty = queue
        .claim("replica-0-consumer-0", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
#[ignore]
async fn test_claim_on_an_empty_stream_returns_within_the_block_window() {
    let docker = clients::Cli::default();
    let redis = docker.run(new_redis_image());
    let queue = new_queue(redis.get_host_port_ipv4(6379)).await;

    let started = Instant::now();
    let batch = queue
        .claim("replica-0-consumer-0", 10, Duration::from_millis(500))
        .await
        .unwrap();

    assert!(batch.is_empty());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
#[ignore]
async fn test_unacked_entries_are_reclaimable() {
    let docker = clients::Cli::default();
    let redis = docker.run(new_redis_image());
    let queue = new_queue(redis.get_host_port_ipv4(6379)).await;

    queue.enqueue(&[42]).await.unwrap();

    let claimed = queue
        .claim("replica-0-consumer-0", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);

    // The crashed consumer never acks; another consumer rescues the entry.
    let rescued = queue
        .reclaim("replica-0-consumer-1", Duration::ZERO, 10)
        .await
        .unwrap();
    assert_eq!(rescued, claimed);

    let ids = rescued.into_iter().map(|entry| entry.id).collect::<Vec<_>>();
    queue.ack(&ids).await.unwrap();

    let empty = queue
        .reclaim("replica-0-consumer-1", Duration::ZERO, 10)
        .await
        .unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
#[ignore]
async fn test_acking_unknown_ids_is_a_no_op() {
    let docker = clients::Cli::default();
    let redis = docker.run(new_redis_image());
    let queue = new_queue(redis.get_host_port_ipv4(6379)).await;

    queue.ack(&["12345-0".to_string()]).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_cursor_roundtrip() {
    let docker = clients::Cli::default();
    let redis = docker.run(new_redis_image());
    let queue = new_queue(redis.get_host_port_ipv4(6379)).await;

    assert_eq!(queue.cursor().await.unwrap(), 0);

    queue.set_cursor(1004).await.unwrap();
    assert_eq!(queue.cursor().await.unwrap(), 1004);
}

#[tokio::test]
#[ignore]
async fn test_initialize_is_idempotent() {
    let docker = clients::Cli::default();
    let redis = docker.run(new_redis_image());
    let queue = new_queue(redis.get_host_port_ipv4(6379)).await;

    queue.initialize().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_consumers_share_the_stream() {
    let docker = clients::Cli::default();
    let redis = docker.run(new_redis_image());
    let queue = new_queue(redis.get_host_port_ipv4(6379)).await;

    queue.enqueue(&[1, 2, 3, 4]).await.unwrap();

    let first = queue
        .claim("replica-0-consumer-0", 2, Duration::from_millis(100))
        .await
        .unwrap();
    let second = queue
        .claim("replica-0-consumer-1", 2, Duration::from_millis(100))
        .await
        .unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);

    let mut slots = first
        .iter()
        .chain(second.iter())
        .map(|entry| entry.slot)
        .collect::<Vec<_>>();
    slots.sort_unstable();
    assert_eq!(slots, vec![1, 2, 3, 4]);
}
