use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kafka_queue::test_utils::{MemoryStats, MemoryTransport};
use kafka_queue::{NameList, Queue, QueueConfig, QueueError, TopicConfig, TransportError, WRITERS_PER_TOPIC};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const BROKER: &str = "memory:9092";
const TOPIC: &str = "events";
const GROUP: &str = "workers";

fn names(list: &[&str]) -> NameList {
    list.iter().copied().collect()
}

fn config(group: &str, concurrency: usize) -> QueueConfig {
    QueueConfig {
        concurrency,
        queues_to_read: names(&[TOPIC]),
        queues_to_write: names(&[TOPIC]),
        brokers: names(&[BROKER]),
        consumer_group: group.to_string(),
        ..QueueConfig::default()
    }
}

async fn start(transport: &MemoryTransport, config: QueueConfig) -> Queue<MemoryTransport> {
    Queue::with_transport(config, transport.clone())
        .await
        .expect("failed to start queue")
}

fn in_ms(ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(ms)
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true: {what}");
}

fn all_closed(stats: MemoryStats) -> bool {
    stats.readers_opened == stats.readers_closed && stats.writers_opened == stats.writers_closed
}

#[tokio::test]
async fn test_every_published_record_is_delivered() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 2);
    let queue = start(&transport, config(GROUP, 2)).await;

    let sent: Vec<String> = (0..10).map(|i| format!("record-{i}")).collect();
    queue
        .put_batch(TOPIC, sent.iter().map(|s| s.as_bytes().to_vec()))
        .await
        .expect("failed to put batch");

    let mut received = HashSet::new();
    for _ in 0..sent.len() {
        let message = queue
            .get_with_deadline(TOPIC, in_ms(2000))
            .await
            .expect("failed to get message");
        received.insert(String::from_utf8(message.data().to_vec()).unwrap());
        message.ack().await.expect("failed to ack");
    }
    assert_eq!(received, sent.into_iter().collect::<HashSet<_>>());

    assert!(matches!(
        queue.get_with_deadline(TOPIC, in_ms(100)).await,
        Err(QueueError::DeadlineExceeded)
    ));
    let committed: i64 = (0..2)
        .map(|p| transport.committed(GROUP, TOPIC, p).unwrap_or(0))
        .sum();
    assert_eq!(committed, 10);

    queue.close().await;
}

#[tokio::test]
async fn test_nack_redelivers_on_single_partition() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 1);
    let queue = start(&transport, config(GROUP, 3)).await;
    assert_eq!(transport.stats().readers_opened, 3);

    queue
        .put_batch(TOPIC, ["a", "b", "c", "d", "e"])
        .await
        .expect("failed to put batch");

    let first = queue.get(TOPIC).await.expect("failed to get message");
    assert_eq!(first.offset(), 0);
    first.nack().expect("failed to nack");

    let again = queue
        .get_with_deadline(TOPIC, in_ms(2000))
        .await
        .expect("rejected record was not redelivered");
    assert!(again.offset() <= first.offset());
    assert_eq!(again.data(), b"a");

    // The discarded handle was closed and a fresh one took its slot
    assert_eq!(transport.stats().readers_opened, 4);
    eventually("rejected handle closed", || transport.stats().readers_closed == 1).await;
    let stats = queue.reader_pool_stats(TOPIC).unwrap();
    assert_eq!(stats.retirements, 1);
    assert_eq!(stats.in_circulation, 3);

    again.ack().await.expect("failed to ack");
    for expected in 1..5 {
        let message = queue
            .get_with_deadline(TOPIC, in_ms(2000))
            .await
            .expect("failed to get message");
        assert_eq!(message.offset(), expected);
        message.ack().await.expect("failed to ack");
    }

    assert!(matches!(
        queue.get_with_deadline(TOPIC, in_ms(200)).await,
        Err(QueueError::DeadlineExceeded)
    ));
    assert_eq!(transport.committed(GROUP, TOPIC, 0), Some(5));

    queue.close().await;
}

#[tokio::test]
async fn test_ack_and_nack_only_count_once() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 1);
    let queue = start(&transport, config(GROUP, 1)).await;
    queue.put(TOPIC, "a").await.expect("failed to put");

    let message = queue.get(TOPIC).await.expect("failed to get message");
    assert!(!message.is_released());
    message.ack().await.expect("failed to ack");
    assert!(message.is_released());

    message.ack().await.expect("second ack should be a no-op");
    message.nack().expect("nack after ack should be a no-op");

    assert_eq!(transport.committed(GROUP, TOPIC, 0), Some(1));
    assert_eq!(transport.stats().readers_opened, 1);
    let stats = queue.reader_pool_stats(TOPIC).unwrap();
    assert_eq!(stats.retirements, 0);
    assert_eq!(stats.releases, 1);

    queue.close().await;
}

#[tokio::test]
async fn test_nack_is_rejected_when_handle_released_on_emit() {
    for (group, async_ack) in [("", false), (GROUP, true)] {
        let transport = MemoryTransport::new().with_topic(TOPIC, 1);
        let queue = start(
            &transport,
            QueueConfig {
                async_ack,
                ..config(group, 1)
            },
        )
        .await;
        queue.put(TOPIC, "a").await.expect("failed to put");

        let message = queue.get(TOPIC).await.expect("failed to get message");
        assert!(message.is_released());
        let before = queue.reader_pool_stats(TOPIC).unwrap();

        assert!(matches!(
            message.nack(),
            Err(QueueError::AsyncRejectUnsupported)
        ));

        let after = queue.reader_pool_stats(TOPIC).unwrap();
        assert_eq!(before.retirements, after.retirements);
        assert_eq!(before.in_circulation, after.in_circulation);
        assert_eq!(transport.stats().readers_opened, 1);

        // Acks of such messages don't commit anything themselves
        message.ack().await.expect("failed to ack");
        queue.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_is_idempotent_and_leak_free() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 2);
    let queue = Arc::new(start(&transport, config(GROUP, 2)).await);
    queue
        .put_batch(TOPIC, ["a", "b", "c"])
        .await
        .expect("failed to put batch");
    let held = queue.get(TOPIC).await.expect("failed to get message");

    let closers: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.close().await })
        })
        .collect();
    for closer in closers {
        closer.await.expect("close panicked");
    }
    queue.close().await;

    assert!(queue.is_closed());
    assert!(matches!(queue.put(TOPIC, "late").await, Err(QueueError::Closed)));
    assert!(matches!(queue.get(TOPIC).await, Err(QueueError::Closed)));
    assert!(matches!(
        queue.register_reader("other").await,
        Err(QueueError::Closed)
    ));
    assert_eq!(transport.stats().writers_closed, WRITERS_PER_TOPIC);

    // The held message still owns its handle and closes it when it goes away
    drop(held);
    eventually("every handle closed", || all_closed(transport.stats())).await;
}

#[tokio::test]
async fn test_ack_after_close_still_commits() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 1);
    let queue = start(&transport, config(GROUP, 1)).await;
    queue.put(TOPIC, "a").await.expect("failed to put");
    let message = queue.get(TOPIC).await.expect("failed to get message");

    queue.close().await;
    message.ack().await.expect("failed to ack");

    assert_eq!(transport.committed(GROUP, TOPIC, 0), Some(1));
    eventually("every handle closed", || all_closed(transport.stats())).await;
}

#[tokio::test]
async fn test_lag_tracks_acknowledged_offsets() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 1);
    let queue = start(&transport, config(GROUP, 1)).await;
    queue.put(TOPIC, "a").await.expect("failed to put");

    let message = queue.get(TOPIC).await.expect("failed to get message");
    assert_eq!(queue.consumer_lag_for_single_partition(TOPIC).await.unwrap(), 1);
    message.ack().await.expect("failed to ack");
    assert_eq!(queue.consumer_lag_for_single_partition(TOPIC).await.unwrap(), 0);

    queue.put_batch(TOPIC, ["b", "c"]).await.expect("failed to put batch");
    assert_eq!(queue.consumer_lag_for_single_partition(TOPIC).await.unwrap(), 2);

    assert!(matches!(
        queue.consumer_lag_for_single_partition("missing").await,
        Err(QueueError::UnknownTopic(_))
    ));
    queue.close().await;
}

#[tokio::test]
async fn test_unknown_topics_are_rejected() {
    let transport = MemoryTransport::new();
    let queue = start(&transport, config(GROUP, 1)).await;

    match queue.get("missing").await {
        Err(QueueError::UnknownTopic(topic)) => assert_eq!(topic, "missing"),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(matches!(
        queue.put("missing", "a").await,
        Err(QueueError::UnknownTopic(_))
    ));
    assert!(queue.reader_pool_stats("missing").is_none());

    queue.close().await;
}

#[tokio::test]
async fn test_unreachable_broker_fails_construction() {
    let transport = MemoryTransport::new();
    transport.set_unreachable(BROKER);

    let mut config = config(GROUP, 2);
    config.brokers = names(&["memory:9093", BROKER]);

    match Queue::with_transport(config, transport.clone()).await {
        Err(QueueError::Transport(TransportError::Unreachable { broker, .. })) => {
            assert_eq!(broker, BROKER)
        }
        other => panic!("expected unreachable broker, got {:?}", other.err()),
    }
    assert_eq!(transport.stats().readers_opened, 0);
    assert_eq!(transport.stats().writers_opened, 0);
}

#[tokio::test]
async fn test_config_without_topics_is_rejected() {
    let config = QueueConfig {
        brokers: names(&[BROKER]),
        ..QueueConfig::default()
    };
    assert!(matches!(
        Queue::with_transport(config, MemoryTransport::new()).await,
        Err(QueueError::Config(_))
    ));
}

#[tokio::test]
async fn test_failed_registration_closes_what_it_opened() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 1);
    transport.fail_reader_opens(1, 1);

    let result = Queue::with_transport(config(GROUP, 3), transport.clone()).await;
    assert!(matches!(
        result,
        Err(QueueError::Transport(TransportError::Broker(_)))
    ));

    assert_eq!(transport.stats().readers_opened, 1);
    eventually("opened reader closed", || all_closed(transport.stats())).await;
}

#[tokio::test]
async fn test_fetch_errors_are_retried() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 1);
    transport.fail_next_fetches(3);
    let queue = start(&transport, config("", 1)).await;

    queue.put(TOPIC, "a").await.expect("failed to put");
    let message = queue
        .get_with_deadline(TOPIC, in_ms(3000))
        .await
        .expect("fetch errors should not stop the worker");
    assert_eq!(message.data(), b"a");

    queue.close().await;
}

#[tokio::test]
async fn test_write_failure_is_surfaced_and_writer_reused() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 1);
    let queue = start(&transport, config(GROUP, 1)).await;
    transport.fail_next_writes(1);

    match queue.put(TOPIC, "a").await {
        Err(QueueError::Publish { topic, .. }) => assert_eq!(topic, TOPIC),
        other => panic!("expected publish error, got {other:?}"),
    }
    let stats = queue.writer_pool_stats(TOPIC).unwrap();
    assert_eq!(stats.available, WRITERS_PER_TOPIC);
    assert_eq!(stats.releases, 1);

    queue.put(TOPIC, "b").await.expect("writer should be reusable");
    assert_eq!(transport.records(TOPIC).len(), 1);
    assert_eq!(transport.stats().writers_opened, WRITERS_PER_TOPIC);

    queue.close().await;
}

#[tokio::test]
async fn test_commit_failure_still_returns_handle() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 1);
    let queue = start(&transport, config(GROUP, 1)).await;
    queue.put_batch(TOPIC, ["a", "b"]).await.expect("failed to put batch");
    transport.fail_next_commits(1);

    let first = queue.get(TOPIC).await.expect("failed to get message");
    match first.ack().await {
        Err(QueueError::Commit { offset, .. }) => assert_eq!(offset, 0),
        other => panic!("expected commit error, got {other:?}"),
    }
    assert!(first.is_released());
    assert_eq!(transport.committed(GROUP, TOPIC, 0), None);

    let second = queue
        .get_with_deadline(TOPIC, in_ms(2000))
        .await
        .expect("handle should be back in the pool");
    assert_eq!(second.offset(), 1);
    second.ack().await.expect("failed to ack");
    assert_eq!(transport.committed(GROUP, TOPIC, 0), Some(2));

    queue.close().await;
}

#[tokio::test]
async fn test_dropped_message_is_redelivered() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 1);
    let queue = start(&transport, config(GROUP, 1)).await;
    queue.put(TOPIC, "a").await.expect("failed to put");

    let message = queue.get(TOPIC).await.expect("failed to get message");
    drop(message);

    let again = queue
        .get_with_deadline(TOPIC, in_ms(2000))
        .await
        .expect("dropped record was not redelivered");
    assert_eq!(again.offset(), 0);
    assert_eq!(transport.stats().readers_opened, 2);
    again.ack().await.expect("failed to ack");

    queue.close().await;
}

#[tokio::test]
async fn test_runtime_registration() {
    let transport = MemoryTransport::new().with_topic("results", 1);
    let queue = start(&transport, config(GROUP, 1)).await;

    queue
        .register_writer("results", 2)
        .await
        .expect("failed to register writer");
    queue
        .register_reader("results")
        .await
        .expect("failed to register reader");
    let opened = transport.stats();

    queue.register_reader("results").await.unwrap();
    queue.register_writer("results", 2).await.unwrap();
    assert_eq!(transport.stats(), opened);
    assert_eq!(queue.writer_pool_stats("results").unwrap().capacity, 2);

    queue.put("results", "done").await.expect("failed to put");
    let message = queue.get("results").await.expect("failed to get message");
    assert_eq!(message.topic(), "results");
    message.ack().await.expect("failed to ack");

    queue.close().await;
}

#[tokio::test]
async fn test_ensure_topic_and_topic_config() {
    let transport = MemoryTransport::new();
    let queue = start(
        &transport,
        QueueConfig {
            default_topic: TopicConfig {
                num_partitions: 3,
                replication_factor: 1,
            },
            ..config(GROUP, 1)
        },
    )
    .await;

    queue.ensure_topic("fresh").await.expect("failed to create topic");
    assert_eq!(transport.partition_count("fresh"), Some(3));
    queue
        .ensure_topic_with_deadline("fresh", in_ms(1000))
        .await
        .expect("existing topic should be fine");

    let entries = vec![("retention.ms".to_string(), "1000".to_string())];
    let applied = queue
        .set_topic_config("fresh", &entries)
        .await
        .expect("failed to set topic config");
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].name, "retention.ms");
    assert_eq!(applied[0].value.as_deref(), Some("1000"));
    assert_eq!(
        transport.topic_config("fresh").get("retention.ms").map(String::as_str),
        Some("1000")
    );

    assert!(matches!(
        queue.set_topic_config("absent", &entries).await,
        Err(QueueError::Transport(TransportError::Admin { .. }))
    ));

    queue.close().await;
}

#[tokio::test]
async fn test_key_value_batch_keeps_keys() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 1);
    let queue = start(&transport, config(GROUP, 1)).await;

    queue
        .put_key_value_batch(TOPIC, [("k1", "v1"), ("k2", "v2")])
        .await
        .expect("failed to put keyed batch");

    for (key, value) in [("k1", "v1"), ("k2", "v2")] {
        let message = queue.get(TOPIC).await.expect("failed to get message");
        assert_eq!(message.key(), Some(key.as_bytes()));
        assert_eq!(message.data(), value.as_bytes());
        assert_eq!(message.partition(), 0);
        message.ack().await.expect("failed to ack");
    }

    queue
        .put_key_value_batch_with_deadline(TOPIC, [("k3", "v3")], in_ms(1000))
        .await
        .expect("failed to put keyed batch");
    assert_eq!(transport.records(TOPIC).len(), 3);

    queue.close().await;
}

#[tokio::test]
async fn test_reset_offset_skips_backlog() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 1);
    for value in ["old-1", "old-2", "old-3"] {
        transport.publish(TOPIC, value);
    }

    let queue = start(
        &transport,
        QueueConfig {
            queues_to_reset_offset: names(&[TOPIC]),
            ..config(GROUP, 1)
        },
    )
    .await;
    assert_eq!(transport.committed(GROUP, TOPIC, 0), Some(3));

    queue.put(TOPIC, "new").await.expect("failed to put");
    let message = queue.get(TOPIC).await.expect("failed to get message");
    assert_eq!(message.data(), b"new");
    assert_eq!(message.offset(), 3);
    message.ack().await.expect("failed to ack");

    queue.close().await;
}

#[tokio::test]
async fn test_caller_cancellation() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 1);
    let queue = start(&transport, config(GROUP, 1)).await;

    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(
        async { queue.get_with_cancel(TOPIC, &cancel).await.map(|_| ()) },
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    );
    assert!(matches!(result, Err(QueueError::Cancelled)));
    assert!(!queue.is_closed());

    assert!(matches!(
        queue.put_batch_with_cancel(TOPIC, ["a"], &cancel).await,
        Err(QueueError::Cancelled)
    ));
    assert!(transport.records(TOPIC).is_empty());

    queue.close().await;
}

#[tokio::test]
async fn test_put_with_deadline() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 1);
    let queue = start(&transport, config("", 1)).await;

    queue
        .put_with_deadline(TOPIC, "a", in_ms(1000))
        .await
        .expect("failed to put");
    queue
        .put_batch_with_deadline(TOPIC, ["b", "c"], in_ms(1000))
        .await
        .expect("failed to put batch");
    assert!(matches!(
        queue
            .put_with_deadline(TOPIC, "late", Instant::now() - Duration::from_millis(1))
            .await,
        Err(QueueError::DeadlineExceeded)
    ));
    assert_eq!(transport.records(TOPIC).len(), 3);

    queue.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handles_are_never_lost_under_concurrent_settling() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 4);
    let queue = Arc::new(start(&transport, config(GROUP, 4)).await);

    let total = 40;
    queue
        .put_batch(TOPIC, (0..total).map(|i| format!("record-{i}").into_bytes()))
        .await
        .expect("failed to put batch");

    let consumers: Vec<_> = (0..4)
        .map(|consumer| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut acked = Vec::new();
                let mut seen = 0usize;
                while let Ok(message) = queue.get_with_deadline(TOPIC, in_ms(500)).await {
                    seen += 1;
                    if (seen + consumer) % 5 == 0 {
                        message.nack().expect("failed to nack");
                        // Settling twice races nothing
                        message.ack().await.expect("ack after nack is a no-op");
                    } else {
                        message.ack().await.expect("failed to ack");
                        acked.push(message.data().to_vec());
                    }
                }
                acked
            })
        })
        .collect();

    let mut acked = HashSet::new();
    for consumer in consumers {
        acked.extend(consumer.await.expect("consumer panicked"));
    }
    assert_eq!(acked.len(), total);

    let stats = queue.reader_pool_stats(TOPIC).unwrap();
    let checked_out = (stats.in_circulation - stats.available) as u64;
    assert_eq!(stats.checkouts, stats.releases + stats.retirements + checked_out);
    assert_eq!(stats.in_circulation, 4);

    queue.close().await;
    eventually("every handle closed", || all_closed(transport.stats())).await;
}

#[tokio::test]
async fn test_nack_keeps_its_slot_when_reopen_fails() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 1);
    let queue = start(&transport, config(GROUP, 1)).await;

    queue
        .put_batch(TOPIC, ["a", "b"])
        .await
        .expect("failed to put batch");

    let first = queue
        .get_with_deadline(TOPIC, in_ms(2000))
        .await
        .expect("failed to get message");
    assert_eq!(first.data(), b"a");

    transport.fail_reader_opens(0, 1);
    first.nack().expect("nack succeeds while the reader is reopened");
    first.nack().expect("second nack is a no-op");
    drop(first);

    let again = queue
        .get_with_deadline(TOPIC, in_ms(3000))
        .await
        .expect("rejected record was not redelivered after the reader reopened");
    assert_eq!(again.data(), b"a");
    again.ack().await.expect("failed to ack");

    let next = queue
        .get_with_deadline(TOPIC, in_ms(2000))
        .await
        .expect("failed to get message");
    assert_eq!(next.data(), b"b");
    next.ack().await.expect("failed to ack");

    let stats = queue.reader_pool_stats(TOPIC).unwrap();
    assert_eq!(stats.capacity, 1);
    assert_eq!(stats.in_circulation, 1);
    assert_eq!(stats.retirements, 1);
    assert_eq!(transport.committed(GROUP, TOPIC, 0), Some(2));

    queue.close().await;
    eventually("every handle closed", || all_closed(transport.stats())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_racing_ack_and_nack_leaks_nothing() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 4);
    let queue = Arc::new(start(&transport, config(GROUP, 4)).await);

    queue
        .put_batch(TOPIC, (0..200).map(|i| format!("record-{i}").into_bytes()))
        .await
        .expect("failed to put batch");

    let received = Arc::new(AtomicUsize::new(0));
    let consumers: Vec<_> = (0..4)
        .map(|consumer| {
            let queue = queue.clone();
            let received = received.clone();
            tokio::spawn(async move {
                let mut seen = 0usize;
                loop {
                    let message = match queue.get_with_deadline(TOPIC, in_ms(2000)).await {
                        Ok(message) => message,
                        Err(QueueError::Closed) => break,
                        Err(e) => panic!("unexpected get error: {e}"),
                    };
                    seen += 1;
                    received.fetch_add(1, Ordering::AcqRel);
                    tokio::task::yield_now().await;
                    if (seen + consumer) % 3 == 0 {
                        message.nack().expect("failed to nack");
                    } else {
                        message.ack().await.expect("failed to ack");
                    }
                    message.ack().await.expect("settling twice is a no-op");
                }
            })
        })
        .collect();

    eventually("consumers busy", || received.load(Ordering::Acquire) >= 40).await;
    queue.close().await;
    for consumer in consumers {
        consumer.await.expect("consumer panicked");
    }

    // Every checkout ended in exactly one release or retirement, except the
    // handles that were out when the pool closed and came back afterwards
    let stats = queue.reader_pool_stats(TOPIC).unwrap();
    let settled = stats.releases + stats.retirements;
    assert!(stats.checkouts >= settled);
    assert!(stats.checkouts - settled <= stats.capacity as u64);
    assert_eq!(stats.in_circulation, 0);
    assert_eq!(stats.available, 0);

    eventually("every handle closed", || all_closed(transport.stats())).await;
    assert!(queue.is_closed());
}

#[tokio::test]
async fn test_close_discards_auto_committed_buffered_messages() {
    let transport = MemoryTransport::new().with_topic(TOPIC, 1);
    let eager = QueueConfig {
        async_ack: true,
        ..config(GROUP, 1)
    };
    let queue = start(&transport, eager.clone()).await;

    queue
        .put_batch(TOPIC, ["a", "b", "c"])
        .await
        .expect("failed to put batch");

    // One message sits in the channel, the worker holds the next one
    eventually("worker blocked on a full channel", || {
        transport.committed(GROUP, TOPIC, 0) == Some(2)
    })
    .await;
    queue.close().await;
    eventually("every handle closed", || all_closed(transport.stats())).await;

    // Both were committed when fetched, so only the third comes back
    let queue = start(&transport, eager).await;
    let message = queue
        .get_with_deadline(TOPIC, in_ms(2000))
        .await
        .expect("failed to get message");
    assert_eq!(message.data(), b"c");
    message.ack().await.expect("failed to ack");
    queue.close().await;
}
