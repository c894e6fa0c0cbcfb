//! Puts one message on a topic, reads it back and acknowledges it.
//!
//! Configured from `KAFKA_*` environment variables; the topic is the first
//! entry of `KAFKA_QUEUES_TO_READ`, which should also be listed in
//! `KAFKA_QUEUES_TO_WRITE`.

use std::time::Duration;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use kafka_queue::{Queue, QueueConfig};
use tokio::time::Instant;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

const GET_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = QueueConfig::init_from_env().context("failed to load configuration from env")?;
    let topic = config
        .queues_to_read
        .iter()
        .next()
        .map(str::to_string)
        .context("KAFKA_QUEUES_TO_READ must name at least one topic")?;

    info!("starting queue");
    let queue = Queue::new(config).await.context("cant init kafka queue")?;
    queue
        .ensure_topic(&topic)
        .await
        .context("cant ensure topic exists")?;

    let result = roundtrip(&queue, &topic).await;
    queue.close().await;
    result
}

async fn roundtrip(queue: &Queue, topic: &str) -> Result<()> {
    queue
        .put(topic, "some message")
        .await
        .context("cant put message in topic")?;
    info!(topic, "message put");

    let message = queue
        .get_with_deadline(topic, Instant::now() + GET_TIMEOUT)
        .await
        .context("cant get message from topic")?;
    info!(
        topic,
        offset = message.offset(),
        data = %String::from_utf8_lossy(message.data()),
        "message got"
    );

    message.ack().await.context("cant ack message")?;
    info!(topic, "message acked");
    Ok(())
}
