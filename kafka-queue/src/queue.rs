use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use envconfig::Envconfig;
use futures::future::{join_all, try_join_all};
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::{ConfigSource, QueueConfig};
use crate::error::QueueError;
use crate::kafka::KafkaTransport;
use crate::message::{Coupling, Message};
use crate::pool::PoolStats;
use crate::reader::TopicReader;
use crate::transport::{ConfigEntry, OutboundRecord, ReaderSettings, Transport, WriterSettings};
use crate::utils::expired;
use crate::writer::TopicWriter;

/// Writer handles opened for each topic in `queues_to_write`
pub const WRITERS_PER_TOPIC: usize = 4;

/// Pooled readers and writers over a set of topics.
///
/// Every blocking operation also wakes up on `close`, after which puts and
/// gets fail with [`QueueError::Closed`].
pub struct Queue<T: Transport = KafkaTransport> {
    config: QueueConfig,
    transport: Arc<T>,
    readers: RwLock<HashMap<String, Arc<TopicReader<T>>>>,
    writers: RwLock<HashMap<String, Arc<TopicWriter<T>>>>,
    // Serializes registrations against each other and against close
    registration: Mutex<()>,
    shutdown: CancellationToken,
    closing: AtomicBool,
    tasks: TaskTracker,
}

impl Queue<KafkaTransport> {
    pub async fn new(config: QueueConfig) -> Result<Self, QueueError> {
        let transport = KafkaTransport::new(&config);
        Self::with_transport(config, transport).await
    }

    pub async fn from_env() -> Result<Self, QueueError> {
        let config = QueueConfig::init_from_env().map_err(|e| QueueError::Config(e.to_string()))?;
        Self::new(config).await
    }

    pub async fn from_source(source: &impl ConfigSource) -> Result<Self, QueueError> {
        Self::new(QueueConfig::from_source(source)?).await
    }
}

impl<T: Transport> Queue<T> {
    /// Validate `config`, dial every broker and register every configured topic.
    ///
    /// Fails without leaving anything open if any of that fails.
    pub async fn with_transport(config: QueueConfig, transport: T) -> Result<Self, QueueError> {
        let config = config.validate()?;

        try_join_all(config.brokers.iter().map(|broker| transport.dial(broker))).await?;

        let queue = Self {
            config,
            transport: Arc::new(transport),
            readers: RwLock::new(HashMap::new()),
            writers: RwLock::new(HashMap::new()),
            registration: Mutex::new(()),
            shutdown: CancellationToken::new(),
            closing: AtomicBool::new(false),
            tasks: TaskTracker::new(),
        };

        if let Err(e) = queue.register_configured().await {
            error!(error = %e, "failed to start kafka queue");
            queue.close().await;
            return Err(e);
        }

        info!(
            brokers = queue.config.brokers.0.len(),
            readers = queue.config.queues_to_read.0.len(),
            writers = queue.config.queues_to_write.0.len(),
            consumer_group = %queue.config.consumer_group,
            "kafka queue started"
        );
        Ok(queue)
    }

    async fn register_configured(&self) -> Result<(), QueueError> {
        for topic in self.config.queues_to_read.iter() {
            self.register_reader(topic).await?;
        }
        for topic in self.config.queues_to_write.iter() {
            self.register_writer(topic, WRITERS_PER_TOPIC).await?;
        }
        Ok(())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Start reading `topic` with `concurrency` handles. Registering a topic
    /// twice leaves the first registration in place.
    pub async fn register_reader(&self, topic: &str) -> Result<(), QueueError> {
        let _registration = self.registration.lock().await;
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let registered = self.readers.read().contains_key(topic);
        if registered {
            debug!(topic, "reader already registered");
            return Ok(());
        }

        let group_id = self.config.consumer_group.clone();
        if self.config.has_consumer_group() && self.config.queues_to_reset_offset.contains(topic) {
            self.transport.reset_offsets(topic, &group_id).await?;
        }

        let coupling = Coupling::new(&group_id, self.config.async_ack);
        let settings = ReaderSettings {
            group_id,
            auto_commit: !coupling.commits_on_ack(),
        };
        let reader = TopicReader::start(
            topic,
            self.transport.clone(),
            self.config.concurrency,
            settings,
            coupling,
            self.shutdown.clone(),
            self.tasks.clone(),
        )?;
        self.readers
            .write()
            .insert(topic.to_string(), Arc::new(reader));
        info!(topic, "reader registered");
        Ok(())
    }

    /// Start writing `topic` with `count` writer handles.
    pub async fn register_writer(&self, topic: &str, count: usize) -> Result<(), QueueError> {
        let _registration = self.registration.lock().await;
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let registered = self.writers.read().contains_key(topic);
        if registered {
            debug!(topic, "writer already registered");
            return Ok(());
        }

        let settings = WriterSettings {
            batch_size: self.config.batch_size,
            async_write: self.config.async_write,
            compression: self.config.compression,
        };
        let writer = TopicWriter::start(
            topic,
            self.transport.as_ref(),
            count,
            &settings,
            self.tasks.clone(),
        )?;
        self.writers
            .write()
            .insert(topic.to_string(), Arc::new(writer));
        info!(topic, count, "writer registered");
        Ok(())
    }

    pub async fn put(&self, topic: &str, data: impl Into<Vec<u8>>) -> Result<(), QueueError> {
        self.publish(topic, vec![OutboundRecord::value(data)], None, None)
            .await
    }

    pub async fn put_with_deadline(
        &self,
        topic: &str,
        data: impl Into<Vec<u8>>,
        deadline: Instant,
    ) -> Result<(), QueueError> {
        self.publish(topic, vec![OutboundRecord::value(data)], Some(deadline), None)
            .await
    }

    /// Publish every payload with a single write call.
    pub async fn put_batch<I, D>(&self, topic: &str, data: I) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = D>,
        D: Into<Vec<u8>>,
    {
        self.publish(topic, values(data), None, None).await
    }

    pub async fn put_batch_with_deadline<I, D>(
        &self,
        topic: &str,
        data: I,
        deadline: Instant,
    ) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = D>,
        D: Into<Vec<u8>>,
    {
        self.publish(topic, values(data), Some(deadline), None)
            .await
    }

    pub async fn put_batch_with_cancel<I, D>(
        &self,
        topic: &str,
        data: I,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = D>,
        D: Into<Vec<u8>>,
    {
        self.publish(topic, values(data), None, Some(cancel)).await
    }

    /// Publish keyed records; the key decides the partition.
    pub async fn put_key_value_batch<I, K, V>(&self, topic: &str, pairs: I) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Vec<u8>>,
        V: Into<Vec<u8>>,
    {
        self.publish(topic, keyed(pairs), None, None).await
    }

    pub async fn put_key_value_batch_with_deadline<I, K, V>(
        &self,
        topic: &str,
        pairs: I,
        deadline: Instant,
    ) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Vec<u8>>,
        V: Into<Vec<u8>>,
    {
        self.publish(topic, keyed(pairs), Some(deadline), None)
            .await
    }

    async fn publish(
        &self,
        topic: &str,
        records: Vec<OutboundRecord>,
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let writer = self.writer(topic)?;
        if records.is_empty() {
            return Ok(());
        }
        writer
            .publish(records, &self.shutdown, deadline, cancel)
            .await
    }

    /// Wait for the next message on `topic`.
    pub async fn get(&self, topic: &str) -> Result<Message<T>, QueueError> {
        self.receive(topic, None, None).await
    }

    /// Like [`Queue::get`], giving up at `deadline`. The fetch feeding the
    /// topic keeps running past the deadline.
    pub async fn get_with_deadline(
        &self,
        topic: &str,
        deadline: Instant,
    ) -> Result<Message<T>, QueueError> {
        self.receive(topic, Some(deadline), None).await
    }

    pub async fn get_with_cancel(
        &self,
        topic: &str,
        cancel: &CancellationToken,
    ) -> Result<Message<T>, QueueError> {
        self.receive(topic, None, Some(cancel)).await
    }

    async fn receive(
        &self,
        topic: &str,
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Message<T>, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let reader = self.reader(topic)?;
        reader.next_message(deadline, cancel).await
    }

    /// Newest offset of partition 0 minus the last acknowledged offset, minus one.
    pub async fn consumer_lag_for_single_partition(&self, topic: &str) -> Result<i64, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let reader = self.reader(topic)?;
        let newest = self.transport.newest_offset(topic, 0).await?;
        Ok(reader.lag(newest))
    }

    /// Create `topic` with the default partition count and replication factor
    /// unless it already exists.
    pub async fn ensure_topic(&self, topic: &str) -> Result<(), QueueError> {
        self.create_topic(topic, None).await
    }

    pub async fn ensure_topic_with_deadline(
        &self,
        topic: &str,
        deadline: Instant,
    ) -> Result<(), QueueError> {
        self.create_topic(topic, Some(deadline)).await
    }

    async fn create_topic(&self, topic: &str, deadline: Option<Instant>) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        tokio::select! {
            biased;
            _ = expired(deadline) => Err(QueueError::DeadlineExceeded),
            created = self.transport.create_topic(topic, &self.config.default_topic) => {
                created.map_err(QueueError::from)
            }
        }
    }

    /// Apply `entries` to `topic` and log the values the broker reports back.
    pub async fn set_topic_config(
        &self,
        topic: &str,
        entries: &[(String, String)],
    ) -> Result<Vec<ConfigEntry>, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let applied = self.transport.alter_topic_config(topic, entries).await?;
        for entry in &applied {
            info!(
                topic,
                name = %entry.name,
                value = entry.value.as_deref().unwrap_or("<unset>"),
                "topic config value"
            );
        }
        Ok(applied)
    }

    pub fn reader_pool_stats(&self, topic: &str) -> Option<PoolStats> {
        self.readers.read().get(topic).map(|reader| reader.stats())
    }

    pub fn writer_pool_stats(&self, topic: &str) -> Option<PoolStats> {
        self.writers.read().get(topic).map(|writer| writer.stats())
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.shutdown.is_cancelled()
    }

    /// Stop every worker and close every pooled handle.
    ///
    /// Only the first call does anything. Handles still held by messages
    /// waiting for an ack or nack are closed when those messages settle or drop.
    pub async fn close(&self) {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!("closing kafka queue");
        self.shutdown.cancel();

        let _registration = self.registration.lock().await;

        let readers: Vec<_> = self.readers.read().values().cloned().collect();
        join_all(readers.iter().map(|reader| reader.shutdown())).await;

        let writers: Vec<_> = self.writers.read().values().cloned().collect();
        for writer in &writers {
            writer.shutdown();
        }

        // Workers may have sent one last message before they saw the shutdown
        self.tasks.close();
        self.tasks.wait().await;
        join_all(readers.iter().map(|reader| reader.discard_pending())).await;
        self.tasks.wait().await;

        info!(
            readers = readers.len(),
            writers = writers.len(),
            "kafka queue closed"
        );
    }

    fn reader(&self, topic: &str) -> Result<Arc<TopicReader<T>>, QueueError> {
        self.readers
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| QueueError::UnknownTopic(topic.to_string()))
    }

    fn writer(&self, topic: &str) -> Result<Arc<TopicWriter<T>>, QueueError> {
        self.writers
            .read()
            .get(topic)
            .cloned()
            .ok_or_else(|| QueueError::UnknownTopic(topic.to_string()))
    }
}

impl<T: Transport> Drop for Queue<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn values<I, D>(data: I) -> Vec<OutboundRecord>
where
    I: IntoIterator<Item = D>,
    D: Into<Vec<u8>>,
{
    data.into_iter().map(OutboundRecord::value).collect()
}

fn keyed<I, K, V>(pairs: I) -> Vec<OutboundRecord>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<Vec<u8>>,
    V: Into<Vec<u8>>,
{
    pairs
        .into_iter()
        .map(|(key, value)| OutboundRecord::keyed(key, value))
        .collect()
}
