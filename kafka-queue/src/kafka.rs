//! rdkafka backed transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{
    AdminClient, AdminOptions, AlterConfig, NewTopic, ResourceSpecifier, TopicReplication,
};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::Message as _;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::config::{QueueConfig, TopicConfig};
use crate::error::TransportError;
use crate::transport::{
    ConfigEntry, OutboundRecord, ReadHandle, ReaderSettings, Record, Transport, WriteHandle,
    WriterSettings,
};

const PRODUCER_LINGER_MS: &str = "20";

/// Talks to a real Kafka cluster. Every handle is its own rdkafka client.
pub struct KafkaTransport {
    client_config: ClientConfig,
    timeout: Duration,
}

impl KafkaTransport {
    pub fn new(config: &QueueConfig) -> Self {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.brokers.0.join(","))
            .set("socket.timeout.ms", config.request_timeout_ms.to_string());

        let protocol = match (config.kafka_tls, config.sasl.credentials()) {
            (false, None) => None,
            (true, None) => Some("ssl"),
            (false, Some(_)) => Some("sasl_plaintext"),
            (true, Some(_)) => Some("sasl_ssl"),
        };
        if let Some(protocol) = protocol {
            client_config.set("security.protocol", protocol);
        }
        if config.kafka_tls {
            client_config.set("enable.ssl.certificate.verification", "false");
        }
        if let Some((user, password)) = config.sasl.credentials() {
            client_config
                .set("sasl.mechanism", "PLAIN")
                .set("sasl.username", user)
                .set("sasl.password", password);
        }

        Self {
            client_config,
            timeout: config.request_timeout(),
        }
    }

    fn admin(&self) -> Result<AdminClient<DefaultClientContext>, TransportError> {
        Ok(self.client_config.create()?)
    }

    fn admin_options(&self) -> AdminOptions {
        AdminOptions::new()
            .request_timeout(Some(self.timeout))
            .operation_timeout(Some(self.timeout))
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    type Reader = KafkaReader;
    type Writer = KafkaWriter;

    async fn dial(&self, broker: &str) -> Result<(), TransportError> {
        let mut config = self.client_config.clone();
        config.set("bootstrap.servers", broker);
        let timeout = self.timeout;
        let target = broker.to_string();

        // "Ping" the broker by requesting metadata
        let metadata = tokio::task::spawn_blocking(move || {
            let consumer: BaseConsumer = config.create()?;
            consumer.fetch_metadata(None, timeout).map(|m| m.brokers().len())
        })
        .await?;

        match metadata {
            Ok(brokers) => {
                info!(broker, brokers, "connected to kafka broker");
                Ok(())
            }
            Err(e) => {
                error!(broker, error = %e, "failed to fetch metadata from kafka broker");
                Err(TransportError::Unreachable {
                    broker: target,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn open_reader(
        &self,
        topic: &str,
        settings: &ReaderSettings,
    ) -> Result<KafkaReader, TransportError> {
        // Sessions without a group still need one to subscribe, so they get a
        // private group that nobody else joins.
        let group_id = if settings.group_id.is_empty() {
            format!("kafka-queue-{topic}-{}", std::process::id())
        } else {
            settings.group_id.clone()
        };

        let consumer: StreamConsumer = self
            .client_config
            .clone()
            .set("group.id", &group_id)
            .set("enable.auto.commit", settings.auto_commit.to_string())
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .create()?;
        consumer.subscribe(&[topic])?;
        debug!(topic, group_id = %group_id, "kafka reader subscribed");

        Ok(KafkaReader {
            topic: topic.to_string(),
            consumer: Arc::new(consumer),
        })
    }

    fn open_writer(
        &self,
        topic: &str,
        settings: &WriterSettings,
    ) -> Result<KafkaWriter, TransportError> {
        let producer: FutureProducer = self
            .client_config
            .clone()
            .set("linger.ms", PRODUCER_LINGER_MS)
            .set("batch.num.messages", settings.batch_size.to_string())
            .set("compression.codec", settings.compression.codec())
            .set("partitioner", "consistent_random")
            .set("message.timeout.ms", self.timeout.as_millis().to_string())
            .create()?;

        Ok(KafkaWriter {
            topic: topic.to_string(),
            producer,
            async_write: settings.async_write,
            timeout: self.timeout,
        })
    }

    async fn reset_offsets(&self, topic: &str, group_id: &str) -> Result<(), TransportError> {
        let mut config = self.client_config.clone();
        config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false");
        let timeout = self.timeout;
        let topic = topic.to_string();

        tokio::task::spawn_blocking(move || -> Result<(), TransportError> {
            let consumer: BaseConsumer = config.create()?;
            let metadata = consumer.fetch_metadata(Some(topic.as_str()), timeout)?;

            let mut tpl = TopicPartitionList::new();
            for partition in metadata.topics().iter().flat_map(|t| t.partitions()) {
                let (_, high) = consumer.fetch_watermarks(&topic, partition.id(), timeout)?;
                tpl.add_partition_offset(&topic, partition.id(), Offset::Offset(high))?;
            }
            if tpl.count() == 0 {
                warn!(topic = %topic, "no partitions found, nothing to reset");
                return Ok(());
            }

            consumer.commit(&tpl, CommitMode::Sync)?;
            info!(topic = %topic, partitions = tpl.count(), "consumer group offsets moved to newest");
            Ok(())
        })
        .await?
    }

    async fn newest_offset(&self, topic: &str, partition: i32) -> Result<i64, TransportError> {
        let config = self.client_config.clone();
        let timeout = self.timeout;
        let topic = topic.to_string();

        tokio::task::spawn_blocking(move || -> Result<i64, TransportError> {
            let consumer: BaseConsumer = config.create()?;
            let (_, high) = consumer.fetch_watermarks(&topic, partition, timeout)?;
            Ok(high)
        })
        .await?
    }

    async fn create_topic(&self, topic: &str, config: &TopicConfig) -> Result<(), TransportError> {
        let admin = self.admin()?;
        let new_topic = NewTopic::new(
            topic,
            config.num_partitions,
            TopicReplication::Fixed(config.replication_factor),
        );

        let results = admin
            .create_topics(&[new_topic], &self.admin_options())
            .await?;
        for result in results {
            match result {
                Ok(_) => info!(topic, "topic created"),
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic, "topic already exists")
                }
                Err((_, code)) => {
                    return Err(TransportError::Admin {
                        topic: topic.to_string(),
                        reason: code.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    async fn alter_topic_config(
        &self,
        topic: &str,
        entries: &[(String, String)],
    ) -> Result<Vec<ConfigEntry>, TransportError> {
        let admin = self.admin()?;
        let options = self.admin_options();

        let alter = entries.iter().fold(
            AlterConfig::new(ResourceSpecifier::Topic(topic)),
            |alter, (key, value)| alter.set(key, value),
        );
        for result in admin.alter_configs(&[alter], &options).await? {
            if let Err((_, code)) = result {
                return Err(TransportError::Admin {
                    topic: topic.to_string(),
                    reason: code.to_string(),
                });
            }
        }

        let mut applied = Vec::with_capacity(entries.len());
        for described in admin
            .describe_configs(&[ResourceSpecifier::Topic(topic)], &options)
            .await?
        {
            let resource = described.map_err(|code| TransportError::Admin {
                topic: topic.to_string(),
                reason: code.to_string(),
            })?;
            applied.extend(
                resource
                    .entries
                    .into_iter()
                    .filter(|entry| entries.iter().any(|(key, _)| *key == entry.name))
                    .map(|entry| ConfigEntry {
                        name: entry.name,
                        value: entry.value,
                    }),
            );
        }
        Ok(applied)
    }
}

/// A consumer subscribed to one topic.
pub struct KafkaReader {
    topic: String,
    consumer: Arc<StreamConsumer>,
}

#[async_trait]
impl ReadHandle for KafkaReader {
    async fn fetch(&mut self) -> Result<Record, TransportError> {
        let message = self.consumer.recv().await?;
        Ok(Record {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            value: message.payload().unwrap_or_default().to_vec(),
        })
    }

    async fn commit(&mut self, record: &Record) -> Result<(), TransportError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))?;

        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync)).await??;
        Ok(())
    }

    fn close(self) -> Result<(), TransportError> {
        self.consumer.unsubscribe();
        debug!(topic = %self.topic, "kafka reader unsubscribed");
        Ok(())
    }
}

/// A producer for one topic.
pub struct KafkaWriter {
    topic: String,
    producer: FutureProducer,
    async_write: bool,
    timeout: Duration,
}

#[async_trait]
impl WriteHandle for KafkaWriter {
    async fn write(&mut self, records: &[OutboundRecord]) -> Result<(), TransportError> {
        let mut deliveries = Vec::with_capacity(records.len());
        for outbound in records {
            let mut record = FutureRecord::<[u8], [u8]>::to(&self.topic).payload(&outbound.value[..]);
            if let Some(key) = &outbound.key {
                record = record.key(&key[..]);
            }
            match self.producer.send_result(record) {
                Ok(delivery) => deliveries.push(delivery),
                Err((e, _)) => return Err(e.into()),
            }
        }

        // Async writers only wait for the records to be queued locally
        if self.async_write {
            return Ok(());
        }

        for delivery in deliveries {
            match delivery.await {
                Ok(Ok(_)) => {}
                Ok(Err((e, _))) => return Err(e.into()),
                Err(_) => return Err(TransportError::DeliveryCanceled),
            }
        }
        Ok(())
    }

    fn close(self) -> Result<(), TransportError> {
        self.producer.flush(self.timeout)?;
        debug!(topic = %self.topic, "kafka writer flushed");
        Ok(())
    }
}
