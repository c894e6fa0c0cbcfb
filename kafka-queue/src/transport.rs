use async_trait::async_trait;

use crate::config::{Compression, TopicConfig};
use crate::error::TransportError;

/// A record as fetched from the broker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

/// A record on its way to the broker. Records without a key are spread over
/// partitions by the transport's balancing policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundRecord {
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

impl OutboundRecord {
    pub fn value(value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            value: value.into(),
        }
    }

    pub fn keyed(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: Some(key.into()),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReaderSettings {
    /// Empty means no application-level commits
    pub group_id: String,
    /// Let the broker client commit whatever it has handed out
    pub auto_commit: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriterSettings {
    pub batch_size: usize,
    /// Return from `write` without waiting for broker acknowledgement
    pub async_write: bool,
    pub compression: Compression,
}

/// A topic configuration value as reported back by the broker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigEntry {
    pub name: String,
    pub value: Option<String>,
}

/// An open reading session bound to one topic and consumer group.
#[async_trait]
pub trait ReadHandle: Send + 'static {
    /// Wait for the next record. Dropping the future must not lose a record.
    async fn fetch(&mut self) -> Result<Record, TransportError>;

    /// Commit `record` as consumed for the session's consumer group.
    async fn commit(&mut self, record: &Record) -> Result<(), TransportError>;

    fn close(self) -> Result<(), TransportError>;
}

/// An open writing session bound to one topic.
#[async_trait]
pub trait WriteHandle: Send + 'static {
    async fn write(&mut self, records: &[OutboundRecord]) -> Result<(), TransportError>;

    fn close(self) -> Result<(), TransportError>;
}

/// Everything the queue needs from the broker client: opening sessions, plus
/// the handful of cluster-level queries and admin calls.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Reader: ReadHandle;
    type Writer: WriteHandle;

    /// Check that `broker` is reachable.
    async fn dial(&self, broker: &str) -> Result<(), TransportError>;

    fn open_reader(
        &self,
        topic: &str,
        settings: &ReaderSettings,
    ) -> Result<Self::Reader, TransportError>;

    fn open_writer(
        &self,
        topic: &str,
        settings: &WriterSettings,
    ) -> Result<Self::Writer, TransportError>;

    /// Move the group's committed offsets to the newest offset of every partition.
    async fn reset_offsets(&self, topic: &str, group_id: &str) -> Result<(), TransportError>;

    /// The offset the next record written to `partition` will get.
    async fn newest_offset(&self, topic: &str, partition: i32) -> Result<i64, TransportError>;

    /// Create `topic`, succeeding if it already exists.
    async fn create_topic(&self, topic: &str, config: &TopicConfig) -> Result<(), TransportError>;

    /// Apply `entries` to the topic and return the resulting values for those keys.
    async fn alter_topic_config(
        &self,
        topic: &str,
        entries: &[(String, String)],
    ) -> Result<Vec<ConfigEntry>, TransportError>;
}
