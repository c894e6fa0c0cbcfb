use std::collections::HashMap;
use std::convert::Infallible;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use thiserror::Error;

use crate::error::QueueError;

pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Envconfig, Clone, Debug)]
pub struct QueueConfig {
    // Kafka assigns at most one partition per group member, so this should be
    // at least the partition count of every topic read.
    #[envconfig(from = "KAFKA_CONCURRENCY", default = "1")]
    pub concurrency: usize,

    // Max records delivered by a single writer at once
    #[envconfig(from = "KAFKA_BATCH_SIZE", default = "100")]
    pub batch_size: usize,

    // Writers return without waiting for broker acknowledgement, no delivery guarantee
    #[envconfig(from = "KAFKA_ASYNC_WRITE", default = "false")]
    pub async_write: bool,

    // Reader handles go back to the pool as soon as a message is emitted
    #[envconfig(from = "KAFKA_ASYNC_ACK", default = "false")]
    pub async_ack: bool,

    #[envconfig(from = "KAFKA_QUEUES_TO_READ", default = "")]
    pub queues_to_read: NameList,

    #[envconfig(from = "KAFKA_QUEUES_TO_WRITE", default = "")]
    pub queues_to_write: NameList,

    #[envconfig(from = "KAFKA_QUEUES_TO_RESET_OFFSET", default = "")]
    pub queues_to_reset_offset: NameList,

    #[envconfig(from = "KAFKA_HOSTS", default = "localhost:9092")]
    pub brokers: NameList,

    // Empty means the broker auto-commits and messages need no acknowledgement
    #[envconfig(from = "KAFKA_CONSUMER_GROUP", default = "")]
    pub consumer_group: String,

    #[envconfig(nested = true)]
    pub default_topic: TopicConfig,

    #[envconfig(from = "KAFKA_COMPRESSION_CODEC", default = "none")]
    pub compression: Compression, // snappy, anything else is none

    #[envconfig(nested = true)]
    pub sasl: SaslConfig,

    #[envconfig(from = "KAFKA_TLS", default = "false")]
    pub kafka_tls: bool,

    #[envconfig(from = "KAFKA_REQUEST_TIMEOUT_MS", default = "10000")]
    pub request_timeout_ms: u64,
}

#[derive(Envconfig, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TopicConfig {
    #[envconfig(from = "KAFKA_TOPIC_PARTITIONS", default = "1")]
    pub num_partitions: i32,

    #[envconfig(from = "KAFKA_TOPIC_REPLICATION_FACTOR", default = "1")]
    pub replication_factor: i32,
}

#[derive(Envconfig, Clone, Debug, Default)]
pub struct SaslConfig {
    #[envconfig(from = "KAFKA_SASL_USER")]
    pub user: Option<String>,

    #[envconfig(from = "KAFKA_SASL_PASSWORD")]
    pub password: Option<String>,
}

impl SaslConfig {
    /// Credentials are only used when both parts are present
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.user.as_deref(), self.password.as_deref()) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                Some((user, password))
            }
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    #[default]
    None,
    Snappy,
}

impl Compression {
    pub fn codec(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Snappy => "snappy",
        }
    }
}

impl FromStr for Compression {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("snappy") {
            Ok(Compression::Snappy)
        } else {
            Ok(Compression::None)
        }
    }
}

/// Semicolon separated list of names, empty entries are dropped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NameList(pub Vec<String>);

impl NameList {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for NameList {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(NameList(
            s.split(';')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }
}

impl<S: Into<String>> FromIterator<S> for NameList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        NameList(
            iter.into_iter()
                .map(Into::into)
                .filter(|name: &String| !name.is_empty())
                .collect(),
        )
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            num_partitions: 1,
            replication_factor: 1,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            batch_size: DEFAULT_BATCH_SIZE,
            async_write: false,
            async_ack: false,
            queues_to_read: NameList::default(),
            queues_to_write: NameList::default(),
            queues_to_reset_offset: NameList::default(),
            brokers: NameList::default(),
            consumer_group: String::new(),
            default_topic: TopicConfig::default(),
            compression: Compression::None,
            sasl: SaslConfig::default(),
            kafka_tls: false,
            request_timeout_ms: 10000,
        }
    }
}

impl QueueConfig {
    /// Build a config from a structured source using dotted keys.
    ///
    /// Only the connection, topic and group settings are read from the source,
    /// everything else keeps its default.
    pub fn from_source(source: &impl ConfigSource) -> Result<Self, QueueError> {
        let read = |key: &str| {
            source
                .get_string(key)
                .map_err(|e| QueueError::Config(format!("cant read config: {e}")))
        };

        let brokers = read("KAFKA.BROKERS")?;
        let queues_to_read = read("KAFKA.QUEUES_TO_READ")?;
        let queues_to_write = read("KAFKA.QUEUES_TO_WRITE")?;
        let consumer_group = read("KAFKA.CONSUMER_GROUP")?;
        let concurrency = source
            .get_int("KAFKA.CONCURRENCY")
            .map_err(|e| QueueError::Config(format!("cant read config: {e}")))?;

        Ok(Self {
            concurrency: usize::try_from(concurrency).unwrap_or(1),
            queues_to_read: parse_list(&queues_to_read),
            queues_to_write: parse_list(&queues_to_write),
            brokers: parse_list(&brokers),
            consumer_group,
            ..Self::default()
        })
    }

    /// Normalize defaults and reject configurations the queue cannot run with.
    pub fn validate(mut self) -> Result<Self, QueueError> {
        if self.queues_to_read.is_empty() && self.queues_to_write.is_empty() {
            return Err(QueueError::Config(
                "must be at least one topic to read or write".to_string(),
            ));
        }
        if self.default_topic.num_partitions < 1 {
            return Err(QueueError::Config(format!(
                "default topic partition count must be at least 1, got {}",
                self.default_topic.num_partitions
            )));
        }
        if self.default_topic.replication_factor < 1 {
            return Err(QueueError::Config(format!(
                "default topic replication factor must be at least 1, got {}",
                self.default_topic.replication_factor
            )));
        }
        if self.concurrency < 1 {
            self.concurrency = 1;
        }
        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        Ok(self)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn has_consumer_group(&self) -> bool {
        !self.consumer_group.is_empty()
    }
}

fn parse_list(raw: &str) -> NameList {
    match raw.parse() {
        Ok(list) => list,
        Err(never) => match never {},
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing key {0}")]
    Missing(String),
    #[error("invalid value {value:?} for key {key}")]
    Invalid { key: String, value: String },
}

/// A structured configuration store addressed by dotted keys.
pub trait ConfigSource {
    fn get_string(&self, key: &str) -> Result<String, ConfigError>;
    fn get_int(&self, key: &str) -> Result<i64, ConfigError>;
}

impl ConfigSource for HashMap<String, String> {
    fn get_string(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .cloned()
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn get_int(&self, key: &str) -> Result<i64, ConfigError> {
        let value = self.get_string(key)?;
        value.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
        })
    }
}
