//! A queue over Kafka topics with pooled reader and writer sessions.
//!
//! Readers run one worker per pooled session. With a consumer group and
//! synchronous acknowledgement a session stays with the message it produced
//! until that message is acked (offset committed, session returned) or nacked
//! (session replaced, record redelivered). Without a group, or with
//! `async_ack`, sessions go back to the pool as soon as a message is emitted.

pub mod config;
pub mod error;
pub mod kafka;
pub mod message;
pub mod metrics_consts;
pub mod offsets;
pub mod pool;
pub mod queue;
mod reader;
pub mod test_utils;
pub mod transport;
mod utils;
mod writer;

pub use config::{Compression, ConfigSource, NameList, QueueConfig, TopicConfig};
pub use error::{QueueError, TransportError};
pub use kafka::KafkaTransport;
pub use message::{Coupling, Message};
pub use pool::PoolStats;
pub use queue::{Queue, WRITERS_PER_TOPIC};
pub use transport::{ConfigEntry, OutboundRecord, Record, Transport};
