use rdkafka::error::KafkaError;
use thiserror::Error;

/// Errors surfaced by the queue to its callers.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("kafka queue is closed")]
    Closed,
    #[error("there is no such topic registered: {0}")]
    UnknownTopic(String),
    #[error("nack is inapplicable to a message whose handle was released on emission")]
    AsyncRejectUnsupported,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("operation cancelled by caller")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to publish to {topic}: {source}")]
    Publish {
        topic: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to commit offset {offset} on {topic}: {source}")]
    Commit {
        topic: String,
        offset: i64,
        #[source]
        source: TransportError,
    },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Failures reported by a [`crate::transport::Transport`] implementation.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("cant connect to broker {broker}: {reason}")]
    Unreachable { broker: String, reason: String },
    #[error("delivery canceled before broker acknowledgement")]
    DeliveryCanceled,
    #[error("admin request for {topic} failed: {reason}")]
    Admin { topic: String, reason: String },
    #[error("broker error: {0}")]
    Broker(String),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl QueueError {
    /// Short tag used as a metrics label and in structured logs
    pub fn error_type(&self) -> &'static str {
        match self {
            QueueError::Closed => "closed",
            QueueError::UnknownTopic(_) => "unknown_topic",
            QueueError::AsyncRejectUnsupported => "async_reject_unsupported",
            QueueError::DeadlineExceeded => "deadline_exceeded",
            QueueError::Cancelled => "cancelled",
            QueueError::Config(_) => "config",
            QueueError::Publish { .. } => "publish",
            QueueError::Commit { .. } => "commit",
            QueueError::Transport(_) => "transport",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, QueueError::Closed)
    }
}
