use metrics::counter;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::error::{QueueError, TransportError};
use crate::metrics_consts::{PUBLISH_ERRORS, RECORDS_PUBLISHED};
use crate::pool::{Handle, HandlePool, PoolStats};
use crate::transport::{OutboundRecord, Transport, WriteHandle, WriterSettings};
use crate::utils::{cancelled_by, close_in_background, expired};

/// Writer handles for one topic. A handle is only checked out for the
/// duration of a single publish call.
pub(crate) struct TopicWriter<T: Transport> {
    topic: String,
    pool: HandlePool<T::Writer>,
    tasks: TaskTracker,
}

impl<T: Transport> TopicWriter<T> {
    pub(crate) fn start(
        topic: &str,
        transport: &T,
        count: usize,
        settings: &WriterSettings,
        tasks: TaskTracker,
    ) -> Result<Self, TransportError> {
        let count = count.max(1);
        let pool = HandlePool::new(format!("{topic}-writers"), count);
        let mut opened = Vec::with_capacity(count);
        for _ in 0..count {
            match transport.open_writer(topic, settings) {
                Ok(writer) => opened.push(writer),
                Err(e) => {
                    for writer in opened {
                        close_in_background(&tasks, topic, "writer", move || writer.close());
                    }
                    return Err(e);
                }
            }
        }
        for writer in opened {
            if let Err(writer) = pool.insert(writer) {
                close_in_background(&tasks, topic, "writer", move || writer.close());
            }
        }
        info!(topic, count, async_write = settings.async_write, "writer pool ready");

        Ok(Self {
            topic: topic.to_string(),
            pool,
            tasks,
        })
    }

    /// Write all `records` with one handle in one call.
    ///
    /// The handle goes back to the pool whatever the outcome; a failed write
    /// doesn't make it unusable.
    pub(crate) async fn publish(
        &self,
        records: Vec<OutboundRecord>,
        shutdown: &CancellationToken,
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), QueueError> {
        let mut handle = tokio::select! {
            biased;
            _ = cancelled_by(cancel) => return Err(QueueError::Cancelled),
            _ = expired(deadline) => return Err(QueueError::DeadlineExceeded),
            handle = self.pool.checkout(shutdown) => handle.map_err(|_| QueueError::Closed)?,
        };

        let written = tokio::select! {
            biased;
            _ = cancelled_by(cancel) => Err(QueueError::Cancelled),
            _ = expired(deadline) => Err(QueueError::DeadlineExceeded),
            result = handle.write(&records) => result.map_err(|source| QueueError::Publish {
                topic: self.topic.clone(),
                source,
            }),
        };
        self.give_back(handle);

        match &written {
            Ok(()) => {
                counter!(RECORDS_PUBLISHED, "topic" => self.topic.clone())
                    .increment(records.len() as u64);
            }
            Err(e) => {
                counter!(PUBLISH_ERRORS, "topic" => self.topic.clone(), "error_type" => e.error_type())
                    .increment(1);
                error!(topic = %self.topic, records = records.len(), error = %e, "error during writing message to kafka");
            }
        }
        written
    }

    fn give_back(&self, handle: Handle<T::Writer>) {
        if let Err(handle) = self.pool.release(handle) {
            let writer = self.pool.retire(handle);
            debug!(topic = %self.topic, "writer pool closed, closing handle");
            close_in_background(&self.tasks, &self.topic, "writer", move || writer.close());
        }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close every pooled writer. Writers busy with a publish are closed when
    /// that publish hands them back.
    pub(crate) fn shutdown(&self) {
        let drained = self.pool.close();
        debug!(topic = %self.topic, drained = drained.len(), "writer pool drained");
        for writer in drained {
            close_in_background(&self.tasks, &self.topic, "writer", move || writer.close());
        }
    }
}
