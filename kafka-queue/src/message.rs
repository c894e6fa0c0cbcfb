use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::QueueError;
use crate::kafka::KafkaTransport;
use crate::metrics_consts::{COMMIT_ERRORS, MESSAGES_ACKED, MESSAGES_NACKED};
use crate::pool::Handle;
use crate::reader::ReaderShared;
use crate::transport::{ReadHandle, Record, Transport};

/// When a reader handle goes back to its pool relative to the message it produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Coupling {
    /// No consumer group, the broker client commits on its own. Released on emission.
    AutoCommit,
    /// Consumer group with asynchronous acknowledge. Released on emission, acks
    /// don't commit.
    AsyncAck,
    /// Held until the message is acked or nacked; one record in flight per handle.
    Held,
}

impl Coupling {
    pub fn new(consumer_group: &str, async_ack: bool) -> Self {
        if consumer_group.is_empty() {
            Coupling::AutoCommit
        } else if async_ack {
            Coupling::AsyncAck
        } else {
            Coupling::Held
        }
    }

    pub fn releases_on_emit(&self) -> bool {
        !matches!(self, Coupling::Held)
    }

    pub fn commits_on_ack(&self) -> bool {
        matches!(self, Coupling::Held)
    }
}

/// The reader handle a message may still own. `take` hands it out at most once.
struct Lease<R> {
    released: AtomicBool,
    slot: Mutex<Option<Handle<R>>>,
}

impl<R> Lease<R> {
    fn held(handle: Handle<R>) -> Self {
        Self {
            released: AtomicBool::new(false),
            slot: Mutex::new(Some(handle)),
        }
    }

    fn released() -> Self {
        Self {
            released: AtomicBool::new(true),
            slot: Mutex::new(None),
        }
    }

    fn take(&self) -> Option<Handle<R>> {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        self.slot.lock().take()
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// Gives the handle back to the pool however the owning future ends.
struct Checkin<'a, T: Transport> {
    reader: &'a ReaderShared<T>,
    handle: Option<Handle<T::Reader>>,
}

impl<T: Transport> Drop for Checkin<'_, T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.reader.give_back(handle);
        }
    }
}

/// One fetched record, plus the right to acknowledge or reject it.
pub struct Message<T: Transport = KafkaTransport> {
    record: Record,
    reader: Arc<ReaderShared<T>>,
    lease: Lease<T::Reader>,
    settled: AtomicBool,
}

impl<T: Transport> Message<T> {
    pub(crate) fn new(reader: Arc<ReaderShared<T>>, record: Record, handle: Handle<T::Reader>) -> Self {
        let lease = if reader.coupling.releases_on_emit() {
            reader.give_back(handle);
            Lease::released()
        } else {
            Lease::held(handle)
        };
        Self {
            record,
            reader,
            lease,
            settled: AtomicBool::new(false),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.record.value
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.record.key.as_deref()
    }

    pub fn offset(&self) -> i64 {
        self.record.offset
    }

    pub fn partition(&self) -> i32 {
        self.record.partition
    }

    pub fn topic(&self) -> &str {
        &self.record.topic
    }

    /// True once the reader handle behind this message is back in circulation
    pub fn is_released(&self) -> bool {
        self.lease.is_released()
    }

    /// Acknowledge the record.
    ///
    /// Held messages commit the offset for the consumer group before their
    /// handle goes back to the pool; the handle is returned even if the commit
    /// fails. Only the first ack or nack of a message has any effect.
    pub async fn ack(&self) -> Result<(), QueueError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut checkin = Checkin {
            reader: &self.reader,
            handle: self.lease.take(),
        };
        let committed = match checkin.handle.as_mut() {
            Some(handle) if self.reader.coupling.commits_on_ack() => {
                handle.commit(&self.record).await
            }
            _ => Ok(()),
        };
        drop(checkin);

        match committed {
            Ok(()) => {
                self.reader.offsets.mark_acked(self.record.offset);
                counter!(MESSAGES_ACKED, "topic" => self.reader.topic.clone()).increment(1);
                Ok(())
            }
            Err(source) => {
                counter!(COMMIT_ERRORS, "topic" => self.reader.topic.clone()).increment(1);
                error!(
                    topic = %self.record.topic,
                    partition = self.record.partition,
                    offset = self.record.offset,
                    error = %source,
                    "failed to commit kafka message"
                );
                Err(QueueError::Commit {
                    topic: self.record.topic.clone(),
                    offset: self.record.offset,
                    source,
                })
            }
        }
    }

    /// Reject the record so it gets delivered again.
    ///
    /// The handle is closed and a fresh one takes its slot in the pool; the
    /// new session resumes from the group's last committed offset. A failed
    /// open is retried in the background, so the slot is never lost. Messages
    /// whose handle went back on emission cannot be rejected.
    pub fn nack(&self) -> Result<(), QueueError> {
        if self.reader.coupling.releases_on_emit() {
            return Err(QueueError::AsyncRejectUnsupported);
        }
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(handle) = self.lease.take() {
            self.reader.replace(handle);
        }
        counter!(MESSAGES_NACKED, "topic" => self.reader.topic.clone()).increment(1);
        debug!(
            topic = %self.record.topic,
            offset = self.record.offset,
            "kafka message rejected"
        );
        Ok(())
    }
}

impl<T: Transport> Drop for Message<T> {
    fn drop(&mut self) {
        let Some(handle) = self.lease.take() else {
            return;
        };
        if self.reader.shutdown.is_cancelled() {
            self.reader.give_back(handle);
            return;
        }
        warn!(
            topic = %self.record.topic,
            offset = self.record.offset,
            "kafka message dropped without ack or nack, rejecting it"
        );
        self.reader.replace(handle);
    }
}

impl<T: Transport> fmt::Debug for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("topic", &self.record.topic)
            .field("partition", &self.record.partition)
            .field("offset", &self.record.offset)
            .field("coupling", &self.reader.coupling)
            .field("released", &self.lease.is_released())
            .finish()
    }
}
