//! Reader pools and the workers that turn fetched records into messages.
//!
//! Each topic gets `concurrency` reader handles and one worker per handle.
//! A worker checks a handle out, fetches one record with it and emits the
//! wrapped message on the topic channel. Under `Coupling::Held` the handle
//! travels with the message, so the next fetch on that handle waits for the
//! ack or nack.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::{QueueError, TransportError};
use crate::message::{Coupling, Message};
use crate::metrics_consts::{FETCH_ERRORS, HANDLES_REPLACED, MESSAGES_EMITTED, REOPEN_ERRORS};
use crate::offsets::OffsetTracker;
use crate::pool::{Handle, HandlePool, PoolStats};
use crate::transport::{ReadHandle, ReaderSettings, Transport};
use crate::utils::{cancelled_by, close_in_background, expired};

const FETCH_RETRY_BACKOFF: Duration = Duration::from_millis(100);
const REOPEN_BACKOFF: Duration = Duration::from_millis(100);

/// State shared between a topic's workers and the messages they emit
pub(crate) struct ReaderShared<T: Transport> {
    pub(crate) topic: String,
    pub(crate) pool: HandlePool<T::Reader>,
    pub(crate) offsets: OffsetTracker,
    pub(crate) coupling: Coupling,
    pub(crate) shutdown: CancellationToken,
    transport: Arc<T>,
    settings: ReaderSettings,
    tasks: TaskTracker,
}

impl<T: Transport> ReaderShared<T> {
    /// Return a handle to the pool, or close it if the pool has shut down.
    pub(crate) fn give_back(&self, handle: Handle<T::Reader>) {
        if let Err(handle) = self.pool.release(handle) {
            let id = handle.id();
            let reader = self.pool.retire(handle);
            debug!(topic = %self.topic, handle = %id, "reader pool closed, closing handle");
            self.close(reader);
        }
    }

    /// Close `handle` and put a freshly opened session in its slot.
    ///
    /// If the new session can't be opened right away the slot is refilled by
    /// a background task that keeps trying until it succeeds or the queue
    /// shuts down.
    pub(crate) fn replace(self: &Arc<Self>, handle: Handle<T::Reader>) {
        let old_id = handle.id();
        let old = self.pool.retire(handle);
        self.close(old);

        if self.shutdown.is_cancelled() {
            return;
        }

        match self.transport.open_reader(&self.topic, &self.settings) {
            Ok(fresh) => self.fill_slot(fresh),
            Err(e) => {
                error!(
                    topic = %self.topic,
                    handle = %old_id,
                    error = %e,
                    "cant open replacement reader, retrying in background"
                );
                counter!(REOPEN_ERRORS, "topic" => self.topic.clone()).increment(1);
                self.spawn_reopen();
            }
        }
    }

    fn fill_slot(&self, fresh: T::Reader) {
        match self.pool.insert(fresh) {
            Ok(new_id) => {
                counter!(HANDLES_REPLACED, "topic" => self.topic.clone()).increment(1);
                debug!(topic = %self.topic, handle = %new_id, "reader handle replaced");
            }
            Err(fresh) => self.close(fresh),
        }
    }

    fn spawn_reopen(self: &Arc<Self>) {
        let shared = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                self.tasks.spawn_on(reopen_reader(shared), &runtime);
            }
            Err(_) => {
                error!(topic = %self.topic, "no runtime to reopen reader on, pool is one handle short");
            }
        }
    }

    fn close(&self, reader: T::Reader) {
        close_in_background(&self.tasks, &self.topic, "reader", move || reader.close());
    }
}

/// Keep trying to open a reader for a vacated slot.
async fn reopen_reader<T: Transport>(shared: Arc<ReaderShared<T>>) {
    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => return,
            _ = tokio::time::sleep(REOPEN_BACKOFF) => {}
        }

        match shared.transport.open_reader(&shared.topic, &shared.settings) {
            Ok(fresh) => {
                shared.fill_slot(fresh);
                return;
            }
            Err(e) => {
                error!(topic = %shared.topic, error = %e, "cant reopen reader");
                counter!(REOPEN_ERRORS, "topic" => shared.topic.clone()).increment(1);
            }
        }
    }
}

pub(crate) struct TopicReader<T: Transport> {
    shared: Arc<ReaderShared<T>>,
    messages: Mutex<mpsc::Receiver<Message<T>>>,
}

impl<T: Transport> TopicReader<T> {
    /// Open every handle up front and spawn one worker per handle. Nothing is
    /// spawned unless all handles open.
    pub(crate) fn start(
        topic: &str,
        transport: Arc<T>,
        concurrency: usize,
        settings: ReaderSettings,
        coupling: Coupling,
        shutdown: CancellationToken,
        tasks: TaskTracker,
    ) -> Result<Self, TransportError> {
        let pool = HandlePool::new(format!("{topic}-readers"), concurrency);
        let mut opened = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            match transport.open_reader(topic, &settings) {
                Ok(reader) => opened.push(reader),
                Err(e) => {
                    for reader in opened {
                        close_in_background(&tasks, topic, "reader", move || reader.close());
                    }
                    return Err(e);
                }
            }
        }
        for reader in opened {
            if let Err(reader) = pool.insert(reader) {
                close_in_background(&tasks, topic, "reader", move || reader.close());
            }
        }

        let shared = Arc::new(ReaderShared {
            topic: topic.to_string(),
            pool,
            offsets: OffsetTracker::new(),
            coupling,
            shutdown,
            transport,
            settings,
            tasks: tasks.clone(),
        });

        let (sender, receiver) = mpsc::channel(1);
        for worker in 0..concurrency {
            tasks.spawn(run_worker(shared.clone(), sender.clone(), worker));
        }
        info!(topic, concurrency, coupling = ?coupling, "reader workers started");

        Ok(Self {
            shared,
            messages: Mutex::new(receiver),
        })
    }

    pub(crate) async fn next_message(
        &self,
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Message<T>, QueueError> {
        let receive = async {
            let mut messages = self.messages.lock().await;
            messages.recv().await
        };

        tokio::select! {
            biased;
            _ = self.shared.shutdown.cancelled() => Err(QueueError::Closed),
            _ = cancelled_by(cancel) => Err(QueueError::Cancelled),
            _ = expired(deadline) => Err(QueueError::DeadlineExceeded),
            message = receive => message.ok_or(QueueError::Closed),
        }
    }

    pub(crate) fn lag(&self, newest_offset: i64) -> i64 {
        self.shared.offsets.lag(newest_offset)
    }

    pub(crate) fn stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    /// Close every pooled handle and every message nobody received yet.
    ///
    /// Handles checked out to in-flight messages are closed by whoever gives
    /// them back later.
    pub(crate) async fn shutdown(&self) {
        let drained = self.shared.pool.close();
        debug!(topic = %self.shared.topic, drained = drained.len(), "reader pool drained");
        for reader in drained {
            self.shared.close(reader);
        }
        self.discard_pending().await;
    }

    /// Stop accepting messages and drop the ones still buffered. Their handles
    /// get closed since the pool is already closed.
    pub(crate) async fn discard_pending(&self) {
        let mut messages = self.messages.lock().await;
        messages.close();
        let mut discarded = Vec::new();
        while let Ok(message) = messages.try_recv() {
            discarded.push((message.partition(), message.offset()));
        }
        if discarded.is_empty() {
            return;
        }

        let topic = &self.shared.topic;
        if self.shared.coupling.releases_on_emit() {
            // The client may already have committed these, they won't come back
            warn!(
                topic = %topic,
                count = discarded.len(),
                offsets = ?discarded,
                "undelivered kafka messages discarded on close"
            );
        } else {
            debug!(
                topic = %topic,
                count = discarded.len(),
                offsets = ?discarded,
                "undelivered kafka messages discarded on close, they stay uncommitted"
            );
        }
    }
}

async fn run_worker<T: Transport>(
    shared: Arc<ReaderShared<T>>,
    sink: mpsc::Sender<Message<T>>,
    worker: usize,
) {
    let topic = shared.topic.clone();
    debug!(topic = %topic, worker, "reader worker running");

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        let Ok(mut handle) = shared.pool.checkout(&shared.shutdown).await else {
            break;
        };

        let fetched = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => None,
            result = handle.fetch() => Some(result),
        };

        let record = match fetched {
            None => {
                shared.give_back(handle);
                break;
            }
            Some(Err(e)) => {
                error!(topic = %topic, worker, error = %e, "error during kafka message fetching");
                counter!(FETCH_ERRORS, "topic" => topic.clone()).increment(1);
                shared.give_back(handle);
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(FETCH_RETRY_BACKOFF) => continue,
                }
            }
            Some(Ok(record)) => record,
        };

        let partition = record.partition;
        let offset = record.offset;
        let message = Message::new(shared.clone(), record, handle);

        let permit = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => None,
            permit = sink.reserve() => permit.ok(),
        };
        match permit {
            Some(permit) => {
                permit.send(message);
                counter!(MESSAGES_EMITTED, "topic" => topic.clone()).increment(1);
                debug!(topic = %topic, worker, partition, offset, "kafka message emitted");
            }
            None => {
                if shared.coupling.releases_on_emit() {
                    warn!(topic = %topic, worker, partition, offset, "undelivered kafka message discarded on close");
                }
                // Nobody will receive it; dropping it closes a handle it still holds
                drop(message);
                break;
            }
        }
    }

    debug!(topic = %topic, worker, "reader worker stopped");
}
