//! An in-process broker implementing [`Transport`], for tests.
//!
//! It keeps just enough of Kafka's behaviour for the queue to be exercised
//! end to end: partitioned topics, consumer groups where each partition is
//! read by at most one session, committed offsets a new session resumes from,
//! and injectable failures.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::TopicConfig;
use crate::error::TransportError;
use crate::transport::{
    ConfigEntry, OutboundRecord, ReadHandle, ReaderSettings, Record, Transport, WriteHandle,
    WriterSettings,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub dials: usize,
    pub readers_opened: usize,
    pub readers_closed: usize,
    pub writers_opened: usize,
    pub writers_closed: usize,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<Record>>>,
    // (group, topic, partition) -> next offset to read
    committed: HashMap<(String, String, i32), i64>,
    // (group, topic, partition) -> session reading it
    claims: HashMap<(String, String, i32), u64>,
    configs: HashMap<String, HashMap<String, String>>,
}

impl BrokerState {
    fn partitions_mut(&mut self, topic: &str) -> &mut Vec<Vec<Record>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new()])
    }

    fn append(&mut self, topic: &str, record: &OutboundRecord) {
        let partitions = self.partitions_mut(topic);
        let partition = match &record.key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % partitions.len() as u64) as usize
            }
            None => partitions
                .iter()
                .enumerate()
                .min_by_key(|(_, log)| log.len())
                .map(|(index, _)| index)
                .unwrap_or(0),
        };
        let log = &mut partitions[partition];
        log.push(Record {
            topic: topic.to_string(),
            partition: partition as i32,
            offset: log.len() as i64,
            key: record.key.clone(),
            value: record.value.clone(),
        });
    }
}

#[derive(Default)]
struct Broker {
    state: Mutex<BrokerState>,
    arrivals: Notify,
    unreachable: Mutex<HashSet<String>>,
    sessions: AtomicU64,
    failing_fetches: AtomicUsize,
    failing_writes: AtomicUsize,
    failing_commits: AtomicUsize,
    reader_opens_before_failure: AtomicUsize,
    failing_reader_opens: AtomicUsize,
    dials: AtomicUsize,
    readers_opened: AtomicUsize,
    readers_closed: AtomicUsize,
    writers_opened: AtomicUsize,
    writers_closed: AtomicUsize,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

/// Cloning gives another view of the same broker.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<Broker>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `topic` with `partitions` partitions, replacing nothing if it exists
    pub fn with_topic(self, topic: &str, partitions: usize) -> Self {
        self.create(topic, partitions);
        self
    }

    pub fn create(&self, topic: &str, partitions: usize) {
        self.broker
            .state
            .lock()
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1)]);
    }

    pub fn set_unreachable(&self, broker: &str) {
        self.broker.unreachable.lock().insert(broker.to_string());
    }

    pub fn fail_next_fetches(&self, count: usize) {
        self.broker.failing_fetches.store(count, Ordering::Release);
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.broker.failing_writes.store(count, Ordering::Release);
    }

    pub fn fail_next_commits(&self, count: usize) {
        self.broker.failing_commits.store(count, Ordering::Release);
    }

    /// Let `after` more reader opens succeed, then fail the next `count`
    pub fn fail_reader_opens(&self, after: usize, count: usize) {
        self.broker
            .reader_opens_before_failure
            .store(after, Ordering::Release);
        self.broker.failing_reader_opens.store(count, Ordering::Release);
    }

    /// Append a record as if another producer wrote it
    pub fn publish(&self, topic: &str, value: impl Into<Vec<u8>>) {
        self.broker
            .state
            .lock()
            .append(topic, &OutboundRecord::value(value));
        self.broker.arrivals.notify_waiters();
    }

    pub fn records(&self, topic: &str) -> Vec<Record> {
        self.broker
            .state
            .lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.broker.state.lock().topics.get(topic).map(Vec::len)
    }

    /// Next offset `group` will read from `partition`, if it committed anything
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.broker
            .state
            .lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    pub fn topic_config(&self, topic: &str) -> HashMap<String, String> {
        self.broker
            .state
            .lock()
            .configs
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> MemoryStats {
        let broker = &self.broker;
        MemoryStats {
            dials: broker.dials.load(Ordering::Acquire),
            readers_opened: broker.readers_opened.load(Ordering::Acquire),
            readers_closed: broker.readers_closed.load(Ordering::Acquire),
            writers_opened: broker.writers_opened.load(Ordering::Acquire),
            writers_closed: broker.writers_closed.load(Ordering::Acquire),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    async fn dial(&self, broker: &str) -> Result<(), TransportError> {
        self.broker.dials.fetch_add(1, Ordering::AcqRel);
        if self.broker.unreachable.lock().contains(broker) {
            return Err(TransportError::Unreachable {
                broker: broker.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    fn open_reader(
        &self,
        topic: &str,
        settings: &ReaderSettings,
    ) -> Result<MemoryReader, TransportError> {
        if !take_one(&self.broker.reader_opens_before_failure)
            && take_one(&self.broker.failing_reader_opens)
        {
            return Err(TransportError::Broker("injected reader open failure".to_string()));
        }
        self.broker.state.lock().partitions_mut(topic);
        self.broker.readers_opened.fetch_add(1, Ordering::AcqRel);

        Ok(MemoryReader {
            broker: self.broker.clone(),
            session: self.broker.sessions.fetch_add(1, Ordering::AcqRel),
            topic: topic.to_string(),
            group: settings.group_id.clone(),
            auto_commit: settings.auto_commit,
            cursor: None,
        })
    }

    fn open_writer(
        &self,
        topic: &str,
        _settings: &WriterSettings,
    ) -> Result<MemoryWriter, TransportError> {
        self.broker.writers_opened.fetch_add(1, Ordering::AcqRel);
        Ok(MemoryWriter {
            broker: self.broker.clone(),
            topic: topic.to_string(),
        })
    }

    async fn reset_offsets(&self, topic: &str, group_id: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        let newest: Vec<i64> = state
            .partitions_mut(topic)
            .iter()
            .map(|log| log.len() as i64)
            .collect();
        for (partition, offset) in newest.into_iter().enumerate() {
            state.committed.insert(
                (group_id.to_string(), topic.to_string(), partition as i32),
                offset,
            );
        }
        Ok(())
    }

    async fn newest_offset(&self, topic: &str, partition: i32) -> Result<i64, TransportError> {
        let state = self.broker.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .map(|log| log.len() as i64)
            .ok_or_else(|| TransportError::Broker(format!("unknown partition {topic}/{partition}")))
    }

    async fn create_topic(&self, topic: &str, config: &TopicConfig) -> Result<(), TransportError> {
        let partitions = usize::try_from(config.num_partitions).unwrap_or(1);
        self.create(topic, partitions);
        Ok(())
    }

    async fn alter_topic_config(
        &self,
        topic: &str,
        entries: &[(String, String)],
    ) -> Result<Vec<ConfigEntry>, TransportError> {
        let mut state = self.broker.state.lock();
        if !state.topics.contains_key(topic) {
            return Err(TransportError::Admin {
                topic: topic.to_string(),
                reason: "unknown topic".to_string(),
            });
        }
        let config = state.configs.entry(topic.to_string()).or_default();
        config.extend(entries.iter().cloned());
        Ok(entries
            .iter()
            .map(|(name, _)| ConfigEntry {
                name: name.clone(),
                value: config.get(name).cloned(),
            })
            .collect())
    }
}

pub struct MemoryReader {
    broker: Arc<Broker>,
    session: u64,
    topic: String,
    group: String,
    auto_commit: bool,
    // Claimed partition and the next offset to read from it
    cursor: Option<(i32, i64)>,
}

impl MemoryReader {
    /// Claim a partition nobody in the group reads yet, starting from the
    /// group's committed offset.
    fn claim(&mut self, state: &mut BrokerState) {
        let partitions = state.partitions_mut(&self.topic).len();
        for partition in 0..partitions as i32 {
            let key = (self.group.clone(), self.topic.clone(), partition);
            if state.claims.contains_key(&key) {
                continue;
            }
            let start = state.committed.get(&key).copied().unwrap_or(0);
            state.claims.insert(key, self.session);
            self.cursor = Some((partition, start));
            return;
        }
    }

    fn next_record(&mut self) -> Option<Record> {
        let broker = self.broker.clone();
        let mut state = broker.state.lock();
        if self.cursor.is_none() {
            self.claim(&mut state);
        }
        let (partition, offset) = self.cursor?;
        let record = state
            .topics
            .get(&self.topic)?
            .get(partition as usize)?
            .get(offset as usize)?
            .clone();

        self.cursor = Some((partition, offset + 1));
        if self.auto_commit {
            state.committed.insert(
                (self.group.clone(), self.topic.clone(), partition),
                offset + 1,
            );
        }
        Some(record)
    }
}

#[async_trait]
impl ReadHandle for MemoryReader {
    async fn fetch(&mut self) -> Result<Record, TransportError> {
        let broker = self.broker.clone();
        loop {
            let arrival = broker.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            if take_one(&broker.failing_fetches) {
                return Err(TransportError::Broker("injected fetch failure".to_string()));
            }
            if let Some(record) = self.next_record() {
                return Ok(record);
            }
            arrival.await;
        }
    }

    async fn commit(&mut self, record: &Record) -> Result<(), TransportError> {
        if take_one(&self.broker.failing_commits) {
            return Err(TransportError::Broker("injected commit failure".to_string()));
        }
        self.broker.state.lock().committed.insert(
            (self.group.clone(), record.topic.clone(), record.partition),
            record.offset + 1,
        );
        Ok(())
    }

    fn close(self) -> Result<(), TransportError> {
        self.broker.readers_closed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl Drop for MemoryReader {
    fn drop(&mut self) {
        if let Some((partition, _)) = self.cursor.take() {
            let key = (self.group.clone(), self.topic.clone(), partition);
            let mut state = self.broker.state.lock();
            if state.claims.get(&key) == Some(&self.session) {
                state.claims.remove(&key);
            }
        }
        // Other sessions may be waiting for the partition
        self.broker.arrivals.notify_waiters();
    }
}

pub struct MemoryWriter {
    broker: Arc<Broker>,
    topic: String,
}

#[async_trait]
impl WriteHandle for MemoryWriter {
    async fn write(&mut self, records: &[OutboundRecord]) -> Result<(), TransportError> {
        if take_one(&self.broker.failing_writes) {
            return Err(TransportError::Broker("injected write failure".to_string()));
        }
        {
            let mut state = self.broker.state.lock();
            for record in records {
                state.append(&self.topic, record);
            }
        }
        self.broker.arrivals.notify_waiters();
        Ok(())
    }

    fn close(self) -> Result<(), TransportError> {
        self.broker.writers_closed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
