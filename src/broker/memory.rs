//! In-process partitioned log with consumer-group offsets.
//!
//! Same shape as a Kafka cluster from the client's point of view: topics are
//! split into partitions, offsets grow strictly per partition, and each group
//! resumes from the offset it last committed.

use super::{BrokerReader, BrokerWriter, StartOffset};
use crate::error::{Result, SchemaStreamError};
use crate::types::{BrokerHandle, Record, StoredRecord};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

struct TopicLog {
    partitions: Vec<RwLock<Vec<Record>>>,
    round_robin: AtomicUsize,
}

impl TopicLog {
    fn new(num_partitions: i32) -> Self {
        Self {
            partitions: (0..num_partitions).map(|_| RwLock::new(Vec::new())).collect(),
            round_robin: AtomicUsize::new(0),
        }
    }

    fn len(&self) -> i32 {
        self.partitions.len() as i32
    }

    fn partition_for(&self, key: Option<&[u8]>) -> usize {
        let n = self.partitions.len();
        match key {
            Some(key) => {
                let hash = key
                    .iter()
                    .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(*b)));
                hash as usize % n
            }
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % n,
        }
    }
}

/// In-memory broker shared by writers and group readers.
pub struct MemoryBroker {
    default_partitions: i32,
    topics: DashMap<String, Arc<TopicLog>>,
    /// Committed offsets: (group_id, topic, partition) -> next offset to read.
    offsets: DashMap<(String, String, i32), i64>,
    appended: Notify,
}

impl MemoryBroker {
    /// Broker whose auto-created topics have a single partition.
    pub fn new() -> Arc<Self> {
        Self::with_partitions(1)
    }

    pub fn with_partitions(default_partitions: i32) -> Arc<Self> {
        Arc::new(Self {
            default_partitions: default_partitions.max(1),
            topics: DashMap::new(),
            offsets: DashMap::new(),
            appended: Notify::new(),
        })
    }

    /// Create a topic. Idempotent as long as the partition count matches.
    pub fn create_topic(&self, name: &str, num_partitions: i32) -> Result<()> {
        if name.is_empty() || num_partitions < 1 {
            return Err(SchemaStreamError::Config(format!(
                "invalid topic {name:?} with {num_partitions} partitions"
            )));
        }
        let existing = self
            .topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TopicLog::new(num_partitions)))
            .len();
        if existing != num_partitions {
            return Err(SchemaStreamError::Config(format!(
                "topic {name} exists with {existing} partitions, cannot change to {num_partitions}"
            )));
        }
        Ok(())
    }

    fn topic(&self, name: &str) -> Arc<TopicLog> {
        Arc::clone(
            &self
                .topics
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(TopicLog::new(self.default_partitions))),
        )
    }

    pub fn num_partitions(&self, topic: &str) -> Option<i32> {
        self.topics.get(topic).map(|log| log.len())
    }

    /// Append a record, returning (partition, offset).
    pub fn append(&self, mut record: Record) -> Result<(i32, i64)> {
        if record.topic.is_empty() {
            return Err(SchemaStreamError::Write("record has no topic".to_string()));
        }
        record.ensure_timestamp();
        let log = self.topic(&record.topic);
        let partition = log.partition_for(record.key.as_deref());
        let offset = {
            let mut entries = log.partitions[partition].write();
            entries.push(record);
            entries.len() as i64 - 1
        };
        self.appended.notify_waiters();
        Ok((partition as i32, offset))
    }

    /// Read up to `max_records` records from `start_offset` (inclusive).
    pub fn fetch(
        &self,
        topic: &str,
        partition: i32,
        start_offset: i64,
        max_records: usize,
    ) -> Result<Vec<StoredRecord>> {
        let log = self
            .topics
            .get(topic)
            .map(|log| Arc::clone(&log))
            .ok_or_else(|| SchemaStreamError::Fetch(format!("unknown topic {topic}")))?;
        let entries = log
            .partitions
            .get(partition as usize)
            .ok_or_else(|| SchemaStreamError::Fetch(format!("unknown partition {topic}/{partition}")))?
            .read();
        let start = start_offset.max(0) as usize;
        Ok(entries
            .iter()
            .enumerate()
            .skip(start)
            .take(max_records)
            .map(|(offset, record)| StoredRecord::new(partition, offset as i64, record.clone()))
            .collect())
    }

    /// Next offset to be assigned in a partition.
    pub fn high_water_mark(&self, topic: &str, partition: i32) -> i64 {
        self.topics
            .get(topic)
            .and_then(|log| log.partitions.get(partition as usize).map(|p| p.read().len() as i64))
            .unwrap_or(0)
    }

    /// Next offset the group will read after a restart, if it ever committed.
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.offsets
            .get(&(group_id.to_string(), topic.to_string(), partition))
            .map(|r| *r)
    }

    fn commit(&self, group_id: &str, topic: &str, partition: i32, next_offset: i64) {
        self.offsets
            .insert((group_id.to_string(), topic.to_string(), partition), next_offset);
    }

    pub fn writer(self: &Arc<Self>) -> MemoryWriter {
        MemoryWriter {
            broker: Arc::clone(self),
            closed: AtomicBool::new(false),
        }
    }

    /// Join `group_id` on `topic`. Partitions without a committed offset start
    /// according to `start`.
    pub fn reader(
        self: &Arc<Self>,
        group_id: impl Into<String>,
        topic: impl Into<String>,
        start: StartOffset,
    ) -> MemoryReader {
        let group_id = group_id.into();
        let topic = topic.into();
        let log = self.topic(&topic);
        let cursors = (0..log.len())
            .map(|p| {
                self.committed_offset(&group_id, &topic, p)
                    .unwrap_or_else(|| match start {
                        StartOffset::Earliest => 0,
                        StartOffset::Latest => self.high_water_mark(&topic, p),
                    })
            })
            .collect();
        MemoryReader {
            broker: Arc::clone(self),
            group_id,
            topic,
            cursors: Mutex::new(Cursors {
                offsets: cursors,
                next_partition: 0,
            }),
            closed: AtomicBool::new(false),
        }
    }
}

pub struct MemoryWriter {
    broker: Arc<MemoryBroker>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerWriter for MemoryWriter {
    async fn write(&self, records: Vec<Record>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchemaStreamError::Write("writer closed".to_string()));
        }
        for record in records {
            self.broker.append(record)?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct Cursors {
    offsets: Vec<i64>,
    next_partition: usize,
}

/// One group member reading every partition of a topic.
pub struct MemoryReader {
    broker: Arc<MemoryBroker>,
    group_id: String,
    topic: String,
    cursors: Mutex<Cursors>,
    closed: AtomicBool,
}

impl MemoryReader {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Take the next unread record, visiting partitions round-robin.
    fn try_next(&self) -> Result<Option<StoredRecord>> {
        let mut cursors = self.cursors.lock();
        let n = cursors.offsets.len();
        for step in 0..n {
            let partition = (cursors.next_partition + step) % n;
            let offset = cursors.offsets[partition];
            let mut records = self.broker.fetch(&self.topic, partition as i32, offset, 1)?;
            if let Some(record) = records.pop() {
                cursors.offsets[partition] = offset + 1;
                cursors.next_partition = (partition + 1) % n;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl BrokerReader for MemoryReader {
    async fn fetch(&self) -> Result<StoredRecord> {
        loop {
            // Registered before the check so an append in between is not missed.
            let appended = self.broker.appended.notified();
            if self.closed.load(Ordering::Acquire) {
                return Err(SchemaStreamError::Fetch("reader closed".to_string()));
            }
            if let Some(record) = self.try_next()? {
                return Ok(record);
            }
            appended.await;
        }
    }

    async fn commit(&self, handle: &BrokerHandle) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchemaStreamError::Commit("reader closed".to_string()));
        }
        if handle.topic() != self.topic {
            return Err(SchemaStreamError::Commit(format!(
                "handle for topic {} committed on reader for {}",
                handle.topic(),
                self.topic
            )));
        }
        self.broker
            .commit(&self.group_id, &self.topic, handle.partition(), handle.offset() + 1);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.broker.appended.notify_waiters();
        Ok(())
    }
}
