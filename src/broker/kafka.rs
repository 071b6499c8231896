//! rdkafka-backed writer and reader.

use super::{BrokerReader, BrokerWriter};
use crate::error::{Result, SchemaStreamError};
use crate::types::{BrokerHandle, Record, RecordHeader, StoredRecord};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as _, StreamConsumer};
use rdkafka::message::{Header, Headers, Message as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

fn client_config(properties: &BTreeMap<String, String>) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in properties {
        config.set(key, value);
    }
    config
}

pub struct KafkaWriter {
    producer: FutureProducer,
}

impl KafkaWriter {
    pub fn new(properties: &BTreeMap<String, String>) -> Result<Self> {
        let producer = client_config(properties)
            .create()
            .map_err(|e| SchemaStreamError::Config(format!("kafka producer: {e}")))?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl BrokerWriter for KafkaWriter {
    async fn write(&self, records: Vec<Record>) -> Result<()> {
        let deliveries = records.iter().map(|record| {
            let headers = record.headers.iter().fold(
                OwnedHeaders::new_with_capacity(record.headers.len()),
                |headers, h| {
                    headers.insert(Header {
                        key: &h.key,
                        value: Some(&h.value),
                    })
                },
            );
            let mut out = FutureRecord::<[u8], [u8]>::to(&record.topic)
                .payload(record.value.as_ref())
                .headers(headers);
            if let Some(key) = &record.key {
                out = out.key(key.as_slice());
            }
            if let Some(ts) = record.timestamp {
                out = out.timestamp(ts);
            }
            self.producer.send(out, Timeout::Never)
        });
        futures::future::try_join_all(deliveries)
            .await
            .map_err(|(e, _)| SchemaStreamError::Write(e.to_string()))?;
        Ok(())
    }

    /// Flushing blocks until delivery reports arrive, so it runs on the
    /// blocking pool.
    async fn close(&self) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(FLUSH_TIMEOUT)))
            .await
            .map_err(|e| SchemaStreamError::Write(format!("flush task: {e}")))?
            .map_err(|e| SchemaStreamError::Write(format!("flush: {e}")))
    }
}

/// Group member on a single topic with manual, synchronous commits.
pub struct KafkaReader {
    consumer: Arc<StreamConsumer>,
    closed: AtomicBool,
}

impl KafkaReader {
    pub fn new(properties: &BTreeMap<String, String>, topic: &str) -> Result<Self> {
        let consumer: StreamConsumer = client_config(properties)
            .create()
            .map_err(|e| SchemaStreamError::Config(format!("kafka consumer: {e}")))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| SchemaStreamError::Config(format!("subscribe to {topic}: {e}")))?;
        Ok(Self {
            consumer: Arc::new(consumer),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl BrokerReader for KafkaReader {
    async fn fetch(&self) -> Result<StoredRecord> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SchemaStreamError::Fetch("reader closed".to_string()));
        }
        let msg = self
            .consumer
            .recv()
            .await
            .map_err(|e| SchemaStreamError::Fetch(e.to_string()))?;

        let headers = msg
            .headers()
            .map(|hs| {
                hs.iter()
                    .map(|h| RecordHeader::new(h.key, h.value.unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default();
        let mut record = Record::new(msg.topic(), msg.payload().unwrap_or_default().to_vec())
            .with_headers(headers);
        record.key = msg.key().map(<[u8]>::to_vec);
        record.timestamp = msg.timestamp().to_millis();
        Ok(StoredRecord::new(msg.partition(), msg.offset(), record))
    }

    async fn commit(&self, handle: &BrokerHandle) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                handle.topic(),
                handle.partition(),
                Offset::Offset(handle.offset() + 1),
            )
            .map_err(|e| SchemaStreamError::Commit(e.to_string()))?;
        // Sync commits wait for the coordinator; keep them off the runtime threads.
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
            .await
            .map_err(|e| SchemaStreamError::Commit(format!("commit task: {e}")))?
            .map_err(|e| SchemaStreamError::Commit(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.consumer.unsubscribe();
        Ok(())
    }
}
