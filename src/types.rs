//! Core types shared by the producer, the consumer and the broker seam.

use crate::error::{Result, SchemaStreamError};
use bytes::Bytes;
use std::time::SystemTime;

/// Kafka-style record header. Insertion order is preserved end to end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: String,
    pub value: Vec<u8>,
}

impl RecordHeader {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Position of a protobuf message type inside its schema file, plus the file
/// text that gets published to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDescriptor {
    /// Fully-qualified message name (e.g. `shop.Order`).
    pub full_name: String,
    /// Textual `.proto` definition of the file hosting the message.
    pub schema: String,
    /// Index of the message under its parent (file or enclosing message).
    pub index: usize,
    /// Indices of the enclosing messages, from the file root down to the parent.
    pub ancestors: Vec<usize>,
}

impl RecordDescriptor {
    /// Descriptor for a top-level message at `index` in its file.
    pub fn top_level(full_name: impl Into<String>, schema: impl Into<String>, index: usize) -> Self {
        Self {
            full_name: full_name.into(),
            schema: schema.into(),
            index,
            ancestors: Vec::new(),
        }
    }

    /// Descriptor for a message nested under the given ancestor path.
    pub fn nested(
        full_name: impl Into<String>,
        schema: impl Into<String>,
        ancestors: Vec<usize>,
        index: usize,
    ) -> Self {
        Self {
            full_name: full_name.into(),
            schema: schema.into(),
            index,
            ancestors,
        }
    }
}

/// Structured record capability: a protobuf message that knows where it lives
/// in its schema file.
pub trait SchemaRecord: prost::Message + Default + Clone + Send + Sync + 'static {
    fn descriptor() -> RecordDescriptor;

    fn encode_payload(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    fn decode_payload(bytes: &[u8]) -> Result<Self> {
        Self::decode(bytes).map_err(|e| SchemaStreamError::Decode(e.to_string()))
    }
}

/// Commit token for an inbound message. Only the consumer that fetched the
/// message is expected to hand it back to its reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerHandle {
    topic: String,
    partition: i32,
    offset: i64,
}

impl BrokerHandle {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

/// Typed message envelope.
///
/// Outbound messages only use `topic`, `key`, `value` and `headers`; inbound
/// messages additionally carry the bytes as fetched and the commit handle.
#[derive(Debug, Clone)]
pub struct Message<T> {
    pub topic: String,
    /// Optional key for partition routing.
    pub key: Option<Vec<u8>>,
    pub value: T,
    pub headers: Vec<RecordHeader>,
    /// Value bytes as fetched from the broker (inbound only).
    pub raw_value: Bytes,
    handle: Option<BrokerHandle>,
}

impl<T> Message<T> {
    pub fn new(topic: impl Into<String>, value: T) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value,
            headers: Vec::new(),
            raw_value: Bytes::new(),
            handle: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_headers(mut self, headers: Vec<RecordHeader>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push(RecordHeader::new(key, value));
        self
    }

    /// Commit handle; `None` for messages built by the application.
    pub fn handle(&self) -> Option<&BrokerHandle> {
        self.handle.as_ref()
    }

    pub(crate) fn inbound(stored: &StoredRecord, value: T) -> Self {
        Self {
            topic: stored.topic.clone(),
            key: stored.record.key.clone(),
            value,
            headers: stored.record.headers.clone(),
            raw_value: stored.record.value.clone(),
            handle: Some(stored.handle()),
        }
    }
}

/// Untyped record as written to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Bytes,
    pub headers: Vec<RecordHeader>,
    /// Millis since epoch; stamped on append if `None`.
    pub timestamp: Option<i64>,
}

impl Record {
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value: value.into(),
            headers: Vec::new(),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_headers(mut self, headers: Vec<RecordHeader>) -> Self {
        self.headers = headers;
        self
    }

    /// Set timestamp to now if not set (used on append).
    pub fn ensure_timestamp(&mut self) {
        if self.timestamp.is_none() {
            self.timestamp = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .ok();
        }
    }
}

/// Record fetched from the broker with its partition and offset.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub record: Record,
}

impl StoredRecord {
    pub fn new(partition: i32, offset: i64, record: Record) -> Self {
        Self {
            topic: record.topic.clone(),
            partition,
            offset,
            record,
        }
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle::new(self.topic.clone(), self.partition, self.offset)
    }
}
