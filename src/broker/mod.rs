//! Broker seam: the write and read capabilities the producer and consumer need.
//!
//! [`memory::MemoryBroker`] is an in-process partitioned log; the `kafka`
//! feature adds rdkafka-backed implementations.

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

use crate::error::Result;
use crate::types::{BrokerHandle, Record, StoredRecord};
use async_trait::async_trait;

/// Writes records to topics. Batching and delivery retries are the
/// implementation's concern.
#[async_trait]
pub trait BrokerWriter: Send + Sync {
    async fn write(&self, records: Vec<Record>) -> Result<()>;

    /// Flush pending records and release the writer.
    async fn close(&self) -> Result<()>;
}

/// Reads one consumer group's share of a topic.
#[async_trait]
pub trait BrokerReader: Send + Sync {
    /// Wait for the next record. Returns [`SchemaStreamError::Cancelled`]
    /// if the wait was interrupted by shutdown.
    ///
    /// [`SchemaStreamError::Cancelled`]: crate::error::SchemaStreamError::Cancelled
    async fn fetch(&self) -> Result<StoredRecord>;

    /// Mark the record behind `handle` as processed for the group.
    async fn commit(&self, handle: &BrokerHandle) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Where a group starts reading a partition it has no committed offset for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOffset {
    Earliest,
    #[default]
    Latest,
}

impl StartOffset {
    pub fn from_read_earliest(read_earliest: bool) -> Self {
        if read_earliest {
            Self::Earliest
        } else {
            Self::Latest
        }
    }

    /// `auto.offset.reset` value.
    pub fn as_reset_policy(&self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }
}
