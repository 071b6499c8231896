//! Schemastream: schema-registry framed protobuf messaging over a partitioned log.
//!
//! Producers frame records with their registry schema id; consumers strip the
//! framing, decode, hand each message to a handler and commit afterwards.

pub mod broker;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod producer;
pub mod registry;
pub mod stats;
pub mod transport;
pub mod types;

pub use broker::memory::{MemoryBroker, MemoryReader, MemoryWriter};
pub use broker::{BrokerReader, BrokerWriter, StartOffset};
pub use consumer::{handler_fn, Consumer, ConsumerOptions, MessageHandler};
pub use error::{Result, SchemaStreamError};
pub use producer::{Compression, Partitioner, Producer, ProducerOptions, RequiredAcks};
pub use registry::{
    CompatibilityLevel, HttpRegistryClient, RegistryClient, SchemaBindings, SchemaRegistry,
    SchemaRegistryOptions,
};
pub use transport::{TlsMode, Transport, TransportOptions};
pub use types::{BrokerHandle, Message, Record, RecordDescriptor, RecordHeader, SchemaRecord, StoredRecord};
pub use tokio_util::sync::CancellationToken;
