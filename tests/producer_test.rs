mod support;

use async_trait::async_trait;
use schemastream::error::{Result, SchemaStreamError};
use schemastream::codec::schema_id_of;
use schemastream::registry::{RegisteredSchema, SchemaType};
use schemastream::{
    BrokerWriter, CompatibilityLevel, MemoryBroker, Message, Producer, ProducerOptions, Record,
    RecordHeader, RegistryClient, SchemaRecord, SchemaRegistryOptions,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use support::{init_tracing, order, Order};

const BROKERS: [&str; 1] = ["localhost:9092"];

/// Writer that counts calls and can be told to fail.
#[derive(Default)]
struct CountingWriter {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl BrokerWriter for CountingWriter {
    async fn write(&self, _records: Vec<Record>) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SchemaStreamError::Fetch("leader not available".to_string()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn empty_input_is_a_no_op() {
    let calls = Arc::new(AtomicUsize::new(0));
    let writer = CountingWriter {
        calls: calls.clone(),
        fail: true,
    };
    let producer: Producer<Order> = Producer::new(ProducerOptions::new(BROKERS), writer)
        .await
        .unwrap();
    producer.produce(&[]).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_topic_fails_before_writing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let writer = CountingWriter {
        calls: calls.clone(),
        fail: false,
    };
    let producer: Producer<Order> = Producer::new(ProducerOptions::new(BROKERS), writer)
        .await
        .unwrap();

    let err = producer
        .produce(&[
            Message::new("orders", order("o-1", 1)),
            Message::new("", order("o-2", 2)),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, SchemaStreamError::MissingTopic));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_broker_list_fails_construction() {
    let result: Result<Producer<Order>> =
        Producer::new(ProducerOptions::new(Vec::<String>::new()), CountingWriter::default()).await;
    assert!(matches!(result, Err(SchemaStreamError::Config(_))));
}

#[tokio::test]
async fn write_failures_are_wrapped() {
    init_tracing();
    let writer = CountingWriter {
        calls: Arc::default(),
        fail: true,
    };
    let producer: Producer<Order> = Producer::new(ProducerOptions::new(BROKERS), writer)
        .await
        .unwrap();
    let err = producer
        .produce(&[Message::new("orders", order("o-1", 1))])
        .await
        .unwrap_err();
    assert!(matches!(err, SchemaStreamError::Write(ref m) if m.contains("leader not available")));
    assert_eq!(producer.stats().write_errors, 1);
}

#[tokio::test]
async fn without_registry_values_are_written_unframed() {
    let broker = MemoryBroker::new();
    let producer: Producer<Order> = Producer::new(ProducerOptions::new(BROKERS), broker.writer())
        .await
        .unwrap();

    let messages = vec![
        Message::new("orders", order("o-1", 100))
            .with_key("o-1")
            .with_headers(vec![
                RecordHeader::new("trace-id", "t-1"),
                RecordHeader::new("source", "checkout"),
            ]),
        Message::new("orders", order("o-2", 200)).with_key("o-2"),
    ];
    producer.produce(&messages).await.unwrap();
    assert_eq!(producer.schema_id("orders"), None);

    let stored = broker.fetch("orders", 0, 0, 10).unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].record.value, order("o-1", 100).encode_payload());
    assert_eq!(stored[0].record.key.as_deref(), Some(&b"o-1"[..]));
    let header_keys: Vec<&str> = stored[0]
        .record
        .headers
        .iter()
        .map(|h| h.key.as_str())
        .collect();
    assert_eq!(header_keys, ["trace-id", "source"]);

    let stats = producer.stats();
    assert_eq!(stats.records, 2);
    assert_eq!(stats.framed, 0);
    producer.close().await.unwrap();
}

#[tokio::test]
async fn unreachable_registry_leaves_topics_unframed() {
    init_tracing();
    let broker = MemoryBroker::new();
    let registry = SchemaRegistryOptions::new("http://127.0.0.1:1")
        .with_request_timeout(Duration::from_millis(500));
    let producer: Producer<Order> = Producer::new(
        ProducerOptions::new(BROKERS).with_schema_registry(registry, ["orders"]),
        broker.writer(),
    )
    .await
    .unwrap();
    assert_eq!(producer.schema_id("orders"), None);

    producer
        .produce(&[Message::new("orders", order("o-1", 1))])
        .await
        .unwrap();
    let stored = broker.fetch("orders", 0, 0, 1).unwrap();
    assert_eq!(stored[0].record.value, order("o-1", 1).encode_payload());
}

/// Registry that already holds every subject at the required level.
struct PinnedRegistry {
    id: u32,
}

#[async_trait]
impl RegistryClient for PinnedRegistry {
    async fn compatibility_level(&self, _subject: &str) -> Result<CompatibilityLevel> {
        Ok(CompatibilityLevel::BackwardTransitive)
    }

    async fn set_compatibility_level(&self, subject: &str, _: CompatibilityLevel) -> Result<()> {
        panic!("compatibility of {subject} is already correct")
    }

    async fn latest_schema(&self, subject: &str) -> Result<RegisteredSchema> {
        Err(SchemaStreamError::Registry {
            status: 404,
            code: Some(40401),
            message: format!("Subject '{subject}' not found."),
        })
    }

    async fn is_compatible(&self, _: &str, _: u32, _: &str, _: SchemaType) -> Result<bool> {
        Ok(true)
    }

    async fn register_schema(&self, _: &str, _: &str, schema_type: SchemaType) -> Result<u32> {
        assert_eq!(schema_type, SchemaType::Protobuf);
        Ok(self.id)
    }
}

#[tokio::test]
async fn custom_registry_client_frames_bound_topics() {
    let broker = MemoryBroker::new();
    let producer: Producer<Order> = Producer::new(
        ProducerOptions::new(BROKERS)
            .with_registry_client(Arc::new(PinnedRegistry { id: 77 }), ["orders"]),
        broker.writer(),
    )
    .await
    .unwrap();
    assert_eq!(producer.schema_id("orders"), Some(77));
    assert_eq!(producer.schema_id("refunds"), None);

    producer
        .produce(&[
            Message::new("orders", order("o-1", 1)),
            Message::new("refunds", order("o-1", 1)),
        ])
        .await
        .unwrap();
    let framed = broker.fetch("orders", 0, 0, 1).unwrap().remove(0).record.value;
    assert_eq!(schema_id_of(&framed), Some(77));
    let plain = broker.fetch("refunds", 0, 0, 1).unwrap().remove(0).record.value;
    assert_eq!(plain, order("o-1", 1).encode_payload());
    assert_eq!(producer.stats().framed, 1);
}
