//! Producer: frame typed records and write them to topics.

use crate::broker::BrokerWriter;
use crate::codec::{descriptor_index_path, frame_record};
use crate::config::{broker_list, EnvSource};
use crate::error::{Result, SchemaStreamError};
use crate::registry::{RegistryClient, SchemaBindings, SchemaRegistry, SchemaRegistryOptions};
use crate::stats::{ProducerStats, ProducerStatsSnapshot};
use crate::transport::{Transport, TransportOptions};
use crate::types::{Message, Record, SchemaRecord};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 1;
pub const DEFAULT_BATCH_BYTES: usize = 1024 * 1024;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(10);
/// Upper bound on linger so a slow batch never holds writes indefinitely.
pub const MAX_BATCH_TIMEOUT: Duration = Duration::from_millis(200);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_WRITE_BACKOFF_MIN: Duration = Duration::from_millis(100);
pub const DEFAULT_WRITE_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Acknowledgment level requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequiredAcks {
    None,
    #[default]
    Leader,
    All,
}

impl RequiredAcks {
    pub fn as_property(&self) -> &'static str {
        match self {
            Self::None => "0",
            Self::Leader => "1",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_property(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

/// Partition selection for records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Partitioner {
    /// Hash of the key; random for records without one.
    #[default]
    ConsistentRandom,
    /// Java-client compatible key hashing.
    Murmur2Random,
    Random,
}

impl Partitioner {
    pub fn as_property(&self) -> &'static str {
        match self {
            Self::ConsistentRandom => "consistent_random",
            Self::Murmur2Random => "murmur2_random",
            Self::Random => "random",
        }
    }
}

#[derive(Clone)]
enum RegistrySource {
    Http(SchemaRegistryOptions),
    Client(Arc<dyn RegistryClient>),
}

/// Producer configuration snapshot.
#[derive(Clone)]
pub struct ProducerOptions {
    brokers: Vec<String>,
    transport: Option<Arc<Transport>>,
    required_acks: RequiredAcks,
    batch_size: usize,
    batch_bytes: usize,
    batch_timeout: Duration,
    compression: Compression,
    partitioner: Partitioner,
    max_attempts: u32,
    backoff_min: Duration,
    backoff_max: Duration,
    registry: Option<RegistrySource>,
    schema_topics: Vec<String>,
}

impl ProducerOptions {
    pub fn new<I, S>(brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            brokers: broker_list(brokers),
            transport: None,
            required_acks: RequiredAcks::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_bytes: DEFAULT_BATCH_BYTES,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            compression: Compression::default(),
            partitioner: Partitioner::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_min: DEFAULT_WRITE_BACKOFF_MIN,
            backoff_max: DEFAULT_WRITE_BACKOFF_MAX,
            registry: None,
            schema_topics: Vec::new(),
        }
    }

    /// Brokers, transport and registry from `SCHEMASTREAM_*` variables.
    /// Schema topics still have to be named with [`with_schema_registry`](Self::with_schema_registry)
    /// or [`with_schema_topics`](Self::with_schema_topics).
    pub fn from_env(env: &EnvSource<'_>) -> Result<Self> {
        let transport = Transport::new(TransportOptions::from_env(env)?)?;
        let mut opts = Self::new(env.list("BROKERS")).with_transport(transport);
        if let Some(registry) = SchemaRegistryOptions::from_env(env) {
            opts.registry = Some(RegistrySource::Http(registry));
        }
        Ok(opts)
    }

    pub fn with_transport(mut self, transport: Arc<Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_required_acks(mut self, acks: RequiredAcks) -> Self {
        self.required_acks = acks;
        self
    }

    /// Records per batch.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_batch_bytes(mut self, bytes: usize) -> Self {
        self.batch_bytes = bytes.max(1);
        self
    }

    /// Linger before a partial batch is sent. Clamped to [`MAX_BATCH_TIMEOUT`].
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        if timeout > MAX_BATCH_TIMEOUT {
            tracing::warn!(
                requested_ms = timeout.as_millis() as u64,
                max_ms = MAX_BATCH_TIMEOUT.as_millis() as u64,
                "batch timeout clamped"
            );
        }
        self.batch_timeout = timeout.min(MAX_BATCH_TIMEOUT);
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_partitioner(mut self, partitioner: Partitioner) -> Self {
        self.partitioner = partitioner;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_write_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min;
        self.backoff_max = max.max(min);
        self
    }

    /// Register the record type for `topics` with the registry at `options`.
    pub fn with_schema_registry<I, S>(mut self, options: SchemaRegistryOptions, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.registry = Some(RegistrySource::Http(options));
        self.with_schema_topics(topics)
    }

    /// Same as [`with_schema_registry`](Self::with_schema_registry) with a custom client.
    pub fn with_registry_client<I, S>(mut self, client: Arc<dyn RegistryClient>, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.registry = Some(RegistrySource::Client(client));
        self.with_schema_topics(topics)
    }

    pub fn with_schema_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schema_topics.extend(topics.into_iter().map(Into::into));
        self
    }

    pub fn brokers(&self) -> &[String] {
        &self.brokers
    }

    pub fn batch_timeout(&self) -> Duration {
        self.batch_timeout
    }

    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() {
            return Err(SchemaStreamError::Config(
                "producer needs at least one broker address".to_string(),
            ));
        }
        Ok(())
    }

    /// Client properties (librdkafka naming), transport settings included.
    pub fn client_properties(&self) -> BTreeMap<String, String> {
        let mut props = self
            .transport
            .as_ref()
            .map(|t| t.client_properties().clone())
            .unwrap_or_else(|| Transport::plaintext().client_properties().clone());
        let mut set = |key: &str, value: String| {
            props.insert(key.to_string(), value);
        };
        set("bootstrap.servers", self.brokers.join(","));
        set("acks", self.required_acks.as_property().to_string());
        set("batch.num.messages", self.batch_size.to_string());
        set("batch.size", self.batch_bytes.to_string());
        set("linger.ms", self.batch_timeout.as_millis().to_string());
        set("compression.type", self.compression.as_property().to_string());
        set("partitioner", self.partitioner.as_property().to_string());
        // librdkafka counts retries, not attempts.
        set(
            "message.send.max.retries",
            self.max_attempts.saturating_sub(1).to_string(),
        );
        set("retry.backoff.ms", self.backoff_min.as_millis().to_string());
        set("retry.backoff.max.ms", self.backoff_max.as_millis().to_string());
        props
    }
}

impl fmt::Debug for ProducerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerOptions")
            .field("brokers", &self.brokers)
            .field("transport", &self.transport)
            .field("required_acks", &self.required_acks)
            .field("batch_size", &self.batch_size)
            .field("batch_bytes", &self.batch_bytes)
            .field("batch_timeout", &self.batch_timeout)
            .field("compression", &self.compression)
            .field("max_attempts", &self.max_attempts)
            .field("schema_topics", &self.schema_topics)
            .finish()
    }
}

#[derive(Debug, Clone)]
struct Framing {
    schema_id: u32,
    index_path: Vec<u8>,
}

/// Typed producer. Topics with a confirmed schema id are written framed;
/// everything else goes out as the bare payload.
pub struct Producer<T: SchemaRecord> {
    writer: Box<dyn BrokerWriter>,
    framing: HashMap<String, Framing>,
    stats: ProducerStats,
    _record: PhantomData<fn(T)>,
}

impl<T: SchemaRecord> Producer<T> {
    /// Validate options, register schemas and wrap `writer`.
    ///
    /// Registration failures are logged and leave the affected topics
    /// unframed; they do not fail construction.
    pub async fn new(options: ProducerOptions, writer: impl BrokerWriter + 'static) -> Result<Self> {
        options.validate()?;
        let framing = match &options.registry {
            Some(source) if !options.schema_topics.is_empty() => {
                Self::register_schemas(source, &options.schema_topics).await?
            }
            _ => HashMap::new(),
        };
        tracing::info!(
            brokers = ?options.brokers,
            record = %T::descriptor().full_name,
            framed_topics = framing.len(),
            "producer created"
        );
        Ok(Self {
            writer: Box::new(writer),
            framing,
            stats: ProducerStats::default(),
            _record: PhantomData,
        })
    }

    /// Producer writing through librdkafka.
    #[cfg(feature = "kafka")]
    pub async fn connect(options: ProducerOptions) -> Result<Self> {
        options.validate()?;
        let writer = crate::broker::kafka::KafkaWriter::new(&options.client_properties())?;
        Self::new(options, writer).await
    }

    async fn register_schemas(
        source: &RegistrySource,
        topics: &[String],
    ) -> Result<HashMap<String, Framing>> {
        let mut registry = match source {
            RegistrySource::Http(opts) => SchemaRegistry::new(opts)?,
            RegistrySource::Client(client) => SchemaRegistry::with_client(Arc::clone(client)),
        };
        let bindings = topics
            .iter()
            .fold(SchemaBindings::new(), |b, topic| b.bind::<T>(topic.clone()));
        if let Err(e) = registry.register_all(&bindings).await {
            tracing::warn!(error = %e, "writing unframed to topics without a registered schema");
        }

        let index_path = descriptor_index_path(&T::descriptor());
        Ok(bindings
            .iter()
            .filter_map(|(topic, _)| {
                registry.lookup_id(topic).map(|schema_id| {
                    (
                        topic.to_string(),
                        Framing {
                            schema_id,
                            index_path: index_path.clone(),
                        },
                    )
                })
            })
            .collect())
    }

    /// Schema id `topic` is framed with, if registration succeeded.
    pub fn schema_id(&self, topic: &str) -> Option<u32> {
        self.framing.get(topic).map(|f| f.schema_id)
    }

    /// Encode, frame and write `messages` in one broker call. Empty input
    /// succeeds without touching the broker.
    pub async fn produce(&self, messages: &[Message<T>]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut records = Vec::with_capacity(messages.len());
        let mut bytes = 0;
        let mut framed = 0;
        for msg in messages {
            if msg.topic.is_empty() {
                return Err(SchemaStreamError::MissingTopic);
            }
            let payload = msg.value.encode_payload();
            let value = match self.framing.get(&msg.topic) {
                Some(f) => {
                    framed += 1;
                    frame_record(f.schema_id, &f.index_path, &payload)?
                }
                None => payload,
            };
            bytes += value.len();
            let mut record = Record::new(msg.topic.clone(), value).with_headers(msg.headers.clone());
            record.key = msg.key.clone();
            records.push(record);
        }

        let count = records.len();
        if let Err(e) = self.writer.write(records).await {
            self.stats.record_write_error();
            tracing::error!(records = count, error = %e, "write failed");
            return Err(match e {
                SchemaStreamError::Write(_) => e,
                other => SchemaStreamError::Write(other.to_string()),
            });
        }
        self.stats.record_write(count, bytes, framed);
        tracing::debug!(records = count, bytes, framed, "records written");
        Ok(())
    }

    pub fn stats(&self) -> ProducerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Flush and close the writer. Consumes the producer.
    pub async fn close(self) -> Result<()> {
        self.writer
            .close()
            .await
            .map_err(|e| SchemaStreamError::Close {
                what: "producer",
                reason: e.to_string(),
            })
    }
}
