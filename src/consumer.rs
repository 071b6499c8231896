//! Consumer loop: fetch, decode, handle, commit.
//!
//! Delivery is at-least-once. A message is committed only after its handler
//! succeeded (or after it was written to the dead-letter topic, when one is
//! configured); everything else is left for redelivery.

use crate::broker::{BrokerReader, BrokerWriter, StartOffset};
use crate::codec::{descriptor_index_path, strip_framing};
use crate::config::{broker_list, EnvSource};
use crate::error::{Result, SchemaStreamError};
use crate::stats::{ConsumerStats, ConsumerStatsSnapshot};
use crate::transport::{Transport, TransportOptions};
use crate::types::{BrokerHandle, Message, Record, RecordHeader, SchemaRecord, StoredRecord};
use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MIN_BYTES: usize = 1_000;
pub const DEFAULT_MAX_BYTES: usize = 10_000_000;
pub const DEFAULT_FETCH_MAX_WAIT: Duration = Duration::from_secs(10);
/// Zero commits synchronously after every handled message.
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::ZERO;
pub const DEFAULT_READ_BACKOFF_MIN: Duration = Duration::from_millis(100);
pub const DEFAULT_READ_BACKOFF_MAX: Duration = Duration::from_secs(1);
/// Attempt ceiling shared by fetch and handler retries.
pub const MAX_ATTEMPTS: usize = 5;
pub const HANDLER_RETRY_DELAY: Duration = Duration::from_millis(200);

pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";
pub const ORIGINAL_TOPIC_HEADER: &str = "x-original-topic";
pub const ORIGINAL_PARTITION_HEADER: &str = "x-original-partition";
pub const ORIGINAL_OFFSET_HEADER: &str = "x-original-offset";

/// Application callback invoked once per decoded message (more than once
/// when it fails and is retried).
///
/// `cancel` is the consumer's shutdown token. An attempt that has started is
/// always awaited to completion; handlers doing long work should watch the
/// token and return early. No further attempt starts once it has fired.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    async fn handle(&self, message: &Message<T>, cancel: &CancellationToken) -> anyhow::Result<()>;
}

/// Handler built from an async closure over the record value and the
/// shutdown token.
pub struct HandlerFn<F>(F);

pub fn handler_fn<T, F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(T, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    HandlerFn(f)
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for HandlerFn<F>
where
    T: SchemaRecord,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, message: &Message<T>, cancel: &CancellationToken) -> anyhow::Result<()> {
        (self.0)(message.value.clone(), cancel.clone()).await
    }
}

#[async_trait]
impl<T, H> MessageHandler<T> for Arc<H>
where
    T: SchemaRecord,
    H: MessageHandler<T> + ?Sized,
{
    async fn handle(&self, message: &Message<T>, cancel: &CancellationToken) -> anyhow::Result<()> {
        (**self).handle(message, cancel).await
    }
}

/// Why a message was not handled.
enum HandleFailure {
    /// Shutdown was requested before a successful attempt.
    Cancelled,
    /// Every attempt failed; carries the last error.
    Exhausted(anyhow::Error),
}

/// Handled-but-uncommitted positions when commits are batched.
struct PendingCommits {
    latest: BTreeMap<(String, i32), BrokerHandle>,
    last_flush: Instant,
}

#[derive(Clone)]
struct DeadLetter {
    writer: Arc<dyn BrokerWriter>,
    topic: String,
}

/// Consumer configuration snapshot.
#[derive(Clone)]
pub struct ConsumerOptions {
    brokers: Vec<String>,
    group_id: String,
    topic: String,
    transport: Option<Arc<Transport>>,
    start_offset: StartOffset,
    min_bytes: usize,
    max_bytes: usize,
    fetch_max_wait: Duration,
    commit_interval: Duration,
    read_backoff_min: Duration,
    read_backoff_max: Duration,
    fetch_attempts: usize,
    handler_attempts: usize,
    handler_retry_delay: Duration,
    dead_letter: Option<DeadLetter>,
}

impl ConsumerOptions {
    pub fn new<I, S>(brokers: I, group_id: impl Into<String>, topic: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            brokers: broker_list(brokers),
            group_id: group_id.into(),
            topic: topic.into(),
            transport: None,
            start_offset: StartOffset::default(),
            min_bytes: DEFAULT_MIN_BYTES,
            max_bytes: DEFAULT_MAX_BYTES,
            fetch_max_wait: DEFAULT_FETCH_MAX_WAIT,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            read_backoff_min: DEFAULT_READ_BACKOFF_MIN,
            read_backoff_max: DEFAULT_READ_BACKOFF_MAX,
            fetch_attempts: MAX_ATTEMPTS,
            handler_attempts: MAX_ATTEMPTS,
            handler_retry_delay: HANDLER_RETRY_DELAY,
            dead_letter: None,
        }
    }

    /// Brokers, group, topic, start offset and transport from `SCHEMASTREAM_*`
    /// variables.
    pub fn from_env(env: &EnvSource<'_>) -> Result<Self> {
        let transport = Transport::new(TransportOptions::from_env(env)?)?;
        Ok(Self::new(
            env.list("BROKERS"),
            env.get("GROUP_ID").unwrap_or_default(),
            env.get("TOPIC").unwrap_or_default(),
        )
        .with_read_earliest(env.flag("READ_EARLIEST"))
        .with_transport(transport))
    }

    pub fn with_transport(mut self, transport: Arc<Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_read_earliest(mut self, read_earliest: bool) -> Self {
        self.start_offset = StartOffset::from_read_earliest(read_earliest);
        self
    }

    pub fn with_start_offset(mut self, start: StartOffset) -> Self {
        self.start_offset = start;
        self
    }

    pub fn with_min_bytes(mut self, bytes: usize) -> Self {
        self.min_bytes = bytes;
        self
    }

    /// Largest fetch the consumer accepts; must fit the biggest message.
    pub fn with_max_bytes(mut self, bytes: usize) -> Self {
        self.max_bytes = bytes;
        self
    }

    pub fn with_fetch_max_wait(mut self, wait: Duration) -> Self {
        self.fetch_max_wait = wait;
        self
    }

    /// Zero commits after every message. A non-zero interval keeps the latest
    /// handled offset per partition and commits it once the interval has
    /// passed, and again when the consumer stops.
    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    pub fn with_read_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.read_backoff_min = min;
        self.read_backoff_max = max.max(min);
        self
    }

    pub fn with_fetch_attempts(mut self, attempts: usize) -> Self {
        self.fetch_attempts = attempts.max(1);
        self
    }

    pub fn with_handler_attempts(mut self, attempts: usize) -> Self {
        self.handler_attempts = attempts.max(1);
        self
    }

    pub fn with_handler_retry_delay(mut self, delay: Duration) -> Self {
        self.handler_retry_delay = delay;
        self
    }

    /// Route undecodable messages and messages whose handler gave up to
    /// `topic`, then commit them.
    pub fn with_dead_letter(mut self, writer: impl BrokerWriter + 'static, topic: impl Into<String>) -> Self {
        self.dead_letter = Some(DeadLetter {
            writer: Arc::new(writer),
            topic: topic.into(),
        });
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn start_offset(&self) -> StartOffset {
        self.start_offset
    }

    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() {
            return Err(SchemaStreamError::Config(
                "consumer needs at least one broker address".to_string(),
            ));
        }
        if self.group_id.is_empty() {
            return Err(SchemaStreamError::Config("consumer group id is empty".to_string()));
        }
        if self.topic.is_empty() {
            return Err(SchemaStreamError::MissingTopic);
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
        set("group.id", self.group_id.clone());
        set("enable.auto.commit", "false".to_string());
        set("auto.offset.reset", self.start_offset.as_reset_policy().to_string());
        set("fetch.min.bytes", self.min_bytes.to_string());
        set("fetch.max.bytes", self.max_bytes.to_string());
        set("fetch.wait.max.ms", self.fetch_max_wait.as_millis().to_string());
        set("reconnect.backoff.ms", self.read_backoff_min.as_millis().to_string());
        set("reconnect.backoff.max.ms", self.read_backoff_max.as_millis().to_string());
        props
    }
}

impl fmt::Debug for ConsumerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerOptions")
            .field("brokers", &self.brokers)
            .field("group_id", &self.group_id)
            .field("topic", &self.topic)
            .field("transport", &self.transport)
            .field("start_offset", &self.start_offset)
            .field("fetch_max_wait", &self.fetch_max_wait)
            .field("fetch_attempts", &self.fetch_attempts)
            .field("handler_attempts", &self.handler_attempts)
            .field("dead_letter_topic", &self.dead_letter.as_ref().map(|d| &d.topic))
            .finish()
    }
}

/// Decode a fetched value into `T`, skipping registry framing if present.
pub fn decode_value<T: SchemaRecord>(raw: &[u8], index_len: usize) -> Result<T> {
    if raw.is_empty() {
        return Err(SchemaStreamError::EmptyValue);
    }
    T::decode_payload(strip_framing(raw, index_len)?)
}

/// Typed consumer for one topic and group.
pub struct Consumer<T: SchemaRecord> {
    reader: Box<dyn BrokerReader>,
    handler: Box<dyn MessageHandler<T>>,
    options: ConsumerOptions,
    index_len: usize,
    stats: ConsumerStats,
    pending: Mutex<PendingCommits>,
}

impl<T: SchemaRecord> Consumer<T> {
    pub fn new(
        options: ConsumerOptions,
        reader: impl BrokerReader + 'static,
        handler: impl MessageHandler<T> + 'static,
    ) -> Result<Self> {
        options.validate()?;
        let index_len = descriptor_index_path(&T::descriptor()).len();
        tracing::info!(
            brokers = ?options.brokers,
            group_id = %options.group_id,
            topic = %options.topic,
            fetch_max_wait_ms = options.fetch_max_wait.as_millis() as u64,
            "consumer created"
        );
        Ok(Self {
            reader: Box::new(reader),
            handler: Box::new(handler),
            options,
            index_len,
            stats: ConsumerStats::default(),
            pending: Mutex::new(PendingCommits {
                latest: BTreeMap::new(),
                last_flush: Instant::now(),
            }),
        })
    }

    /// Consumer reading through librdkafka.
    #[cfg(feature = "kafka")]
    pub fn connect(options: ConsumerOptions, handler: impl MessageHandler<T> + 'static) -> Result<Self> {
        options.validate()?;
        let reader = crate::broker::kafka::KafkaReader::new(&options.client_properties(), &options.topic)?;
        Self::new(options, reader, handler)
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run until `token` is cancelled. Cancellation is a clean exit, not an
    /// error; no other failure stops the loop.
    pub async fn consume(&self, token: CancellationToken) -> Result<()> {
        self.pending.lock().last_flush = Instant::now();
        loop {
            if token.is_cancelled() {
                break;
            }

            let stored = match self.fetch(&token).await {
                Ok(Some(stored)) => stored,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(topic = %self.options.topic, error = %e, "failed to fetch message");
                    // Keep a dead broker from turning the loop into a busy spin.
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(self.options.read_backoff_min) => {}
                    }
                    continue;
                }
            };

            let value = match decode_value::<T>(&stored.record.value, self.index_len) {
                Ok(value) => value,
                Err(e) => {
                    self.stats.record_decode_error();
                    tracing::error!(
                        topic = %stored.topic,
                        partition = stored.partition,
                        offset = stored.offset,
                        error = %e,
                        "failed to decode message"
                    );
                    if self.dead_letter(&stored, &e.to_string()).await.is_break() {
                        break;
                    }
                    continue;
                }
            };

            let message = Message::inbound(&stored, value);
            match self.handle(&message, &token).await {
                Ok(()) => {}
                Err(HandleFailure::Cancelled) => {
                    tracing::info!(
                        topic = %stored.topic,
                        partition = stored.partition,
                        offset = stored.offset,
                        "stopped before the handler succeeded, message left uncommitted"
                    );
                    break;
                }
                Err(HandleFailure::Exhausted(e)) => {
                    tracing::error!(
                        topic = %stored.topic,
                        partition = stored.partition,
                        offset = stored.offset,
                        error = ?e,
                        "failed to handle message"
                    );
                    if self.dead_letter(&stored, &format!("{e:#}")).await.is_break() {
                        break;
                    }
                    continue;
                }
            }

            if self.commit(&stored.handle()).await.is_break() {
                break;
            }
        }

        let _ = self.flush_commits().await;
        tracing::info!(topic = %self.options.topic, "consumer stopped");
        Ok(())
    }

    /// `Ok(None)` when the fetch was cancelled.
    async fn fetch(&self, token: &CancellationToken) -> Result<Option<StoredRecord>> {
        let reader = self.reader.as_ref();
        let stats = &self.stats;
        let attempts = (move || async move {
            let result = reader.fetch().await;
            if let Err(e) = &result {
                if !e.is_cancelled() {
                    stats.record_fetch(false);
                }
            }
            result
        })
        .retry(
            ConstantBuilder::default()
                .with_delay(Duration::ZERO)
                .with_max_times(self.options.fetch_attempts.saturating_sub(1)),
        )
        .when(|e: &SchemaStreamError| !e.is_cancelled())
        .notify(|e: &SchemaStreamError, _| {
            tracing::warn!(topic = %self.options.topic, error = %e, "fetch failed, retrying");
        });

        tokio::select! {
            _ = token.cancelled() => Ok(None),
            result = attempts => match result {
                Ok(stored) => {
                    self.stats.record_fetch(true);
                    Ok(Some(stored))
                }
                Err(e) if e.is_cancelled() => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    /// Run handler attempts up to the ceiling with a fixed delay between
    /// them. A running attempt is never interrupted; cancellation is only
    /// observed before an attempt and during the delay.
    async fn handle(
        &self,
        message: &Message<T>,
        token: &CancellationToken,
    ) -> std::result::Result<(), HandleFailure> {
        let mut attempt = 1;
        loop {
            if token.is_cancelled() {
                return Err(HandleFailure::Cancelled);
            }
            let err = match self.handler.handle(message, token).await {
                Ok(()) => {
                    self.stats.record_handle(true);
                    return Ok(());
                }
                Err(e) => {
                    self.stats.record_handle(false);
                    e
                }
            };
            if attempt >= self.options.handler_attempts {
                return Err(HandleFailure::Exhausted(err));
            }

            tracing::warn!(
                topic = %message.topic,
                attempt,
                error = ?err,
                retry_in_ms = self.options.handler_retry_delay.as_millis() as u64,
                "handler failed, retrying"
            );
            tokio::select! {
                _ = token.cancelled() => return Err(HandleFailure::Cancelled),
                _ = tokio::time::sleep(self.options.handler_retry_delay) => {}
            }
            attempt += 1;
        }
    }

    /// Commit now, or queue the position when commits are batched.
    async fn commit(&self, handle: &BrokerHandle) -> ControlFlow<()> {
        let interval = self.options.commit_interval;
        if interval.is_zero() {
            return self.commit_now(handle).await;
        }
        let due = {
            let mut pending = self.pending.lock();
            pending
                .latest
                .insert((handle.topic().to_string(), handle.partition()), handle.clone());
            pending.last_flush.elapsed() >= interval
        };
        if due {
            self.flush_commits().await
        } else {
            ControlFlow::Continue(())
        }
    }

    /// Commit the latest queued position of every partition.
    async fn flush_commits(&self) -> ControlFlow<()> {
        let latest = {
            let mut pending = self.pending.lock();
            pending.last_flush = Instant::now();
            std::mem::take(&mut pending.latest)
        };
        for handle in latest.into_values() {
            if self.commit_now(&handle).await.is_break() {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Break when the broker reported cancellation.
    async fn commit_now(&self, handle: &BrokerHandle) -> ControlFlow<()> {
        match self.reader.commit(handle).await {
            Ok(()) => {
                self.stats.record_commit(true);
                tracing::debug!(
                    topic = handle.topic(),
                    partition = handle.partition(),
                    offset = handle.offset(),
                    "message committed"
                );
                ControlFlow::Continue(())
            }
            Err(e) if e.is_cancelled() => ControlFlow::Break(()),
            Err(e) => {
                self.stats.record_commit(false);
                tracing::error!(
                    topic = handle.topic(),
                    partition = handle.partition(),
                    offset = handle.offset(),
                    error = %e,
                    "failed to commit message"
                );
                ControlFlow::Continue(())
            }
        }
    }

    /// Write the raw record to the dead-letter topic and commit it. Without a
    /// dead-letter topic the message is left uncommitted.
    async fn dead_letter(&self, stored: &StoredRecord, reason: &str) -> ControlFlow<()> {
        let Some(dlq) = &self.options.dead_letter else {
            return ControlFlow::Continue(());
        };

        let mut headers = stored.record.headers.clone();
        headers.push(RecordHeader::new(DEAD_LETTER_REASON_HEADER, reason));
        headers.push(RecordHeader::new(ORIGINAL_TOPIC_HEADER, stored.topic.as_str()));
        headers.push(RecordHeader::new(
            ORIGINAL_PARTITION_HEADER,
            stored.partition.to_string(),
        ));
        headers.push(RecordHeader::new(ORIGINAL_OFFSET_HEADER, stored.offset.to_string()));
        let mut record = Record::new(dlq.topic.clone(), stored.record.value.clone()).with_headers(headers);
        record.key = stored.record.key.clone();

        match dlq.writer.write(vec![record]).await {
            Ok(()) => {
                self.stats.record_dead_letter();
                tracing::warn!(
                    topic = %stored.topic,
                    partition = stored.partition,
                    offset = stored.offset,
                    dead_letter_topic = %dlq.topic,
                    "message dead-lettered"
                );
                self.commit(&stored.handle()).await
            }
            Err(e) => {
                tracing::error!(
                    topic = %stored.topic,
                    offset = stored.offset,
                    dead_letter_topic = %dlq.topic,
                    error = %e,
                    "dead-letter write failed, message left uncommitted"
                );
                ControlFlow::Continue(())
            }
        }
    }

    /// Close the reader. Consumes the consumer.
    pub async fn close(self) -> Result<()> {
        self.reader
            .close()
            .await
            .map_err(|e| SchemaStreamError::Close {
                what: "consumer",
                reason: e.to_string(),
            })
    }
}
