#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use schemastream::error::{Result, SchemaStreamError};
use schemastream::{
    BrokerHandle, BrokerReader, MemoryReader, RecordDescriptor, SchemaRecord, StoredRecord,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const SHOP_PROTO: &str = r#"syntax = "proto3";
package shop;

message Order {
  string id = 1;
  int64 amount_cents = 2;

  message Line {
    string sku = 1;
    uint32 quantity = 2;
  }
}
"#;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Order {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(int64, tag = "2")]
    pub amount_cents: i64,
}

impl SchemaRecord for Order {
    fn descriptor() -> RecordDescriptor {
        RecordDescriptor::top_level("shop.Order", SHOP_PROTO, 0)
    }
}

/// Nested under `Order`, so its index path is longer than one byte.
#[derive(Clone, PartialEq, prost::Message)]
pub struct OrderLine {
    #[prost(string, tag = "1")]
    pub sku: String,
    #[prost(uint32, tag = "2")]
    pub quantity: u32,
}

impl SchemaRecord for OrderLine {
    fn descriptor() -> RecordDescriptor {
        RecordDescriptor::nested("shop.Order.Line", SHOP_PROTO, vec![0], 0)
    }
}

pub fn order(id: &str, amount_cents: i64) -> Order {
    Order {
        id: id.to_string(),
        amount_cents,
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("schemastream=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/// Reader wrapper that counts calls and injects failures.
pub struct InstrumentedReader {
    inner: MemoryReader,
    pub counters: Arc<ReaderCounters>,
}

#[derive(Default)]
pub struct ReaderCounters {
    pub fetches: AtomicUsize,
    pub fetch_failures_left: AtomicUsize,
    pub commit_failures_left: AtomicUsize,
    pub commits: Mutex<Vec<(i32, i64)>>,
    pub fetch_times: Mutex<Vec<tokio::time::Instant>>,
}

impl ReaderCounters {
    pub fn committed(&self) -> Vec<(i32, i64)> {
        self.commits.lock().clone()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.lock().len()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl InstrumentedReader {
    pub fn new(inner: MemoryReader) -> Self {
        Self {
            inner,
            counters: Arc::new(ReaderCounters::default()),
        }
    }

    pub fn failing_fetches(self, n: usize) -> Self {
        self.counters.fetch_failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn failing_commits(self, n: usize) -> Self {
        self.counters.commit_failures_left.store(n, Ordering::SeqCst);
        self
    }
}

#[async_trait]
impl BrokerReader for InstrumentedReader {
    async fn fetch(&self) -> Result<StoredRecord> {
        self.counters.fetches.fetch_add(1, Ordering::SeqCst);
        self.counters.fetch_times.lock().push(tokio::time::Instant::now());
        if take_one(&self.counters.fetch_failures_left) {
            return Err(SchemaStreamError::Fetch("broker unavailable".to_string()));
        }
        self.inner.fetch().await
    }

    async fn commit(&self, handle: &BrokerHandle) -> Result<()> {
        if take_one(&self.counters.commit_failures_left) {
            return Err(SchemaStreamError::Commit("coordinator moved".to_string()));
        }
        self.inner.commit(handle).await?;
        self.counters
            .commits
            .lock()
            .push((handle.partition(), handle.offset()));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[derive(Default)]
struct RegistryState {
    /// subject -> (schema id, schema text) per version
    subjects: HashMap<String, Vec<(u32, String)>>,
    ids: HashMap<String, u32>,
    compatibility: HashMap<String, String>,
    rejected: Vec<String>,
}

type Shared = Arc<Mutex<RegistryState>>;

/// In-process Confluent-style schema registry.
pub struct RegistryFixture {
    pub base_url: String,
    state: Shared,
    server: JoinHandle<()>,
}

impl RegistryFixture {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state: Shared = Arc::default();

        let app = Router::new()
            .route(
                "/config/:subject",
                get(get_subject_config).put(set_subject_config),
            )
            .route("/subjects/:subject/versions", post(register_schema))
            .route("/subjects/:subject/versions/latest", get(latest_version))
            .route(
                "/compatibility/subjects/:subject/versions/:version",
                post(check_compatibility),
            )
            .with_state(state.clone());

        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
            server,
        }
    }

    /// Make the compatibility check fail for this exact schema text.
    pub fn reject(&self, schema: &str) {
        self.state.lock().rejected.push(schema.to_string());
    }

    pub fn compatibility(&self, subject: &str) -> Option<String> {
        self.state.lock().compatibility.get(subject).cloned()
    }

    pub fn versions(&self, subject: &str) -> usize {
        self.state
            .lock()
            .subjects
            .get(subject)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Drop for RegistryFixture {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn not_found(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error_code": 40401, "message": message })),
    )
}

#[derive(Deserialize)]
struct CompatibilityRequest {
    compatibility: String,
}

#[derive(Deserialize)]
struct SchemaRequest {
    schema: String,
    #[serde(rename = "schemaType")]
    schema_type: Option<String>,
}

async fn get_subject_config(
    Path(subject): Path<String>,
    State(state): State<Shared>,
) -> (StatusCode, Json<Value>) {
    match state.lock().compatibility.get(&subject) {
        Some(level) => (StatusCode::OK, Json(json!({ "compatibilityLevel": level }))),
        None => not_found("Subject not found"),
    }
}

async fn set_subject_config(
    Path(subject): Path<String>,
    State(state): State<Shared>,
    Json(req): Json<CompatibilityRequest>,
) -> Json<Value> {
    state
        .lock()
        .compatibility
        .insert(subject, req.compatibility.clone());
    Json(json!({ "compatibility": req.compatibility }))
}

async fn register_schema(
    Path(subject): Path<String>,
    State(state): State<Shared>,
    Json(req): Json<SchemaRequest>,
) -> (StatusCode, Json<Value>) {
    if req.schema_type.as_deref() != Some("PROTOBUF") {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error_code": 42201, "message": "Invalid schema type" })),
        );
    }
    let mut guard = state.lock();
    let next = guard.ids.len() as u32 + 1;
    let id = *guard.ids.entry(req.schema.clone()).or_insert(next);
    let versions = guard.subjects.entry(subject).or_default();
    if !versions.iter().any(|(_, s)| *s == req.schema) {
        versions.push((id, req.schema));
    }
    (StatusCode::OK, Json(json!({ "id": id })))
}

async fn latest_version(
    Path(subject): Path<String>,
    State(state): State<Shared>,
) -> (StatusCode, Json<Value>) {
    let guard = state.lock();
    let Some((version, (id, schema))) = guard
        .subjects
        .get(&subject)
        .and_then(|v| v.last().map(|last| (v.len(), last)))
    else {
        return not_found("Subject not found");
    };
    (
        StatusCode::OK,
        Json(json!({
            "subject": subject,
            "version": version,
            "id": id,
            "schema": schema,
            "schemaType": "PROTOBUF",
        })),
    )
}

async fn check_compatibility(
    Path((_subject, _version)): Path<(String, u32)>,
    State(state): State<Shared>,
    Json(req): Json<SchemaRequest>,
) -> Json<Value> {
    let compatible = !state.lock().rejected.iter().any(|s| *s == req.schema);
    Json(json!({ "is_compatible": compatible }))
}
