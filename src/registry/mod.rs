//! Registry adapter: publishes each topic's record schema and caches the
//! schema id the producer frames with.

mod client;

pub use client::{
    CompatibilityLevel, HttpRegistryClient, RegisteredSchema, RegistryClient, SchemaType,
};

use crate::config::EnvSource;
use crate::error::{Result, SchemaStreamError};
use crate::types::{RecordDescriptor, SchemaRecord};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Level every subject is moved to before a new version is registered.
pub const REQUIRED_COMPATIBILITY: CompatibilityLevel = CompatibilityLevel::BackwardTransitive;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Registry subject holding a topic's value schemas.
pub fn subject_name(topic: &str) -> String {
    format!("{topic}-value")
}

#[derive(Clone)]
pub struct SchemaRegistryOptions {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout: Duration,
}

impl SchemaRegistryOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// `None` when `SCHEMASTREAM_REGISTRY_URL` is unset.
    pub fn from_env(env: &EnvSource<'_>) -> Option<Self> {
        let mut opts = Self::new(env.get("REGISTRY_URL")?);
        if let (Some(user), Some(pass)) = (env.get("REGISTRY_USERNAME"), env.get("REGISTRY_PASSWORD")) {
            opts = opts.with_basic_auth(user, pass);
        }
        Some(opts)
    }
}

impl std::fmt::Debug for SchemaRegistryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistryOptions")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Topic to record-type bindings a producer publishes.
#[derive(Debug, Clone, Default)]
pub struct SchemaBindings {
    bindings: BTreeMap<String, RecordDescriptor>,
}

impl SchemaBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind<T: SchemaRecord>(mut self, topic: impl Into<String>) -> Self {
        self.insert(topic, T::descriptor());
        self
    }

    pub fn insert(&mut self, topic: impl Into<String>, descriptor: RecordDescriptor) {
        self.bindings.insert(topic.into(), descriptor);
    }

    pub fn get(&self, topic: &str) -> Option<&RecordDescriptor> {
        self.bindings.get(topic)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RecordDescriptor)> {
        self.bindings.iter().map(|(t, d)| (t.as_str(), d))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Schema id cache in front of a [`RegistryClient`].
///
/// Populated by [`register_all`](Self::register_all) during producer setup and
/// only read afterwards.
pub struct SchemaRegistry {
    client: Arc<dyn RegistryClient>,
    ids: HashMap<String, u32>,
}

impl SchemaRegistry {
    pub fn new(options: &SchemaRegistryOptions) -> Result<Self> {
        let mut client = HttpRegistryClient::new(options.url.clone(), options.request_timeout)?;
        if let (Some(user), Some(pass)) = (&options.username, &options.password) {
            client = client.with_basic_auth(user.clone(), pass.clone());
        }
        Ok(Self::with_client(Arc::new(client)))
    }

    pub fn with_client(client: Arc<dyn RegistryClient>) -> Self {
        Self {
            client,
            ids: HashMap::new(),
        }
    }

    /// Register every binding, in topic order. A failing topic is logged and
    /// skipped; the others still get their ids. Returns
    /// [`SchemaStreamError::Registration`] naming the failed topics.
    pub async fn register_all(&mut self, bindings: &SchemaBindings) -> Result<()> {
        let mut failed = Vec::new();
        for (topic, descriptor) in bindings.iter() {
            match self.register_topic(topic, descriptor).await {
                Ok(id) => {
                    tracing::info!(topic, schema_id = id, record = %descriptor.full_name, "schema registered");
                    self.ids.insert(topic.to_string(), id);
                }
                Err(e) => {
                    tracing::error!(topic, record = %descriptor.full_name, error = %e, "schema registration failed");
                    failed.push(topic.to_string());
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(SchemaStreamError::Registration { topics: failed })
        }
    }

    async fn register_topic(&self, topic: &str, descriptor: &RecordDescriptor) -> Result<u32> {
        let subject = subject_name(topic);

        let current = match self.client.compatibility_level(&subject).await {
            Ok(level) => Some(level),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        if current != Some(REQUIRED_COMPATIBILITY) {
            self.client
                .set_compatibility_level(&subject, REQUIRED_COMPATIBILITY)
                .await?;
        }

        match self.client.latest_schema(&subject).await {
            Ok(latest) => {
                let compatible = self
                    .client
                    .is_compatible(&subject, latest.version, &descriptor.schema, SchemaType::Protobuf)
                    .await?;
                if !compatible {
                    return Err(SchemaStreamError::IncompatibleSchema {
                        subject,
                        version: latest.version,
                    });
                }
            }
            // First version of a new subject.
            Err(e) if e.is_not_found() => {
                tracing::debug!(subject = %subject, "subject has no versions yet");
            }
            Err(e) => return Err(e),
        }

        self.client
            .register_schema(&subject, &descriptor.schema, SchemaType::Protobuf)
            .await
    }

    /// Cached schema id for `topic`. `None` means the producer writes unframed.
    pub fn lookup_id(&self, topic: &str) -> Option<u32> {
        self.ids.get(topic).copied()
    }

    pub fn client(&self) -> &Arc<dyn RegistryClient> {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::REGISTRY_SUBJECT_NOT_FOUND;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Subject -> registered schema texts (version = position + 1).
    #[derive(Default)]
    struct FakeRegistry {
        levels: Mutex<HashMap<String, CompatibilityLevel>>,
        subjects: Mutex<HashMap<String, Vec<String>>>,
        ids: Mutex<HashMap<String, u32>>,
        level_writes: Mutex<Vec<String>>,
        /// Schemas rejected by the compatibility check.
        incompatible: Mutex<Vec<String>>,
    }

    fn not_found(what: &str) -> SchemaStreamError {
        SchemaStreamError::Registry {
            status: 404,
            code: Some(REGISTRY_SUBJECT_NOT_FOUND),
            message: format!("{what} not found"),
        }
    }

    #[async_trait]
    impl RegistryClient for FakeRegistry {
        async fn compatibility_level(&self, subject: &str) -> Result<CompatibilityLevel> {
            self.levels
                .lock()
                .get(subject)
                .copied()
                .ok_or_else(|| not_found(subject))
        }

        async fn set_compatibility_level(&self, subject: &str, level: CompatibilityLevel) -> Result<()> {
            self.level_writes.lock().push(subject.to_string());
            self.levels.lock().insert(subject.to_string(), level);
            Ok(())
        }

        async fn latest_schema(&self, subject: &str) -> Result<RegisteredSchema> {
            let subjects = self.subjects.lock();
            let versions = subjects.get(subject).ok_or_else(|| not_found(subject))?;
            let schema = versions.last().cloned().ok_or_else(|| not_found(subject))?;
            let id = self.ids.lock().get(&schema).copied().unwrap_or_default();
            Ok(RegisteredSchema {
                subject: subject.to_string(),
                version: versions.len() as u32,
                id,
                schema,
                schema_type: SchemaType::Protobuf,
            })
        }

        async fn is_compatible(&self, _: &str, _: u32, schema: &str, _: SchemaType) -> Result<bool> {
            Ok(!self.incompatible.lock().iter().any(|s| s == schema))
        }

        async fn register_schema(&self, subject: &str, schema: &str, _: SchemaType) -> Result<u32> {
            let mut ids = self.ids.lock();
            let next = ids.len() as u32 + 1;
            let id = *ids.entry(schema.to_string()).or_insert(next);
            let mut subjects = self.subjects.lock();
            let versions = subjects.entry(subject.to_string()).or_default();
            if !versions.iter().any(|s| s == schema) {
                versions.push(schema.to_string());
            }
            Ok(id)
        }
    }

    fn bindings() -> SchemaBindings {
        let mut b = SchemaBindings::new();
        b.insert("orders", RecordDescriptor::top_level("shop.Order", "message Order {}", 0));
        b.insert("payments", RecordDescriptor::top_level("shop.Payment", "message Payment {}", 0));
        b
    }

    #[tokio::test]
    async fn registering_twice_keeps_the_same_id() {
        let fake = Arc::new(FakeRegistry::default());
        let mut registry = SchemaRegistry::with_client(fake.clone());

        registry.register_all(&bindings()).await.unwrap();
        let first = registry.lookup_id("orders").unwrap();
        registry.register_all(&bindings()).await.unwrap();

        assert_eq!(registry.lookup_id("orders"), Some(first));
        assert_ne!(registry.lookup_id("payments"), Some(first));
        // Compatibility is only set once per subject.
        assert_eq!(fake.level_writes.lock().len(), 2);
        assert_eq!(
            fake.levels.lock().get("orders-value"),
            Some(&CompatibilityLevel::BackwardTransitive)
        );
    }

    #[tokio::test]
    async fn incompatible_schema_only_fails_its_topic() {
        let fake = Arc::new(FakeRegistry::default());
        let mut registry = SchemaRegistry::with_client(fake.clone());
        registry.register_all(&bindings()).await.unwrap();

        fake.incompatible.lock().push("message Order { int32 breaking = 1; }".to_string());
        let mut changed = bindings();
        changed.insert(
            "orders",
            RecordDescriptor::top_level("shop.Order", "message Order { int32 breaking = 1; }", 0),
        );
        changed.insert("refunds", RecordDescriptor::top_level("shop.Refund", "message Refund {}", 0));

        let mut fresh = SchemaRegistry::with_client(fake);
        let err = fresh.register_all(&changed).await.unwrap_err();
        match err {
            SchemaStreamError::Registration { topics } => assert_eq!(topics, ["orders"]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fresh.lookup_id("orders"), None);
        assert!(fresh.lookup_id("payments").is_some());
        assert!(fresh.lookup_id("refunds").is_some());
    }

    #[tokio::test]
    async fn lookup_of_unknown_topic_is_none() {
        let registry = SchemaRegistry::with_client(Arc::new(FakeRegistry::default()));
        assert_eq!(registry.lookup_id("never-registered"), None);
    }

    #[test]
    fn options_from_env() {
        let vars: HashMap<String, String> = [
            ("SCHEMASTREAM_REGISTRY_URL", "http://registry:8081"),
            ("SCHEMASTREAM_REGISTRY_USERNAME", "svc"),
            ("SCHEMASTREAM_REGISTRY_PASSWORD", "hunter2"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let opts = SchemaRegistryOptions::from_env(&EnvSource::from_map(&vars)).unwrap();
        assert_eq!(opts.url, "http://registry:8081");
        assert_eq!(opts.username.as_deref(), Some("svc"));
        assert!(!format!("{opts:?}").contains("hunter2"));

        let empty = HashMap::new();
        assert!(SchemaRegistryOptions::from_env(&EnvSource::from_map(&empty)).is_none());
    }

    #[test]
    fn bind_uses_record_descriptor() {
        assert_eq!(subject_name("orders"), "orders-value");
        let b = bindings();
        assert_eq!(b.len(), 2);
        let topics: Vec<&str> = b.iter().map(|(t, _)| t).collect();
        assert_eq!(topics, ["orders", "payments"]);
    }
}
