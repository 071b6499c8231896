//! Schema registry REST client (Confluent-compatible API).

use crate::error::{Result, SchemaStreamError};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REGISTRY_MEDIA_TYPE: &str = "application/vnd.schemaregistry.v1+json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompatibilityLevel {
    None,
    Backward,
    BackwardTransitive,
    Forward,
    ForwardTransitive,
    Full,
    FullTransitive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemaType {
    /// The registry omits `schemaType` for Avro schemas.
    #[default]
    Avro,
    Protobuf,
    Json,
}

/// One registered version of a subject.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegisteredSchema {
    pub subject: String,
    pub version: u32,
    pub id: u32,
    pub schema: String,
    #[serde(rename = "schemaType", default)]
    pub schema_type: SchemaType,
}

/// Operations the registry adapter needs from a schema registry.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Effective compatibility level of a subject (falling back to the global one).
    async fn compatibility_level(&self, subject: &str) -> Result<CompatibilityLevel>;

    async fn set_compatibility_level(&self, subject: &str, level: CompatibilityLevel)
        -> Result<()>;

    async fn latest_schema(&self, subject: &str) -> Result<RegisteredSchema>;

    async fn is_compatible(
        &self,
        subject: &str,
        version: u32,
        schema: &str,
        schema_type: SchemaType,
    ) -> Result<bool>;

    /// Register a schema version, returning its id. Registering an existing
    /// schema returns the existing id.
    async fn register_schema(&self, subject: &str, schema: &str, schema_type: SchemaType)
        -> Result<u32>;
}

#[derive(Serialize)]
struct SchemaRequest<'a> {
    schema: &'a str,
    #[serde(rename = "schemaType")]
    schema_type: SchemaType,
}

#[derive(Serialize)]
struct CompatibilityRequest {
    compatibility: CompatibilityLevel,
}

#[derive(Deserialize)]
struct CompatibilityLevelResponse {
    #[serde(rename = "compatibilityLevel", alias = "compatibility")]
    compatibility_level: CompatibilityLevel,
}

#[derive(Deserialize)]
struct CompatibilityCheckResponse {
    is_compatible: bool,
}

#[derive(Deserialize)]
struct RegisterResponse {
    id: u32,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error_code: u32,
    message: String,
}

/// reqwest-backed [`RegistryClient`].
#[derive(Clone)]
pub struct HttpRegistryClient {
    base_url: String,
    http: reqwest::Client,
    credentials: Option<(String, String)>,
}

impl HttpRegistryClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(SchemaStreamError::Config(
                "schema registry URL must not be empty".to_string(),
            ));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url,
            http,
            credentials: None,
        })
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header(ACCEPT, REGISTRY_MEDIA_TYPE);
        match &self.credentials {
            Some((user, pass)) => builder.basic_auth(user, Some(pass)),
            None => builder,
        }
    }

    fn with_json<B: Serialize>(builder: RequestBuilder, body: &B) -> Result<RequestBuilder> {
        let body = serde_json::to_vec(body)
            .map_err(|e| SchemaStreamError::Encode(format!("registry request: {e}")))?;
        Ok(builder.header(CONTENT_TYPE, REGISTRY_MEDIA_TYPE).body(body))
    }

    async fn send<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T> {
        let resp = builder.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json::<T>().await?);
        }
        let body = resp.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(err) => (Some(err.error_code), err.message),
            Err(_) => (None, body),
        };
        Err(SchemaStreamError::Registry {
            status: status.as_u16(),
            code,
            message,
        })
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn compatibility_level(&self, subject: &str) -> Result<CompatibilityLevel> {
        let builder = self.request(
            Method::GET,
            &format!("/config/{subject}?defaultToGlobal=true"),
        );
        let resp: CompatibilityLevelResponse = Self::send(builder).await?;
        Ok(resp.compatibility_level)
    }

    async fn set_compatibility_level(
        &self,
        subject: &str,
        level: CompatibilityLevel,
    ) -> Result<()> {
        let builder = Self::with_json(
            self.request(Method::PUT, &format!("/config/{subject}")),
            &CompatibilityRequest {
                compatibility: level,
            },
        )?;
        let _: serde_json::Value = Self::send(builder).await?;
        Ok(())
    }

    async fn latest_schema(&self, subject: &str) -> Result<RegisteredSchema> {
        let builder = self.request(
            Method::GET,
            &format!("/subjects/{subject}/versions/latest"),
        );
        Self::send(builder).await
    }

    async fn is_compatible(
        &self,
        subject: &str,
        version: u32,
        schema: &str,
        schema_type: SchemaType,
    ) -> Result<bool> {
        let builder = Self::with_json(
            self.request(
                Method::POST,
                &format!("/compatibility/subjects/{subject}/versions/{version}"),
            ),
            &SchemaRequest {
                schema,
                schema_type,
            },
        )?;
        let resp: CompatibilityCheckResponse = Self::send(builder).await?;
        Ok(resp.is_compatible)
    }

    async fn register_schema(
        &self,
        subject: &str,
        schema: &str,
        schema_type: SchemaType,
    ) -> Result<u32> {
        let builder = Self::with_json(
            self.request(Method::POST, &format!("/subjects/{subject}/versions")),
            &SchemaRequest {
                schema,
                schema_type,
            },
        )?;
        let resp: RegisterResponse = Self::send(builder).await?;
        Ok(resp.id)
    }
}
