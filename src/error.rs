//! Error types for the messaging layer.

use thiserror::Error;

/// Result alias for producer, consumer and registry operations.
pub type Result<T> = std::result::Result<T, SchemaStreamError>;

/// Registry error code for an unknown subject.
pub const REGISTRY_SUBJECT_NOT_FOUND: u32 = 40401;
/// Registry error code for an unknown schema version.
pub const REGISTRY_VERSION_NOT_FOUND: u32 = 40402;

/// Errors that can occur while producing, consuming or registering schemas.
#[derive(Error, Debug)]
pub enum SchemaStreamError {
    /// Invalid construction-time or call-time configuration; never retried.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("topic must be specified")]
    MissingTopic,

    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// Cooperative shutdown surfaced from a blocking call.
    #[error("operation cancelled")]
    Cancelled,

    #[error("unable to fetch message: {0}")]
    Fetch(String),

    #[error("unable to commit message: {0}")]
    Commit(String),

    #[error("unable to write message: {0}")]
    Write(String),

    #[error("unable to marshal message value: {0}")]
    Encode(String),

    #[error("empty message value")]
    EmptyValue,

    #[error("unable to unmarshal message value: {0}")]
    Decode(String),

    #[error("unable to close {what}: {reason}")]
    Close { what: &'static str, reason: String },

    #[error("schema registry error (HTTP {status}, code {code:?}): {message}")]
    Registry {
        status: u16,
        code: Option<u32>,
        message: String,
    },

    #[error("schema registry request failed: {0}")]
    RegistryTransport(#[from] reqwest::Error),

    #[error("schema for {subject} is incompatible with version {version}")]
    IncompatibleSchema { subject: String, version: u32 },

    #[error("schema registration failed for topics: {}", topics.join(", "))]
    Registration { topics: Vec<String> },
}

impl SchemaStreamError {
    /// True for the cancellation signal, which ends the consumer loop cleanly.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// True when the registry reports an unknown subject or version.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Registry { status, code, .. } => {
                matches!(
                    code,
                    Some(REGISTRY_SUBJECT_NOT_FOUND) | Some(REGISTRY_VERSION_NOT_FOUND)
                ) || (code.is_none() && *status == 404)
            }
            _ => false,
        }
    }

    /// Decode failures are terminal for the message they belong to.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::EmptyValue | Self::Decode(_))
    }
}
