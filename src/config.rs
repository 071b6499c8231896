//! Environment-variable configuration.
//!
//! All variables share the `SCHEMASTREAM_` prefix:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `SCHEMASTREAM_BROKERS` | comma-separated broker addresses |
//! | `SCHEMASTREAM_GROUP_ID` | consumer group |
//! | `SCHEMASTREAM_TOPIC` | consumer topic |
//! | `SCHEMASTREAM_READ_EARLIEST` | start from the earliest offset when the group has none |
//! | `SCHEMASTREAM_USERNAME` / `SCHEMASTREAM_PASSWORD` | SASL/SCRAM credentials |
//! | `SCHEMASTREAM_TLS` | enable TLS with system roots |
//! | `SCHEMASTREAM_CA_PEM` | CA certificate (PEM text); implies TLS |
//! | `SCHEMASTREAM_DIAL_TIMEOUT_MS` | connection setup timeout |
//! | `SCHEMASTREAM_REGISTRY_URL` | schema registry base URL |
//! | `SCHEMASTREAM_REGISTRY_USERNAME` / `SCHEMASTREAM_REGISTRY_PASSWORD` | registry basic auth |

use crate::error::{Result, SchemaStreamError};
use std::collections::HashMap;
use std::time::Duration;

pub const ENV_PREFIX: &str = "SCHEMASTREAM_";

/// Source of configuration values, keyed by the name without prefix.
pub struct EnvSource<'a> {
    lookup: Box<dyn Fn(&str) -> Option<String> + 'a>,
}

impl EnvSource<'static> {
    /// Read from the process environment.
    pub fn process() -> Self {
        Self {
            lookup: Box::new(|key: &str| std::env::var(key).ok()),
        }
    }
}

impl<'a> EnvSource<'a> {
    /// Read from a map of fully-prefixed variable names.
    pub fn from_map(map: &'a HashMap<String, String>) -> Self {
        Self {
            lookup: Box::new(move |key: &str| map.get(key).cloned()),
        }
    }

    /// Value of `SCHEMASTREAM_<name>`, with empty values treated as unset.
    pub fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn list(&self, name: &str) -> Vec<String> {
        self.get(name)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }

    pub fn flag(&self, name: &str) -> bool {
        self.get(name)
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
            .unwrap_or(false)
    }

    pub fn millis(&self, name: &str) -> Result<Option<Duration>> {
        let Some(raw) = self.get(name) else {
            return Ok(None);
        };
        raw.parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| {
                SchemaStreamError::Config(format!("{ENV_PREFIX}{name}: invalid milliseconds {raw:?}"))
            })
    }
}

/// Trimmed broker addresses with blank entries dropped.
pub(crate) fn broker_list<I, S>(brokers: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    brokers
        .into_iter()
        .map(Into::into)
        .filter_map(|b| {
            let trimmed = b.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .collect()
}
