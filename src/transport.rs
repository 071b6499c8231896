//! Shared connection settings: dial timeout, TLS posture and SASL credentials.
//!
//! A [`Transport`] is validated once and then shared read-only (behind `Arc`)
//! by any number of producers and consumers.

use crate::config::EnvSource;
use crate::error::{Result, SchemaStreamError};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::CertificateDer;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(1);
/// Lowest connection setup timeout librdkafka accepts.
pub const MIN_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// SASL mechanism negotiated when credentials are present.
pub const SASL_MECHANISM: &str = "SCRAM-SHA-512";

#[derive(Clone, PartialEq, Eq, Default)]
pub enum TlsMode {
    #[default]
    Disabled,
    /// TLS verified against the system trust store.
    SystemRoots,
    /// TLS verified against the given CA certificate(s), PEM text.
    CustomCa(String),
}

impl TlsMode {
    /// A CA certificate enables TLS on its own; the flag alone selects system roots.
    pub fn from_flags(enabled: bool, ca_pem: Option<&str>) -> Self {
        match ca_pem.map(str::trim).filter(|pem| !pem.is_empty()) {
            Some(pem) => Self::CustomCa(pem.to_string()),
            None if enabled => Self::SystemRoots,
            None => Self::Disabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

impl fmt::Debug for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::SystemRoots => f.write_str("SystemRoots"),
            Self::CustomCa(pem) => write!(f, "CustomCa({} bytes)", pem.len()),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SaslCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for SaslCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub dial_timeout: Duration,
    pub tls: TlsMode,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            tls: TlsMode::Disabled,
            username: None,
            password: None,
        }
    }
}

impl TransportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Load `SCHEMASTREAM_TLS`, `SCHEMASTREAM_CA_PEM`, `SCHEMASTREAM_USERNAME`,
    /// `SCHEMASTREAM_PASSWORD` and `SCHEMASTREAM_DIAL_TIMEOUT_MS`.
    pub fn from_env(env: &EnvSource<'_>) -> Result<Self> {
        let ca_pem = env.get("CA_PEM");
        Ok(Self {
            dial_timeout: env.millis("DIAL_TIMEOUT_MS")?.unwrap_or(DEFAULT_DIAL_TIMEOUT),
            tls: TlsMode::from_flags(env.flag("TLS"), ca_pem.as_deref()),
            username: env.get("USERNAME"),
            password: env.get("PASSWORD"),
        })
    }
}

/// Validated, shareable connection configuration.
#[derive(Clone)]
pub struct Transport {
    dial_timeout: Duration,
    tls: TlsMode,
    sasl: Option<SaslCredentials>,
    properties: BTreeMap<String, String>,
}

impl Transport {
    pub fn new(opts: TransportOptions) -> Result<Arc<Self>> {
        if let TlsMode::CustomCa(pem) = &opts.tls {
            validate_ca_pem(pem)?;
        }

        let sasl = match (opts.username, opts.password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(SaslCredentials { username, password })
            }
            (None, None) => None,
            (username, _) => {
                tracing::warn!(
                    username = username.as_deref().unwrap_or(""),
                    "incomplete SASL credentials, connecting without SASL"
                );
                None
            }
        };

        if opts.dial_timeout < MIN_DIAL_TIMEOUT {
            tracing::warn!(
                requested_ms = opts.dial_timeout.as_millis() as u64,
                min_ms = MIN_DIAL_TIMEOUT.as_millis() as u64,
                "dial timeout raised to the minimum"
            );
        }
        let dial_timeout = opts.dial_timeout.max(MIN_DIAL_TIMEOUT);

        let properties = render_properties(dial_timeout, &opts.tls, sasl.as_ref());
        Ok(Arc::new(Self {
            dial_timeout,
            tls: opts.tls,
            sasl,
            properties,
        }))
    }

    /// Plaintext transport with the default dial timeout.
    pub fn plaintext() -> Arc<Self> {
        Arc::new(Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            tls: TlsMode::Disabled,
            sasl: None,
            properties: render_properties(DEFAULT_DIAL_TIMEOUT, &TlsMode::Disabled, None),
        })
    }

    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    pub fn tls(&self) -> &TlsMode {
        &self.tls
    }

    pub fn sasl(&self) -> Option<&SaslCredentials> {
        self.sasl.as_ref()
    }

    /// `security.protocol` value for this transport.
    pub fn security_protocol(&self) -> &'static str {
        security_protocol(&self.tls, self.sasl.is_some())
    }

    /// Connection-level client properties (librdkafka naming).
    pub fn client_properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("dial_timeout", &self.dial_timeout)
            .field("tls", &self.tls)
            .field("sasl", &self.sasl)
            .finish()
    }
}

fn validate_ca_pem(pem: &str) -> Result<()> {
    let mut count = 0usize;
    for cert in CertificateDer::pem_slice_iter(pem.as_bytes()) {
        cert.map_err(|e| SchemaStreamError::Tls(format!("invalid CA certificate PEM: {e:?}")))?;
        count += 1;
    }
    if count == 0 {
        return Err(SchemaStreamError::Tls(
            "CA PEM contains no certificates".to_string(),
        ));
    }
    Ok(())
}

fn security_protocol(tls: &TlsMode, sasl: bool) -> &'static str {
    match (tls.is_enabled(), sasl) {
        (false, false) => "PLAINTEXT",
        (true, false) => "SSL",
        (false, true) => "SASL_PLAINTEXT",
        (true, true) => "SASL_SSL",
    }
}

fn render_properties(
    dial_timeout: Duration,
    tls: &TlsMode,
    sasl: Option<&SaslCredentials>,
) -> BTreeMap<String, String> {
    let mut props = BTreeMap::new();
    props.insert(
        "security.protocol".to_string(),
        security_protocol(tls, sasl.is_some()).to_string(),
    );
    props.insert(
        "socket.connection.setup.timeout.ms".to_string(),
        dial_timeout.as_millis().to_string(),
    );
    match tls {
        TlsMode::Disabled => {}
        TlsMode::SystemRoots => {
            props.insert("ssl.ca.location".to_string(), "probe".to_string());
        }
        TlsMode::CustomCa(pem) => {
            props.insert("ssl.ca.pem".to_string(), pem.clone());
        }
    }
    if tls.is_enabled() {
        props.insert(
            "enable.ssl.certificate.verification".to_string(),
            "true".to_string(),
        );
    }
    if let Some(creds) = sasl {
        props.insert("sasl.mechanism".to_string(), SASL_MECHANISM.to_string());
        props.insert("sasl.username".to_string(), creds.username.clone());
        props.insert("sasl.password".to_string(), creds.password.clone());
    }
    props
}
