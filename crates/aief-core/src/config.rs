// ── Runtime configuration ──
//
// These types describe *what* the state client connects to and how hard it
// tries. They carry credential data and tuning, but never touch disk.
// `aief-config` builds them from the environment or the snapshot file.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use aief_api::ServiceAccountKey;
use aief_api::auth::{
    DEFAULT_AUTH_PROVIDER_CERT_URL, DEFAULT_AUTH_URI, DEFAULT_CLIENT_CERT_URL, DEFAULT_TOKEN_URI,
};
use secrecy::SecretString;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::error::CoreError;

// ── CredentialSet ────────────────────────────────────────────────────

/// Service-account credentials for one backend project.
#[derive(Debug, Clone)]
pub struct CredentialSet {
    pub project_id: String,
    pub private_key_id: String,
    pub private_key: SecretString,
    pub client_email: String,
    pub client_id: String,
    pub auth_uri: String,
    pub token_uri: String,
    pub auth_provider_x509_cert_url: String,
    pub client_x509_cert_url: String,
}

impl CredentialSet {
    /// Fields that must be present and non-empty before connecting.
    pub const REQUIRED_FIELDS: [&'static str; 3] = ["project_id", "private_key", "client_email"];

    /// Build from a plain field mapping (`"project_id" -> "..."`, ...).
    ///
    /// Missing optional fields fall back to empty ids and the standard
    /// Google OAuth endpoints. A missing or empty required field is a
    /// [`CoreError::Config`] naming it.
    pub fn from_fields<I, K, V>(fields: I) -> Result<Self, CoreError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut map: HashMap<String, String> = fields
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_owned(), v.as_ref().to_owned()))
            .collect();

        for field in Self::REQUIRED_FIELDS {
            if map.get(field).is_none_or(|v| v.trim().is_empty()) {
                return Err(CoreError::missing_field(field));
            }
        }

        let mut take = |key: &str, default: &str| {
            map.remove(key)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_owned())
        };

        Ok(Self {
            project_id: take("project_id", ""),
            private_key_id: take("private_key_id", ""),
            private_key: SecretString::from(take("private_key", "")),
            client_email: take("client_email", ""),
            client_id: take("client_id", ""),
            auth_uri: take("auth_uri", DEFAULT_AUTH_URI),
            token_uri: take("token_uri", DEFAULT_TOKEN_URI),
            auth_provider_x509_cert_url: take(
                "auth_provider_x509_cert_url",
                DEFAULT_AUTH_PROVIDER_CERT_URL,
            ),
            client_x509_cert_url: take("client_x509_cert_url", DEFAULT_CLIENT_CERT_URL),
        })
    }

    /// The service-account key handed to the token provider.
    pub fn to_service_account(&self) -> ServiceAccountKey {
        ServiceAccountKey {
            project_id: self.project_id.clone(),
            private_key_id: self.private_key_id.clone(),
            private_key: self.private_key.clone(),
            client_email: self.client_email.clone(),
            client_id: self.client_id.clone(),
            auth_uri: self.auth_uri.clone(),
            token_uri: self.token_uri.clone(),
            auth_provider_x509_cert_url: self.auth_provider_x509_cert_url.clone(),
            client_x509_cert_url: self.client_x509_cert_url.clone(),
        }
    }
}

// ── Collections ──────────────────────────────────────────────────────

/// The five well-known logical collections.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum CollectionRole {
    IntegrationLogs,
    Strategies,
    PerformanceMetrics,
    AdaptationHistory,
    PlatformConfigs,
}

/// Role → backend collection name. Always holds an entry for every role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMap {
    names: BTreeMap<CollectionRole, String>,
}

impl Default for CollectionMap {
    /// Every role maps to a collection of the same name.
    fn default() -> Self {
        Self {
            names: CollectionRole::iter()
                .map(|role| (role, role.to_string()))
                .collect(),
        }
    }
}

impl CollectionMap {
    /// Override the backend name of one role.
    pub fn with(mut self, role: CollectionRole, name: impl Into<String>) -> Self {
        self.names.insert(role, name.into());
        self
    }

    pub fn get(&self, role: CollectionRole) -> &str {
        self.names.get(&role).map_or("", String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CollectionRole, &str)> {
        self.names.iter().map(|(role, name)| (*role, name.as_str()))
    }

    /// Build from a loosely-typed mapping keyed by role name. Unknown keys
    /// are ignored and absent roles keep their default name.
    pub fn from_names<I, K, V>(names: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        names
            .into_iter()
            .fold(Self::default(), |map, (key, name)| match key.as_ref().parse() {
                Ok(role) => map.with(role, name),
                Err(_) => map,
            })
    }
}

// ── OperationalSettings ──────────────────────────────────────────────

/// Tunables that govern how the client talks to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationalSettings {
    /// Retries after the first attempt of a transient-failing call.
    pub max_retries: u32,
    /// Fixed pause between attempts.
    pub retry_delay: Duration,
    /// Upper bound on each attempt.
    pub timeout: Duration,
    pub collections: CollectionMap,
}

impl Default for OperationalSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            collections: CollectionMap::default(),
        }
    }
}

impl OperationalSettings {
    /// Validated construction. `retry_delay_secs` must be finite and
    /// non-negative; `timeout` must be non-zero.
    pub fn new(
        max_retries: u32,
        retry_delay_secs: f64,
        timeout: Duration,
        collections: CollectionMap,
    ) -> Result<Self, CoreError> {
        let retry_delay = Duration::try_from_secs_f64(retry_delay_secs).map_err(|_| {
            CoreError::Config {
                message: format!(
                    "retry_delay must be a finite, non-negative number of seconds (got {retry_delay_secs})"
                ),
                field: Some("retry_delay"),
            }
        })?;

        if timeout.is_zero() {
            return Err(CoreError::Config {
                message: "timeout must be greater than zero".into(),
                field: Some("timeout"),
            });
        }

        Ok(Self {
            max_retries,
            retry_delay,
            timeout,
            collections,
        })
    }
}
