//! Configuration for the AIEF state client.
//!
//! Credential loading from `FIREBASE_*` environment variables, the
//! persisted `{"framework": .., "firebase": ..}` JSON snapshot, and
//! translation to the `aief_core` runtime types.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use aief_api::auth::{
    DEFAULT_AUTH_PROVIDER_CERT_URL, DEFAULT_AUTH_URI, DEFAULT_CLIENT_CERT_URL, DEFAULT_TOKEN_URI,
};
use aief_core::{CollectionMap, CollectionRole, CoreError, CredentialSet, OperationalSettings};

/// File name of the snapshot in the user's home directory.
pub const CONFIG_FILE_NAME: &str = ".aief_config.json";

/// Prefix of environment variables that override framework settings.
pub const ENV_PREFIX: &str = "AIEF_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("incomplete Firebase configuration: missing {}", missing.join(", "))]
    Incomplete { missing: Vec<&'static str> },

    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not determine the home directory")]
    NoHomeDir,
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

impl From<CoreError> for ConfigError {
    fn from(err: CoreError) -> Self {
        Self::Validation {
            field: err.field().unwrap_or("config").to_owned(),
            reason: err.to_string(),
        }
    }
}

// ── Firebase credentials ────────────────────────────────────────────

/// Service-account credentials as stored in the snapshot's `firebase`
/// object and in `FIREBASE_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirebaseConfig {
    pub project_id: String,
    #[serde(default)]
    pub private_key_id: String,
    #[serde(with = "secret_string")]
    pub private_key: SecretString,
    pub client_email: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default = "default_auth_provider_cert_url")]
    pub auth_provider_x509_cert_url: String,
    #[serde(default = "default_client_cert_url")]
    pub client_x509_cert_url: String,
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.into()
}
fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.into()
}
fn default_auth_provider_cert_url() -> String {
    DEFAULT_AUTH_PROVIDER_CERT_URL.into()
}
fn default_client_cert_url() -> String {
    DEFAULT_CLIENT_CERT_URL.into()
}

mod secret_string {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(secret: &SecretString, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(secret.expose_secret())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SecretString, D::Error> {
        String::deserialize(d).map(SecretString::from)
    }
}

impl FirebaseConfig {
    /// Read `FIREBASE_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read `FIREBASE_*` variables through `lookup`.
    ///
    /// `FIREBASE_PROJECT_ID`, `FIREBASE_PRIVATE_KEY` and
    /// `FIREBASE_CLIENT_EMAIL` are required; every missing one is listed in
    /// the error. Literal `\n` sequences in the private key become line
    /// breaks.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut missing = Vec::new();
        let mut require = |name: &'static str| {
            let value = get(name);
            if value.is_none() {
                missing.push(name);
            }
            value.unwrap_or_default()
        };

        let project_id = require("FIREBASE_PROJECT_ID");
        let private_key = require("FIREBASE_PRIVATE_KEY").replace("\\n", "\n");
        let client_email = require("FIREBASE_CLIENT_EMAIL");

        if !missing.is_empty() {
            return Err(ConfigError::Incomplete { missing });
        }

        Ok(Self {
            project_id,
            private_key_id: get("FIREBASE_PRIVATE_KEY_ID").unwrap_or_default(),
            private_key: SecretString::from(private_key),
            client_email,
            client_id: get("FIREBASE_CLIENT_ID").unwrap_or_default(),
            auth_uri: default_auth_uri(),
            token_uri: default_token_uri(),
            auth_provider_x509_cert_url: default_auth_provider_cert_url(),
            client_x509_cert_url: get("FIREBASE_CLIENT_CERT_URL")
                .unwrap_or_else(default_client_cert_url),
        })
    }

    /// The field mapping `StateClient::initialize` accepts.
    pub fn to_fields(&self) -> HashMap<String, String> {
        [
            ("project_id", self.project_id.as_str()),
            ("private_key_id", self.private_key_id.as_str()),
            ("private_key", self.private_key.expose_secret()),
            ("client_email", self.client_email.as_str()),
            ("client_id", self.client_id.as_str()),
            ("auth_uri", self.auth_uri.as_str()),
            ("token_uri", self.token_uri.as_str()),
            ("auth_provider_x509_cert_url", self.auth_provider_x509_cert_url.as_str()),
            ("client_x509_cert_url", self.client_x509_cert_url.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
    }

    pub fn credential_set(&self) -> Result<CredentialSet, ConfigError> {
        Ok(CredentialSet::from_fields(self.to_fields())?)
    }
}

// ── Framework settings ──────────────────────────────────────────────

/// The persisted `framework` object. Only the integration parameters and
/// the collection mapping reach the state client; the rest is carried for
/// the components built on top of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkConfig {
    // Learning parameters
    pub learning_rate: f64,
    pub exploration_rate: f64,
    pub memory_size: u64,
    pub batch_size: u32,

    // Integration parameters
    pub max_retries: u32,
    /// Seconds.
    pub retry_delay: f64,
    pub timeout_seconds: u64,

    // Evolution parameters
    /// Seconds.
    pub strategy_evaluation_interval: u64,
    pub performance_threshold: f64,
    pub adaptation_threshold: f64,

    /// Role → backend collection name; always holds every role.
    #[serde(deserialize_with = "populated_collections")]
    pub firebase_collections: BTreeMap<String, String>,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            exploration_rate: 0.1,
            memory_size: 10_000,
            batch_size: 32,
            max_retries: 3,
            retry_delay: 1.0,
            timeout_seconds: 30,
            strategy_evaluation_interval: 3600,
            performance_threshold: 0.8,
            adaptation_threshold: 0.15,
            firebase_collections: default_collections(),
        }
    }
}

fn default_collections() -> BTreeMap<String, String> {
    CollectionMap::default()
        .iter()
        .map(|(role, name)| (role.to_string(), name.to_owned()))
        .collect()
}

/// `null` or a partial mapping is filled up with the default names.
fn populated_collections<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<BTreeMap<String, String>, D::Error> {
    let given: Option<BTreeMap<String, String>> = Option::deserialize(d)?;
    let mut names = default_collections();
    names.extend(given.unwrap_or_default());
    Ok(names)
}

impl FrameworkConfig {
    /// Defaults overridden by `AIEF_`-prefixed environment variables,
    /// e.g. `AIEF_MAX_RETRIES=5`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?)
    }

    /// The state client's runtime settings.
    pub fn operational_settings(&self) -> Result<OperationalSettings, ConfigError> {
        let collections = CollectionMap::from_names(&self.firebase_collections);
        Ok(OperationalSettings::new(
            self.max_retries,
            self.retry_delay,
            Duration::from_secs(self.timeout_seconds),
            collections,
        )?)
    }

    /// Backend name for `role`.
    pub fn collection(&self, role: CollectionRole) -> &str {
        let default: &'static str = role.into();
        self.firebase_collections
            .get(default)
            .map_or(default, String::as_str)
    }
}

// ── Config file path ────────────────────────────────────────────────

/// `$HOME/.aief_config.json`
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::NoHomeDir)
}

// ── ConfigManager ───────────────────────────────────────────────────

/// Holds the current settings and credentials, and persists them as a
/// JSON snapshot. `save` and `load` are best-effort: failures are logged
/// and reported as `false`.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    path: PathBuf,
    pub framework: FrameworkConfig,
    pub firebase: Option<FirebaseConfig>,
}

#[derive(Serialize)]
struct Snapshot<'a> {
    framework: &'a FrameworkConfig,
    firebase: serde_json::Value,
}

impl ConfigManager {
    /// Framework settings and credentials from the environment, over the
    /// defaults. `path` defaults to `$HOME/.aief_config.json`.
    pub fn new(path: Option<PathBuf>) -> Self {
        let path = path.unwrap_or_else(|| {
            default_config_path().unwrap_or_else(|e| {
                warn!(error = %e, "falling back to the working directory for the config file");
                PathBuf::from(CONFIG_FILE_NAME)
            })
        });

        let firebase = match FirebaseConfig::from_env() {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(error = %e, "Firebase credentials not loaded from environment");
                None
            }
        };

        let framework = FrameworkConfig::from_env().unwrap_or_else(|e| {
            warn!(error = %e, "ignoring framework overrides from environment");
            FrameworkConfig::default()
        });

        Self {
            framework,
            ..Self::with_credentials(path, firebase)
        }
    }

    /// Explicit credentials instead of the environment.
    pub fn with_credentials(path: PathBuf, firebase: Option<FirebaseConfig>) -> Self {
        Self {
            path,
            framework: FrameworkConfig::default(),
            firebase,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `true` when credentials with a project id are present.
    pub fn validate(&self) -> bool {
        match self.firebase {
            None => {
                warn!("Firebase configuration is missing");
                false
            }
            Some(ref fb) if fb.project_id.trim().is_empty() => {
                warn!("Firebase project ID is required");
                false
            }
            Some(_) => true,
        }
    }

    /// Write the snapshot. Parent directories are created as needed.
    pub fn save(&self) -> bool {
        match self.try_save() {
            Ok(()) => {
                info!(path = %self.path.display(), "configuration saved");
                true
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "failed to save configuration");
                false
            }
        }
    }

    /// Read the snapshot. A missing file returns `false` and leaves the
    /// current settings untouched, as does any read or parse failure.
    ///
    /// The `framework` object is layered over the defaults, then
    /// `AIEF_`-prefixed environment variables override it. The file's
    /// `firebase` object is only used when no credentials came from the
    /// environment.
    pub fn load(&mut self) -> bool {
        if !self.path.exists() {
            info!(path = %self.path.display(), "config file not found, keeping current settings");
            return false;
        }

        match self.try_load() {
            Ok(()) => {
                info!(path = %self.path.display(), "configuration loaded");
                true
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "failed to load configuration");
                false
            }
        }
    }

    fn try_load(&mut self) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(&self.path)?;
        let document: serde_json::Value = serde_json::from_str(&text)?;
        let Some(sections) = document.as_object() else {
            return Err(ConfigError::Validation {
                field: "config".into(),
                reason: "top level must be a JSON object".into(),
            });
        };

        // Parse everything before touching `self`, so a failure leaves the
        // previous settings in place.
        let framework = match sections.get("framework") {
            Some(_) => Some(
                Figment::new()
                    .merge(Serialized::defaults(FrameworkConfig::default()))
                    .merge(Figment::from(Json::string(&text)).focus("framework"))
                    .merge(Env::prefixed(ENV_PREFIX))
                    .extract::<FrameworkConfig>()?,
            ),
            None => None,
        };

        let firebase = match sections.get("firebase") {
            Some(value) if self.firebase.is_none() && value.as_object().is_some_and(|m| !m.is_empty()) => {
                Some(serde_json::from_value::<FirebaseConfig>(value.clone())?)
            }
            _ => None,
        };

        if let Some(framework) = framework {
            debug!(?framework, "framework settings replaced from file");
            self.framework = framework;
        }
        if let Some(firebase) = firebase {
            debug!(project_id = %firebase.project_id, "Firebase credentials taken from file");
            self.firebase = Some(firebase);
        }
        Ok(())
    }

    fn try_save(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let firebase = match self.firebase {
            Some(ref fb) => serde_json::to_value(fb)?,
            None => serde_json::Value::Object(serde_json::Map::new()),
        };
        let snapshot = Snapshot {
            framework: &self.framework,
            firebase,
        };

        std::fs::write(&self.path, serde_json::to_string_pretty(&snapshot)?)?;
        Ok(())
    }

    /// The state client's runtime settings.
    pub fn operational_settings(&self) -> Result<OperationalSettings, ConfigError> {
        self.framework.operational_settings()
    }

    pub fn credential_set(&self) -> Result<CredentialSet, ConfigError> {
        match self.firebase {
            Some(ref fb) => fb.credential_set(),
            None => Err(ConfigError::Validation {
                field: "firebase".into(),
                reason: "no Firebase credentials loaded".into(),
            }),
        }
    }
}
