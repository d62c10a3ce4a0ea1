// Service-account authentication.
//
// Signs an RS256 JWT assertion with the account's private key and trades it
// at the OAuth token endpoint for a short-lived bearer token. Tokens are
// cached and refreshed shortly before they expire.

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use crate::error::Error;

pub const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_AUTH_PROVIDER_CERT_URL: &str = "https://www.googleapis.com/oauth2/v1/certs";
pub const DEFAULT_CLIENT_CERT_URL: &str =
    "https://www.googleapis.com/robot/v1/metadata/x509/firebase-adminsdk.iam.gserviceaccount.com";

/// OAuth scopes covering Firestore and the Realtime Database.
pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/datastore",
    "https://www.googleapis.com/auth/firebase.database",
    "https://www.googleapis.com/auth/userinfo.email",
];

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const REFRESH_MARGIN_SECS: i64 = 60;

/// A service-account key, field-for-field the JSON document the Firebase
/// console hands out (minus the constant `"type": "service_account"`).
#[derive(Debug, Clone)]
pub struct ServiceAccountKey {
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

impl ServiceAccountKey {
    /// The standard service-account JSON document, private key included.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "service_account",
            "project_id": self.project_id,
            "private_key_id": self.private_key_id,
            "private_key": self.private_key.expose_secret(),
            "client_email": self.client_email,
            "client_id": self.client_id,
            "auth_uri": self.auth_uri,
            "token_uri": self.token_uri,
            "auth_provider_x509_cert_url": self.auth_provider_x509_cert_url,
            "client_x509_cert_url": self.client_x509_cert_url,
        })
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    sub: &'a str,
    aud: &'a str,
    scope: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    ASSERTION_LIFETIME_SECS
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

struct AccessToken {
    value: SecretString,
    expires_at: DateTime<Utc>,
}

/// Mints and caches bearer tokens for one service account.
///
/// Concurrent callers share a single in-flight refresh: the cache lock is
/// held across the token exchange.
pub struct TokenProvider {
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    token_uri: Url,
    http: reqwest::Client,
    cached: Mutex<Option<AccessToken>>,
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("client_email", &self.key.client_email)
            .field("token_uri", &self.token_uri.as_str())
            .finish_non_exhaustive()
    }
}

impl TokenProvider {
    /// Parse the key material. Fails with [`Error::Credential`] if the
    /// private key is not an RSA PEM or the token URI is malformed.
    pub fn new(key: ServiceAccountKey, http: reqwest::Client) -> Result<Self, Error> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.expose_secret().as_bytes())
            .map_err(|e| Error::Credential(format!("private key is not a valid RSA PEM: {e}")))?;
        let token_uri = Url::parse(&key.token_uri)
            .map_err(|e| Error::Credential(format!("invalid token_uri '{}': {e}", key.token_uri)))?;

        Ok(Self {
            key,
            encoding_key,
            token_uri,
            http,
            cached: Mutex::new(None),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.key.project_id
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    /// Return a valid bearer token, exchanging a fresh assertion if the
    /// cached one is missing or about to expire.
    pub async fn access_token(&self) -> Result<SecretString, Error> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.expires_at - TimeDelta::seconds(REFRESH_MARGIN_SECS) > Utc::now() {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.exchange().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    /// Drop the cached token so the next call re-authenticates.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    fn assertion(&self, now: DateTime<Utc>) -> Result<String, Error> {
        let claims = Claims {
            iss: &self.key.client_email,
            sub: &self.key.client_email,
            aud: &self.key.token_uri,
            scope: SCOPES.join(" "),
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        if !self.key.private_key_id.is_empty() {
            header.kid = Some(self.key.private_key_id.clone());
        }

        jsonwebtoken::encode(&header, &claims, &self.encoding_key)
            .map_err(|e| Error::Credential(format!("failed to sign assertion: {e}")))
    }

    async fn exchange(&self) -> Result<AccessToken, Error> {
        let now = Utc::now();
        let assertion = self.assertion(now)?;

        debug!(token_uri = %self.token_uri, "exchanging service-account assertion");

        let resp = self
            .http
            .post(self.token_uri.clone())
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<TokenErrorBody>(&body).map_or_else(
                |_| body.clone(),
                |e| match e.error_description {
                    Some(desc) => format!("{}: {desc}", e.error),
                    None => e.error,
                },
            );

            if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(Error::Api {
                    message,
                    code: None,
                    status: status.as_u16(),
                });
            }
            return Err(Error::Authentication { message });
        }

        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body: body.clone(),
            })?;

        debug!(expires_in = token.expires_in, "access token issued");

        Ok(AccessToken {
            value: SecretString::from(token.access_token),
            expires_at: now + TimeDelta::seconds(token.expires_in),
        })
    }
}
