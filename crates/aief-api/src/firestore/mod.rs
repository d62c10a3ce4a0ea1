// Firestore REST client
//
// Wraps `reqwest::Client` with document URL construction, bearer-token
// injection and typed-value translation. Callers see plain JSON objects;
// the `{"fields": {"x": {"stringValue": ..}}}` wire shape never leaks out.

pub mod value;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::debug;
use url::Url;

use crate::auth::TokenProvider;
use crate::error::Error;

/// Production REST root. Paths are appended as segments.
pub const FIRESTORE_BASE_URL: &str = "https://firestore.googleapis.com/v1/";

const DEFAULT_DATABASE: &str = "(default)";
const LIST_PAGE_SIZE: &str = "300";

/// A Firestore document with its fields decoded to plain JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Last path segment of the resource name.
    pub id: String,
    /// Full resource name (`projects/{p}/databases/{d}/documents/{c}/{id}`).
    pub name: String,
    pub fields: Map<String, Value>,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

impl Document {
    /// The fields as a single JSON object value.
    pub fn data(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
    #[serde(default)]
    create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    update_time: Option<DateTime<Utc>>,
}

impl TryFrom<RawDocument> for Document {
    type Error = Error;

    fn try_from(raw: RawDocument) -> Result<Self, Error> {
        let id = raw.name.rsplit('/').next().unwrap_or_default().to_owned();
        Ok(Self {
            id,
            fields: value::decode_fields(&raw.fields)?,
            name: raw.name,
            create_time: raw.create_time,
            update_time: raw.update_time,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    documents: Vec<RawDocument>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Google API error envelope: `{"error": {"code", "message", "status"}}`.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub(crate) error: ErrorBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) status: Option<String>,
}

/// HTTP client for the Firestore document API of one project.
pub struct FirestoreClient {
    http: reqwest::Client,
    base_url: Url,
    project_id: String,
    tokens: Arc<TokenProvider>,
}

impl FirestoreClient {
    /// Create a client rooted at `base_url` (normally [`FIRESTORE_BASE_URL`];
    /// an emulator or mock server in tests).
    pub fn new(
        http: reqwest::Client,
        base_url: Url,
        project_id: impl Into<String>,
        tokens: Arc<TokenProvider>,
    ) -> Result<Self, Error> {
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase));
        }
        Ok(Self {
            http,
            base_url,
            project_id: project_id.into(),
            tokens,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    // ── URL builders ─────────────────────────────────────────────────

    /// `{base}/projects/{project}/databases/(default)/documents/{segments..}`
    fn documents_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .extend([
                    "projects",
                    self.project_id.as_str(),
                    "databases",
                    DEFAULT_DATABASE,
                    "documents",
                ])
                .extend(segments);
        }
        url
    }

    // ── Document operations ──────────────────────────────────────────

    /// Create or fully replace `{collection}/{document_id}`.
    ///
    /// A PATCH without an update mask overwrites every field, so fields
    /// absent from `data` are removed from the stored document.
    pub async fn set_document(
        &self,
        collection: &str,
        document_id: &str,
        data: &Map<String, Value>,
    ) -> Result<Document, Error> {
        let url = self.documents_url(&[collection, document_id]);
        let body = json!({ "fields": value::encode_fields(data)? });

        debug!("PATCH {}", url);
        let resp = self.send(self.http.patch(url).json(&body)).await?;
        let raw: RawDocument = parse_json(resp).await?;
        raw.try_into()
    }

    /// Fetch one document. A missing document is `Ok(None)`, not an error.
    pub async fn get_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<Document>, Error> {
        let url = self.documents_url(&[collection, document_id]);

        debug!("GET {}", url);
        let resp = self.send(self.http.get(url)).await?;
        match parse_json::<RawDocument>(resp).await {
            Ok(raw) => Ok(Some(raw.try_into()?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete one document. Deleting a missing document succeeds.
    pub async fn delete_document(&self, collection: &str, document_id: &str) -> Result<(), Error> {
        let url = self.documents_url(&[collection, document_id]);

        debug!("DELETE {}", url);
        let resp = self.send(self.http.delete(url)).await?;
        let _: Value = parse_json(resp).await?;
        Ok(())
    }

    /// List every document in a collection, following page tokens.
    pub async fn list_documents(&self, collection: &str) -> Result<Vec<Document>, Error> {
        let mut documents: Vec<Document> = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.documents_url(&[collection]);
            url.query_pairs_mut().append_pair("pageSize", LIST_PAGE_SIZE);
            if let Some(ref token) = page_token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }

            debug!("GET {}", url);
            let resp = self.send(self.http.get(url)).await?;
            let page: ListResponse = parse_json(resp).await?;

            for raw in page.documents {
                documents.push(raw.try_into()?);
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(documents)
    }

    // ── Request helpers ──────────────────────────────────────────────

    /// Attach the bearer token and send. A 401 drops the cached token so
    /// the next attempt re-authenticates.
    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, Error> {
        let token = self.tokens.access_token().await?;
        let resp = req.bearer_auth(token.expose_secret()).send().await?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        Ok(resp)
    }
}

/// Deserialize a success body, or turn an error body into [`Error::Api`].
pub(crate) async fn parse_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let status = resp.status();
    let body = resp.text().await?;

    if !status.is_success() {
        return Err(api_error(status.as_u16(), &body));
    }

    serde_json::from_str(&body).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body,
    })
}

pub(crate) fn api_error(status: u16, body: &str) -> Error {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => Error::Api {
            message: envelope.error.message,
            code: envelope.error.status,
            status,
        },
        Err(_) => Error::Api {
            message: if body.is_empty() {
                format!("HTTP {status}")
            } else {
                body.to_owned()
            },
            code: None,
            status,
        },
    }
}
