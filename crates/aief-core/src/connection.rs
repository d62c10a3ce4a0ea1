// ── Connection lifecycle ──
//
// One authenticated connection per `ConnectionCell`, created on first
// `initialize` and shared by every later caller. Concurrent initializers
// wait on the same cell; a failed attempt leaves it empty for a retry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};
use url::Url;

use aief_api::firestore::FIRESTORE_BASE_URL;
use aief_api::realtime::DATABASE_HOST;
use aief_api::{FirestoreClient, RealtimeClient, TokenProvider, TransportConfig};

use crate::backend::{DocumentBackend, RealtimeBackend};
use crate::config::CredentialSet;
use crate::error::CoreError;

// ── Connection ───────────────────────────────────────────────────────

/// A live, authenticated session with one project. Handed out as
/// `Arc<Connection>`; there is no close operation.
pub struct Connection {
    project_id: String,
    database_url: Url,
    documents: Arc<dyn DocumentBackend>,
    realtime: Arc<dyn RealtimeBackend>,
}

impl Connection {
    pub fn new(
        project_id: impl Into<String>,
        database_url: Url,
        documents: Arc<dyn DocumentBackend>,
        realtime: Arc<dyn RealtimeBackend>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            database_url,
            documents,
            realtime,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database_url(&self) -> &Url {
        &self.database_url
    }

    /// Structured-document view.
    pub fn documents(&self) -> &dyn DocumentBackend {
        self.documents.as_ref()
    }

    /// Hierarchical real-time view.
    pub fn realtime(&self) -> &dyn RealtimeBackend {
        self.realtime.as_ref()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("project_id", &self.project_id)
            .field("database_url", &self.database_url.as_str())
            .finish_non_exhaustive()
    }
}

/// `https://{project_id}.firebaseio.com`
pub fn database_url_for(project_id: &str) -> Result<Url, CoreError> {
    Url::parse(&format!("https://{project_id}.{DATABASE_HOST}")).map_err(|e| CoreError::Config {
        message: format!("project_id '{project_id}' does not form a valid database URL: {e}"),
        field: Some("project_id"),
    })
}

// ── Connector ────────────────────────────────────────────────────────

/// Turns validated credentials into a live [`Connection`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        credentials: &CredentialSet,
        database_url: &Url,
    ) -> Result<Connection, aief_api::Error>;
}

/// Connects to Firebase: Firestore for documents, the Realtime Database
/// for change streams, both behind one service-account token provider.
///
/// Endpoints default to production and can be pointed at an emulator or a
/// mock server.
#[derive(Debug, Clone, Default)]
pub struct FirebaseConnector {
    transport: TransportConfig,
    firestore_base: Option<Url>,
    database_url: Option<Url>,
    token_uri: Option<String>,
}

impl FirebaseConnector {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            ..Self::default()
        }
    }

    pub fn with_firestore_base(mut self, url: Url) -> Self {
        self.firestore_base = Some(url);
        self
    }

    /// Replace the derived `https://{project}.firebaseio.com` URL.
    pub fn with_database_url(mut self, url: Url) -> Self {
        self.database_url = Some(url);
        self
    }

    /// Replace the credential set's token endpoint.
    pub fn with_token_uri(mut self, uri: impl Into<String>) -> Self {
        self.token_uri = Some(uri.into());
        self
    }
}

#[async_trait]
impl Connector for FirebaseConnector {
    async fn connect(
        &self,
        credentials: &CredentialSet,
        database_url: &Url,
    ) -> Result<Connection, aief_api::Error> {
        let mut key = credentials.to_service_account();
        if let Some(ref uri) = self.token_uri {
            key.token_uri.clone_from(uri);
        }

        let http = self.transport.build_client()?;
        let stream_http = self.transport.build_streaming_client()?;
        let tokens = Arc::new(TokenProvider::new(key, http.clone())?);

        // One exchange up front so bad credentials fail here, not on the
        // first document call.
        tokens.access_token().await?;
        debug!(client_email = tokens.client_email(), "service-account credentials accepted");

        let firestore_base = match self.firestore_base {
            Some(ref url) => url.clone(),
            None => Url::parse(FIRESTORE_BASE_URL)?,
        };
        let database_url = self.database_url.clone().unwrap_or_else(|| database_url.clone());

        let documents = FirestoreClient::new(
            http.clone(),
            firestore_base,
            credentials.project_id.as_str(),
            Arc::clone(&tokens),
        )?;
        let realtime = RealtimeClient::new(http, stream_http, database_url.clone(), tokens)?;

        Ok(Connection::new(
            credentials.project_id.as_str(),
            database_url,
            Arc::new(documents),
            Arc::new(realtime),
        ))
    }
}

// ── ConnectionCell ───────────────────────────────────────────────────

/// Lazily-constructed, thread-safe holder of at most one [`Connection`].
#[derive(Debug, Default)]
pub struct ConnectionCell {
    cell: OnceCell<Arc<Connection>>,
}

impl ConnectionCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect once; every later call returns the same handle.
    ///
    /// The three required credential fields are checked first, before any
    /// network activity. Once a connection exists it is returned as-is,
    /// even if `fields` names different credentials.
    pub async fn initialize(
        &self,
        fields: &HashMap<String, String>,
        connector: &dyn Connector,
    ) -> Result<Arc<Connection>, CoreError> {
        let credentials = CredentialSet::from_fields(fields).inspect_err(|e| {
            error!(error = %e, "state client configuration rejected");
        })?;

        if let Some(existing) = self.cell.get() {
            debug!(project_id = existing.project_id(), "reusing existing connection");
            return Ok(Arc::clone(existing));
        }

        let database_url = database_url_for(&credentials.project_id)?;

        let connection = self
            .cell
            .get_or_try_init(|| async {
                info!(
                    project_id = %credentials.project_id,
                    database_url = %database_url,
                    "connecting to backend"
                );
                match connector.connect(&credentials, &database_url).await {
                    Ok(conn) => {
                        info!(project_id = conn.project_id(), "backend connection established");
                        Ok(Arc::new(conn))
                    }
                    Err(source) => {
                        error!(error = %source, "backend initialization failed");
                        Err(CoreError::BackendInit { source })
                    }
                }
            })
            .await?;

        Ok(Arc::clone(connection))
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    pub fn get(&self) -> Option<Arc<Connection>> {
        self.cell.get().cloned()
    }
}
