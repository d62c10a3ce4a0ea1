// ── Remote state client ──
//
// The entry point consumers use: initialize once, then read and write
// documents and subscribe to their changes. Document calls go through the
// retry policy; subscriptions go through the registry. Writes land in the
// document store first and are then mirrored into the real-time tree at
// `/{collection}/{document_id}`, which is where subscriptions listen.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use aief_api::Document;

use crate::config::{CollectionRole, OperationalSettings};
use crate::connection::{Connection, ConnectionCell, Connector};
use crate::error::CoreError;
use crate::registry::{BoxError, DocumentSnapshot, SubscriptionId, SubscriptionRegistry, tree_path};
use crate::retry::{RetryPolicy, Sleeper, TokioSleeper};

static GLOBAL: LazyLock<StateClient> = LazyLock::new(StateClient::default);

/// Document CRUD and change subscriptions over one shared connection.
pub struct StateClient {
    cell: ConnectionCell,
    settings: RwLock<OperationalSettings>,
    registry: SubscriptionRegistry,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for StateClient {
    fn default() -> Self {
        Self::new(OperationalSettings::default())
    }
}

impl std::fmt::Debug for StateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateClient")
            .field("connection", &self.cell)
            .field("settings", &*self.settings.read())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl StateClient {
    pub fn new(settings: OperationalSettings) -> Self {
        Self {
            cell: ConnectionCell::new(),
            settings: RwLock::new(settings),
            registry: SubscriptionRegistry::new(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replace the pause used between retries.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// The process-wide client. Its connection is established by the
    /// first successful `initialize` and kept for the process lifetime.
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    pub fn settings(&self) -> OperationalSettings {
        self.settings.read().clone()
    }

    /// Takes effect for calls started afterwards.
    pub fn set_settings(&self, settings: OperationalSettings) {
        *self.settings.write() = settings;
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Establish the shared connection, or return the existing one.
    pub async fn initialize(
        &self,
        fields: &HashMap<String, String>,
        connector: &dyn Connector,
    ) -> Result<Arc<Connection>, CoreError> {
        self.cell.initialize(fields, connector).await
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.is_initialized()
    }

    pub fn connection(&self) -> Result<Arc<Connection>, CoreError> {
        self.cell.get().ok_or(CoreError::NotInitialized)
    }

    // ── Document operations ──────────────────────────────────────────

    /// Create or fully overwrite a document. `data` must be a JSON object.
    pub async fn save_document(
        &self,
        collection: &str,
        document_id: &str,
        data: Value,
    ) -> Result<bool, CoreError> {
        let connection = self.connection()?;
        let settings = self.settings();
        let collection = resolve_collection(&settings, collection)?;
        validate_document_id(document_id)?;

        let fields = match data {
            Value::Object(fields) => fields,
            other => {
                return Err(CoreError::Config {
                    message: format!("document data must be a JSON object, got {}", type_name(&other)),
                    field: Some("data"),
                });
            }
        };

        let documents = connection.documents();
        let realtime = connection.realtime();
        let name = collection.as_str();
        let path = tree_path(name, document_id);
        let path = path.as_str();
        let mirror = Value::Object(fields.clone());
        let (fields, mirror) = (&fields, &mirror);
        self.policy(&settings)
            .run("save_document", move || async move {
                documents.set_document(name, document_id, fields).await?;
                realtime.set_value(path, mirror).await
            })
            .await?;

        info!(collection = name, document_id, "document saved");
        Ok(true)
    }

    /// `Ok(None)` when the document does not exist.
    pub async fn get_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<Document>, CoreError> {
        let connection = self.connection()?;
        let settings = self.settings();
        let collection = resolve_collection(&settings, collection)?;
        validate_document_id(document_id)?;

        let documents = connection.documents();
        let name = collection.as_str();
        let doc = self
            .policy(&settings)
            .run("get_document", move || documents.get_document(name, document_id))
            .await?;

        debug!(collection = name, document_id, found = doc.is_some(), "document fetched");
        Ok(doc)
    }

    pub async fn delete_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<bool, CoreError> {
        let connection = self.connection()?;
        let settings = self.settings();
        let collection = resolve_collection(&settings, collection)?;
        validate_document_id(document_id)?;

        let documents = connection.documents();
        let realtime = connection.realtime();
        let name = collection.as_str();
        let path = tree_path(name, document_id);
        let path = path.as_str();
        self.policy(&settings)
            .run("delete_document", move || async move {
                documents.delete_document(name, document_id).await?;
                realtime.delete_value(path).await
            })
            .await?;

        info!(collection = name, document_id, "document deleted");
        Ok(true)
    }

    /// Every document in a collection.
    pub async fn query_collection(&self, collection: &str) -> Result<Vec<Document>, CoreError> {
        let connection = self.connection()?;
        let settings = self.settings();
        let collection = resolve_collection(&settings, collection)?;

        let documents = connection.documents();
        let name = collection.as_str();
        let docs = self
            .policy(&settings)
            .run("query_collection", move || documents.list_documents(name))
            .await?;

        debug!(collection = name, count = docs.len(), "collection queried");
        Ok(docs)
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Call `callback` with the new snapshot whenever the document at
    /// `document_path` changes. Callback errors and panics are logged and
    /// never reach other callbacks.
    pub fn subscribe<F>(
        &self,
        collection: &str,
        document_path: &str,
        callback: F,
    ) -> Result<SubscriptionId, CoreError>
    where
        F: Fn(&DocumentSnapshot) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        let connection = self.connection()?;
        let collection = resolve_collection(&self.settings.read(), collection)?;
        if document_path.trim_matches('/').is_empty() {
            return Err(CoreError::Config {
                message: "document path must not be empty".into(),
                field: Some("document_path"),
            });
        }

        self.registry
            .subscribe(
                connection.realtime(),
                &collection,
                document_path,
                Arc::new(callback),
            )
            .map_err(|source| CoreError::Operation {
                operation: "subscribe".into(),
                attempts: 1,
                source,
            })
    }

    /// Remove one subscription. `false` if the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.subscription_count()
    }

    pub fn listener_count(&self) -> usize {
        self.registry.listener_count()
    }

    fn policy(&self, settings: &OperationalSettings) -> RetryPolicy {
        RetryPolicy::new(settings, Arc::clone(&self.sleeper))
    }
}

// ── Argument validation ──────────────────────────────────────────────

/// A role name maps through the settings; any other plain name is used
/// as the backend collection name.
fn resolve_collection(settings: &OperationalSettings, name: &str) -> Result<String, CoreError> {
    if let Ok(role) = name.parse::<CollectionRole>() {
        return Ok(settings.collections.get(role).to_owned());
    }
    if name.is_empty() || name.contains('/') {
        return Err(CoreError::Config {
            message: format!("invalid collection name '{name}'"),
            field: Some("collection"),
        });
    }
    Ok(name.to_owned())
}

fn validate_document_id(document_id: &str) -> Result<(), CoreError> {
    if document_id.is_empty() || document_id.contains('/') {
        return Err(CoreError::Config {
            message: format!("invalid document id '{document_id}'"),
            field: Some("document_id"),
        });
    }
    Ok(())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
