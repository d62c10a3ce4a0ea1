// ── Backend seams ──
//
// The two views a connection exposes: a structured document store and a
// hierarchical real-time tree. Document writes land in both, so listeners
// on the tree see them. The Firebase clients from `aief-api` implement
// them; tests substitute in-memory fakes.

use async_trait::async_trait;
use serde_json::{Map, Value};

use aief_api::realtime::SnapshotSink;
use aief_api::{Document, Error, FirestoreClient, ListenerHandle, RealtimeClient};

/// Structured document operations against one project.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Create or fully replace `{collection}/{document_id}`.
    async fn set_document(
        &self,
        collection: &str,
        document_id: &str,
        data: &Map<String, Value>,
    ) -> Result<(), Error>;

    /// `Ok(None)` when the document does not exist.
    async fn get_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<Document>, Error>;

    async fn delete_document(&self, collection: &str, document_id: &str) -> Result<(), Error>;

    /// Every document of one collection.
    async fn list_documents(&self, collection: &str) -> Result<Vec<Document>, Error>;
}

/// A live backend listener. Dropping the guard tears the listener down.
pub trait ListenerGuard: Send + Sync {
    fn path(&self) -> &str;
}

/// Real-time tree: writes and change listeners.
#[async_trait]
pub trait RealtimeBackend: Send + Sync {
    /// Start delivering the value under `path` to `sink` after every change.
    ///
    /// Implementations must not call `sink` before returning.
    fn listen(&self, path: &str, sink: SnapshotSink) -> Result<Box<dyn ListenerGuard>, Error>;

    /// Replace the value under `path`.
    async fn set_value(&self, path: &str, value: &Value) -> Result<(), Error>;

    /// Remove the value under `path`.
    async fn delete_value(&self, path: &str) -> Result<(), Error>;
}

// ── Firebase implementations ─────────────────────────────────────────

#[async_trait]
impl DocumentBackend for FirestoreClient {
    async fn set_document(
        &self,
        collection: &str,
        document_id: &str,
        data: &Map<String, Value>,
    ) -> Result<(), Error> {
        FirestoreClient::set_document(self, collection, document_id, data)
            .await
            .map(|_| ())
    }

    async fn get_document(
        &self,
        collection: &str,
        document_id: &str,
    ) -> Result<Option<Document>, Error> {
        FirestoreClient::get_document(self, collection, document_id).await
    }

    async fn delete_document(&self, collection: &str, document_id: &str) -> Result<(), Error> {
        FirestoreClient::delete_document(self, collection, document_id).await
    }

    async fn list_documents(&self, collection: &str) -> Result<Vec<Document>, Error> {
        FirestoreClient::list_documents(self, collection).await
    }
}

impl ListenerGuard for ListenerHandle {
    fn path(&self) -> &str {
        ListenerHandle::path(self)
    }
}

#[async_trait]
impl RealtimeBackend for RealtimeClient {
    fn listen(&self, path: &str, sink: SnapshotSink) -> Result<Box<dyn ListenerGuard>, Error> {
        let handle = RealtimeClient::listen(self, path, sink)?;
        Ok(Box::new(handle))
    }

    async fn set_value(&self, path: &str, value: &Value) -> Result<(), Error> {
        RealtimeClient::set_value(self, path, value).await
    }

    async fn delete_value(&self, path: &str) -> Result<(), Error> {
        RealtimeClient::delete_value(self, path).await
    }
}
