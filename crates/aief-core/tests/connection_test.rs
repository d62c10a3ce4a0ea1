#![allow(clippy::unwrap_used)]
// Connection lifecycle: single construction, field validation, failures,
// and the Firebase connector against a mock server.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use url::Url;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use aief_api::TransportConfig;
use aief_core::{
    ConnectionCell, CoreError, DocumentBackend, ErrorKind, FirebaseConnector, StateClient,
};
use common::{FakeConnector, permission_denied, unavailable, valid_fields};

const TEST_KEY: &str = include_str!("fixtures/test_key.pem");
const DOCS: &str = "/v1/projects/demo/databases/(default)/documents";

#[tokio::test]
async fn test_initialize_twice_reuses_connection() {
    let cell = ConnectionCell::new();
    let connector = FakeConnector::new();

    let first = cell.initialize(&valid_fields(), &connector).await.unwrap();
    let second = cell.initialize(&valid_fields(), &connector).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(connector.calls(), 1);
    assert!(cell.is_initialized());
    assert_eq!(first.project_id(), "demo");
    assert_eq!(first.database_url().as_str(), "https://demo.firebaseio.com/");
}

#[tokio::test]
async fn test_existing_connection_ignores_new_credentials() {
    let cell = ConnectionCell::new();
    let connector = FakeConnector::new();

    let first = cell.initialize(&valid_fields(), &connector).await.unwrap();

    let mut other = valid_fields();
    other.insert("project_id".into(), "another-project".into());
    let second = cell.initialize(&other, &connector).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.project_id(), "demo");
    assert_eq!(connector.calls(), 1);
}

#[tokio::test]
async fn test_missing_required_field_fails_before_connecting() {
    for field in ["project_id", "private_key", "client_email"] {
        let cell = ConnectionCell::new();
        let connector = FakeConnector::new();

        let mut fields = valid_fields();
        fields.remove(field);

        let err = cell.initialize(&fields, &connector).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(err.field(), Some(field));
        assert!(err.to_string().contains(field), "error should name {field}: {err}");
        assert_eq!(connector.calls(), 0);
        assert!(!cell.is_initialized());
    }
}

#[tokio::test]
async fn test_empty_required_field_is_missing() {
    let cell = ConnectionCell::new();
    let connector = FakeConnector::new();

    let mut fields = valid_fields();
    fields.insert("client_email".into(), String::new());

    let err = cell.initialize(&fields, &connector).await.unwrap_err();
    assert_eq!(err.field(), Some("client_email"));
    assert_eq!(connector.calls(), 0);
}

#[tokio::test]
async fn test_backend_failure_is_distinct_and_retryable() {
    let cell = ConnectionCell::new();
    let connector = FakeConnector::new();
    connector.fail_with(permission_denied);

    let err = cell.initialize(&valid_fields(), &connector).await.unwrap_err();

    match err {
        CoreError::BackendInit { ref source } => {
            assert_eq!(source.api_error_code(), Some("PERMISSION_DENIED"));
        }
        ref other => panic!("expected BackendInit, got: {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::BackendInit);
    assert!(!cell.is_initialized());

    // A later call may succeed once the backend accepts the credentials.
    connector.succeed();
    cell.initialize(&valid_fields(), &connector).await.unwrap();
    assert!(cell.is_initialized());
    assert_eq!(connector.calls(), 2);
}

#[tokio::test]
async fn test_transient_init_failure_is_reported_as_such() {
    let cell = ConnectionCell::new();
    let connector = FakeConnector::new();
    connector.fail_with(unavailable);

    let err = cell.initialize(&valid_fields(), &connector).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendInit);
    assert!(err.is_transient());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_initializers_share_one_connection() {
    let cell = ConnectionCell::new();
    let connector = FakeConnector::slow(Duration::from_millis(100));
    let fields = valid_fields();

    let (a, b, c) = tokio::join!(
        cell.initialize(&fields, &connector),
        cell.initialize(&fields, &connector),
        cell.initialize(&fields, &connector),
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&b, &c));
    assert_eq!(connector.calls(), 1);
}

#[tokio::test]
async fn test_state_client_exposes_initialization() {
    let client = StateClient::default();
    let connector = FakeConnector::new();

    assert!(!client.is_initialized());
    assert!(matches!(client.connection(), Err(CoreError::NotInitialized)));

    let conn = client.initialize(&valid_fields(), &connector).await.unwrap();

    assert!(client.is_initialized());
    assert!(Arc::ptr_eq(&conn, &client.connection().unwrap()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_initializers_on_many_tasks_share_one_connection() {
    let cell = Arc::new(ConnectionCell::new());
    let connector = Arc::new(FakeConnector::slow(Duration::from_millis(50)));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let cell = Arc::clone(&cell);
            let connector = Arc::clone(&connector);
            tokio::spawn(async move { cell.initialize(&valid_fields(), connector.as_ref()).await })
        })
        .collect();

    let mut connections = Vec::new();
    for task in tasks {
        connections.push(task.await.unwrap().unwrap());
    }

    assert_eq!(connector.calls(), 1);
    assert!(connections.iter().all(|c| Arc::ptr_eq(c, &connections[0])));
}

// ── Firebase connector ──────────────────────────────────────────────

fn signing_fields() -> HashMap<String, String> {
    let mut fields = valid_fields();
    fields.insert("private_key".into(), TEST_KEY.to_owned());
    fields
}

fn firebase(server: &MockServer) -> FirebaseConnector {
    FirebaseConnector::new(TransportConfig::default())
        .with_token_uri(format!("{}/token", server.uri()))
        .with_firestore_base(Url::parse(&format!("{}/v1/", server.uri())).unwrap())
        .with_database_url(Url::parse(&server.uri()).unwrap())
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "test-token",
            "expires_in": 3600,
            "token_type": "Bearer"
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_firebase_connector_exchanges_token_once() {
    let server = MockServer::start().await;
    mount_token(&server).await;

    Mock::given(method("GET"))
        .and(path(format!("{DOCS}/strategies/s1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "projects/demo/databases/(default)/documents/strategies/s1",
            "fields": { "v": { "integerValue": "1" } }
        })))
        .mount(&server)
        .await;

    let cell = ConnectionCell::new();
    let conn = cell.initialize(&signing_fields(), &firebase(&server)).await.unwrap();

    assert_eq!(conn.project_id(), "demo");
    assert_eq!(conn.database_url().as_str(), format!("{}/", server.uri()));

    let doc = conn.documents().get_document("strategies", "s1").await.unwrap().unwrap();
    assert_eq!(doc.id, "s1");
    assert_eq!(doc.data(), json!({ "v": 1 }));
}

#[tokio::test]
async fn test_firebase_connector_rejected_credentials_fail_init() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Invalid JWT Signature."
        })))
        .expect(1)
        .mount(&server)
        .await;

    let cell = ConnectionCell::new();
    let err = cell
        .initialize(&signing_fields(), &firebase(&server))
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::BackendInit { .. }), "got: {err:?}");
    assert_eq!(err.kind(), ErrorKind::BackendInit);
    assert!(!err.is_transient());
    assert!(!cell.is_initialized());
}

#[tokio::test]
async fn test_saved_document_is_mirrored_to_the_realtime_tree() {
    let server = MockServer::start().await;
    mount_token(&server).await;

    Mock::given(method("PATCH"))
        .and(path(format!("{DOCS}/strategies/s1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "projects/demo/databases/(default)/documents/strategies/s1",
            "fields": { "v": { "integerValue": "1" } }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/strategies/s1.json"))
        .and(query_param("access_token", "test-token"))
        .and(body_json(json!({ "v": 1 })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{DOCS}/strategies/s1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/strategies/s1.json"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = StateClient::default();
    client.initialize(&signing_fields(), &firebase(&server)).await.unwrap();

    assert!(client.save_document("strategies", "s1", json!({ "v": 1 })).await.unwrap());
    assert!(client.delete_document("strategies", "s1").await.unwrap());
}
