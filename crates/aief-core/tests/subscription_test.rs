#![allow(clippy::unwrap_used)]
// Subscription registry behavior through `StateClient`.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use aief_core::{CollectionMap, DocumentSnapshot, ErrorKind, OperationalSettings, StateClient};
use common::{FakeConnector, permission_denied, valid_fields};

async fn connected() -> (StateClient, FakeConnector) {
    let client = StateClient::default();
    let connector = FakeConnector::new();
    client.initialize(&valid_fields(), &connector).await.unwrap();
    (client, connector)
}

type Log = Arc<Mutex<Vec<(String, Option<Value>)>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

#[tokio::test]
async fn test_two_callbacks_share_one_listener() {
    let (client, connector) = connected().await;
    let realtime = &connector.realtime;
    let (first, second) = (log(), log());

    let l1 = Arc::clone(&first);
    let id1 = client
        .subscribe("strategies", "momentum", move |snap: &DocumentSnapshot| {
            l1.lock().push(("first".into(), snap.data.clone()));
            Ok(())
        })
        .unwrap();
    let l2 = Arc::clone(&second);
    let id2 = client
        .subscribe("strategies", "momentum", move |snap: &DocumentSnapshot| {
            l2.lock().push(("second".into(), snap.data.clone()));
            Ok(())
        })
        .unwrap();

    assert_eq!(realtime.opened(), 1);
    assert_eq!(realtime.paths(), vec!["/strategies/momentum".to_owned()]);
    assert_eq!(client.listener_count(), 1);
    assert_eq!(client.subscription_count(), 2);

    realtime.emit("/strategies/momentum", &json!({ "score": 1 }));
    assert_eq!(first.lock().len(), 1);
    assert_eq!(second.lock().len(), 1);

    // Removing one keeps the listener and the other callback.
    assert!(client.unsubscribe(id1));
    assert_eq!(realtime.live(), 1);
    realtime.emit("/strategies/momentum", &json!({ "score": 2 }));
    assert_eq!(first.lock().len(), 1);
    assert_eq!(second.lock().len(), 2);
    assert_eq!(second.lock()[1].1, Some(json!({ "score": 2 })));

    // Removing the last tears it down.
    assert!(client.unsubscribe(id2));
    assert_eq!(realtime.live(), 0);
    assert_eq!(client.listener_count(), 0);
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test]
async fn test_distinct_paths_get_distinct_listeners() {
    let (client, connector) = connected().await;

    client.subscribe("strategies", "a", |_| Ok(())).unwrap();
    client.subscribe("strategies", "b", |_| Ok(())).unwrap();
    client.subscribe("integration_logs", "a", |_| Ok(())).unwrap();

    assert_eq!(connector.realtime.opened(), 3);
    assert_eq!(client.listener_count(), 3);
}

#[tokio::test]
async fn test_failing_callbacks_do_not_stop_delivery() {
    let (client, connector) = connected().await;
    let seen = log();

    client
        .subscribe("strategies", "s1", |_| Err("callback rejected the snapshot".into()))
        .unwrap();
    client
        .subscribe("strategies", "s1", |_| panic!("callback blew up"))
        .unwrap();
    let sink = Arc::clone(&seen);
    client
        .subscribe("strategies", "s1", move |snap: &DocumentSnapshot| {
            sink.lock().push(("last".into(), snap.data.clone()));
            Ok(())
        })
        .unwrap();

    connector.realtime.emit("/strategies/s1", &json!({ "v": 1 }));
    connector.realtime.emit("/strategies/s1", &Value::Null);

    assert_eq!(
        *seen.lock(),
        vec![("last".to_owned(), Some(json!({ "v": 1 }))), ("last".to_owned(), None)]
    );
}

#[tokio::test]
async fn test_snapshot_names_collection_and_path() {
    let (client, connector) = connected().await;
    let captured: Arc<Mutex<Option<DocumentSnapshot>>> = Arc::new(Mutex::new(None));

    let slot = Arc::clone(&captured);
    client
        .subscribe("performance_metrics", "daily/2026-10-16", move |snap: &DocumentSnapshot| {
            *slot.lock() = Some(snap.clone());
            Ok(())
        })
        .unwrap();

    connector
        .realtime
        .emit("/performance_metrics/daily/2026-10-16", &json!({ "sharpe": 1.4 }));

    let snap = captured.lock().clone().unwrap();
    assert_eq!(snap.collection, "performance_metrics");
    assert_eq!(snap.document_path, "daily/2026-10-16");
    assert!(snap.exists());
}

#[tokio::test]
async fn test_unknown_subscription_id_is_rejected() {
    let (client, _connector) = connected().await;

    let id = client.subscribe("strategies", "s1", |_| Ok(())).unwrap();
    assert!(client.unsubscribe(id));
    assert!(!client.unsubscribe(id));
}

#[tokio::test]
async fn test_empty_document_path_is_config_error() {
    let (client, connector) = connected().await;

    let err = client.subscribe("strategies", "/", |_| Ok(())).unwrap_err();

    assert_eq!(err.field(), Some("document_path"));
    assert_eq!(connector.realtime.opened(), 0);
}

#[tokio::test]
async fn test_saved_document_reaches_subscribers() {
    let (client, connector) = connected().await;
    let seen = log();

    let sink = Arc::clone(&seen);
    client
        .subscribe("strategies", "s1", move |snap: &DocumentSnapshot| {
            sink.lock().push((snap.document_path.clone(), snap.data.clone()));
            Ok(())
        })
        .unwrap();

    client
        .save_document("strategies", "s1", json!({ "score": 0.9 }))
        .await
        .unwrap();
    client.delete_document("strategies", "s1").await.unwrap();

    assert_eq!(
        *seen.lock(),
        vec![
            ("s1".to_owned(), Some(json!({ "score": 0.9 }))),
            ("s1".to_owned(), None),
        ]
    );
    assert_eq!(connector.realtime.value("/strategies/s1"), None);
}

#[tokio::test]
async fn test_failed_mirror_write_fails_the_save() {
    let settings =
        OperationalSettings::new(1, 0.0, Duration::from_secs(30), CollectionMap::default()).unwrap();
    let client = StateClient::new(settings);
    let connector = FakeConnector::new();
    client.initialize(&valid_fields(), &connector).await.unwrap();
    connector.realtime.fail_writes(permission_denied);

    let err = client
        .save_document("strategies", "s1", json!({ "v": 1 }))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Operation);
    assert_eq!(connector.realtime.value("/strategies/s1"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_threads_share_one_listener_per_key() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 50;

    let (client, connector) = connected().await;
    let realtime = &connector.realtime;
    let delivered = Arc::new(AtomicUsize::new(0));

    // While one callback stays registered, churn on the same key reuses
    // its listener.
    let keeper = client.subscribe("strategies", "shared", |_| Ok(())).unwrap();
    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                for _ in 0..ROUNDS {
                    let counter = Arc::clone(&delivered);
                    let id = client
                        .subscribe("strategies", "shared", move |_| {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                    assert_eq!(realtime.opened(), 1);
                    assert_eq!(realtime.live(), 1);
                    assert!(client.unsubscribe(id));
                }
            });
        }
    });
    assert_eq!(realtime.opened(), 1);
    assert!(client.unsubscribe(keeper));
    assert_eq!(realtime.live(), 0);

    // Without a keeper the listener is reopened, but never twice at once.
    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                for _ in 0..ROUNDS {
                    let id = client.subscribe("strategies", "shared", |_| Ok(())).unwrap();
                    assert!(realtime.live() <= 1);
                    assert!(client.unsubscribe(id));
                }
            });
        }
    });

    assert_eq!(realtime.live(), 0);
    assert_eq!(client.listener_count(), 0);
    assert_eq!(client.subscription_count(), 0);
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
}
