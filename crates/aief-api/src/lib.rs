// aief-api: Async Rust client for the Firebase REST surfaces (Firestore + Realtime Database)

pub mod auth;
pub mod error;
pub mod firestore;
pub mod realtime;
pub mod transport;

pub use auth::{ServiceAccountKey, TokenProvider};
pub use error::Error;
pub use firestore::{Document, FirestoreClient};
pub use realtime::{ListenerHandle, RealtimeClient, ReconnectConfig, SnapshotSink};
pub use transport::TransportConfig;
