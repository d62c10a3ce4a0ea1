// aief-core: Managed remote state client between aief-api and its consumers.

pub mod backend;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod registry;
pub mod retry;

// ── Primary re-exports ──────────────────────────────────────────────
pub use backend::{DocumentBackend, ListenerGuard, RealtimeBackend};
pub use client::StateClient;
pub use config::{CollectionMap, CollectionRole, CredentialSet, OperationalSettings};
pub use connection::{Connection, ConnectionCell, Connector, FirebaseConnector, database_url_for};
pub use error::{CoreError, ErrorKind};
pub use registry::{BoxError, ChangeCallback, DocumentSnapshot, SubscriptionId, SubscriptionRegistry};
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};

// Wire-level types that appear in this crate's signatures.
pub use aief_api::{Document, SnapshotSink};
