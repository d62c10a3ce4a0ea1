//! Realtime Database client: one-shot REST calls plus streaming listeners.
//!
//! A listener opens `GET {database}/{path}.json` with
//! `Accept: text/event-stream` and keeps a local copy of the JSON tree under
//! that path, applying every `put`/`patch` the server streams. After each
//! change the full current value is handed to the listener's sink. Dropped
//! streams reconnect with exponential backoff + jitter; every reconnect
//! fetches a fresh token.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! let handle = realtime.listen("strategies/momentum", Arc::new(|value| {
//!     println!("now: {value}");
//! }))?;
//!
//! // Dropping the handle tears the stream down.
//! drop(handle);
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::auth::TokenProvider;
use crate::error::Error;

/// Host suffix of production Realtime Database instances.
pub const DATABASE_HOST: &str = "firebaseio.com";

/// Receives the full value under a listener's path after every change.
/// `Value::Null` means nothing is stored there.
pub type SnapshotSink = Arc<dyn Fn(Value) + Send + Sync>;

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for stream reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum consecutive failed attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── ListenerHandle ───────────────────────────────────────────────────

/// Handle to a running listener. Dropping it stops the background task.
#[derive(Debug)]
pub struct ListenerHandle {
    path: String,
    cancel: CancellationToken,
}

impl ListenerHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Signal the background task to stop.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── RealtimeClient ───────────────────────────────────────────────────

/// HTTP client for one Realtime Database instance.
pub struct RealtimeClient {
    http: reqwest::Client,
    stream_http: reqwest::Client,
    database_url: Url,
    tokens: Arc<TokenProvider>,
    reconnect: ReconnectConfig,
    /// Runtime listener tasks are spawned on.
    runtime: Option<Handle>,
}

impl RealtimeClient {
    /// `http` serves one-shot calls; `stream_http` must not carry an
    /// overall request timeout, since event streams stay open.
    ///
    /// When called inside a tokio runtime, that runtime is remembered and
    /// listeners may later be started from any thread.
    pub fn new(
        http: reqwest::Client,
        stream_http: reqwest::Client,
        database_url: Url,
        tokens: Arc<TokenProvider>,
    ) -> Result<Self, Error> {
        if database_url.cannot_be_a_base() {
            return Err(Error::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase));
        }
        Ok(Self {
            http,
            stream_http,
            database_url,
            tokens,
            reconnect: ReconnectConfig::default(),
            runtime: Handle::try_current().ok(),
        })
    }

    /// Spawn listener tasks on `runtime`.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn database_url(&self) -> &Url {
        &self.database_url
    }

    /// `{database}/{a}/{b}.json` for path `a/b`; `{database}/.json` for the root.
    pub fn path_url(&self, path: &str) -> Url {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut url = self.database_url.clone();
        if let Ok(mut p) = url.path_segments_mut() {
            p.pop_if_empty();
            match segments.split_last() {
                Some((last, parents)) => {
                    p.extend(parents);
                    p.push(&format!("{last}.json"));
                }
                None => {
                    p.push(".json");
                }
            }
        }
        url
    }

    // ── One-shot calls ───────────────────────────────────────────────

    /// Read the value stored under `path` (`Value::Null` if empty).
    pub async fn get_value(&self, path: &str) -> Result<Value, Error> {
        let token = self.tokens.access_token().await?;
        debug!(path, "GET realtime value");

        let resp = self
            .http
            .get(self.path_url(path))
            .query(&[("access_token", token.expose_secret())])
            .send()
            .await?;
        parse_response(resp).await
    }

    /// Replace the value stored under `path`.
    pub async fn set_value(&self, path: &str, value: &Value) -> Result<(), Error> {
        let token = self.tokens.access_token().await?;
        debug!(path, "PUT realtime value");

        let resp = self
            .http
            .put(self.path_url(path))
            .query(&[("access_token", token.expose_secret()), ("print", "silent")])
            .json(value)
            .send()
            .await?;

        check_status(resp).await
    }

    /// Remove everything stored under `path`. Removing an empty path
    /// succeeds.
    pub async fn delete_value(&self, path: &str) -> Result<(), Error> {
        let token = self.tokens.access_token().await?;
        debug!(path, "DELETE realtime value");

        let resp = self
            .http
            .delete(self.path_url(path))
            .query(&[("access_token", token.expose_secret()), ("print", "silent")])
            .send()
            .await?;

        check_status(resp).await
    }

    // ── Streaming ────────────────────────────────────────────────────

    /// Start streaming changes under `path` into `sink`.
    ///
    /// Returns immediately; the connection is made on a spawned task. The
    /// task runs on the runtime captured at construction, else on the
    /// caller's current runtime. With neither, this fails with
    /// [`Error::Stream`].
    pub fn listen(&self, path: &str, sink: SnapshotSink) -> Result<ListenerHandle, Error> {
        let runtime = match self.runtime {
            Some(ref handle) => handle.clone(),
            None => Handle::try_current().map_err(|e| {
                Error::Stream(format!("no tokio runtime to run the listener on: {e}"))
            })?,
        };

        let cancel = CancellationToken::new();
        let task = ListenTask {
            http: self.stream_http.clone(),
            url: self.path_url(path),
            path: path.to_owned(),
            tokens: Arc::clone(&self.tokens),
            reconnect: self.reconnect.clone(),
            sink,
            cancel: cancel.clone(),
        };

        runtime.spawn(listen_loop(task));

        Ok(ListenerHandle {
            path: path.to_owned(),
            cancel,
        })
    }
}

// ── Background listener loop ─────────────────────────────────────────

struct ListenTask {
    http: reqwest::Client,
    url: Url,
    path: String,
    tokens: Arc<TokenProvider>,
    reconnect: ReconnectConfig,
    sink: SnapshotSink,
    cancel: CancellationToken,
}

/// Main loop: connect → read → on error, backoff → reconnect.
async fn listen_loop(task: ListenTask) {
    let mut attempt: u32 = 0;
    let mut tree = Value::Null;

    loop {
        let delay = tokio::select! {
            biased;
            () = task.cancel.cancelled() => break,
            result = connect_and_read(&task, &mut tree) => match result {
                // Stream ended without an error. Reset the counter, but
                // still pause so a server that closes at once is not hammered.
                Ok(()) => {
                    info!(path = %task.path, "event stream ended, reconnecting");
                    attempt = 0;
                    task.reconnect.initial_delay
                }
                Err(Error::ListenerCancelled(reason)) => {
                    warn!(path = %task.path, %reason, "listener cancelled by server");
                    break;
                }
                Err(e) => {
                    if e.is_auth_expired() {
                        task.tokens.invalidate().await;
                    }
                    warn!(path = %task.path, error = %e, attempt, "event stream error");

                    if let Some(max) = task.reconnect.max_retries {
                        if attempt >= max {
                            warn!(
                                path = %task.path,
                                max_retries = max,
                                "listener reconnection limit reached, giving up"
                            );
                            break;
                        }
                    }

                    let delay = calculate_backoff(attempt, &task.reconnect);
                    attempt += 1;
                    delay
                }
            }
        };

        debug!(path = %task.path, delay_ms = delay.as_millis(), "waiting before reconnect");
        tokio::select! {
            biased;
            () = task.cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    debug!(path = %task.path, "listener loop exiting");
}

/// Open one event stream and apply events until it ends.
async fn connect_and_read(task: &ListenTask, tree: &mut Value) -> Result<(), Error> {
    let token = task.tokens.access_token().await?;

    let resp = task
        .http
        .get(task.url.clone())
        .query(&[("access_token", token.expose_secret())])
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await?;
        let err = rtdb_error(status.as_u16(), &body);
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::ListenerCancelled(err.to_string()));
        }
        return Err(err);
    }

    info!(path = %task.path, "event stream connected");

    let mut stream = resp.bytes_stream();
    let mut decoder = SseDecoder::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::Stream(e.to_string()))?;
        for event in decoder.feed(&chunk) {
            if apply_event(tree, &event)? {
                (task.sink)(tree.clone());
            }
        }
    }

    Ok(())
}

// ── Server-sent event parsing ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct SseEvent {
    event: String,
    data: String,
}

/// Incremental decoder; chunks may split events (and UTF-8 sequences)
/// at arbitrary byte offsets.
#[derive(Debug, Default)]
struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend(chunk.iter().filter(|b| **b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buf.drain(..end + 2).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block[..end])) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = String::new();
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = line
            .split_once(':')
            .map_or((line, ""), |(f, v)| (f, v.strip_prefix(' ').unwrap_or(v)));
        match field {
            "event" => value.clone_into(&mut event),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_empty() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

#[derive(Debug, Deserialize)]
struct PathData {
    path: String,
    data: Value,
}

/// Apply one event to the local tree. Returns `true` when the tree changed
/// and should be delivered.
fn apply_event(tree: &mut Value, event: &SseEvent) -> Result<bool, Error> {
    match event.event.as_str() {
        "put" => {
            let PathData { path, data } = parse_path_data(&event.data)?;
            set_at(tree, &path, data);
            Ok(true)
        }
        "patch" => {
            let PathData { path, data } = parse_path_data(&event.data)?;
            let Value::Object(children) = data else {
                return Err(Error::Stream(format!("patch payload is not an object: {data}")));
            };
            for (key, value) in children {
                set_at(tree, &format!("{path}/{key}"), value);
            }
            Ok(true)
        }
        "keep-alive" => {
            trace!("event stream keep-alive");
            Ok(false)
        }
        "cancel" => Err(Error::ListenerCancelled(event.data.clone())),
        "auth_revoked" => Err(Error::TokenExpired),
        other => {
            debug!(event = other, "ignoring unknown stream event");
            Ok(false)
        }
    }
}

fn parse_path_data(data: &str) -> Result<PathData, Error> {
    serde_json::from_str(data).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: data.to_owned(),
    })
}

/// Write `data` at `path` below `root`, creating parents as needed.
/// Writing `null` removes the child; parents left empty are pruned, as
/// the database never stores empty nodes.
fn set_at(root: &mut Value, path: &str, data: Value) {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    set_segments(root, &segments, data);
    if root.as_object().is_some_and(Map::is_empty) {
        *root = Value::Null;
    }
}

fn set_segments(node: &mut Value, segments: &[&str], data: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *node = data;
        return;
    };

    if !node.is_object() {
        if data.is_null() {
            return;
        }
        *node = Value::Object(Map::new());
    }

    if let Value::Object(map) = node {
        let child = map.entry((*first).to_owned()).or_insert(Value::Null);
        set_segments(child, rest, data);

        let vacant = map
            .get(*first)
            .is_some_and(|v| v.is_null() || v.as_object().is_some_and(Map::is_empty));
        if vacant {
            map.remove(*first);
        }
    }
}

// ── Responses ────────────────────────────────────────────────────────

/// Realtime Database error body: `{"error": "Permission denied"}`.
#[derive(Debug, Deserialize)]
struct RtdbError {
    error: String,
}

fn rtdb_error(status: u16, body: &str) -> Error {
    let message = serde_json::from_str::<RtdbError>(body).map_or_else(|_| body.to_owned(), |e| e.error);
    Error::Api {
        message,
        code: None,
        status,
    }
}

async fn check_status(resp: reqwest::Response) -> Result<(), Error> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await?;
        return Err(rtdb_error(status.as_u16(), &body));
    }
    Ok(())
}

async fn parse_response(resp: reqwest::Response) -> Result<Value, Error> {
    let status = resp.status();
    let body = resp.text().await?;

    if !status.is_success() {
        return Err(rtdb_error(status.as_u16(), &body));
    }

    serde_json::from_str(&body).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body,
    })
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is +-25% to spread out reconnection storms from many listeners.
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic "jitter" seeded from the attempt number.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────
