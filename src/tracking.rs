//! Fire-and-forget usage tracking and security event logging.
//!
//! Guard decisions must never wait on, or fail because of, the audit trail.
//! [`Tracker`] hands every record to a detached task tracked by a
//! `TaskTracker`; a store failure is logged at `warn` and counted in metrics,
//! never returned to the request path.
//!
//! # Stores
//!
//! - [`JsonLinesStore`]: appends one JSON object per line to a file
//! - [`MemoryStore`]: bounded in-memory ring for tests and embedders
//!
//! With no store configured, tracking is a no-op.

use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::metrics;
use crate::models::{SecurityEvent, UsageRecord};

/// Why a record could not be persisted.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Boxed future returned by [`EventStore`] methods.
pub type StoreFuture<'a> = Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>>;

/// Destination for usage records and security events.
pub trait EventStore: Send + Sync {
    fn append_usage(&self, record: UsageRecord) -> StoreFuture<'_>;
    fn append_security_event(&self, event: SecurityEvent) -> StoreFuture<'_>;
}

/// Line layout of [`JsonLinesStore`]: `{"type":"usage", ...record}`.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StoredLine<'a> {
    Usage(&'a UsageRecord),
    SecurityEvent(&'a SecurityEvent),
}

/// Appends records to a JSON Lines file.
///
/// Writes are serialized through an async mutex so concurrent lines never
/// interleave.
#[derive(Debug)]
pub struct JsonLinesStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonLinesStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append_line(&self, line: StoredLine<'_>) -> Result<(), StoreError> {
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        Ok(())
    }
}

impl EventStore for JsonLinesStore {
    fn append_usage(&self, record: UsageRecord) -> StoreFuture<'_> {
        Box::pin(async move { self.append_line(StoredLine::Usage(&record)).await })
    }

    fn append_security_event(&self, event: SecurityEvent) -> StoreFuture<'_> {
        Box::pin(async move { self.append_line(StoredLine::SecurityEvent(&event)).await })
    }
}

/// Keeps the most recent records in memory.
#[derive(Debug)]
pub struct MemoryStore {
    capacity: usize,
    usage: Mutex<VecDeque<UsageRecord>>,
    events: Mutex<VecDeque<SecurityEvent>>,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            usage: Mutex::new(VecDeque::new()),
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage
            .lock()
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn security_events(&self) -> Vec<SecurityEvent> {
        self.events
            .lock()
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn push<T>(&self, queue: &Mutex<VecDeque<T>>, item: T) -> Result<(), StoreError> {
        let mut queue = queue
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        if queue.len() == self.capacity {
            queue.pop_front();
        }
        queue.push_back(item);
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventStore for MemoryStore {
    fn append_usage(&self, record: UsageRecord) -> StoreFuture<'_> {
        let result = self.push(&self.usage, record);
        Box::pin(async move { result })
    }

    fn append_security_event(&self, event: SecurityEvent) -> StoreFuture<'_> {
        let result = self.push(&self.events, event);
        Box::pin(async move { result })
    }
}

/// Persist a usage record, swallowing and logging any failure.
///
/// A missing store is a no-op.
pub async fn track_api_key_usage(store: Option<&dyn EventStore>, record: UsageRecord) {
    let Some(store) = store else {
        return;
    };
    let operation = record.operation.clone();
    if let Err(e) = store.append_usage(record).await {
        warn!(error = %e, operation = %operation, "Failed to record API key usage");
        metrics::record_tracking_failure("usage");
    }
}

/// Persist a security event, swallowing and logging any failure.
pub async fn log_security_event(store: Option<&dyn EventStore>, event: SecurityEvent) {
    let Some(store) = store else {
        return;
    };
    let kind = event.kind;
    if let Err(e) = store.append_security_event(event).await {
        warn!(error = %e, kind = kind.as_str(), "Failed to log security event");
        metrics::record_tracking_failure("security_event");
    }
}

/// Detached, non-blocking front end over an optional [`EventStore`].
///
/// Cloning is cheap; clones share the store and the task tracker.
#[derive(Clone, Default)]
pub struct Tracker {
    store: Option<Arc<dyn EventStore>>,
    tasks: TaskTracker,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("enabled", &self.store.is_some())
            .field("pending", &self.tasks.len())
            .finish()
    }
}

impl Tracker {
    pub fn new(store: Option<Arc<dyn EventStore>>) -> Self {
        Self {
            store,
            tasks: TaskTracker::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Record usage in the background. Returns immediately.
    pub fn track_api_key_usage(&self, record: UsageRecord) {
        let Some(store) = self.store.clone() else {
            return;
        };
        self.spawn(async move { track_api_key_usage(Some(store.as_ref()), record).await });
    }

    /// Log a security event in the background. Returns immediately.
    pub fn log_security_event(&self, event: SecurityEvent) {
        let Some(store) = self.store.clone() else {
            return;
        };
        self.spawn(async move { log_security_event(Some(store.as_ref()), event).await });
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                self.tasks.spawn_on(task, &handle);
            }
            Err(_) => debug!("No async runtime available, dropping tracking record"),
        }
    }

    /// Wait for every pending write to finish.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::{Outcome, SecurityEventKind};

    struct FailingStore;

    impl EventStore for FailingStore {
        fn append_usage(&self, _record: UsageRecord) -> StoreFuture<'_> {
            Box::pin(async { Err(StoreError::Unavailable("down".to_string())) })
        }

        fn append_security_event(&self, _event: SecurityEvent) -> StoreFuture<'_> {
            Box::pin(async { Err(StoreError::Unavailable("down".to_string())) })
        }
    }

    #[tokio::test]
    async fn test_tracker_writes_to_memory_store() {
        let store = Arc::new(MemoryStore::default());
        let tracker = Tracker::new(Some(store.clone()));

        tracker.track_api_key_usage(
            UsageRecord::new("api_key_saved", "user-1", Outcome::Allowed).with_provider("openai"),
        );
        tracker.log_security_event(
            SecurityEvent::new(SecurityEventKind::CsrfRejected, Outcome::Blocked)
                .with_identity("user-1"),
        );
        tracker.shutdown().await;

        let usage = store.usage_records();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].provider.as_deref(), Some("openai"));

        let events = store.security_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SecurityEventKind::CsrfRejected);
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed() {
        let store: Arc<dyn EventStore> = Arc::new(FailingStore);
        // Must complete without panicking or returning an error
        track_api_key_usage(
            Some(store.as_ref()),
            UsageRecord::new("chat", "user-1", Outcome::Allowed),
        )
        .await;

        let tracker = Tracker::new(Some(store));
        tracker.log_security_event(SecurityEvent::new(
            SecurityEventKind::RateLimited,
            Outcome::Blocked,
        ));
        tracker.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_store_is_noop() {
        track_api_key_usage(None, UsageRecord::new("chat", "user-1", Outcome::Allowed)).await;
        let tracker = Tracker::disabled();
        assert!(!tracker.is_enabled());
        tracker.track_api_key_usage(UsageRecord::new("chat", "user-1", Outcome::Allowed));
        tracker.shutdown().await;
    }

    #[test]
    fn test_tracker_outside_runtime_does_not_panic() {
        let tracker = Tracker::new(Some(Arc::new(MemoryStore::default())));
        tracker.track_api_key_usage(UsageRecord::new("chat", "user-1", Outcome::Allowed));
    }

    #[test]
    fn test_memory_store_is_bounded() {
        let store = MemoryStore::new(2);
        for id in ["a", "b", "c"] {
            store
                .push(&store.usage, UsageRecord::new("chat", id, Outcome::Allowed))
                .unwrap();
        }
        let kept: Vec<String> = store.usage_records().into_iter().map(|r| r.identity).collect();
        assert_eq!(kept, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_json_lines_store_appends_tagged_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesStore::new(dir.path().join("events.jsonl"));

        store
            .append_usage(UsageRecord::new("api_key_tested", "user-9", Outcome::Allowed))
            .await
            .unwrap();
        store
            .append_security_event(
                SecurityEvent::new(SecurityEventKind::OriginRejected, Outcome::Blocked)
                    .with_context(serde_json::json!({"origin": "https://evil.example"})),
            )
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(store.path()).await.unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "usage");
        assert_eq!(lines[0]["identity"], "user-9");
        assert_eq!(lines[1]["type"], "security_event");
        assert_eq!(lines[1]["kind"], "origin_rejected");
        assert_eq!(lines[1]["context"]["origin"], "https://evil.example");
    }
}
