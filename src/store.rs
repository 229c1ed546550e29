//! Remote document store seam.
//!
//! The engine never talks to a concrete backend; everything goes through
//! the [`DocumentStore`] trait with opaque JSON values on both sides. The
//! session layer wraps calls it cannot afford to drop in [`with_retry`],
//! which backs off only on rate limiting.
//!
//! ```text
//! session ──► with_retry ──► DocumentStore::{get, filter, create, update, delete}
//!                 │                          │
//!          429? exponential          remote JSON document API
//!          backoff + jitter          (MemoryStore in tests)
//! ```
//!
//! ## Retry defaults
//!
//! | Attempt | Backoff window |
//! |---------|----------------|
//! | 1 → 2   | 0..=500ms      |
//! | 2 → 3   | 0..=1s         |
//! | 3 → 4   | 0..=2s         |
//! | cap     | 8s             |
//!
//! Full jitter: every delay is drawn uniformly from zero to the window, so
//! concurrent clients that got limited together do not retry together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::document::WorkspaceId;

// ───────────────────────────────────────────────────────────────────
// Errors
// ───────────────────────────────────────────────────────────────────

/// Failures surfaced by the store client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend pushed back (HTTP 429 or equivalent). Retryable.
    RateLimited { status: u16 },
    /// No document under this id.
    NotFound(WorkspaceId),
    /// Transport or backend failure. Not retried automatically.
    Backend(String),
    /// A payload could not be encoded or was structurally unusable.
    Serialization(String),
}

impl StoreError {
    pub fn rate_limited() -> Self {
        StoreError::RateLimited { status: 429 }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, StoreError::RateLimited { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::RateLimited { status } => {
                write!(f, "rate limited by store (status {status})")
            }
            StoreError::NotFound(id) => write!(f, "workspace {id} not found"),
            StoreError::Backend(msg) => write!(f, "store backend error: {msg}"),
            StoreError::Serialization(msg) => write!(f, "serialization error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

// ───────────────────────────────────────────────────────────────────
// Store trait
// ───────────────────────────────────────────────────────────────────

/// Async client for the remote workspace document API.
///
/// Payloads are raw `serde_json::Value` documents; decoding into the typed
/// model happens on the engine side (leniently, see [`crate::document`]).
/// `update` performs a shallow field merge: top-level keys of the patch
/// replace the stored document's keys, everything else is untouched.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, id: &WorkspaceId) -> Result<Value, StoreError>;

    /// Returns every document matching the predicate, in stable id order.
    async fn filter(
        &self,
        predicate: &(dyn for<'a> Fn(&'a Value) -> bool + Send + Sync),
    ) -> Result<Vec<Value>, StoreError>;

    /// Stores a new document, assigning an id when the payload carries
    /// none. Returns the stored document.
    async fn create(&self, doc: Value) -> Result<Value, StoreError>;

    /// Shallow-merges `patch` into the stored document and bumps its
    /// `updatedAt`. Returns the merged document.
    async fn update(&self, id: &WorkspaceId, patch: Value) -> Result<Value, StoreError>;

    async fn delete(&self, id: &WorkspaceId) -> Result<(), StoreError>;
}

/// Upload sink for binary assets. Returns a locator string the preview
/// rewriter can substitute for the file name.
#[async_trait]
pub trait UploadService: Send + Sync {
    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<String, StoreError>;
}

// ───────────────────────────────────────────────────────────────────
// Retry
// ───────────────────────────────────────────────────────────────────

/// Bounded exponential backoff for rate-limited store calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Tight delays so paused-clock tests resolve instantly.
    pub fn for_testing() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        }
    }

    /// Full-jitter delay for the given zero-based attempt number.
    fn backoff(&self, attempt: u32) -> Duration {
        let window = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let millis = window.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}

/// Runs `op`, retrying only rate-limit errors up to the policy's attempt
/// budget. Any other error, and the final rate-limit error, pass through.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_rate_limit() && attempt + 1 < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                attempt += 1;
                log::debug!("store rate limited, retry {attempt} in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Store statistics
// ───────────────────────────────────────────────────────────────────

/// Point-in-time operation counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub gets: u64,
    pub filters: u64,
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
    pub faults: u64,
}

/// Lock-free counters, readable while operations are in flight.
#[derive(Debug, Default)]
struct AtomicStoreStats {
    gets: AtomicU64,
    filters: AtomicU64,
    creates: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    faults: AtomicU64,
}

impl AtomicStoreStats {
    fn snapshot(&self) -> StoreStats {
        StoreStats {
            gets: self.gets.load(Ordering::Relaxed),
            filters: self.filters.load(Ordering::Relaxed),
            creates: self.creates.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory store
// ───────────────────────────────────────────────────────────────────

/// In-memory [`DocumentStore`] with the remote API's observable semantics:
/// shallow-merge updates, strictly increasing `updatedAt` stamps, and a
/// fault queue for scripting failures in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<String, Value>>,
    faults: Mutex<VecDeque<StoreError>>,
    stats: AtomicStoreStats,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.snapshot()
    }

    /// Queues an error; the next operation consumes and returns it.
    pub async fn inject_fault(&self, err: StoreError) {
        self.faults.lock().await.push_back(err);
    }

    /// Queues the same error `n` times.
    pub async fn inject_faults(&self, n: usize, err: StoreError) {
        let mut queue = self.faults.lock().await;
        for _ in 0..n {
            queue.push_back(err.clone());
        }
    }

    /// Inserts a raw value without stamping. Lets tests seed malformed
    /// documents the lenient decoder must survive.
    pub async fn put_raw(&self, id: &WorkspaceId, value: Value) {
        self.docs.write().await.insert(id.as_str().to_owned(), value);
    }

    /// Raw stored value, unstamped and unparsed.
    pub async fn raw(&self, id: &WorkspaceId) -> Option<Value> {
        self.docs.read().await.get(id.as_str()).cloned()
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }

    async fn take_fault(&self) -> Result<(), StoreError> {
        let next = self.faults.lock().await.pop_front();
        match next {
            Some(err) => {
                self.stats.faults.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
            None => Ok(()),
        }
    }
}

/// Next `updatedAt`: wall clock, nudged forward when the clock has not
/// moved past the previous stamp. Keeps stamps strictly increasing.
fn next_stamp(prev: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match prev {
        Some(p) if p >= now => p + chrono::Duration::milliseconds(1),
        _ => now,
    }
}

fn stored_stamp(doc: &Value) -> Option<DateTime<Utc>> {
    doc.get("updatedAt")
        .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok())
}

fn stamp_value(stamp: DateTime<Utc>) -> Result<Value, StoreError> {
    serde_json::to_value(stamp).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn shallow_merge(doc: &mut Value, patch: Map<String, Value>) {
    match doc {
        Value::Object(fields) => {
            for (key, value) in patch {
                fields.insert(key, value);
            }
        }
        // A previously corrupted document gets replaced outright.
        other => *other = Value::Object(patch),
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, id: &WorkspaceId) -> Result<Value, StoreError> {
        self.take_fault().await?;
        self.stats.gets.fetch_add(1, Ordering::Relaxed);
        self.docs
            .read()
            .await
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn filter(
        &self,
        predicate: &(dyn for<'a> Fn(&'a Value) -> bool + Send + Sync),
    ) -> Result<Vec<Value>, StoreError> {
        self.take_fault().await?;
        self.stats.filters.fetch_add(1, Ordering::Relaxed);
        let docs = self.docs.read().await;
        let mut keys: Vec<&String> = docs.keys().collect();
        keys.sort();
        Ok(keys
            .into_iter()
            .filter_map(|k| docs.get(k))
            .filter(|doc| predicate(doc))
            .cloned()
            .collect())
    }

    async fn create(&self, mut doc: Value) -> Result<Value, StoreError> {
        self.take_fault().await?;
        self.stats.creates.fetch_add(1, Ordering::Relaxed);
        if !doc.is_object() {
            return Err(StoreError::Serialization(
                "document must be a JSON object".to_owned(),
            ));
        }
        let id = match doc.get("id").and_then(Value::as_str) {
            Some(given) if !given.is_empty() => given.to_owned(),
            _ => format!("ws_{}", Uuid::new_v4().simple()),
        };
        let mut docs = self.docs.write().await;
        if docs.contains_key(&id) {
            return Err(StoreError::Backend(format!(
                "workspace {id} already exists"
            )));
        }
        if let Value::Object(fields) = &mut doc {
            fields.insert("id".to_owned(), Value::String(id.clone()));
            fields.insert("updatedAt".to_owned(), stamp_value(next_stamp(None))?);
        }
        docs.insert(id, doc.clone());
        Ok(doc)
    }

    async fn update(&self, id: &WorkspaceId, patch: Value) -> Result<Value, StoreError> {
        self.take_fault().await?;
        self.stats.updates.fetch_add(1, Ordering::Relaxed);
        let Value::Object(mut patch) = patch else {
            return Err(StoreError::Serialization(
                "patch must be a JSON object".to_owned(),
            ));
        };
        let mut docs = self.docs.write().await;
        let doc = docs
            .get_mut(id.as_str())
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let stamp = stamp_value(next_stamp(stored_stamp(doc)))?;
        patch.insert("updatedAt".to_owned(), stamp);
        patch.insert("id".to_owned(), Value::String(id.as_str().to_owned()));
        shallow_merge(doc, patch);
        Ok(doc.clone())
    }

    async fn delete(&self, id: &WorkspaceId) -> Result<(), StoreError> {
        self.take_fault().await?;
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        match self.docs.write().await.remove(id.as_str()) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(id.clone())),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory uploads
// ───────────────────────────────────────────────────────────────────

/// Test upload sink. Locators use a non-relative scheme so the preview
/// rewriter treats them as resolved.
#[derive(Debug, Default)]
pub struct MemoryUploader {
    received: Mutex<Vec<(String, usize)>>,
}

impl MemoryUploader {
    pub fn new() -> Self {
        MemoryUploader::default()
    }

    pub async fn received(&self) -> Vec<(String, usize)> {
        self.received.lock().await.clone()
    }
}

#[async_trait]
impl UploadService for MemoryUploader {
    async fn upload(&self, name: &str, bytes: &[u8]) -> Result<String, StoreError> {
        self.received
            .lock()
            .await
            .push((name.to_owned(), bytes.len()));
        Ok(format!("mem://uploads/{name}"))
    }
}

// ===================================================================
// Tests
// ===================================================================
