//! The four-primitive store abstraction.
//!
//! Everything syncbase does rests on a backend that natively offers four
//! primitives: atomic per-key JSON operations, string sets, pattern-based
//! publish/subscribe channels, and a simple tag/numeric secondary index.
//! The design assumes a Redis-family server, but any store implementing
//! [`Backend`] can be plugged in via
//! [`SyncBase::init_with_backend`](crate::SyncBase::init_with_backend).
//!
//! The bundled [`MemoryBackend`] is a complete in-process implementation
//! with the same observable semantics: lazy TTL expiration, conditional
//! sub-field writes, trailing-`*` channel globs, and a strict
//! `@field:{tag}` / `@field:[min max]` query grammar.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::Result;

mod memory;

pub use memory::MemoryBackend;

/// Stream of `(channel, payload)` pairs delivered to a subscriber.
///
/// The stream ends when the backend drops the subscription (which the
/// in-memory backend does once the receiver itself is dropped).
pub type MessageStream = UnboundedReceiver<(String, String)>;

/// Secondary-index field types.
///
/// `Tag` fields support exact string equality; `Numeric` fields support
/// closed-range queries (exact equality is expressed as `[v v]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFieldKind {
    /// Exact-match string field.
    Tag,
    /// Range-indexed numeric field.
    Numeric,
}

/// One indexed field: the query name, the JSON path it reads from, and its
/// type.
#[derive(Debug, Clone)]
pub struct IndexField {
    /// Name used in query syntax (`@name:...`).
    pub name: String,
    /// JSON path into the stored document, e.g. `$.data.name`.
    pub path: String,
    /// Field type.
    pub kind: IndexFieldKind,
}

impl IndexField {
    /// Create a field definition
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<String>, kind: IndexFieldKind) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind,
        }
    }
}

/// A named secondary index scoped to a key prefix.
#[derive(Debug, Clone)]
pub struct IndexDefinition {
    /// Index name, e.g. `idx:users`.
    pub name: String,
    /// Only documents whose key starts with this prefix are indexed.
    pub prefix: String,
    /// Indexed fields.
    pub fields: Vec<IndexField>,
}

/// The store primitives syncbase is built on.
///
/// Implementations must provide per-key atomicity: a single call is never
/// observed half-applied. No cross-key atomicity is assumed anywhere.
///
/// # Errors
///
/// Every operation may fail with a backend error; the document layer
/// catches these and reports them as unsuccessful results rather than
/// propagating.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Liveness probe. Failure at facade init is fatal.
    async fn ping(&self) -> Result<()>;

    /// Store-local timestamp in milliseconds since the epoch.
    ///
    /// Envelope timestamps come from here, not from the caller's clock, so
    /// ordering holds across writers sharing one backend.
    async fn now_ms(&self) -> Result<i64>;

    /// Read the JSON document at `key`. `None` when absent.
    async fn json_get(&self, key: &str) -> Result<Option<Value>>;

    /// Replace the JSON document at `key`.
    ///
    /// A TTL of `ttl_secs` seconds is applied when `ttl_secs > -1`;
    /// otherwise the key does not expire.
    async fn json_set(&self, key: &str, value: &Value, ttl_secs: i64) -> Result<()>;

    /// Write a single sub-field of an existing JSON document.
    ///
    /// `path` is a `$.`-rooted dot path (e.g. `$.data.name`). Returns
    /// `false` without writing when the key does not exist or an
    /// intermediate path segment is missing; parents are never created
    /// implicitly. The key's TTL is unaffected.
    async fn json_set_path(&self, key: &str, path: &str, value: &Value) -> Result<bool>;

    /// Delete `key`. Returns whether a value existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Whether `key` currently holds a live (unexpired) value.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// All live keys starting with `prefix`, documents and sets alike.
    ///
    /// Unpaginated: cost is proportional to the number of matching keys.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;

    /// Add members to the set at `key`, creating it if absent.
    ///
    /// Returns the number of members that were not already present.
    async fn set_add(&self, key: &str, members: &[String]) -> Result<usize>;

    /// All members of the set at `key`; empty when absent.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Delete the set at `key`. Returns whether it existed.
    async fn set_delete(&self, key: &str) -> Result<bool>;

    /// Publish `payload` on `channel`. Returns the number of subscribers
    /// the message was delivered to.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    /// Subscribe to `pattern`: an exact channel name, or a trailing-`*`
    /// glob matching every channel under a prefix.
    async fn subscribe(&self, pattern: &str) -> Result<MessageStream>;

    /// Create (or replace) a secondary index.
    async fn index_create(&self, def: IndexDefinition) -> Result<()>;

    /// Drop an index by name. Returns `false` when no such index exists.
    async fn index_drop(&self, name: &str) -> Result<bool>;

    /// Run an equality query against an index.
    ///
    /// `query` uses the grammar `@field:{tag}` (backslash-escaped
    /// punctuation inside the braces) or `@field:[min max]`. Returns at
    /// most `limit` full documents. A malformed query is an error.
    async fn index_search(&self, name: &str, query: &str, limit: usize) -> Result<Vec<Value>>;
}
