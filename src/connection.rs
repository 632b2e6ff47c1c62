//! Connection ownership and duplication.
//!
//! The backend family this layer targets forbids mixing blocking-subscribe
//! mode with command mode on one connection. [`ConnectionManager`] therefore
//! owns a single long-lived primary [`Connection`] for ordinary commands and
//! mints independent duplicates on demand for anything that must block on
//! subscribed messages.
//!
//! Connections are counted: every live [`Connection`] holds an RAII guard
//! that decrements the manager's count on drop, which is how subscription
//! teardown is observable (see
//! [`ConnectionManager::active_connections`]).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::backend::{Backend, IndexDefinition, MessageStream};
use crate::error::{Error, Result};

/// Owns the primary connection and mints duplicates.
pub struct ConnectionManager {
    backend: Arc<dyn Backend>,
    active: Arc<AtomicUsize>,
    primary: Connection,
}

impl ConnectionManager {
    /// Connect to the backend and establish the primary connection.
    ///
    /// # Errors
    ///
    /// Fails when the backend is unreachable. By contract this is the one
    /// fatal failure mode: init aborts, nothing is constructed.
    pub async fn connect(backend: Arc<dyn Backend>) -> Result<Self> {
        backend
            .ping()
            .await
            .map_err(|e| Error::init(format!("backend unreachable: {e}")))?;
        let active = Arc::new(AtomicUsize::new(0));
        let primary = Connection::new(backend.clone(), active.clone());
        Ok(Self {
            backend,
            active,
            primary,
        })
    }

    /// The primary command connection.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.primary
    }

    /// Mint a new, independently connected handle to the same backend.
    ///
    /// Callers own the returned connection and release it by dropping it
    /// (subscriptions do this in their teardown).
    ///
    /// # Errors
    ///
    /// Fails when the backend no longer answers; callers surface this as an
    /// unsuccessful operation rather than a fault.
    pub async fn duplicate(&self) -> Result<Connection> {
        self.backend
            .ping()
            .await
            .map_err(|e| Error::connection(format!("duplicate failed: {e}")))?;
        debug!(active = self.active_connections() + 1, "duplicated connection");
        Ok(Connection::new(self.backend.clone(), self.active.clone()))
    }

    /// Number of currently live connections, the primary included.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// A handle to the backend.
///
/// A connection starts in command mode. Calling [`Connection::subscribe`]
/// moves it permanently into subscriber mode, after which every command
/// operation is rejected with a connection error; the two modes are
/// mutually exclusive per connection.
pub struct Connection {
    backend: Arc<dyn Backend>,
    subscriber: AtomicBool,
    active: Arc<AtomicUsize>,
}

impl Connection {
    fn new(backend: Arc<dyn Backend>, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            backend,
            subscriber: AtomicBool::new(false),
            active,
        }
    }

    fn command_backend(&self) -> Result<&dyn Backend> {
        if self.subscriber.load(Ordering::SeqCst) {
            return Err(Error::connection(
                "connection is in subscriber mode; commands are not allowed",
            ));
        }
        Ok(self.backend.as_ref())
    }

    /// Enter subscriber mode and stream messages matching `pattern`.
    ///
    /// # Errors
    ///
    /// Fails when the backend rejects the subscription.
    pub async fn subscribe(&self, pattern: &str) -> Result<MessageStream> {
        self.subscriber.store(true, Ordering::SeqCst);
        self.backend.subscribe(pattern).await
    }

    /// Store-local timestamp in milliseconds.
    ///
    /// # Errors
    ///
    /// Backend or mode errors.
    pub async fn now_ms(&self) -> Result<i64> {
        self.command_backend()?.now_ms().await
    }

    /// Read a JSON document.
    ///
    /// # Errors
    ///
    /// Backend or mode errors.
    pub async fn json_get(&self, key: &str) -> Result<Option<Value>> {
        self.command_backend()?.json_get(key).await
    }

    /// Replace a JSON document, with optional TTL.
    ///
    /// # Errors
    ///
    /// Backend or mode errors.
    pub async fn json_set(&self, key: &str, value: &Value, ttl_secs: i64) -> Result<()> {
        self.command_backend()?.json_set(key, value, ttl_secs).await
    }

    /// Conditionally write one sub-field of an existing document.
    ///
    /// # Errors
    ///
    /// Backend or mode errors.
    pub async fn json_set_path(&self, key: &str, path: &str, value: &Value) -> Result<bool> {
        self.command_backend()?.json_set_path(key, path, value).await
    }

    /// Delete a key.
    ///
    /// # Errors
    ///
    /// Backend or mode errors.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.command_backend()?.delete(key).await
    }

    /// Whether a key holds a live value.
    ///
    /// # Errors
    ///
    /// Backend or mode errors.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.command_backend()?.exists(key).await
    }

    /// Scan keys by prefix.
    ///
    /// # Errors
    ///
    /// Backend or mode errors.
    pub async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        self.command_backend()?.scan(prefix).await
    }

    /// Add members to a set.
    ///
    /// # Errors
    ///
    /// Backend or mode errors.
    pub async fn set_add(&self, key: &str, members: &[String]) -> Result<usize> {
        self.command_backend()?.set_add(key, members).await
    }

    /// Read all members of a set.
    ///
    /// # Errors
    ///
    /// Backend or mode errors.
    pub async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.command_backend()?.set_members(key).await
    }

    /// Delete a set.
    ///
    /// # Errors
    ///
    /// Backend or mode errors.
    pub async fn set_delete(&self, key: &str) -> Result<bool> {
        self.command_backend()?.set_delete(key).await
    }

    /// Publish a payload on a channel.
    ///
    /// # Errors
    ///
    /// Backend or mode errors.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        self.command_backend()?.publish(channel, payload).await
    }

    /// Create or replace a secondary index.
    ///
    /// # Errors
    ///
    /// Backend or mode errors.
    pub async fn index_create(&self, def: IndexDefinition) -> Result<()> {
        self.command_backend()?.index_create(def).await
    }

    /// Drop a secondary index.
    ///
    /// # Errors
    ///
    /// Backend or mode errors.
    pub async fn index_drop(&self, name: &str) -> Result<bool> {
        self.command_backend()?.index_drop(name).await
    }

    /// Run an equality query against an index.
    ///
    /// # Errors
    ///
    /// Backend, mode, or query-syntax errors.
    pub async fn index_search(&self, name: &str, query: &str, limit: usize) -> Result<Vec<Value>> {
        self.command_backend()?.index_search(name, query, limit).await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::json;

    async fn create_test_manager() -> ConnectionManager {
        ConnectionManager::connect(Arc::new(MemoryBackend::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_primary_counts_as_one() {
        let manager = create_test_manager().await;
        assert_eq!(manager.active_connections(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_release() {
        let manager = create_test_manager().await;

        let dup = manager.duplicate().await.unwrap();
        assert_eq!(manager.active_connections(), 2);

        drop(dup);
        assert_eq!(manager.active_connections(), 1);
    }

    #[tokio::test]
    async fn test_subscriber_mode_rejects_commands() {
        let manager = create_test_manager().await;
        let dup = manager.duplicate().await.unwrap();

        let _stream = dup.subscribe("chan").await.unwrap();
        let err = dup.json_set("k", &json!(1), -1).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert!(dup.json_get("k").await.is_err());
    }

    #[tokio::test]
    async fn test_command_mode_passes_through() {
        let manager = create_test_manager().await;
        let conn = manager.connection();

        conn.json_set("k", &json!({"a": 1}), -1).await.unwrap();
        assert_eq!(conn.json_get("k").await.unwrap(), Some(json!({"a": 1})));
    }
}
