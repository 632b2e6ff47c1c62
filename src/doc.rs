//! Document envelopes and per-document operations.
//!
//! The atomic unit of storage is a [`Document<T>`]: creation/update metadata
//! wrapped around a caller-defined JSON payload. A [`DocumentRef<T>`] is a
//! stateless, cheaply-constructed proxy over one document's key path with
//! read/set/update/delete operations and per-document subscription.
//!
//! # Failure behavior
//!
//! CRUD operations never propagate errors: `read` returns `None` and the
//! write operations return a [`WriteResult`] with `success: false`, with
//! the underlying cause logged. Only `subscribe` returns a `Result`, since
//! acquiring its duplicated connection can genuinely fail.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{ChangeBus, ChangeMessage, DocUpdate};
use crate::connection::{Connection, ConnectionManager};
use crate::error::{Error, Result};
use crate::subscription::Subscription;

/// The stored envelope: metadata plus payload.
///
/// `id` is generated at creation and immutable. Timestamps are store-local
/// milliseconds; `updated_at` is refreshed on every successful mutation, so
/// `created_at <= updated_at` always holds. `created_by` is immutable
/// except through [`DocumentRef::update_created_by`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document<T> {
    /// Globally unique id; doubles as the key suffix.
    pub id: String,
    /// Creation time, store-local milliseconds.
    pub created_at: i64,
    /// Actor that created the document.
    pub created_by: String,
    /// Last-mutation time, store-local milliseconds.
    pub updated_at: i64,
    /// Actor behind the last mutation.
    pub updated_by: String,
    /// Caller-defined payload.
    pub data: T,
}

/// Outcome of a single write operation.
///
/// `doc` is present exactly when `success` is true; for deletes it is the
/// pre-deletion snapshot. `write_timestamp` is the store-local time of the
/// write, or zero when the write never reached the store.
#[derive(Debug, Clone)]
pub struct WriteResult<T> {
    /// Whether the operation took effect.
    pub success: bool,
    /// Store-local milliseconds at write time.
    pub write_timestamp: i64,
    /// The written document (or pre-deletion snapshot).
    pub doc: Option<Document<T>>,
}

impl<T> WriteResult<T> {
    pub(crate) fn ok(write_timestamp: i64, doc: Document<T>) -> Self {
        Self {
            success: true,
            write_timestamp,
            doc: Some(doc),
        }
    }

    pub(crate) fn failure() -> Self {
        Self {
            success: false,
            write_timestamp: 0,
            doc: None,
        }
    }
}

/// A dot-path keyed partial update.
///
/// Each entry maps a path inside the payload (`"name"`, `"profile.city"`)
/// to its new value. Paths are validated at apply time; an invalid path
/// counts as a failed entry under the update's at-least-one-key semantics.
///
/// Serializes flat (`{"profile.city": "oslo"}`) so a requested patch can
/// ride in UPDATE messages verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Patch {
    entries: BTreeMap<String, Value>,
}

impl Patch {
    /// Create an empty patch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one path/value entry (builder style)
    #[must_use]
    pub fn with(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.insert(path.into(), value.into());
        self
    }

    /// Add one path/value entry
    pub fn insert(&mut self, path: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(path.into(), value.into());
    }

    /// Iterate over the entries
    pub fn entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the patch has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Validate a dot path: non-empty segments of word characters and hyphens.
pub(crate) fn is_valid_path(path: &str) -> bool {
    !path.is_empty()
        && path.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        })
}

/// A handle to one document.
///
/// Holds no state beyond the key path; constructing one performs no I/O.
/// Obtained from [`Collection::doc_ref`](crate::collection::Collection::doc_ref)
/// or [`Database::doc_ref`](crate::database::Database::doc_ref).
pub struct DocumentRef<T> {
    collection: String,
    id: String,
    key: String,
    manager: Arc<ConnectionManager>,
    bus: ChangeBus,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DocumentRef<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    pub(crate) fn new(
        manager: Arc<ConnectionManager>,
        bus: ChangeBus,
        collection: impl Into<String>,
        path: &str,
        id: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            collection: collection.into(),
            key: format!("{path}:{id}"),
            id,
            manager,
            bus,
            _marker: PhantomData,
        }
    }

    /// Generate a ref with a fresh random id.
    pub(crate) fn with_generated_id(
        manager: Arc<ConnectionManager>,
        bus: ChangeBus,
        collection: impl Into<String>,
        path: &str,
    ) -> Self {
        Self::new(manager, bus, collection, path, Uuid::new_v4().to_string())
    }

    /// The document id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The full backend key
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The collection this ref belongs to
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Read the document. `None` when absent or on any backend error
    /// (logged, not thrown).
    pub async fn read(&self) -> Option<Document<T>> {
        match self.read_inner().await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(key = %self.key, error = %e, "read failed");
                None
            }
        }
    }

    async fn read_inner(&self) -> Result<Option<Document<T>>> {
        let Some(value) = self.manager.connection().json_get(&self.key).await? else {
            return Ok(None);
        };
        let doc = serde_json::from_value(value)
            .map_err(|e| Error::document(format!("malformed envelope at {}: {e}", self.key)))?;
        Ok(Some(doc))
    }

    /// Write a full document: a replace, never a merge.
    ///
    /// A fresh envelope is generated (the ref keeps its id, so re-setting
    /// an existing ref overwrites in place). A TTL is applied when
    /// `ttl_secs > -1`. A CREATE message is announced when `publish` is
    /// set.
    pub async fn set(&self, data: T, actor: &str, ttl_secs: i64, publish: bool) -> WriteResult<T> {
        match self.set_inner(data, actor, ttl_secs, publish).await {
            Ok(result) => result,
            Err(e) => {
                warn!(key = %self.key, error = %e, "set failed");
                WriteResult::failure()
            }
        }
    }

    async fn set_inner(
        &self,
        data: T,
        actor: &str,
        ttl_secs: i64,
        publish: bool,
    ) -> Result<WriteResult<T>> {
        let conn = self.manager.connection();
        let now = conn.now_ms().await?;
        let doc = Document {
            id: self.id.clone(),
            created_at: now,
            created_by: actor.to_string(),
            updated_at: now,
            updated_by: actor.to_string(),
            data,
        };
        let value = serde_json::to_value(&doc)
            .map_err(|e| Error::document(format!("failed to serialize document: {e}")))?;
        conn.json_set(&self.key, &value, ttl_secs).await?;
        debug!(key = %self.key, ttl_secs, "document written");

        if publish {
            let message = ChangeMessage::Create {
                col: self.collection.clone(),
                doc: vec![doc.clone()],
            };
            self.bus.announce(&self.key, &message).await;
        }
        Ok(WriteResult::ok(now, doc))
    }

    /// Apply a partial update to the payload of an existing document.
    ///
    /// One independent sub-field write is issued per patch entry, all
    /// concurrently. The update counts as successful when **at least one**
    /// entry landed; partial application is a documented semantic of this
    /// layer, not an error. On success `updated_at` (and `updated_by` when
    /// `actor` is non-empty) is refreshed, the envelope re-read, and an
    /// UPDATE message announced carrying the fresh document together with
    /// the originally requested patch.
    ///
    /// Updating a nonexistent document fails; it does not create.
    pub async fn update(&self, patch: &Patch, actor: &str, publish: bool) -> WriteResult<T> {
        match self.update_inner(patch, actor, publish).await {
            Ok(result) => result,
            Err(e) => {
                warn!(key = %self.key, error = %e, "update failed");
                WriteResult::failure()
            }
        }
    }

    async fn update_inner(
        &self,
        patch: &Patch,
        actor: &str,
        publish: bool,
    ) -> Result<WriteResult<T>> {
        if patch.is_empty() {
            return Ok(WriteResult::failure());
        }
        let conn = self.manager.connection();

        let writes = patch.entries().map(|(path, value)| async move {
            if !is_valid_path(path) {
                warn!(key = %self.key, path = %path, "rejecting invalid patch path");
                return false;
            }
            match conn
                .json_set_path(&self.key, &format!("$.data.{path}"), value)
                .await
            {
                Ok(applied) => applied,
                Err(e) => {
                    warn!(key = %self.key, path = %path, error = %e, "patch entry failed");
                    false
                }
            }
        });
        let applied = join_all(writes).await;
        if !applied.iter().any(|ok| *ok) {
            return Ok(WriteResult::failure());
        }

        let now = self.touch(conn, actor).await?;
        let doc = self
            .read_inner()
            .await?
            .ok_or_else(|| Error::document("document vanished during update"))?;

        if publish {
            let message = ChangeMessage::Update {
                col: self.collection.clone(),
                doc: vec![doc.clone()],
                updates: vec![DocUpdate {
                    id: self.id.clone(),
                    updates: patch.clone(),
                }],
            };
            self.bus.announce(&self.key, &message).await;
        }
        Ok(WriteResult::ok(now, doc))
    }

    /// Administrative re-assignment of `created_by`.
    ///
    /// Conditional on the document existing; runs the same refresh and
    /// publish path as [`DocumentRef::update`].
    pub async fn update_created_by(&self, actor: &str) -> WriteResult<T> {
        match self.update_created_by_inner(actor).await {
            Ok(result) => result,
            Err(e) => {
                warn!(key = %self.key, error = %e, "created_by update failed");
                WriteResult::failure()
            }
        }
    }

    async fn update_created_by_inner(&self, actor: &str) -> Result<WriteResult<T>> {
        let conn = self.manager.connection();
        let applied = conn
            .json_set_path(&self.key, "$.createdBy", &Value::String(actor.to_string()))
            .await?;
        if !applied {
            return Ok(WriteResult::failure());
        }

        let now = self.touch(conn, actor).await?;
        let doc = self
            .read_inner()
            .await?
            .ok_or_else(|| Error::document("document vanished during update"))?;

        let message = ChangeMessage::Update {
            col: self.collection.clone(),
            doc: vec![doc.clone()],
            updates: vec![DocUpdate {
                id: self.id.clone(),
                updates: Patch::new().with("createdBy", actor),
            }],
        };
        self.bus.announce(&self.key, &message).await;
        Ok(WriteResult::ok(now, doc))
    }

    /// Refresh mutation metadata, conditional on the document existing.
    async fn touch(&self, conn: &Connection, actor: &str) -> Result<i64> {
        let now = conn.now_ms().await?;
        conn.json_set_path(&self.key, "$.updatedAt", &Value::from(now))
            .await?;
        if !actor.is_empty() {
            conn.json_set_path(&self.key, "$.updatedBy", &Value::String(actor.to_string()))
                .await?;
        }
        Ok(now)
    }

    /// Delete the document.
    ///
    /// Reads the current value first so the result can carry the
    /// pre-deletion snapshot. Deleting a nonexistent document is a no-op
    /// returning `success: false`.
    pub async fn delete(&self, publish: bool) -> WriteResult<T> {
        match self.delete_inner(publish).await {
            Ok(result) => result,
            Err(e) => {
                warn!(key = %self.key, error = %e, "delete failed");
                WriteResult::failure()
            }
        }
    }

    async fn delete_inner(&self, publish: bool) -> Result<WriteResult<T>> {
        let Some(doc) = self.read_inner().await? else {
            return Ok(WriteResult::failure());
        };
        let conn = self.manager.connection();
        let now = conn.now_ms().await?;
        if !conn.delete(&self.key).await? {
            return Ok(WriteResult::failure());
        }

        if publish {
            let message = ChangeMessage::Delete {
                col: self.collection.clone(),
                doc: vec![doc.clone()],
            };
            self.bus.announce(&self.key, &message).await;
        }
        Ok(WriteResult::ok(now, doc))
    }

    /// Subscribe to changes of this document.
    ///
    /// Each incoming payload is parsed as a change message, re-tagged with
    /// this ref's collection name (the raw message does not self-describe
    /// its collection reliably), and handed to the callback. The returned
    /// [`Subscription`] owns a duplicated connection; keep it alive for as
    /// long as callbacks should fire and call
    /// [`close`](Subscription::close) to release it.
    ///
    /// # Errors
    ///
    /// Fails when the duplicated connection cannot be established.
    pub async fn subscribe<F>(&self, mut callback: F) -> Result<Subscription>
    where
        F: FnMut(ChangeMessage<Document<T>>) + Send + 'static,
    {
        let (conn, mut stream) = self.bus.open(&self.key).await?;
        let collection = self.collection.clone();
        let task = tokio::spawn(async move {
            while let Some((channel, payload)) = stream.recv().await {
                match serde_json::from_str::<ChangeMessage<Document<T>>>(&payload) {
                    Ok(mut message) => {
                        message.set_col(&collection);
                        callback(message);
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "discarding unparseable change message"),
                }
            }
        });
        Ok(Subscription::new(conn, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Note {
        text: String,
        pinned: bool,
    }

    fn note(text: &str) -> Note {
        Note {
            text: text.to_string(),
            pinned: false,
        }
    }

    async fn create_test_ref(id: &str) -> DocumentRef<Note> {
        let manager = Arc::new(
            ConnectionManager::connect(Arc::new(MemoryBackend::new()))
                .await
                .unwrap(),
        );
        let bus = ChangeBus::new(manager.clone());
        DocumentRef::new(manager, bus, "notes", "app:DB:notes", id)
    }

    #[tokio::test]
    async fn test_set_then_read_roundtrip() {
        let doc_ref = create_test_ref("n1").await;

        let result = doc_ref.set(note("hello"), "alice", -1, false).await;
        assert!(result.success);
        assert!(result.write_timestamp > 0);

        let doc = doc_ref.read().await.unwrap();
        assert_eq!(doc.id, "n1");
        assert_eq!(doc.data, note("hello"));
        assert_eq!(doc.created_by, "alice");
        assert!(doc.created_at <= doc.updated_at);
    }

    #[tokio::test]
    async fn test_set_replaces_not_merges() {
        let doc_ref = create_test_ref("n1").await;
        doc_ref.set(note("one"), "alice", -1, false).await;
        doc_ref.set(note("two"), "bob", -1, false).await;

        let doc = doc_ref.read().await.unwrap();
        assert_eq!(doc.data.text, "two");
        assert_eq!(doc.created_by, "bob");
    }

    #[tokio::test]
    async fn test_set_with_ttl_expires() {
        let doc_ref = create_test_ref("n1").await;
        doc_ref.set(note("gone"), "alice", 0, false).await;
        assert!(doc_ref.read().await.is_none());
    }

    #[tokio::test]
    async fn test_update_nonexistent_fails() {
        let doc_ref = create_test_ref("n1").await;
        let result = doc_ref
            .update(&Patch::new().with("text", "x"), "alice", false)
            .await;
        assert!(!result.success);
        assert!(result.doc.is_none());
        // update never creates
        assert!(doc_ref.read().await.is_none());
    }

    #[tokio::test]
    async fn test_update_refreshes_metadata() {
        let doc_ref = create_test_ref("n1").await;
        doc_ref.set(note("old"), "alice", -1, false).await;

        let result = doc_ref
            .update(&Patch::new().with("text", "new"), "bob", false)
            .await;
        assert!(result.success);

        let doc = result.doc.unwrap();
        assert_eq!(doc.data.text, "new");
        assert!(!doc.data.pinned);
        assert_eq!(doc.created_by, "alice");
        assert_eq!(doc.updated_by, "bob");
        assert!(doc.updated_at >= doc.created_at);
    }

    #[tokio::test]
    async fn test_update_partial_failure_still_succeeds() {
        let doc_ref = create_test_ref("n1").await;
        doc_ref.set(note("old"), "alice", -1, false).await;

        // "missing.deep" has no parent object, so that entry fails while
        // "text" lands: at-least-one-key semantics report success.
        let patch = Patch::new()
            .with("text", "survived")
            .with("missing.deep", 1);
        let result = doc_ref.update(&patch, "alice", false).await;
        assert!(result.success);
        assert_eq!(result.doc.unwrap().data.text, "survived");
    }

    #[tokio::test]
    async fn test_update_empty_patch_fails() {
        let doc_ref = create_test_ref("n1").await;
        doc_ref.set(note("x"), "alice", -1, false).await;
        assert!(!doc_ref.update(&Patch::new(), "alice", false).await.success);
    }

    #[tokio::test]
    async fn test_update_created_by() {
        let doc_ref = create_test_ref("n1").await;
        doc_ref.set(note("x"), "alice", -1, false).await;

        let result = doc_ref.update_created_by("admin").await;
        assert!(result.success);
        assert_eq!(result.doc.unwrap().created_by, "admin");

        // conditional on existence
        let missing = create_test_ref("other").await;
        assert!(!missing.update_created_by("admin").await.success);
    }

    #[tokio::test]
    async fn test_delete_returns_snapshot() {
        let doc_ref = create_test_ref("n1").await;
        doc_ref.set(note("bye"), "alice", -1, false).await;

        let result = doc_ref.delete(false).await;
        assert!(result.success);
        assert_eq!(result.doc.unwrap().data.text, "bye");
        assert!(doc_ref.read().await.is_none());
    }

    #[tokio::test]
    async fn test_delete_nonexistent_is_noop() {
        let doc_ref = create_test_ref("n1").await;
        let result = doc_ref.delete(false).await;
        assert!(!result.success);
        assert!(result.doc.is_none());
    }

    #[test]
    fn test_patch_serializes_flat() {
        let patch = Patch::new().with("profile.city", "oslo").with("age", 30);
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({"profile.city": "oslo", "age": 30})
        );
    }

    #[test]
    fn test_path_validation() {
        assert!(is_valid_path("name"));
        assert!(is_valid_path("profile.city"));
        assert!(is_valid_path("a_b-c.d2"));
        assert!(!is_valid_path(""));
        assert!(!is_valid_path(".leading"));
        assert!(!is_valid_path("trailing."));
        assert!(!is_valid_path("a..b"));
        assert!(!is_valid_path("a b"));
        assert!(!is_valid_path("$.a"));
    }

    #[test]
    fn test_envelope_wire_field_names() {
        let doc = Document {
            id: "d1".to_string(),
            created_at: 1,
            created_by: "a".to_string(),
            updated_at: 2,
            updated_by: "b".to_string(),
            data: note("x"),
        };
        let wire = serde_json::to_value(&doc).unwrap();
        assert_eq!(wire["createdAt"], json!(1));
        assert_eq!(wire["updatedBy"], json!("b"));
        assert_eq!(wire["data"]["text"], json!("x"));
    }
}
