//! Named groups of documents sharing a key prefix.
//!
//! A [`Collection<T>`] is a naming convention over key prefixes: it has no
//! persisted record of its own, only an in-memory handle plus, optionally,
//! one secondary-index definition in the store. It layers three things over
//! [`DocumentRef`](crate::doc::DocumentRef): bulk operations with
//! single-notification-per-batch semantics, equality queries against a
//! schema'd index, and collection-wide (or filtered) subscriptions.
//!
//! # Batch semantics
//!
//! `add_docs`/`update_docs`/`delete_docs` fire their per-item operations
//! concurrently with per-item publishing suppressed, then announce exactly
//! one change message carrying the items that succeeded. There is no
//! cross-item atomicity: a batch of ten may persist seven, and only those
//! seven are reported and published. An all-failed batch still publishes an
//! empty array, which subscribers must treat as a no-event signal.

use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{IndexDefinition, IndexField, IndexFieldKind};
use crate::bus::{ChangeBus, ChangeMessage, DocUpdate};
use crate::connection::ConnectionManager;
use crate::doc::{Document, DocumentRef, WriteResult};
use crate::error::Result;
use crate::set_doc::{SetDocumentRef, SET_KEY_SUFFIX};
use crate::subscription::Subscription;
use crate::QUERY_PAGE_LIMIT;

/// Structured outcome of a batch mutation.
///
/// Returned instead of a bare filtered array so callers cannot mistake
/// partial success for all-or-nothing: `failed` lists the ids of items
/// whose individual operation did not take effect.
#[derive(Debug, Clone)]
pub struct BatchOutcome<T> {
    /// Envelopes of the items that persisted.
    pub succeeded: Vec<Document<T>>,
    /// Ids of the items that failed.
    pub failed: Vec<String>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> BatchOutcome<T> {
    /// Whether every item in the batch persisted
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A named collection of documents under one key prefix.
pub struct Collection<T> {
    name: String,
    path: String,
    ttl_secs: i64,
    manager: Arc<ConnectionManager>,
    bus: ChangeBus,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    pub(crate) fn new(
        manager: Arc<ConnectionManager>,
        bus: ChangeBus,
        project: &str,
        name: impl Into<String>,
        ttl_secs: i64,
    ) -> Self {
        let name = name.into();
        Self {
            path: format!("{project}:{}:{name}", crate::DB_SEGMENT),
            name,
            ttl_secs,
            manager,
            bus,
            _marker: PhantomData,
        }
    }

    /// The collection name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The key prefix documents of this collection live under
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    fn index_name(&self) -> String {
        format!("idx:{}", self.name)
    }

    /// Batch messages go to the collection's root channel (the prefix with
    /// an empty id), which pattern subscribers see and exact-document
    /// subscribers do not.
    fn batch_channel(&self) -> String {
        format!("{}:", self.path)
    }

    /// Construct a handle to one document. No I/O.
    #[must_use]
    pub fn doc_ref(&self, id: impl Into<String>) -> DocumentRef<T> {
        DocumentRef::new(
            self.manager.clone(),
            self.bus.clone(),
            self.name.clone(),
            &self.path,
            id,
        )
    }

    /// Construct a handle to one set document. No I/O.
    #[must_use]
    pub fn set_doc_ref(&self, id: impl Into<String>) -> SetDocumentRef {
        SetDocumentRef::new(
            self.manager.clone(),
            self.bus.clone(),
            self.name.clone(),
            &self.path,
            id,
        )
    }

    /// Create a document with a generated id.
    ///
    /// Returns the ref on success, `None` when the write failed. Publishes
    /// a CREATE message.
    pub async fn add_doc(&self, data: T, actor: &str) -> Option<DocumentRef<T>> {
        let doc_ref = DocumentRef::with_generated_id(
            self.manager.clone(),
            self.bus.clone(),
            self.name.clone(),
            &self.path,
        );
        let result = doc_ref.set(data, actor, self.ttl_secs, true).await;
        result.success.then_some(doc_ref)
    }

    /// Create a document under a caller-chosen id.
    ///
    /// Used when the id must be deterministic or externally meaningful. No
    /// uniqueness check is performed beyond the store's overwrite-on-set
    /// semantics.
    pub async fn add_doc_with_id(
        &self,
        data: T,
        actor: &str,
        id: impl Into<String>,
    ) -> Option<DocumentRef<T>> {
        let doc_ref = self.doc_ref(id);
        let result = doc_ref.set(data, actor, self.ttl_secs, true).await;
        result.success.then_some(doc_ref)
    }

    /// Create many documents, publishing one CREATE message for the batch.
    ///
    /// Per-item writes run concurrently with publishing suppressed; the
    /// single message carries exactly the documents that persisted (an
    /// empty array when none did).
    pub async fn add_docs(&self, items: Vec<T>, actor: &str) -> BatchOutcome<T> {
        let writes = items.into_iter().map(|data| {
            let doc_ref = DocumentRef::with_generated_id(
                self.manager.clone(),
                self.bus.clone(),
                self.name.clone(),
                &self.path,
            );
            async move {
                let result = doc_ref.set(data, actor, self.ttl_secs, false).await;
                (doc_ref.id().to_string(), result)
            }
        });

        let mut outcome = BatchOutcome::default();
        for (id, result) in join_all(writes).await {
            match result.doc {
                Some(doc) if result.success => outcome.succeeded.push(doc),
                _ => outcome.failed.push(id),
            }
        }

        let message = ChangeMessage::Create {
            col: self.name.clone(),
            doc: outcome.succeeded.clone(),
        };
        self.bus.announce(&self.batch_channel(), &message).await;
        outcome
    }

    /// Update many documents, publishing one UPDATE message for the batch.
    ///
    /// The message's `updates` field contains only the entries whose
    /// per-document update actually took effect.
    pub async fn update_docs(&self, updates: Vec<DocUpdate>, actor: &str) -> BatchOutcome<T> {
        let writes = updates.into_iter().map(|entry| {
            let doc_ref = self.doc_ref(entry.id.clone());
            async move {
                let result = doc_ref.update(&entry.updates, actor, false).await;
                (entry, result)
            }
        });

        let mut outcome = BatchOutcome::default();
        let mut applied = Vec::new();
        for (entry, result) in join_all(writes).await {
            match result.doc {
                Some(doc) if result.success => {
                    outcome.succeeded.push(doc);
                    applied.push(entry);
                }
                _ => outcome.failed.push(entry.id),
            }
        }

        let message = ChangeMessage::Update {
            col: self.name.clone(),
            doc: outcome.succeeded.clone(),
            updates: applied,
        };
        self.bus.announce(&self.batch_channel(), &message).await;
        outcome
    }

    /// Delete many documents, publishing one DELETE message for the batch.
    ///
    /// Unlike add/update, the full per-item result array is returned in
    /// input order so partial failure stays inspectable per id.
    pub async fn delete_docs(&self, ids: &[String]) -> Vec<WriteResult<T>> {
        let deletes = ids.iter().map(|id| {
            let doc_ref = self.doc_ref(id.clone());
            async move { doc_ref.delete(false).await }
        });
        let results = join_all(deletes).await;

        let snapshots: Vec<Document<T>> = results
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| r.doc.clone())
            .collect();
        let message = ChangeMessage::Delete {
            col: self.name.clone(),
            doc: snapshots,
        };
        self.bus.announce(&self.batch_channel(), &message).await;
        results
    }

    /// Handles for every document currently in the collection.
    ///
    /// A key-prefix scan: cost grows with the collection, there is no
    /// pagination. Large collections should shard by naming convention
    /// rather than lean on this. Companion `_set` keys are filtered out.
    pub async fn get_all_doc_refs(&self) -> Vec<DocumentRef<T>> {
        let prefix = format!("{}:", self.path);
        let keys = match self.manager.connection().scan(&prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(collection = %self.name, error = %e, "scan failed");
                return Vec::new();
            }
        };
        keys.into_iter()
            .filter(|key| !key.ends_with(SET_KEY_SUFFIX))
            .filter_map(|key| key.strip_prefix(&prefix).map(ToString::to_string))
            .map(|id| self.doc_ref(id))
            .collect()
    }

    /// Read every document in the collection, concurrently.
    pub async fn get_all_docs(&self) -> Vec<Document<T>> {
        let refs = self.get_all_doc_refs().await;
        let reads = refs.iter().map(DocumentRef::read);
        join_all(reads).await.into_iter().flatten().collect()
    }

    /// Create (or re-create) the collection's secondary index from a sample
    /// object.
    ///
    /// Any existing index of the same name is dropped first: schema
    /// evolution here is idempotent replacement, not incremental change;
    /// the "no such index" error on first run is swallowed. The four
    /// metadata fields are always indexed; each top-level sample field is
    /// indexed as a tag (strings) or numeric (numbers), and every other
    /// type is skipped.
    pub async fn create_query_index(&self, sample: &Value) -> bool {
        let Some(sample_fields) = sample.as_object() else {
            warn!(collection = %self.name, "index sample must be an object");
            return false;
        };
        let conn = self.manager.connection();

        match conn.index_drop(&self.index_name()).await {
            Ok(true) => debug!(collection = %self.name, "dropped existing index"),
            Ok(false) => {}
            Err(e) => debug!(collection = %self.name, error = %e, "ignoring index drop failure"),
        }

        let mut fields = vec![
            IndexField::new("id", "$.id", IndexFieldKind::Tag),
            IndexField::new("createdAt", "$.createdAt", IndexFieldKind::Numeric),
            IndexField::new("updatedAt", "$.updatedAt", IndexFieldKind::Numeric),
            IndexField::new("updatedBy", "$.updatedBy", IndexFieldKind::Tag),
            IndexField::new("createdBy", "$.createdBy", IndexFieldKind::Tag),
        ];
        for (field, value) in sample_fields {
            let kind = match value {
                Value::String(_) => IndexFieldKind::Tag,
                Value::Number(_) => IndexFieldKind::Numeric,
                _ => {
                    debug!(collection = %self.name, field = %field, "skipping non-indexable field");
                    continue;
                }
            };
            fields.push(IndexField::new(field, format!("$.data.{field}"), kind));
        }

        let definition = IndexDefinition {
            name: self.index_name(),
            prefix: format!("{}:", self.path),
            fields,
        };
        match conn.index_create(definition).await {
            Ok(()) => true,
            Err(e) => {
                warn!(collection = %self.name, error = %e, "index creation failed");
                false
            }
        }
    }

    /// Exact-match equality query against the collection's index.
    ///
    /// String values are brace-wrapped with index metacharacters escaped
    /// (raw UUID-like values full of dashes and dots would otherwise match
    /// nothing or error); numeric values are queried as the closed range
    /// `[v, v]`. Results are truncated at 1000 matches, a fixed page, not
    /// a bug. Any failure is logged and yields an empty result.
    pub async fn query(&self, field: &str, value: impl Into<Value>) -> Vec<Document<T>> {
        let query = match value.into() {
            Value::String(s) => format!("@{field}:{{{}}}", escape_tag_value(&s)),
            Value::Number(n) => format!("@{field}:[{n} {n}]"),
            other => {
                warn!(collection = %self.name, field, ?other, "only strings and numbers are queryable");
                return Vec::new();
            }
        };
        let hits = match self
            .manager
            .connection()
            .index_search(&self.index_name(), &query, QUERY_PAGE_LIMIT)
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                warn!(collection = %self.name, query = %query, error = %e, "query failed");
                return Vec::new();
            }
        };
        hits.into_iter()
            .filter_map(|hit| match serde_json::from_value(hit) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!(collection = %self.name, error = %e, "skipping malformed hit");
                    None
                }
            })
            .collect()
    }

    /// Subscribe to every change in the collection.
    ///
    /// Pattern-subscribes under the collection prefix, so per-document
    /// messages and batch messages both arrive.
    ///
    /// # Errors
    ///
    /// Fails when the duplicated connection cannot be established.
    pub async fn subscribe<F>(&self, mut callback: F) -> Result<Subscription>
    where
        F: FnMut(ChangeMessage<Document<T>>) + Send + 'static,
    {
        let (conn, mut stream) = self.bus.open(&format!("{}:*", self.path)).await?;
        let name = self.name.clone();
        let task = tokio::spawn(async move {
            while let Some((channel, payload)) = stream.recv().await {
                match serde_json::from_str::<ChangeMessage<Document<T>>>(&payload) {
                    Ok(mut message) => {
                        message.set_col(&name);
                        callback(message);
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "discarding unparseable change message"),
                }
            }
        });
        Ok(Subscription::new(conn, task))
    }

    /// Subscribe to changes whose documents match one equality predicate.
    ///
    /// Each incoming message's doc array is trimmed to documents whose
    /// `data[field]` equals `value`; the callback is suppressed entirely
    /// when nothing survives the trim.
    ///
    /// # Errors
    ///
    /// Fails when the duplicated connection cannot be established.
    pub async fn subscribe_to_query<F>(
        &self,
        field: &str,
        value: impl Into<Value>,
        mut callback: F,
    ) -> Result<Subscription>
    where
        F: FnMut(ChangeMessage<Document<T>>) + Send + 'static,
    {
        let (conn, mut stream) = self.bus.open(&format!("{}:*", self.path)).await?;
        let name = self.name.clone();
        let field = field.to_string();
        let value = value.into();
        let task = tokio::spawn(async move {
            while let Some((channel, payload)) = stream.recv().await {
                let mut message =
                    match serde_json::from_str::<ChangeMessage<Document<Value>>>(&payload) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "discarding unparseable change message");
                            continue;
                        }
                    };
                message
                    .docs_mut()
                    .retain(|doc| doc.data.get(&field) == Some(&value));
                if message.docs().is_empty() {
                    continue;
                }
                message.set_col(&name);
                let typed = serde_json::to_value(&message)
                    .and_then(serde_json::from_value::<ChangeMessage<Document<T>>>);
                match typed {
                    Ok(message) => callback(message),
                    Err(e) => warn!(channel = %channel, error = %e, "discarding untypeable change message"),
                }
            }
        });
        Ok(Subscription::new(conn, task))
    }
}

/// Backslash-escape everything the index query syntax could misread.
///
/// Covers at least `#`, `-`, `.`, `@` plus the rest of the punctuation the
/// tag grammar reserves; alphanumerics and underscores pass through.
fn escape_tag_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_alphanumeric() || c == '_' {
            escaped.push(c);
        } else {
            escaped.push('\\');
            escaped.push(c);
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct User {
        name: String,
        age: i64,
    }

    fn user(name: &str, age: i64) -> User {
        User {
            name: name.to_string(),
            age,
        }
    }

    async fn create_test_collection() -> Collection<User> {
        let manager = Arc::new(
            ConnectionManager::connect(Arc::new(MemoryBackend::new()))
                .await
                .unwrap(),
        );
        let bus = ChangeBus::new(manager.clone());
        Collection::new(manager, bus, "app", "users", -1)
    }

    #[test]
    fn test_escape_tag_value() {
        assert_eq!(escape_tag_value("alice"), "alice");
        assert_eq!(escape_tag_value("a.b@c-d"), r"a\.b\@c\-d");
        assert_eq!(escape_tag_value("x#1"), r"x\#1");
        assert_eq!(escape_tag_value("under_score"), "under_score");
    }

    #[tokio::test]
    async fn test_add_doc_and_read_back() {
        let users = create_test_collection().await;

        let doc_ref = users.add_doc(user("alice", 30), "admin").await.unwrap();
        let doc = doc_ref.read().await.unwrap();
        assert_eq!(doc.data, user("alice", 30));
        assert_eq!(doc.created_by, "admin");
    }

    #[tokio::test]
    async fn test_add_doc_with_forced_id() {
        let users = create_test_collection().await;

        let doc_ref = users
            .add_doc_with_id(user("bob", 40), "admin", "bob-id")
            .await
            .unwrap();
        assert_eq!(doc_ref.id(), "bob-id");
        assert_eq!(users.doc_ref("bob-id").read().await.unwrap().data.name, "bob");
    }

    #[tokio::test]
    async fn test_get_all_docs_skips_set_companions() {
        let users = create_test_collection().await;
        users.add_doc_with_id(user("a", 1), "admin", "u1").await.unwrap();
        users
            .set_doc_ref("g1")
            .set(&["m".to_string()], "admin", -1, false)
            .await;

        let refs = users.get_all_doc_refs().await;
        let mut ids: Vec<&str> = refs.iter().map(DocumentRef::id).collect();
        ids.sort_unstable();
        // the set document envelope is a real key; its _set companion is not
        assert_eq!(ids, vec!["g1", "u1"]);
    }

    #[tokio::test]
    async fn test_index_and_query() {
        let users = create_test_collection().await;
        assert!(users.create_query_index(&json!({"name": "", "age": 0})).await);

        users.add_doc(user("alice", 30), "admin").await.unwrap();
        users.add_doc(user("bob", 40), "admin").await.unwrap();

        let hits = users.query("name", "alice").await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].data.age, 30);

        let hits = users.query("age", 40).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].data.name, "bob");

        let hits = users.query("name", "nobody").await;
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_index_creation_is_idempotent() {
        let users = create_test_collection().await;
        let sample = json!({"name": ""});
        assert!(users.create_query_index(&sample).await);
        assert!(users.create_query_index(&sample).await);

        users.add_doc(user("alice", 1), "admin").await.unwrap();
        assert_eq!(users.query("name", "alice").await.len(), 1);
    }

    #[tokio::test]
    async fn test_query_metadata_fields() {
        let users = create_test_collection().await;
        users.create_query_index(&json!({"name": ""})).await;
        users.add_doc(user("alice", 1), "admin").await.unwrap();

        let hits = users.query("createdBy", "admin").await;
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_query_escaped_special_characters() {
        let users = create_test_collection().await;
        users.create_query_index(&json!({"name": ""})).await;
        users.add_doc(user("a.b@c-d", 1), "admin").await.unwrap();

        let hits = users.query("name", "a.b@c-d").await;
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_update_docs_filters_failures() {
        let users = create_test_collection().await;
        let doc_ref = users
            .add_doc_with_id(user("alice", 30), "admin", "u1")
            .await
            .unwrap();

        let outcome = users
            .update_docs(
                vec![
                    DocUpdate {
                        id: "u1".to_string(),
                        updates: crate::doc::Patch::new().with("age", 31),
                    },
                    DocUpdate {
                        id: "missing".to_string(),
                        updates: crate::doc::Patch::new().with("age", 99),
                    },
                ],
                "admin",
            )
            .await;

        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(outcome.failed, vec!["missing".to_string()]);
        assert!(!outcome.is_complete());
        assert_eq!(doc_ref.read().await.unwrap().data.age, 31);
    }

    #[tokio::test]
    async fn test_delete_docs_returns_per_item_results() {
        let users = create_test_collection().await;
        users.add_doc_with_id(user("a", 1), "admin", "u1").await.unwrap();

        let results = users
            .delete_docs(&["u1".to_string(), "missing".to_string()])
            .await;
        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert!(users.get_all_docs().await.is_empty());
    }
}
