//! Set-valued documents.
//!
//! A set document shares the metadata envelope and lifecycle of an ordinary
//! document but its payload is an unordered collection of string members,
//! stored in a companion native set at `<key>_set`. The envelope record and
//! the set are created and deleted together; one existing without the other
//! is an invariant violation, which write operations guard against with
//! existence-checked operations.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::bus::{ChangeBus, ChangeMessage, DocUpdate};
use crate::connection::ConnectionManager;
use crate::doc::{Document, Patch, WriteResult};
use crate::error::{Error, Result};
use crate::subscription::Subscription;

/// Suffix deriving the companion set key from the envelope key.
pub(crate) const SET_KEY_SUFFIX: &str = "_set";

/// The envelope of a set document: metadata only, no payload field.
///
/// Membership lives in the companion set and is read through
/// [`SetDocumentRef::members`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SetDocument {
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
}

/// Lift a set-document envelope into the [`Document`] envelope that
/// [`WriteResult`] carries. A set document has no payload, so the envelope
/// itself rides in the `data` slot; `WriteResult::doc` is informational only
/// for set-document writes.
fn as_envelope(doc: SetDocument) -> Document<SetDocument> {
    Document {
        id: doc.id.clone(),
        created_at: doc.created_at,
        created_by: doc.created_by.clone(),
        updated_at: doc.updated_at,
        updated_by: doc.updated_by.clone(),
        data: doc,
    }
}

/// A handle to one set document.
pub struct SetDocumentRef {
    collection: String,
    id: String,
    key: String,
    set_key: String,
    manager: Arc<ConnectionManager>,
    bus: ChangeBus,
}

impl SetDocumentRef {
    pub(crate) fn new(
        manager: Arc<ConnectionManager>,
        bus: ChangeBus,
        collection: impl Into<String>,
        path: &str,
        id: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let key = format!("{path}:{id}");
        Self {
            collection: collection.into(),
            set_key: format!("{key}{SET_KEY_SUFFIX}"),
            key,
            id,
            manager,
            bus,
        }
    }

    /// The document id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The envelope key
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the envelope. `None` when absent or on any backend error.
    pub async fn read(&self) -> Option<SetDocument> {
        match self.read_inner().await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(key = %self.key, error = %e, "read failed");
                None
            }
        }
    }

    async fn read_inner(&self) -> Result<Option<SetDocument>> {
        let Some(value) = self.manager.connection().json_get(&self.key).await? else {
            return Ok(None);
        };
        let doc = serde_json::from_value(value)
            .map_err(|e| Error::document(format!("malformed envelope at {}: {e}", self.key)))?;
        Ok(Some(doc))
    }

    /// Read the member set. Empty when the document does not exist or on
    /// backend error (logged).
    pub async fn members(&self) -> HashSet<String> {
        match self.manager.connection().set_members(&self.set_key).await {
            Ok(members) => members.into_iter().collect(),
            Err(e) => {
                warn!(key = %self.set_key, error = %e, "member read failed");
                HashSet::new()
            }
        }
    }

    /// Replace the whole set: envelope rewritten, members deleted and
    /// re-added. Announces CREATE when `publish` is set.
    pub async fn set(
        &self,
        members: &[String],
        actor: &str,
        ttl_secs: i64,
        publish: bool,
    ) -> WriteResult<SetDocument> {
        match self.set_inner(members, actor, ttl_secs, publish).await {
            Ok(result) => result,
            Err(e) => {
                warn!(key = %self.key, error = %e, "set failed");
                WriteResult::failure()
            }
        }
    }

    async fn set_inner(
        &self,
        members: &[String],
        actor: &str,
        ttl_secs: i64,
        publish: bool,
    ) -> Result<WriteResult<SetDocument>> {
        let conn = self.manager.connection();
        let now = conn.now_ms().await?;
        let doc = SetDocument {
            id: self.id.clone(),
            created_at: now,
            created_by: actor.to_string(),
            updated_at: now,
            updated_by: actor.to_string(),
        };
        let value = serde_json::to_value(&doc)
            .map_err(|e| Error::document(format!("failed to serialize envelope: {e}")))?;

        // Envelope and members are written together; the _set key is
        // replaced wholesale so stale members cannot survive a set().
        conn.json_set(&self.key, &value, ttl_secs).await?;
        conn.set_delete(&self.set_key).await?;
        if !members.is_empty() {
            conn.set_add(&self.set_key, members).await?;
        }
        debug!(key = %self.key, members = members.len(), "set document written");

        if publish {
            let message = ChangeMessage::Create {
                col: self.collection.clone(),
                doc: vec![doc.clone()],
            };
            self.bus.announce(&self.key, &message).await;
        }
        Ok(WriteResult::ok(now, as_envelope(doc)))
    }

    /// Add members to an existing set document.
    ///
    /// Additive only, and existence-checked: when the envelope is missing
    /// the operation fails with `success: false` rather than conjuring a
    /// half-made document.
    pub async fn add(
        &self,
        members: &[String],
        actor: &str,
        publish: bool,
    ) -> WriteResult<SetDocument> {
        match self.add_inner(members, actor, publish).await {
            Ok(result) => result,
            Err(e) => {
                warn!(key = %self.key, error = %e, "add failed");
                WriteResult::failure()
            }
        }
    }

    async fn add_inner(
        &self,
        members: &[String],
        actor: &str,
        publish: bool,
    ) -> Result<WriteResult<SetDocument>> {
        let conn = self.manager.connection();
        if !conn.exists(&self.key).await? {
            return Ok(WriteResult::failure());
        }
        conn.set_add(&self.set_key, members).await?;

        let now = conn.now_ms().await?;
        conn.json_set_path(&self.key, "$.updatedAt", &Value::from(now))
            .await?;
        if !actor.is_empty() {
            conn.json_set_path(&self.key, "$.updatedBy", &Value::String(actor.to_string()))
                .await?;
        }
        let doc = self
            .read_inner()
            .await?
            .ok_or_else(|| Error::document("envelope vanished during add"))?;

        if publish {
            let message = ChangeMessage::Update {
                col: self.collection.clone(),
                doc: vec![doc.clone()],
                updates: vec![DocUpdate {
                    id: self.id.clone(),
                    updates: Patch::new().with("members", members.to_vec()),
                }],
            };
            self.bus.announce(&self.key, &message).await;
        }
        Ok(WriteResult::ok(now, as_envelope(doc)))
    }

    /// Delete the envelope and its companion set together.
    ///
    /// Returns the pre-deletion envelope snapshot; deleting a nonexistent
    /// set document is a no-op returning `success: false`.
    pub async fn delete(&self, publish: bool) -> WriteResult<SetDocument> {
        match self.delete_inner(publish).await {
            Ok(result) => result,
            Err(e) => {
                warn!(key = %self.key, error = %e, "delete failed");
                WriteResult::failure()
            }
        }
    }

    async fn delete_inner(&self, publish: bool) -> Result<WriteResult<SetDocument>> {
        let Some(doc) = self.read_inner().await? else {
            return Ok(WriteResult::failure());
        };
        let conn = self.manager.connection();
        let now = conn.now_ms().await?;
        conn.delete(&self.key).await?;
        conn.set_delete(&self.set_key).await?;

        if publish {
            let message = ChangeMessage::Delete {
                col: self.collection.clone(),
                doc: vec![doc.clone()],
            };
            self.bus.announce(&self.key, &message).await;
        }
        Ok(WriteResult::ok(now, as_envelope(doc)))
    }

    /// Subscribe to changes of this set document.
    ///
    /// # Errors
    ///
    /// Fails when the duplicated connection cannot be established.
    pub async fn subscribe<F>(&self, mut callback: F) -> Result<Subscription>
    where
        F: FnMut(ChangeMessage<SetDocument>) + Send + 'static,
    {
        let (conn, mut stream) = self.bus.open(&self.key).await?;
        let collection = self.collection.clone();
        let task = tokio::spawn(async move {
            while let Some((channel, payload)) = stream.recv().await {
                match serde_json::from_str::<ChangeMessage<SetDocument>>(&payload) {
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

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    async fn create_test_ref(id: &str) -> SetDocumentRef {
        let manager = Arc::new(
            ConnectionManager::connect(Arc::new(MemoryBackend::new()))
                .await
                .unwrap(),
        );
        let bus = ChangeBus::new(manager.clone());
        SetDocumentRef::new(manager, bus, "rooms", "app:DB:rooms", id)
    }

    #[tokio::test]
    async fn test_set_creates_envelope_and_members() {
        let set_ref = create_test_ref("r1").await;

        let result = set_ref.set(&strings(&["a", "b"]), "alice", -1, false).await;
        assert!(result.success);

        let doc = set_ref.read().await.unwrap();
        assert_eq!(doc.id, "r1");
        assert_eq!(doc.created_by, "alice");
        assert_eq!(set_ref.members().await, strings(&["a", "b"]).into_iter().collect());
    }

    #[tokio::test]
    async fn test_set_replaces_members() {
        let set_ref = create_test_ref("r1").await;
        set_ref.set(&strings(&["a", "b"]), "alice", -1, false).await;
        set_ref.set(&strings(&["c"]), "alice", -1, false).await;

        assert_eq!(set_ref.members().await, strings(&["c"]).into_iter().collect());
    }

    #[tokio::test]
    async fn test_add_requires_existing_envelope() {
        let set_ref = create_test_ref("r1").await;

        let result = set_ref.add(&strings(&["a"]), "alice", false).await;
        assert!(!result.success);
        assert!(set_ref.members().await.is_empty());
    }

    #[tokio::test]
    async fn test_add_is_additive() {
        let set_ref = create_test_ref("r1").await;
        set_ref.set(&strings(&["a"]), "alice", -1, false).await;

        let result = set_ref.add(&strings(&["b", "c"]), "bob", false).await;
        assert!(result.success);
        assert_eq!(result.doc.unwrap().updated_by, "bob");
        assert_eq!(
            set_ref.members().await,
            strings(&["a", "b", "c"]).into_iter().collect()
        );
    }

    #[tokio::test]
    async fn test_delete_removes_both_keys() {
        let set_ref = create_test_ref("r1").await;
        set_ref.set(&strings(&["a"]), "alice", -1, false).await;

        let result = set_ref.delete(false).await;
        assert!(result.success);
        assert_eq!(result.doc.unwrap().id, "r1");

        assert!(set_ref.read().await.is_none());
        assert!(set_ref.members().await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_nonexistent_is_noop() {
        let set_ref = create_test_ref("r1").await;
        assert!(!set_ref.delete(false).await.success);
    }
}
