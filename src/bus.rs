//! Change-notification bus.
//!
//! A minimal named-channel publish/subscribe facility. The document layer
//! uses it internally to announce CREATE/UPDATE/DELETE after every
//! mutation, and the facade re-exposes it (as [`PubSub`], under the
//! project's `PUBSUB` key segment) for cross-cutting notifications that are
//! not tied to any document, such as presence and cursor broadcast in the
//! surrounding application.
//!
//! Every subscription duplicates the connection, because the backend cannot
//! block on messages and serve commands on the same connection. The
//! returned [`Subscription`] owns that duplicate; see [`crate::subscription`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::connection::{Connection, ConnectionManager};
use crate::doc::Patch;
use crate::error::{Error, Result};
use crate::subscription::Subscription;

/// What a caller asked an update to change, alongside the document id.
///
/// Rides in UPDATE messages verbatim: it is the requested patch, not a
/// computed diff of what actually persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocUpdate {
    /// Id of the updated document.
    pub id: String,
    /// The requested field changes.
    pub updates: Patch,
}

/// A change notification, broadcast after every mutation.
///
/// Wire shape (JSON-serialized as the pub/sub payload body):
///
/// ```json
/// {"type": "CREATE" | "UPDATE" | "DELETE",
///  "col": "...",
///  "doc": [ ...full envelopes... ],
///  "updates": [{"id": "...", "updates": {...}}]}
/// ```
///
/// `doc` carries one-or-more full envelopes: the created/deleted documents,
/// or the post-update reads. A batch mutation produces exactly one message
/// whose `doc` array holds every item that succeeded; an empty array is a
/// legal no-event signal that subscribers must tolerate.
///
/// The type is generic over the envelope (`Document<T>` for ordinary
/// collections, [`SetDocument`](crate::set_doc::SetDocument) for set
/// documents).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ChangeMessage<D> {
    /// One or more documents were created.
    #[serde(rename = "CREATE")]
    Create {
        /// Collection name.
        col: String,
        /// The created envelopes.
        doc: Vec<D>,
    },
    /// One or more documents were updated.
    #[serde(rename = "UPDATE")]
    Update {
        /// Collection name.
        col: String,
        /// The envelopes as re-read after the update.
        doc: Vec<D>,
        /// What was requested per document (independent of what persisted).
        updates: Vec<DocUpdate>,
    },
    /// One or more documents were deleted.
    #[serde(rename = "DELETE")]
    Delete {
        /// Collection name.
        col: String,
        /// Pre-deletion snapshots.
        doc: Vec<D>,
    },
}

impl<D> ChangeMessage<D> {
    /// The collection this change belongs to.
    #[must_use]
    pub fn col(&self) -> &str {
        match self {
            Self::Create { col, .. } | Self::Update { col, .. } | Self::Delete { col, .. } => col,
        }
    }

    /// Re-tag the message with a collection name.
    ///
    /// Subscribers know which collection they watch and stamp it on every
    /// incoming message rather than trusting the payload.
    pub fn set_col(&mut self, name: &str) {
        match self {
            Self::Create { col, .. } | Self::Update { col, .. } | Self::Delete { col, .. } => {
                name.clone_into(col);
            }
        }
    }

    /// The envelopes carried by this change.
    #[must_use]
    pub fn docs(&self) -> &[D] {
        match self {
            Self::Create { doc, .. } | Self::Update { doc, .. } | Self::Delete { doc, .. } => doc,
        }
    }

    /// Mutable access to the carried envelopes (used by filtered
    /// subscriptions to trim the array).
    pub fn docs_mut(&mut self) -> &mut Vec<D> {
        match self {
            Self::Create { doc, .. } | Self::Update { doc, .. } | Self::Delete { doc, .. } => doc,
        }
    }
}

/// Named-channel publish/subscribe over the connection manager.
#[derive(Clone)]
pub struct ChangeBus {
    manager: Arc<ConnectionManager>,
}

impl ChangeBus {
    pub(crate) fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Publish a JSON-serializable message on a channel.
    ///
    /// Returns the number of subscribers it reached.
    ///
    /// # Errors
    ///
    /// Serialization or backend failures.
    pub async fn publish<M: Serialize>(&self, channel: &str, message: &M) -> Result<usize> {
        let payload = serde_json::to_string(message)
            .map_err(|e| Error::backend(format!("failed to serialize message: {e}")))?;
        self.manager.connection().publish(channel, &payload).await
    }

    /// Publish and swallow failures.
    ///
    /// Mutations announce their change messages through here: a publish
    /// failure must not turn a persisted write into a failed one.
    pub(crate) async fn announce<M: Serialize>(&self, channel: &str, message: &M) {
        if let Err(e) = self.publish(channel, message).await {
            warn!(channel = %channel, error = %e, "failed to publish change message");
        }
    }

    /// Duplicate a connection and open a raw message stream on `pattern`.
    pub(crate) async fn open(
        &self,
        pattern: &str,
    ) -> Result<(Connection, crate::backend::MessageStream)> {
        let conn = self.manager.duplicate().await?;
        let stream = conn.subscribe(pattern).await?;
        Ok((conn, stream))
    }

    /// Subscribe to a channel (or trailing-`*` pattern), decoding each
    /// payload as `M` before invoking the callback.
    ///
    /// Payloads that fail to decode are logged and dropped.
    ///
    /// # Errors
    ///
    /// Fails when the duplicated connection cannot be established.
    pub async fn subscribe<M, F>(&self, pattern: &str, mut callback: F) -> Result<Subscription>
    where
        M: DeserializeOwned + Send + 'static,
        F: FnMut(M) + Send + 'static,
    {
        let (conn, mut stream) = self.open(pattern).await?;
        let task = tokio::spawn(async move {
            while let Some((channel, payload)) = stream.recv().await {
                match serde_json::from_str::<M>(&payload) {
                    Ok(message) => callback(message),
                    Err(e) => warn!(channel = %channel, error = %e, "discarding unparseable message"),
                }
            }
        });
        Ok(Subscription::new(conn, task))
    }
}

/// Ad-hoc channels under the project's `PUBSUB` key segment.
///
/// Obtained from [`SyncBase::pubsub`](crate::SyncBase::pubsub). Channel
/// names are namespaced automatically, so `presence` becomes
/// `{project}:PUBSUB:presence` on the wire.
pub struct PubSub {
    bus: ChangeBus,
    prefix: String,
}

impl PubSub {
    pub(crate) fn new(bus: ChangeBus, project: &str) -> Self {
        Self {
            bus,
            prefix: format!("{project}:{}:", crate::PUBSUB_SEGMENT),
        }
    }

    fn channel_key(&self, channel: &str) -> String {
        format!("{}{channel}", self.prefix)
    }

    /// Publish a message on an ad-hoc channel.
    ///
    /// # Errors
    ///
    /// Serialization or backend failures.
    pub async fn publish<M: Serialize>(&self, channel: &str, message: &M) -> Result<usize> {
        self.bus.publish(&self.channel_key(channel), message).await
    }

    /// Subscribe to an ad-hoc channel.
    ///
    /// # Errors
    ///
    /// Fails when the duplicated connection cannot be established.
    pub async fn subscribe<M, F>(&self, channel: &str, callback: F) -> Result<Subscription>
    where
        M: DeserializeOwned + Send + 'static,
        F: FnMut(M) + Send + 'static,
    {
        self.bus.subscribe(&self.channel_key(channel), callback).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape_create() {
        let message: ChangeMessage<serde_json::Value> = ChangeMessage::Create {
            col: "users".to_string(),
            doc: vec![json!({"id": "d1"})],
        };
        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(
            wire,
            json!({"type": "CREATE", "col": "users", "doc": [{"id": "d1"}]})
        );
    }

    #[test]
    fn test_wire_shape_update_roundtrip() {
        let message: ChangeMessage<serde_json::Value> = ChangeMessage::Update {
            col: "users".to_string(),
            doc: vec![json!({"id": "d1"})],
            updates: vec![DocUpdate {
                id: "d1".to_string(),
                updates: Patch::new().with("name", "alicia"),
            }],
        };
        let wire = serde_json::to_string(&message).unwrap();
        let back: ChangeMessage<serde_json::Value> = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, message);
        assert!(wire.contains(r#""type":"UPDATE""#));
    }

    #[test]
    fn test_set_col_retags() {
        let mut message: ChangeMessage<serde_json::Value> = ChangeMessage::Delete {
            col: "bogus".to_string(),
            doc: vec![],
        };
        message.set_col("users");
        assert_eq!(message.col(), "users");
    }
}
