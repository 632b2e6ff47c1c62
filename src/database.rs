//! Typed accessors over the document layer.
//!
//! [`Database`] is the facade-owned handle consumers use to reach
//! collections and individual documents. It is cheap to clone and carries
//! no state of its own beyond the project namespace and the shared
//! connection manager: every ref it hands out is a stateless proxy over a
//! key path.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bus::ChangeBus;
use crate::collection::Collection;
use crate::connection::ConnectionManager;
use crate::doc::DocumentRef;
use crate::set_doc::SetDocumentRef;
use crate::NO_EXPIRY;

/// The document layer: typed collection and document accessors.
#[derive(Clone)]
pub struct Database {
    project: String,
    manager: Arc<ConnectionManager>,
    bus: ChangeBus,
}

impl Database {
    pub(crate) fn new(project: impl Into<String>, manager: Arc<ConnectionManager>, bus: ChangeBus) -> Self {
        Self {
            project: project.into(),
            manager,
            bus,
        }
    }

    /// A collection handle without expiration.
    #[must_use]
    pub fn collection<T>(&self, name: impl Into<String>) -> Collection<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
    {
        self.collection_with_ttl(name, NO_EXPIRY)
    }

    /// A collection handle whose documents expire `ttl_secs` seconds after
    /// each write (`-1` disables expiration).
    ///
    /// Expiration is the opt-in per-collection contract; there is no
    /// general retention policy anywhere in this layer.
    #[must_use]
    pub fn collection_with_ttl<T>(&self, name: impl Into<String>, ttl_secs: i64) -> Collection<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
    {
        Collection::new(
            self.manager.clone(),
            self.bus.clone(),
            &self.project,
            name,
            ttl_secs,
        )
    }

    /// A direct handle to one document. No I/O.
    #[must_use]
    pub fn doc_ref<T>(&self, collection: &str, id: impl Into<String>) -> DocumentRef<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
    {
        self.collection::<T>(collection).doc_ref(id)
    }

    /// A direct handle to one set document. No I/O.
    #[must_use]
    pub fn set_doc_ref(&self, collection: &str, id: impl Into<String>) -> SetDocumentRef {
        self.collection::<serde_json::Value>(collection).set_doc_ref(id)
    }
}
