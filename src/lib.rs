//! # syncbase - embedded real-time document layer
//!
//! syncbase is the storage core of a collaborative-board application: CRUD
//! documents, typed collections with secondary-index equality queries,
//! set-valued documents, and a publish/subscribe change bus, all over one
//! underlying key-value store. Every mutation fans out exactly one change
//! notification to all interested subscribers, even when the mutation is a
//! batch of independent per-item operations with partial failure.
//!
//! ## Features
//!
//! - **Document envelopes**: every payload is wrapped in creation/update
//!   metadata (`id`, timestamps, actor fields) and stored atomically.
//! - **Typed collections**: bulk add/update/delete with exactly one change
//!   message per batch, schema'd secondary indexes, exact-match queries.
//! - **Set documents**: the same envelope and lifecycle over a native set
//!   of string members.
//! - **Change bus**: named-channel pub/sub used internally for
//!   CREATE/UPDATE/DELETE announcements and exposed for ad-hoc channels.
//! - **Pluggable backend**: the four store primitives live behind the
//!   [`Backend`] trait; an in-process [`MemoryBackend`] ships in the box.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use syncbase::{Config, Patch, SyncBase};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Card {
//!     title: String,
//!     votes: i64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> syncbase::Result<()> {
//!     let base = SyncBase::init(Config::new("whiteboard")).await?;
//!     let cards = base.database().collection::<Card>("cards");
//!
//!     // Index and create
//!     cards
//!         .create_query_index(&serde_json::json!({"title": "", "votes": 0}))
//!         .await;
//!     let card_ref = cards
//!         .add_doc(Card { title: "retro".into(), votes: 0 }, "alice")
//!         .await
//!         .expect("write failed");
//!
//!     // React to changes from anywhere in the process
//!     let sub = cards.subscribe(|message| {
//!         println!("{} changed: {} docs", message.col(), message.docs().len());
//!     }).await?;
//!
//!     // Query and mutate
//!     let hits = cards.query("title", "retro").await;
//!     assert_eq!(hits.len(), 1);
//!     card_ref.update(&Patch::new().with("votes", 1), "bob", true).await;
//!
//!     // Subscriptions are scoped resources: close them.
//!     sub.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: Facade configuration
//! - [`node`]: The [`SyncBase`] facade and initialization order
//! - [`database`]: Typed collection/document accessors
//! - [`collection`]: Batch operations, indexes, queries, subscriptions
//! - [`doc`]: Document envelopes and per-document operations
//! - [`set_doc`]: Set-valued documents
//! - [`bus`]: Change messages and the pub/sub bus
//! - [`subscription`]: Scoped subscription teardown
//! - [`connection`]: Connection ownership and duplication
//! - [`backend`]: The four-primitive store abstraction
//! - [`auth`]: Identity records and sessions
//! - [`error`]: Error types and Result alias

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all, clippy::pedantic)]

pub mod auth;
pub mod backend;
pub mod bus;
pub mod collection;
pub mod config;
pub mod connection;
pub mod database;
pub mod doc;
pub mod error;
pub mod node;
pub mod set_doc;
pub mod subscription;

// =============================================================================
// Public re-exports - the primary public API
// =============================================================================

pub use auth::{AuthProfile, AuthRecord, AuthStore, TEMPORARY_PROVIDERS};
pub use backend::{Backend, IndexDefinition, IndexField, IndexFieldKind, MemoryBackend};
pub use bus::{ChangeBus, ChangeMessage, DocUpdate, PubSub};
pub use collection::{BatchOutcome, Collection};
pub use config::{AuthConfig, Config, LogConfig};
pub use connection::{Connection, ConnectionManager};
pub use database::Database;
pub use doc::{Document, DocumentRef, Patch, WriteResult};
pub use error::{Error, Result};
pub use node::SyncBase;
pub use set_doc::{SetDocument, SetDocumentRef};
pub use subscription::Subscription;

// =============================================================================
// Constants
// =============================================================================

/// Key segment for document storage: `{project}:DB:{collection}:{id}`.
pub const DB_SEGMENT: &str = "DB";

/// Key segment for ad-hoc channels: `{project}:PUBSUB:{channel}`.
pub const PUBSUB_SEGMENT: &str = "PUBSUB";

/// Key segment for identity records: `{project}:AUTH:DB:{provider}{id}`.
pub const AUTH_SEGMENT: &str = "AUTH";

/// TTL value disabling expiration.
pub const NO_EXPIRY: i64 = -1;

/// Fixed page size for equality queries; results beyond it are truncated.
pub const QUERY_PAGE_LIMIT: usize = 1000;
