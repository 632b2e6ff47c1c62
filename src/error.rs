//! Error types for syncbase.
//!
//! This module defines the [`enum@Error`] enum and [`Result`] type alias used
//! throughout the library.
//!
//! # Error Categories
//!
//! Errors are categorized by the operation that failed:
//!
//! - [`Error::Init`] - Facade initialization failures (fatal by contract)
//! - [`Error::Connection`] - Connection acquisition or mode violations
//! - [`Error::Backend`] - Failures reported by the underlying store
//! - [`Error::Document`] - Document envelope operations
//! - [`Error::Collection`] - Collection-level operations
//! - [`Error::Index`] - Secondary-index creation/removal
//! - [`Error::Query`] - Equality-query syntax or execution
//! - [`Error::Auth`] - Identity record operations
//! - [`Error::Config`] - Configuration issues
//!
//! Only `init` and `subscribe` surfaces propagate these errors to callers.
//! CRUD operations catch them internally and report failure through
//! `Option`/`WriteResult` return values instead.

use std::sync::Arc;
use thiserror::Error;

/// Result type alias for syncbase operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in syncbase operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Failed to initialize the facade
    #[error("initialization failed: {0}")]
    Init(Arc<str>),

    /// Failed to acquire a connection, or a command was issued on a
    /// connection that is in subscriber mode
    #[error("connection error: {0}")]
    Connection(Arc<str>),

    /// The underlying store reported a failure
    #[error("backend error: {0}")]
    Backend(Arc<str>),

    /// Document operation failed
    #[error("document error: {0}")]
    Document(Arc<str>),

    /// Collection operation failed
    #[error("collection error: {0}")]
    Collection(Arc<str>),

    /// Index creation or removal failed
    #[error("index error: {0}")]
    Index(Arc<str>),

    /// Malformed or unexecutable equality query
    #[error("query error: {0}")]
    Query(Arc<str>),

    /// Identity record operation failed
    #[error("auth error: {0}")]
    Auth(Arc<str>),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(Arc<str>),
}

impl Error {
    /// Create an initialization error
    #[inline]
    pub fn init(msg: impl Into<String>) -> Self {
        Self::Init(Arc::from(msg.into()))
    }

    /// Create a connection error
    #[inline]
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(Arc::from(msg.into()))
    }

    /// Create a backend error
    #[inline]
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(Arc::from(msg.into()))
    }

    /// Create a document error
    #[inline]
    pub fn document(msg: impl Into<String>) -> Self {
        Self::Document(Arc::from(msg.into()))
    }

    /// Create a collection error
    #[inline]
    pub fn collection(msg: impl Into<String>) -> Self {
        Self::Collection(Arc::from(msg.into()))
    }

    /// Create an index error
    #[inline]
    pub fn index(msg: impl Into<String>) -> Self {
        Self::Index(Arc::from(msg.into()))
    }

    /// Create a query error
    #[inline]
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(Arc::from(msg.into()))
    }

    /// Create an auth error
    #[inline]
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(Arc::from(msg.into()))
    }

    /// Create a configuration error
    #[inline]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(Arc::from(msg.into()))
    }
}
