//! Configuration for the syncbase facade.
//!
//! This module provides the [`Config`] struct consumed by
//! [`SyncBase::init`](crate::SyncBase::init). Configuration covers the
//! project key namespace plus the two optional subsystems: identity storage
//! ([`AuthConfig`]) and log-filter installation ([`LogConfig`]).
//!
//! # Example
//!
//! ```rust
//! use syncbase::{AuthConfig, Config, LogConfig};
//!
//! // Minimal configuration: just the project namespace
//! let config = Config::new("whiteboard");
//!
//! // Full configuration with builder pattern
//! let config = Config::new("whiteboard")
//!     .with_auth(AuthConfig::default())
//!     .with_log(LogConfig::new("syncbase=debug"));
//! ```

use serde::{Deserialize, Serialize};

/// Default session lifetime: 24 hours.
const DEFAULT_SESSION_TTL_SECS: i64 = 60 * 60 * 24;

/// Configuration for the syncbase facade.
///
/// Every key written by the library is namespaced under `project`, so
/// multiple applications can share one backend without colliding:
///
/// ```text
/// {project}:DB:{collection}:{id}         documents
/// {project}:DB:{collection}:{id}_set     set-document members
/// {project}:PUBSUB:{channel}             ad-hoc channels
/// {project}:AUTH:DB:{provider}{id}       identity records
/// {project}:AUTH:SESSION:{id}            sessions
/// ```
///
/// # Defaults
///
/// - `project`: required, no default
/// - `auth`: `None` (identity accessor unavailable)
/// - `log`: `None` (no subscriber installed; the host app owns logging)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Key namespace shared by everything this facade writes.
    pub project: String,

    /// Identity storage configuration.
    ///
    /// When `None`, [`SyncBase::auth`](crate::SyncBase::auth) returns `None`
    /// and no boot-time purge of temporary accounts runs.
    pub auth: Option<AuthConfig>,

    /// Log filter configuration.
    ///
    /// When set, init installs a `tracing-subscriber` with the given
    /// env-filter directive. Leave `None` when the host application
    /// installs its own subscriber.
    pub log: Option<LogConfig>,
}

impl Config {
    /// Create a new configuration with the given project namespace
    #[must_use]
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            auth: None,
            log: None,
        }
    }

    /// Enable the identity subsystem
    #[must_use]
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Install a log filter at init
    #[must_use]
    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = Some(log);
        self
    }
}

/// Configuration for the identity subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Lifetime applied to session records, in seconds.
    ///
    /// Default is 24 hours.
    pub session_ttl_secs: i64,
}

impl AuthConfig {
    /// Create an auth configuration with the given session lifetime
    #[must_use]
    pub const fn new(session_ttl_secs: i64) -> Self {
        Self { session_ttl_secs }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL_SECS)
    }
}

/// Configuration for log-filter installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// An env-filter directive, e.g. `"syncbase=debug"` or `"info"`.
    pub filter: String,
}

impl LogConfig {
    /// Create a log configuration with the given filter directive
    #[must_use]
    pub fn new(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_minimal() {
        let config = Config::new("whiteboard");
        assert_eq!(config.project, "whiteboard");
        assert!(config.auth.is_none());
        assert!(config.log.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new("whiteboard")
            .with_auth(AuthConfig::new(600))
            .with_log(LogConfig::new("syncbase=trace"));

        assert_eq!(config.auth.unwrap().session_ttl_secs, 600);
        assert_eq!(config.log.unwrap().filter, "syncbase=trace");
    }

    #[test]
    fn test_auth_config_default() {
        let auth = AuthConfig::default();
        assert_eq!(auth.session_ttl_secs, 60 * 60 * 24);
    }
}
