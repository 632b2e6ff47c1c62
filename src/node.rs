//! The syncbase facade.
//!
//! [`SyncBase`] is an explicit context object, constructed once at process
//! start and passed by reference to every consumer. Construction *is*
//! initialization: there is no ambient singleton and no "used before init"
//! state to guard against: if you hold a `SyncBase`, the primary
//! connection is up and the document layer is ready.
//!
//! # Initialization order
//!
//! 1. Connect the primary connection (failure here is fatal; init aborts)
//! 2. Construct the change bus
//! 3. Construct the document layer ([`Database`])
//! 4. If auth is configured: construct the [`AuthStore`] and purge
//!    ephemeral guest/spectator identities
//! 5. If a log filter is configured: install the tracing subscriber
//!
//! # Example
//!
//! ```rust,no_run
//! use syncbase::{Config, SyncBase};
//!
//! # async fn example() -> syncbase::Result<()> {
//! let base = SyncBase::init(Config::new("whiteboard")).await?;
//!
//! let notes = base.database().collection::<serde_json::Value>("notes");
//! let note = notes.add_doc(serde_json::json!({"text": "hello"}), "alice").await;
//! assert!(note.is_some());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::{info, warn};

use crate::auth::AuthStore;
use crate::backend::{Backend, MemoryBackend};
use crate::bus::{ChangeBus, PubSub};
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::database::Database;
use crate::error::Result;

/// The facade: owns configuration, connections, and the subsystem handles.
///
/// Cheap to share behind an `Arc`; all handles it returns are themselves
/// clonable or reference-shaped.
pub struct SyncBase {
    config: Config,
    manager: Arc<ConnectionManager>,
    database: Database,
    pubsub: PubSub,
    auth: Option<AuthStore>,
}

impl SyncBase {
    /// Initialize against the bundled in-memory backend.
    ///
    /// # Errors
    ///
    /// Fails when the backend is unreachable (fatal by contract).
    pub async fn init(config: Config) -> Result<Self> {
        Self::init_with_backend(config, Arc::new(MemoryBackend::new())).await
    }

    /// Initialize against any [`Backend`] implementation.
    ///
    /// # Errors
    ///
    /// Fails when the backend is unreachable (fatal by contract).
    pub async fn init_with_backend(config: Config, backend: Arc<dyn Backend>) -> Result<Self> {
        info!(project = %config.project, "initializing syncbase");

        let manager = Arc::new(ConnectionManager::connect(backend).await?);
        let bus = ChangeBus::new(manager.clone());
        let database = Database::new(&config.project, manager.clone(), bus.clone());
        let pubsub = PubSub::new(bus, &config.project);

        let auth = match &config.auth {
            Some(auth_config) => {
                let store = AuthStore::new(
                    &config.project,
                    manager.clone(),
                    auth_config.session_ttl_secs,
                );
                store.delete_all_temporary_accounts().await;
                Some(store)
            }
            None => None,
        };

        if let Some(log) = &config.log {
            install_log_filter(&log.filter);
        }

        info!(project = %config.project, auth = auth.is_some(), "syncbase ready");
        Ok(Self {
            config,
            manager,
            database,
            pubsub,
            auth,
        })
    }

    /// The configuration this facade was initialized with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The document layer.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Ad-hoc publish/subscribe channels under the project namespace.
    #[must_use]
    pub fn pubsub(&self) -> &PubSub {
        &self.pubsub
    }

    /// Identity storage, present only when auth was configured.
    ///
    /// Callers must check configuration rather than assume availability.
    #[must_use]
    pub fn auth(&self) -> Option<&AuthStore> {
        self.auth.as_ref()
    }

    /// Number of live backend connections (primary plus one per active
    /// subscription). Useful for leak diagnostics.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.manager.active_connections()
    }
}

fn install_log_filter(filter: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|e| {
        warn!(filter, error = %e, "bad log filter, falling back to `info`");
        EnvFilter::new("info")
    });
    // The host app may already own a subscriber; losing that race is fine.
    if fmt().with_env_filter(env_filter).try_init().is_err() {
        warn!("a tracing subscriber is already installed, keeping it");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthProfile;
    use crate::config::AuthConfig;

    #[tokio::test]
    async fn test_init_without_auth() {
        let base = SyncBase::init(Config::new("app")).await.unwrap();
        assert!(base.auth().is_none());
        assert_eq!(base.active_connections(), 1);
    }

    #[tokio::test]
    async fn test_init_with_auth_purges_temporaries() {
        let backend = Arc::new(MemoryBackend::new());

        // Boot once, create a guest identity, then "restart" on the same
        // backend: the guest must be gone, the durable identity must not.
        let config = Config::new("app").with_auth(AuthConfig::default());
        let first = SyncBase::init_with_backend(config.clone(), backend.clone())
            .await
            .unwrap();
        let auth = first.auth().unwrap();
        let profile = AuthProfile {
            display_name: "Guest".to_string(),
            email: "g@example.com".to_string(),
            picture: String::new(),
        };
        auth.find_or_add_auth("guest", "tmp-1", &profile).await.unwrap();
        auth.find_or_add_auth("google", "g-1", &profile).await.unwrap();
        drop(first);

        let second = SyncBase::init_with_backend(config, backend).await.unwrap();
        let auth = second.auth().unwrap();
        assert!(!auth.delete_auth("guest", "tmp-1").await);
        assert!(auth.delete_auth("google", "g-1").await);
    }
}
