//! Identity records and session persistence.
//!
//! The core only needs one thing from authentication: a stable
//! `(provider, providerId) -> record` lookup with idempotent upsert. The
//! strategy plumbing (OAuth flows, JWT minting, guest issuance) lives with
//! the surrounding application; this module keeps its records and sessions
//! in the same store as everything else.
//!
//! Identities from the `guest` and `spectator` providers are ephemeral by
//! definition and are purged once at boot via
//! [`AuthStore::delete_all_temporary_accounts`].

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::NO_EXPIRY;

/// Provider types whose identities never persist across a restart.
pub const TEMPORARY_PROVIDERS: [&str; 2] = ["guest", "spectator"];

/// Profile details supplied by an auth strategy at upsert time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthProfile {
    /// Human-readable display name.
    pub display_name: String,
    /// Account email address.
    pub email: String,
    /// Avatar URL.
    pub picture: String,
}

/// A stored identity record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthRecord {
    /// Auth strategy that produced this identity (`google`, `guest`, ...).
    pub provider: String,
    /// Stable id within the provider's namespace.
    pub provider_id: String,
    /// Human-readable display name.
    pub display_name: String,
    /// Account email address.
    pub email: String,
    /// Avatar URL.
    pub picture: String,
    /// Creation time, milliseconds since epoch.
    pub created_at: i64,
}

/// Identity and session storage over the shared backend.
pub struct AuthStore {
    project: String,
    manager: Arc<ConnectionManager>,
    session_ttl_secs: i64,
}

impl AuthStore {
    pub(crate) fn new(
        project: impl Into<String>,
        manager: Arc<ConnectionManager>,
        session_ttl_secs: i64,
    ) -> Self {
        Self {
            project: project.into(),
            manager,
            session_ttl_secs,
        }
    }

    fn record_prefix(&self) -> String {
        format!("{}:{}:DB:", self.project, crate::AUTH_SEGMENT)
    }

    fn record_key(&self, provider: &str, provider_id: &str) -> String {
        format!("{}{provider}{provider_id}", self.record_prefix())
    }

    fn session_key(&self, session_id: &str) -> String {
        format!("{}:{}:SESSION:{session_id}", self.project, crate::AUTH_SEGMENT)
    }

    /// Look up an identity, creating it when absent (idempotent upsert).
    ///
    /// An existing record wins: the supplied profile is only persisted for
    /// new identities. Returns `None` on backend failure (logged).
    pub async fn find_or_add_auth(
        &self,
        provider: &str,
        provider_id: &str,
        profile: &AuthProfile,
    ) -> Option<AuthRecord> {
        match self.find_or_add_inner(provider, provider_id, profile).await {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(provider, provider_id, error = %e, "identity upsert failed");
                None
            }
        }
    }

    async fn find_or_add_inner(
        &self,
        provider: &str,
        provider_id: &str,
        profile: &AuthProfile,
    ) -> Result<AuthRecord> {
        let conn = self.manager.connection();
        let key = self.record_key(provider, provider_id);

        if let Some(value) = conn.json_get(&key).await? {
            let record = serde_json::from_value(value)
                .map_err(|e| Error::auth(format!("malformed identity at {key}: {e}")))?;
            return Ok(record);
        }

        let record = AuthRecord {
            provider: provider.to_string(),
            provider_id: provider_id.to_string(),
            display_name: profile.display_name.clone(),
            email: profile.email.clone(),
            picture: profile.picture.clone(),
            created_at: Utc::now().timestamp_millis(),
        };
        let value = serde_json::to_value(&record)
            .map_err(|e| Error::auth(format!("failed to serialize identity: {e}")))?;
        conn.json_set(&key, &value, NO_EXPIRY).await?;
        debug!(provider, provider_id, "identity created");
        Ok(record)
    }

    /// Delete an identity. `false` when it did not exist or on backend
    /// failure.
    pub async fn delete_auth(&self, provider: &str, provider_id: &str) -> bool {
        let key = self.record_key(provider, provider_id);
        match self.manager.connection().delete(&key).await {
            Ok(existed) => existed,
            Err(e) => {
                warn!(provider, provider_id, error = %e, "identity delete failed");
                false
            }
        }
    }

    /// Delete the identity matching an email address, returning the removed
    /// record.
    ///
    /// Scans the identity prefix; email is not a key component, so this is
    /// `O(#identities)`.
    pub async fn delete_auth_by_email(&self, email: &str) -> Option<AuthRecord> {
        match self.delete_by_email_inner(email).await {
            Ok(record) => record,
            Err(e) => {
                warn!(email, error = %e, "identity delete by email failed");
                None
            }
        }
    }

    async fn delete_by_email_inner(&self, email: &str) -> Result<Option<AuthRecord>> {
        let conn = self.manager.connection();
        for key in conn.scan(&self.record_prefix()).await? {
            let Some(value) = conn.json_get(&key).await? else {
                continue;
            };
            let Ok(record) = serde_json::from_value::<AuthRecord>(value) else {
                continue;
            };
            if record.email == email {
                conn.delete(&key).await?;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Purge every identity from an ephemeral provider type.
    ///
    /// Runs once at facade init; guest and spectator identities are never
    /// expected to survive a restart. Returns the number removed.
    pub async fn delete_all_temporary_accounts(&self) -> usize {
        match self.purge_temporary_inner().await {
            Ok(purged) => purged,
            Err(e) => {
                warn!(error = %e, "temporary-account purge failed");
                0
            }
        }
    }

    async fn purge_temporary_inner(&self) -> Result<usize> {
        let conn = self.manager.connection();
        let mut purged = 0;
        for key in conn.scan(&self.record_prefix()).await? {
            let Some(value) = conn.json_get(&key).await? else {
                continue;
            };
            let Ok(record) = serde_json::from_value::<AuthRecord>(value) else {
                continue;
            };
            if TEMPORARY_PROVIDERS.contains(&record.provider.as_str())
                && conn.delete(&key).await?
            {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "removed temporary accounts");
        }
        Ok(purged)
    }

    /// Persist a session value under the configured session TTL.
    pub async fn put_session(&self, session_id: &str, value: &Value) -> bool {
        let key = self.session_key(session_id);
        match self
            .manager
            .connection()
            .json_set(&key, value, self.session_ttl_secs)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id, error = %e, "session write failed");
                false
            }
        }
    }

    /// Read a session value. `None` when absent, expired, or on failure.
    pub async fn get_session(&self, session_id: &str) -> Option<Value> {
        match self
            .manager
            .connection()
            .json_get(&self.session_key(session_id))
            .await
        {
            Ok(value) => value,
            Err(e) => {
                warn!(session_id, error = %e, "session read failed");
                None
            }
        }
    }

    /// Delete a session. `false` when it did not exist.
    pub async fn delete_session(&self, session_id: &str) -> bool {
        match self
            .manager
            .connection()
            .delete(&self.session_key(session_id))
            .await
        {
            Ok(existed) => existed,
            Err(e) => {
                warn!(session_id, error = %e, "session delete failed");
                false
            }
        }
    }
}
