//! Credential pair and the process-wide credential store
//!
//! The store owns the single "current" pair. Reads clone it out under a
//! short lock, writes replace it whole, so a reader never sees an access
//! token from one pair next to a refresh token from another. Persistence is
//! best-effort: a failed write is logged and the in-memory pair keeps
//! serving the current process.

use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::CREDENTIALS_KEY;
use crate::error::Error;
use crate::kv::KeyValueStore;
use crate::token::jwt_expiry_millis;

/// Access/refresh token pair.
///
/// `expires_at_estimate` is a unix timestamp in milliseconds. It is an
/// estimate only (from `expiresIn` or the JWT `exp` claim); the server's
/// 401 stays authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPair {
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_estimate: Option<u64>,
}

impl CredentialPair {
    /// Build a pair, estimating expiry from the access token's `exp` claim when it is a JWT.
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        let access_token = access_token.into();
        let expires_at_estimate = jwt_expiry_millis(&access_token);
        Self {
            access_token: Secret::new(access_token),
            refresh_token: Secret::new(refresh_token.into()),
            expires_at_estimate,
        }
    }

    pub fn with_expiry(mut self, expires_at_millis: Option<u64>) -> Self {
        self.expires_at_estimate = expires_at_millis;
        self
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// Whether the estimate says the access token expires within `skew` of `now_millis`.
    /// Pairs without an estimate never report as expiring.
    pub fn expires_within(&self, skew: Duration, now_millis: u64) -> bool {
        let skew_millis = u64::try_from(skew.as_millis()).unwrap_or(u64::MAX);
        self.expires_at_estimate
            .is_some_and(|expires| expires <= now_millis.saturating_add(skew_millis))
    }
}

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Holder of the current credential pair.
///
/// `current` is the source of truth for this process. `persist_lock`
/// serializes backend writes; each write snapshots `current` so the last
/// writer always persists the latest pair.
pub struct CredentialStore {
    current: RwLock<Option<CredentialPair>>,
    backend: Option<Arc<dyn KeyValueStore>>,
    persist_lock: Mutex<()>,
}

impl CredentialStore {
    /// Store with no durable backend.
    pub fn in_memory() -> Self {
        Self {
            current: RwLock::new(None),
            backend: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Restore the persisted pair from `backend`, if any.
    ///
    /// Unreadable or corrupt values are logged and treated as "no
    /// credentials" so a damaged file degrades to a fresh login.
    pub fn load(backend: Arc<dyn KeyValueStore>) -> Self {
        let restored = match backend.get(CREDENTIALS_KEY) {
            Ok(Some(json)) => match serde_json::from_str::<CredentialPair>(&json) {
                Ok(pair) => {
                    info!(
                        expires_at = ?pair.expires_at_estimate,
                        "restored persisted credentials"
                    );
                    Some(pair)
                }
                Err(e) => {
                    warn!(error = %e, "persisted credentials are corrupt, ignoring");
                    None
                }
            },
            Ok(None) => {
                debug!("no persisted credentials");
                None
            }
            Err(e) => {
                warn!(error = %e, "failed to read persisted credentials");
                None
            }
        };

        Self {
            current: RwLock::new(restored),
            backend: Some(backend),
            persist_lock: Mutex::new(()),
        }
    }

    /// Clone of the current pair.
    pub fn get(&self) -> Option<CredentialPair> {
        self.current.read().clone()
    }

    /// Atomically replace the current pair, then persist it.
    pub fn set(&self, pair: CredentialPair) {
        *self.current.write() = Some(pair);
        debug!("credentials replaced");
        self.persist();
    }

    /// Drop the current pair, then remove it from the backend.
    pub fn clear(&self) {
        let had = self.current.write().take().is_some();
        if had {
            debug!("credentials cleared");
        }
        self.persist();
    }

    /// Clear only while the stored access token is still `access_token`.
    /// Returns whether a pair was removed.
    pub fn clear_if_current(&self, access_token: &Secret<String>) -> bool {
        {
            let mut current = self.current.write();
            if !current
                .as_ref()
                .is_some_and(|pair| pair.access_token == *access_token)
            {
                return false;
            }
            *current = None;
        }
        debug!("credentials cleared");
        self.persist();
        true
    }

    pub fn is_authenticated(&self) -> bool {
        self.current.read().is_some()
    }

    fn persist(&self) {
        let Some(backend) = &self.backend else {
            return;
        };
        let _guard = self.persist_lock.lock();
        let snapshot = self.current.read().clone();

        let result = match snapshot {
            Some(pair) => serde_json::to_string(&pair)
                .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))
                .and_then(|json| backend.set(CREDENTIALS_KEY, &json)),
            None => backend.delete(CREDENTIALS_KEY),
        };

        if let Err(e) = result {
            warn!(error = %e, "failed to persist credentials, keeping in-memory copy");
        }
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("authenticated", &self.is_authenticated())
            .field("persistent", &self.backend.is_some())
            .finish()
    }
}
