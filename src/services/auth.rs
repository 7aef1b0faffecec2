//! Session glue over the managed auth endpoint.
//!
//! ARCHITECTURE
//! ============
//! Credential storage, token issuance, and refresh all belong to the auth
//! provider. This module only orchestrates: exchange credentials for a
//! session, expose it to the other services through a shared handle, and
//! round-trip the "remember session" flag plus the cached user object
//! through the local flag store so the app can restore identity offline.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{ApiError, AuthApi, AuthToken, DataApi, Query};
use crate::event::ErrorCode;
use crate::prefs::FlagStore;

/// Profile table holding each user's `email` and `rol`.
pub const USERS_TABLE: &str = "usuarios";

/// Flag store keys.
pub const REMEMBER_FLAG: &str = "remember_session";
pub const CACHED_USER_KEY: &str = "cached_user";

const DEFAULT_ROL: &str = "usuario";

// =============================================================================
// TYPES
// =============================================================================

/// The signed-in identity shared across services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: Uuid,
    pub email: String,
    pub rol: String,
}

/// Shared read handle to the current session. Services hold a clone and
/// read it at call time; only `AuthClient` writes.
#[derive(Clone, Default)]
pub struct SessionHandle(Arc<std::sync::RwLock<Option<Session>>>);

impl SessionHandle {
    #[must_use]
    pub fn current(&self) -> Option<Session> {
        let slot = self.0.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        slot.clone()
    }

    #[must_use]
    pub fn user_id(&self) -> Option<Uuid> {
        self.current().map(|s| s.user_id)
    }

    fn set(&self, session: Session) {
        let mut slot = self.0.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        *slot = Some(session);
    }

    fn clear(&self) {
        let mut slot = self.0.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        *slot = None;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("backend error: {0}")]
    Backend(#[from] ApiError),
}

impl ErrorCode for AuthError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "E_INVALID_CREDENTIALS",
            Self::Backend(_) => "E_BACKEND",
        }
    }
}

// =============================================================================
// CLIENT
// =============================================================================

pub struct AuthClient {
    auth: Arc<dyn AuthApi>,
    api: Arc<dyn DataApi>,
    flags: Arc<dyn FlagStore>,
    token: AuthToken,
    session: SessionHandle,
}

impl AuthClient {
    #[must_use]
    pub fn new(auth: Arc<dyn AuthApi>, api: Arc<dyn DataApi>, flags: Arc<dyn FlagStore>, token: AuthToken) -> Self {
        Self { auth, api, flags, token, session: SessionHandle::default() }
    }

    /// Handle the other services read the current session through.
    #[must_use]
    pub fn session(&self) -> SessionHandle {
        self.session.clone()
    }

    /// Exchange credentials for a session. With `remember`, the session is
    /// also cached in the flag store for later `restore`.
    ///
    /// # Errors
    ///
    /// `InvalidCredentials` when the provider rejects the pair; any other
    /// backend failure is passed through.
    pub async fn sign_in(&self, email: &str, password: &str, remember: bool) -> Result<Session, AuthError> {
        let granted = match self.auth.password_sign_in(email, password).await {
            Ok(granted) => granted,
            Err(ApiError::Status { status: 400 | 401, .. }) => return Err(AuthError::InvalidCredentials),
            Err(e) => return Err(AuthError::Backend(e)),
        };

        self.token.set(&granted.access_token);
        let rol = self.fetch_rol(granted.user_id).await;
        let session = Session { user_id: granted.user_id, email: granted.email, rol };
        self.session.set(session.clone());

        if remember {
            self.flags.set(REMEMBER_FLAG, "true");
            match serde_json::to_string(&session) {
                Ok(json) => self.flags.set(CACHED_USER_KEY, &json),
                Err(e) => warn!(error = %e, "session cache serialize failed"),
            }
        } else {
            self.flags.remove(REMEMBER_FLAG);
            self.flags.remove(CACHED_USER_KEY);
        }

        info!(user_id = %session.user_id, "signed in");
        Ok(session)
    }

    /// End the session. Local state and cached flags are cleared even when
    /// the provider call fails — a stale local session is worse than a
    /// dangling remote one.
    ///
    /// # Errors
    ///
    /// Returns the provider error, after local cleanup.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let result = self.auth.sign_out().await;

        self.token.clear();
        self.session.clear();
        self.flags.remove(REMEMBER_FLAG);
        self.flags.remove(CACHED_USER_KEY);
        info!("signed out");

        result.map_err(AuthError::Backend)
    }

    /// Restore identity from the cached user object when the remember flag
    /// is set. Identity only — transport re-authentication stays with the
    /// provider.
    #[must_use]
    pub fn restore(&self) -> Option<Session> {
        if self.flags.get(REMEMBER_FLAG).as_deref() != Some("true") {
            return None;
        }
        let json = self.flags.get(CACHED_USER_KEY)?;
        let session: Session = match serde_json::from_str(&json) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "cached user is unreadable; ignoring");
                return None;
            }
        };

        self.session.set(session.clone());
        info!(user_id = %session.user_id, "session restored from cache");
        Some(session)
    }

    /// The profile row is enrichment; a failed fetch degrades to the
    /// default rol rather than failing the sign-in.
    async fn fetch_rol(&self, user_id: Uuid) -> String {
        let query = Query::new(USERS_TABLE).eq("id", user_id.to_string()).limit(1);
        match self.api.select(&query).await {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.get("rol"))
                .and_then(|v| v.as_str())
                .unwrap_or(DEFAULT_ROL)
                .to_string(),
            Err(e) => {
                warn!(error = %e, %user_id, "rol fetch failed; defaulting");
                DEFAULT_ROL.to_string()
            }
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
