//! Customer session lifecycle
//!
//! A session is a sealed [`SessionPayload`] in an HttpOnly cookie, backed by
//! a [`SessionRecord`] in the [`SessionStore`]. Both must be valid for a
//! request to be authenticated.
//!
//! Every successful [`SessionManager::get_session`] rotates the session: a
//! new id is minted, the new record is written, the old record is deleted,
//! and only then is the cookie replaced. A stolen token is therefore good for
//! one request at most.
//!
//! A CSRF token lives in a second, script-readable cookie. It is issued
//! alongside the session when absent and validated with
//! [`SessionManager::validate_csrf_token`].

pub mod cookies;
pub mod csrf;

use crate::config::SessionConfig;
use crate::role::SessionRole;
use crate::seal::{self, SealError, SealOptions};
use crate::store::{SessionRecord, SessionStore, StoreError};
use chrono::Utc;
use cookies::{CookieJar, CookieOptions, SameSite};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the sealed session cookie
pub const SESSION_COOKIE: &str = "customer_session";

/// Name of the CSRF cookie
pub const CSRF_COOKIE: &str = "csrf_token";

/// Lifetime of a session created with `remember` set
pub const REMEMBER_ME_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 30);

/// User agent recorded when the request carried none
const UNKNOWN_USER_AGENT: &str = "unknown";

/// Session manager errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session secret is configured.
    #[error("session secret is not configured")]
    MissingSecret,

    /// The session payload could not be sealed.
    #[error("failed to seal session: {0}")]
    Seal(#[from] SealError),

    /// The session store failed.
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
}

/// Contents of the session cookie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload<R> {
    /// Owner of the session.
    pub customer_id: String,
    /// Role granted at login.
    pub role: R,
    /// Id of the backing [`SessionRecord`].
    pub session_id: String,
    /// Whether the long-lived lifetime applies.
    #[serde(default)]
    pub remember: bool,
}

/// Authenticated identity handed to and returned by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerSession<R> {
    /// Customer id.
    pub customer_id: String,
    /// Role.
    pub role: R,
}

/// Options for [`SessionManager::create_session`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Keep the customer signed in for [`REMEMBER_ME_TTL`].
    pub remember: bool,
}

/// Session manager settings
#[derive(Clone)]
pub struct SessionSettings {
    /// Sealing secret. Sessions cannot be created without it.
    pub secret: Option<String>,
    /// Default session lifetime.
    pub ttl: Duration,
    /// Cookie domain, host-only when `None`.
    pub cookie_domain: Option<String>,
}

impl SessionSettings {
    /// Settings with the given secret and a one hour lifetime.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            ttl: Duration::from_secs(3600),
            cookie_domain: None,
        }
    }

    /// Settings from loaded configuration.
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            secret: config.secret.clone().filter(|s| !s.is_empty()),
            ttl: config.ttl(),
            cookie_domain: config.cookie_domain.clone(),
        }
    }
}

impl std::fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSettings")
            .field("secret", &self.secret.as_ref().map(|_| "[redacted]"))
            .field("ttl", &self.ttl)
            .field("cookie_domain", &self.cookie_domain)
            .finish()
    }
}

/// Issues, verifies, rotates and revokes customer sessions.
pub struct SessionManager<R> {
    settings: SessionSettings,
    store: Arc<dyn SessionStore>,
    _role: PhantomData<fn() -> R>,
}

impl<R> Clone for SessionManager<R> {
    fn clone(&self) -> Self {
        Self {
            settings: self.settings.clone(),
            store: Arc::clone(&self.store),
            _role: PhantomData,
        }
    }
}

impl<R> std::fmt::Debug for SessionManager<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<R: SessionRole> SessionManager<R> {
    /// Create a manager over a store.
    #[must_use]
    pub fn new(settings: SessionSettings, store: Arc<dyn SessionStore>) -> Self {
        Self {
            settings,
            store,
            _role: PhantomData,
        }
    }

    /// Start a session for `identity`.
    ///
    /// Sets the session cookie and, when absent, the CSRF cookie, then
    /// persists the session record.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::MissingSecret`] without a secret and
    /// [`SessionError::Seal`] if sealing fails; neither touches the jar or
    /// the store. A store failure is returned after the cookies were set.
    pub async fn create_session(
        &self,
        jar: &mut CookieJar,
        identity: CustomerSession<R>,
        options: SessionOptions,
    ) -> Result<(), SessionError> {
        let secret = self.secret().ok_or(SessionError::MissingSecret)?;
        let ttl = self.ttl_for(options.remember);
        let payload = SessionPayload {
            customer_id: identity.customer_id,
            role: identity.role,
            session_id: csrf::random_token(csrf::SESSION_ID_BYTES),
            remember: options.remember,
        };
        let token = seal::seal(&payload, &SealOptions { password: secret, ttl })?;

        self.write_cookies(jar, token, ttl);

        let record = Self::record_for(jar, &payload);
        self.store.set(&record, ttl).await?;

        info!(
            customer_id = %payload.customer_id,
            remember = options.remember,
            "Session created"
        );
        Ok(())
    }

    /// Resolve the current session and rotate it.
    ///
    /// Returns `Ok(None)` when there is no session cookie, no secret, the
    /// token does not unseal, or its record is gone. Invalid tokens are never
    /// reported as errors.
    ///
    /// # Errors
    ///
    /// Store failures are returned as-is, with the jar untouched.
    pub async fn get_session(
        &self,
        jar: &mut CookieJar,
    ) -> Result<Option<CustomerSession<R>>, SessionError> {
        let Some(token) = jar.get(SESSION_COOKIE).map(ToString::to_string) else {
            return Ok(None);
        };
        let Some(secret) = self.secret() else {
            debug!("Session cookie present but no session secret is configured");
            return Ok(None);
        };
        let Some(payload) = self.open(&token, secret) else {
            return Ok(None);
        };
        if self.store.get(&payload.session_id).await?.is_none() {
            debug!(customer_id = %payload.customer_id, "Session record missing or expired");
            return Ok(None);
        }

        let ttl = self.ttl_for(payload.remember);
        let rotated = SessionPayload {
            session_id: csrf::random_token(csrf::SESSION_ID_BYTES),
            ..payload.clone()
        };
        let token = seal::seal(&rotated, &SealOptions { password: secret, ttl })?;

        let record = Self::record_for(jar, &rotated);
        self.store.set(&record, ttl).await?;
        if !self.store.delete(&payload.session_id).await? {
            // Another request rotated the same token first. Back out so one
            // logical session keeps exactly one live record.
            warn!(
                customer_id = %payload.customer_id,
                "Concurrent rotation detected, discarding this rotation"
            );
            self.store.delete(&record.session_id).await?;
            return Ok(None);
        }

        self.write_cookies(jar, token, ttl);
        debug!(customer_id = %rotated.customer_id, "Session rotated");

        Ok(Some(CustomerSession {
            customer_id: rotated.customer_id,
            role: rotated.role,
        }))
    }

    /// End the current session.
    ///
    /// Both cookies are cleared first, unconditionally. The record is then
    /// deleted if the token can be unsealed.
    ///
    /// # Errors
    ///
    /// Store failures are returned after the cookies were cleared.
    pub async fn destroy_session(&self, jar: &mut CookieJar) -> Result<(), SessionError> {
        let token = jar.get(SESSION_COOKIE).map(ToString::to_string);
        jar.remove(SESSION_COOKIE, self.cookie_options(Duration::ZERO, true));
        jar.remove(CSRF_COOKIE, self.cookie_options(Duration::ZERO, false));

        let (Some(token), Some(secret)) = (token, self.secret()) else {
            return Ok(());
        };
        if let Some(payload) = self.open(&token, secret) {
            self.store.delete(&payload.session_id).await?;
            info!(customer_id = %payload.customer_id, "Session destroyed");
        }
        Ok(())
    }

    /// Live sessions of a customer, newest first.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn list_sessions(
        &self,
        customer_id: &str,
    ) -> Result<Vec<SessionRecord>, SessionError> {
        Ok(self.store.list(customer_id).await?)
    }

    /// Revoke one session by id. Returns whether a live session was removed.
    ///
    /// The holder's next [`get_session`](Self::get_session) returns `None`.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn revoke_session(&self, session_id: &str) -> Result<bool, SessionError> {
        let removed = self.store.delete(session_id).await?;
        if removed {
            info!("Session revoked");
        }
        Ok(removed)
    }

    /// Check a submitted CSRF token against the CSRF cookie.
    #[must_use]
    pub fn validate_csrf_token(&self, jar: &CookieJar, candidate: Option<&str>) -> bool {
        match (jar.get(CSRF_COOKIE), candidate) {
            (Some(expected), Some(candidate)) => csrf::tokens_match(expected, candidate),
            _ => false,
        }
    }

    fn secret(&self) -> Option<&str> {
        self.settings.secret.as_deref()
    }

    fn ttl_for(&self, remember: bool) -> Duration {
        if remember {
            REMEMBER_ME_TTL
        } else {
            self.settings.ttl
        }
    }

    /// Unseal a session token, treating every failure as "no session".
    fn open(&self, token: &str, secret: &str) -> Option<SessionPayload<R>> {
        // Each token enforces the expiry it was sealed with; this bound only
        // caps the longest lifetime any session can have.
        let ttl = self.settings.ttl.max(REMEMBER_ME_TTL);
        match seal::unseal(token, &SealOptions { password: secret, ttl }) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(error = %e, "Ignoring invalid session token");
                None
            }
        }
    }

    fn record_for(jar: &CookieJar, payload: &SessionPayload<R>) -> SessionRecord {
        SessionRecord {
            session_id: payload.session_id.clone(),
            customer_id: payload.customer_id.clone(),
            user_agent: jar.user_agent().unwrap_or(UNKNOWN_USER_AGENT).to_string(),
            created_at: Utc::now(),
        }
    }

    fn cookie_options(&self, max_age: Duration, http_only: bool) -> CookieOptions {
        CookieOptions {
            path: "/".to_string(),
            domain: self.settings.cookie_domain.clone(),
            max_age,
            http_only,
            secure: true,
            same_site: SameSite::Strict,
        }
    }

    fn write_cookies(&self, jar: &mut CookieJar, token: String, ttl: Duration) {
        jar.set(SESSION_COOKIE, token, self.cookie_options(ttl, true));
        if jar.get(CSRF_COOKIE).is_none() {
            jar.set(
                CSRF_COOKIE,
                csrf::generate_csrf_token(),
                self.cookie_options(ttl, false),
            );
        }
    }
}
