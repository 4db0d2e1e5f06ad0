//! Session and federated login core for Acme storefronts.
//!
//! Provides sealed customer sessions with rotation on every read, CSRF
//! tokens, and OpenID Connect login (authorization code + PKCE).
//!
//! # Example
//!
//! ```no_run
//! use acme_auth::{AuthConfig, AuthCore, CookieJar, CustomerSession, Role, SessionOptions};
//!
//! # async fn example(headers: http::HeaderMap) -> Result<(), Box<dyn std::error::Error>> {
//! let config = AuthConfig::load()?;
//! let core: AuthCore<Role> = AuthCore::from_config(&config)?;
//!
//! let mut jar = CookieJar::from_headers(&headers);
//! core.sessions
//!     .create_session(
//!         &mut jar,
//!         CustomerSession { customer_id: "c-42".into(), role: Role::Customer },
//!         SessionOptions::default(),
//!     )
//!     .await?;
//!
//! let mut response_headers = http::HeaderMap::new();
//! jar.write_headers(&mut response_headers);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod oidc;
pub mod role;
pub mod seal;
pub mod session;
pub mod store;

pub use config::{AuthConfig, ConfigError, OidcSettings};
pub use oidc::{
    CompleteLogin, DiscoveryClientFactory, LoginResult, LoginStart, OidcClientProvider, OidcError,
    OidcLoginFlow, OidcProfile,
};
pub use role::{Role, SessionRole};
pub use seal::{seal, unseal, SealError, SealOptions};
pub use session::cookies::{CookieJar, CookieOptions, SameSite};
pub use session::{
    CustomerSession, SessionError, SessionManager, SessionOptions, SessionSettings, CSRF_COOKIE,
    SESSION_COOKIE,
};
pub use store::{
    connect_stores, FlowStore, OidcFlowRecord, SessionRecord, SessionStore, StoreError, Stores,
};

use std::sync::Arc;

/// Everything a web layer needs, built from one [`AuthConfig`].
#[derive(Debug, Clone)]
pub struct AuthCore<R = Role> {
    /// Session manager.
    pub sessions: SessionManager<R>,
    /// OIDC login flow, when a provider is configured.
    pub oidc: Option<OidcLoginFlow>,
    /// Underlying stores.
    pub stores: Stores,
}

impl<R: SessionRole> AuthCore<R> {
    /// Validate configuration and assemble the core.
    ///
    /// The OIDC provider is not contacted here; discovery happens on first
    /// use.
    ///
    /// # Errors
    ///
    /// Returns an error for a missing or weak session secret, an unusable
    /// store backend, or partial OIDC settings.
    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        config.session.require_secret()?;
        let stores = connect_stores(&config.store)?;
        let sessions = SessionManager::new(
            SessionSettings::from_config(&config.session),
            Arc::clone(&stores.sessions),
        );

        let oidc = if config.oidc.is_configured() {
            let settings = config.oidc.settings()?;
            let provider = OidcClientProvider::new(Arc::new(DiscoveryClientFactory::new(
                settings.clone(),
            )));
            Some(OidcLoginFlow::new(
                settings,
                Arc::new(provider),
                Arc::clone(&stores.flows),
            ))
        } else {
            tracing::info!("No OIDC provider configured, federated login disabled");
            None
        };

        Ok(Self {
            sessions,
            oidc,
            stores,
        })
    }
}
