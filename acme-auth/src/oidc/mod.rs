//! OpenID Connect login
//!
//! Authorization code flow with optional PKCE against a single identity
//! provider. The provider client is discovered lazily and shared, and each
//! login attempt is tracked by a single-use [`OidcFlowRecord`](crate::store::OidcFlowRecord).

pub mod client;
pub mod error;
pub mod flow;
pub mod provider;

pub use client::{
    ClientFactory, CodeExchange, DiscoveredClient, DiscoveryClientFactory, OidcClient, TokenSet,
};
pub use error::OidcError;
pub use flow::{
    sanitize_return_to, CompleteLogin, LoginResult, LoginStart, OidcLoginFlow, OidcProfile,
};
pub use provider::OidcClientProvider;
