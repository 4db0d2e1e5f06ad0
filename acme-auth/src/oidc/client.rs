//! Identity provider client
//!
//! [`OidcClient`] is the narrow surface the login flow needs from a provider:
//! its authorization and end-session endpoints, and the code exchange.
//! [`DiscoveredClient`] implements it over `openidconnect` using discovered
//! provider metadata.

use super::error::OidcError;
use crate::config::OidcSettings;
use async_trait::async_trait;
use openidconnect::core::CoreClient;
use openidconnect::{
    reqwest, AuthorizationCode, ClientId, ClientSecret, EndpointMaybeSet, EndpointNotSet,
    EndpointSet, IssuerUrl, Nonce, OAuth2TokenResponse, PkceCodeVerifier,
    ProviderMetadataWithLogout, RedirectUrl, TokenResponse,
};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Inputs for redeeming an authorization code.
#[derive(Clone)]
pub struct CodeExchange {
    /// Authorization code from the callback.
    pub code: String,
    /// Redirect URI used in the authorization request.
    pub redirect_uri: String,
    /// Nonce the ID token must carry.
    pub nonce: String,
    /// PKCE verifier, sent only when PKCE is enforced.
    pub code_verifier: Option<String>,
}

impl std::fmt::Debug for CodeExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeExchange")
            .field("redirect_uri", &self.redirect_uri)
            .field("pkce", &self.code_verifier.is_some())
            .finish_non_exhaustive()
    }
}

/// Tokens and verified ID token claims from a code exchange.
#[derive(Clone)]
pub struct TokenSet {
    /// Access token.
    pub access_token: String,
    /// Raw ID token, usable as `id_token_hint` at logout.
    pub id_token: Option<String>,
    /// Refresh token, if granted.
    pub refresh_token: Option<String>,
    /// Access token lifetime, if reported.
    pub expires_in: Option<Duration>,
    /// Verified ID token claims.
    pub claims: Map<String, Value>,
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[redacted]")
            .field("id_token", &self.id_token.as_ref().map(|_| "[redacted]"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[redacted]"))
            .field("expires_in", &self.expires_in)
            .field("claims", &self.claims.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Protocol client for one identity provider.
#[async_trait]
pub trait OidcClient: Send + Sync {
    /// Provider authorization endpoint.
    fn authorization_endpoint(&self) -> &Url;

    /// Provider end-session endpoint, if RP-initiated logout is supported.
    fn end_session_endpoint(&self) -> Option<&Url>;

    /// Redeem an authorization code and verify the resulting ID token.
    async fn exchange_code(&self, exchange: CodeExchange) -> Result<TokenSet, OidcError>;
}

/// Creates the provider client. Called by
/// [`OidcClientProvider`](super::OidcClientProvider) until it succeeds once.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Build a ready-to-use client.
    async fn create(&self) -> Result<Arc<dyn OidcClient>, OidcError>;
}

type DiscoveredCoreClient = CoreClient<
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointMaybeSet,
    EndpointMaybeSet,
>;

/// [`OidcClient`] built from discovered provider metadata.
pub struct DiscoveredClient {
    client: DiscoveredCoreClient,
    http: reqwest::Client,
    authorization_endpoint: Url,
    end_session_endpoint: Option<Url>,
}

impl std::fmt::Debug for DiscoveredClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveredClient")
            .field("authorization_endpoint", &self.authorization_endpoint.as_str())
            .field(
                "end_session_endpoint",
                &self.end_session_endpoint.as_ref().map(Url::as_str),
            )
            .finish_non_exhaustive()
    }
}

/// Build the HTTP client used for discovery and token requests.
///
/// Redirects are not followed.
fn http_client() -> Result<reqwest::Client, OidcError> {
    reqwest::ClientBuilder::new()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| OidcError::Configuration(format!("failed to create HTTP client: {e}")))
}

impl DiscoveredClient {
    /// Discover provider metadata for `settings.issuer` and build a client.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Discovery`] if the metadata cannot be fetched or
    /// parsed, and [`OidcError::Configuration`] for invalid settings.
    pub async fn discover(settings: &OidcSettings) -> Result<Self, OidcError> {
        let issuer_str = settings.issuer.as_str().trim_end_matches('/');
        let issuer = IssuerUrl::new(issuer_str.to_string())
            .map_err(|e| OidcError::Configuration(format!("invalid issuer URL: {e}")))?;
        let redirect = RedirectUrl::new(settings.redirect_uri.to_string())
            .map_err(|e| OidcError::Configuration(format!("invalid redirect URI: {e}")))?;
        let http = http_client()?;

        let metadata = ProviderMetadataWithLogout::discover_async(issuer, &http)
            .await
            .map_err(|e| OidcError::Discovery {
                issuer: issuer_str.to_string(),
                message: e.to_string(),
            })?;

        let authorization_endpoint = metadata.authorization_endpoint().url().clone();
        let end_session_endpoint = metadata
            .additional_metadata()
            .end_session_endpoint
            .as_ref()
            .map(|endpoint| endpoint.url().clone());

        tracing::info!(
            issuer = issuer_str,
            authorization_endpoint = %authorization_endpoint,
            logout_supported = end_session_endpoint.is_some(),
            "Discovered OIDC provider"
        );

        let client = CoreClient::from_provider_metadata(
            metadata,
            ClientId::new(settings.client_id.clone()),
            Some(ClientSecret::new(settings.client_secret.clone())),
        )
        .set_redirect_uri(redirect);

        Ok(Self {
            client,
            http,
            authorization_endpoint,
            end_session_endpoint,
        })
    }
}

#[async_trait]
impl OidcClient for DiscoveredClient {
    fn authorization_endpoint(&self) -> &Url {
        &self.authorization_endpoint
    }

    fn end_session_endpoint(&self) -> Option<&Url> {
        self.end_session_endpoint.as_ref()
    }

    async fn exchange_code(&self, exchange: CodeExchange) -> Result<TokenSet, OidcError> {
        let redirect = RedirectUrl::new(exchange.redirect_uri)
            .map_err(|e| OidcError::Configuration(format!("invalid redirect URI: {e}")))?;
        let mut request = self
            .client
            .exchange_code(AuthorizationCode::new(exchange.code))
            .map_err(|e| OidcError::Configuration(e.to_string()))?
            .set_redirect_uri(Cow::Owned(redirect));
        if let Some(verifier) = exchange.code_verifier {
            request = request.set_pkce_verifier(PkceCodeVerifier::new(verifier));
        }

        let response = request
            .request_async(&self.http)
            .await
            .map_err(|e| OidcError::Exchange(e.to_string()))?;

        let id_token = response.id_token().ok_or(OidcError::MissingIdToken)?;
        let nonce = Nonce::new(exchange.nonce);
        let claims = id_token
            .claims(&self.client.id_token_verifier(), &nonce)
            .map_err(|e| OidcError::InvalidIdToken(e.to_string()))?;
        let claims = match serde_json::to_value(claims) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(OidcError::InvalidIdToken("claims are not an object".to_string())),
            Err(e) => return Err(OidcError::InvalidIdToken(e.to_string())),
        };
        let raw_id_token = serde_json::to_value(id_token)
            .ok()
            .and_then(|v| v.as_str().map(ToString::to_string));

        Ok(TokenSet {
            access_token: response.access_token().secret().clone(),
            id_token: raw_id_token,
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            expires_in: response.expires_in(),
            claims,
        })
    }
}

/// [`ClientFactory`] that discovers the configured issuer.
#[derive(Debug, Clone)]
pub struct DiscoveryClientFactory {
    settings: OidcSettings,
}

impl DiscoveryClientFactory {
    /// Create a factory for validated settings.
    #[must_use]
    pub const fn new(settings: OidcSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ClientFactory for DiscoveryClientFactory {
    async fn create(&self) -> Result<Arc<dyn OidcClient>, OidcError> {
        let client = DiscoveredClient::discover(&self.settings).await?;
        Ok(Arc::new(client))
    }
}
