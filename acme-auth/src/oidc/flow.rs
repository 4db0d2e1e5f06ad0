//! Authorization code login flow
//!
//! [`OidcLoginFlow::begin_login`] stores an [`OidcFlowRecord`] keyed by a
//! random `state` and returns the provider URL to redirect to.
//! [`OidcLoginFlow::complete_login`] consumes that record, redeems the code
//! and yields the verified [`OidcProfile`]. The caller is expected to bind
//! `flow_id` to the browser (e.g. in a short-lived cookie) between the two.

use super::client::{CodeExchange, TokenSet};
use super::error::OidcError;
use super::provider::OidcClientProvider;
use crate::config::OidcSettings;
use crate::session::csrf::tokens_match;
use crate::store::{FlowStore, OidcFlowRecord};
use chrono::Utc;
use openidconnect::{CsrfToken, Nonce, PkceCodeChallenge};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Identity asserted by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcProfile {
    /// `iss` claim.
    pub issuer: String,
    /// `sub` claim.
    pub subject: String,
    /// `email` claim.
    pub email: Option<String>,
    /// `email_verified` claim.
    pub email_verified: Option<bool>,
    /// `name`, or `preferred_username` when absent.
    pub name: Option<String>,
}

impl OidcProfile {
    /// Build a profile from ID token claims.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::MissingSubject`] or [`OidcError::MissingIssuer`]
    /// when `sub` or `iss` is not a non-empty string.
    pub fn from_claims(claims: &Map<String, Value>) -> Result<Self, OidcError> {
        let subject = string_claim(claims, "sub").ok_or(OidcError::MissingSubject)?;
        let issuer = string_claim(claims, "iss").ok_or(OidcError::MissingIssuer)?;
        let name = string_claim(claims, "name")
            .or_else(|| string_claim(claims, "preferred_username"));

        Ok(Self {
            issuer,
            subject,
            email: string_claim(claims, "email"),
            email_verified: claims.get("email_verified").and_then(Value::as_bool),
            name,
        })
    }
}

fn string_claim(claims: &Map<String, Value>, key: &str) -> Option<String> {
    claims
        .get(key)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// Result of [`OidcLoginFlow::begin_login`].
#[derive(Debug, Clone)]
pub struct LoginStart {
    /// Provider URL to redirect the browser to.
    pub authorization_url: Url,
    /// Id the caller must present again at completion.
    pub flow_id: String,
}

/// Callback parameters for [`OidcLoginFlow::complete_login`].
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteLogin {
    /// `state` query parameter.
    pub state: String,
    /// `code` query parameter.
    pub code: String,
    /// Flow id returned by `begin_login`.
    pub flow_id: String,
}

impl std::fmt::Debug for CompleteLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompleteLogin")
            .field("state", &self.state)
            .field("flow_id", &"[redacted]")
            .finish_non_exhaustive()
    }
}

/// Result of a completed login.
#[derive(Debug, Clone)]
pub struct LoginResult {
    /// Verified identity.
    pub profile: OidcProfile,
    /// Tokens from the exchange.
    pub token_set: TokenSet,
    /// Relative path to continue at.
    pub return_to: String,
}

/// Reduce `return_to` to a same-origin relative path.
///
/// Anything that could leave the site (`//host`, `/\host`, absolute URLs)
/// becomes `/`.
#[must_use]
pub fn sanitize_return_to(return_to: Option<&str>) -> String {
    match return_to {
        Some(path)
            if path.starts_with('/')
                && !path.starts_with("//")
                && !path.contains('\\')
                && !path.chars().any(char::is_control) =>
        {
            path.to_string()
        }
        _ => "/".to_string(),
    }
}

/// Runs OIDC logins against one provider.
#[derive(Clone)]
pub struct OidcLoginFlow {
    settings: OidcSettings,
    provider: Arc<OidcClientProvider>,
    flows: Arc<dyn FlowStore>,
}

impl std::fmt::Debug for OidcLoginFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcLoginFlow")
            .field("settings", &self.settings)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

impl OidcLoginFlow {
    /// Create a flow over a client provider and flow store.
    #[must_use]
    pub fn new(
        settings: OidcSettings,
        provider: Arc<OidcClientProvider>,
        flows: Arc<dyn FlowStore>,
    ) -> Self {
        Self {
            settings,
            provider,
            flows,
        }
    }

    /// Start a login and return the provider redirect.
    ///
    /// # Errors
    ///
    /// Returns client creation and flow store failures.
    pub async fn begin_login(&self, return_to: Option<&str>) -> Result<LoginStart, OidcError> {
        let client = self.provider.get_client().await?;

        let state = CsrfToken::new_random();
        let nonce = Nonce::new_random();
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let flow_id = Uuid::new_v4().to_string();
        let return_to = sanitize_return_to(return_to);

        let record = OidcFlowRecord {
            state: state.secret().clone(),
            nonce: nonce.secret().clone(),
            code_verifier: pkce_verifier.secret().clone(),
            redirect_uri: self.settings.redirect_uri.to_string(),
            return_to,
            flow_id: flow_id.clone(),
            created_at: Utc::now(),
        };
        self.flows.set(&record).await?;

        let mut authorization_url = client.authorization_endpoint().clone();
        {
            let mut query = authorization_url.query_pairs_mut();
            query.append_pair("client_id", &self.settings.client_id);
            query.append_pair("scope", &self.settings.scopes);
            query.append_pair("response_type", "code");
            query.append_pair("response_mode", "query");
            query.append_pair("redirect_uri", &record.redirect_uri);
            query.append_pair("state", &record.state);
            query.append_pair("nonce", &record.nonce);
            if self.settings.enforce_pkce {
                query.append_pair("code_challenge", pkce_challenge.as_str());
                query.append_pair("code_challenge_method", "S256");
            }
        }

        debug!(
            pkce = self.settings.enforce_pkce,
            return_to = %record.return_to,
            "OIDC login started"
        );

        Ok(LoginStart {
            authorization_url,
            flow_id,
        })
    }

    /// Finish a login from the provider callback.
    ///
    /// The flow record is consumed before anything else is checked, so every
    /// outcome (including mismatches and exchange failures) uses it up.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::FlowNotFound`] for unknown, expired or replayed
    /// states, [`OidcError::FlowMismatch`] when `flow_id` does not match,
    /// exchange and verification failures, and
    /// [`OidcError::MissingSubject`] / [`OidcError::MissingIssuer`] for
    /// incomplete identities.
    pub async fn complete_login(&self, input: CompleteLogin) -> Result<LoginResult, OidcError> {
        let record = self
            .flows
            .take(&input.state)
            .await?
            .ok_or(OidcError::FlowNotFound)?;

        if !tokens_match(&record.flow_id, &input.flow_id) {
            warn!(state = %record.state, "OIDC flow id mismatch, flow discarded");
            return Err(OidcError::FlowMismatch);
        }

        let client = self.provider.get_client().await?;
        let token_set = client
            .exchange_code(CodeExchange {
                code: input.code,
                redirect_uri: record.redirect_uri,
                nonce: record.nonce,
                code_verifier: self.settings.enforce_pkce.then_some(record.code_verifier),
            })
            .await?;

        let profile = OidcProfile::from_claims(&token_set.claims)?;
        info!(
            issuer = %profile.issuer,
            subject = %profile.subject,
            "OIDC login completed"
        );

        Ok(LoginResult {
            profile,
            token_set,
            return_to: record.return_to,
        })
    }

    /// Provider logout URL, or `None` if the provider has no end-session
    /// endpoint.
    ///
    /// # Errors
    ///
    /// Returns client creation failures.
    pub async fn build_logout_url(
        &self,
        id_token_hint: Option<&str>,
    ) -> Result<Option<Url>, OidcError> {
        let client = self.provider.get_client().await?;
        let Some(endpoint) = client.end_session_endpoint() else {
            return Ok(None);
        };

        let mut url = endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(
                "post_logout_redirect_uri",
                self.settings.post_logout_redirect_uri.as_str(),
            );
            query.append_pair("client_id", &self.settings.client_id);
            if let Some(hint) = id_token_hint {
                query.append_pair("id_token_hint", hint);
            }
        }
        Ok(Some(url))
    }
}
