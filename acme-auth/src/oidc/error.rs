//! OIDC error types

use crate::store::StoreError;

/// Errors raised by the OIDC login flow.
///
/// Every variant raised by [`complete_login`](super::OidcLoginFlow::complete_login)
/// is raised after the flow record was consumed.
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// Client settings are missing or invalid.
    #[error("OIDC configuration error: {0}")]
    Configuration(String),

    /// Provider metadata could not be discovered.
    #[error("OIDC discovery failed for {issuer}: {message}")]
    Discovery {
        /// Issuer that was queried.
        issuer: String,
        /// Failure description.
        message: String,
    },

    /// No live flow exists for the given state (expired or already used).
    #[error("OIDC login flow not found or expired")]
    FlowNotFound,

    /// The flow id does not belong to the flow for this state.
    #[error("OIDC login flow mismatch")]
    FlowMismatch,

    /// The token endpoint rejected the code or could not be reached.
    #[error("OIDC code exchange failed: {0}")]
    Exchange(String),

    /// The token response carried no ID token.
    #[error("OIDC token response did not include an ID token")]
    MissingIdToken,

    /// The ID token failed verification.
    #[error("invalid ID token: {0}")]
    InvalidIdToken(String),

    /// The ID token has no string `sub` claim.
    #[error("ID token is missing the subject claim")]
    MissingSubject,

    /// The ID token has no string `iss` claim.
    #[error("ID token is missing the issuer claim")]
    MissingIssuer,

    /// The flow store failed.
    #[error("OIDC flow store error: {0}")]
    Store(#[from] StoreError),
}
