//! Sealed token codec
//!
//! Turns a small serde payload into an opaque, tamper-evident string that is
//! safe to use as a cookie value, and back. Each token carries its own issue
//! time and, when sealed with a non-zero TTL, its own expiry. A token is
//! rejected once either its sealed expiry or the caller's TTL has passed.
//!
//! Token layout (all segments base64url without padding):
//!
//! ```text
//! v1.<salt>.<nonce>.<ciphertext>
//! ```
//!
//! The key is derived per token with HKDF-SHA256 from the password and the
//! random salt. The payload is encrypted with AES-256-GCM and the `v1.<salt>`
//! header is bound as associated data.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

/// Minimum password length in bytes
pub const MIN_PASSWORD_LEN: usize = 32;

const VERSION: &str = "v1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_INFO: &[u8] = b"acme-auth/seal/v1";

/// Tokens issued further than this in the future are rejected (milliseconds)
const CLOCK_SKEW_MS: i64 = 60_000;

/// Errors produced by the codec
///
/// Every unseal failure (malformed token, bad tag, wrong password, expired,
/// unexpected payload shape) collapses into [`SealError::InvalidSeal`].
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    /// The password is too short to derive a key from.
    #[error("seal password must be at least {min} bytes")]
    WeakPassword {
        /// Required minimum length.
        min: usize,
    },

    /// The payload could not be serialized.
    #[error("failed to serialize sealed payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The cipher rejected the payload.
    #[error("failed to encrypt sealed payload")]
    Encryption,

    /// The token is not a valid, unexpired seal for this password.
    #[error("invalid sealed token")]
    InvalidSeal,
}

/// Password and lifetime used for sealing and unsealing
#[derive(Clone, Copy)]
pub struct SealOptions<'a> {
    /// Server-side secret.
    pub password: &'a str,
    /// Lifetime sealed into new tokens, and maximum accepted age when
    /// unsealing. Zero means no limit.
    pub ttl: Duration,
}

impl std::fmt::Debug for SealOptions<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealOptions")
            .field("password", &"[redacted]")
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[derive(Serialize)]
struct Envelope<'a, T> {
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
    data: &'a T,
}

#[derive(Deserialize)]
struct OpenedEnvelope<T> {
    iat: i64,
    #[serde(default)]
    exp: Option<i64>,
    data: T,
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Seal `payload` with the current time as issue time.
///
/// # Errors
///
/// Returns error if the password is too short or the payload cannot be
/// serialized.
pub fn seal<T: Serialize>(payload: &T, options: &SealOptions<'_>) -> Result<String, SealError> {
    seal_at(payload, options, Utc::now())
}

/// Seal `payload` with an explicit issue time.
///
/// # Errors
///
/// Returns error if the password is too short or the payload cannot be
/// serialized.
pub fn seal_at<T: Serialize>(
    payload: &T,
    options: &SealOptions<'_>,
    now: DateTime<Utc>,
) -> Result<String, SealError> {
    check_password(options.password)?;

    let iat = now.timestamp_millis();
    let exp = (!options.ttl.is_zero()).then(|| iat.saturating_add(ttl_millis(options.ttl)));
    let plaintext = serde_json::to_vec(&Envelope {
        iat,
        exp,
        data: payload,
    })?;

    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    let mut rng = rand::rng();
    rng.fill(&mut salt);
    rng.fill(&mut nonce);

    let header = format!("{VERSION}.{}", URL_SAFE_NO_PAD.encode(salt));
    let cipher = derive_cipher(options.password, &salt).ok_or(SealError::Encryption)?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &plaintext,
                aad: header.as_bytes(),
            },
        )
        .map_err(|_| SealError::Encryption)?;

    Ok(format!(
        "{header}.{}.{}",
        URL_SAFE_NO_PAD.encode(nonce),
        URL_SAFE_NO_PAD.encode(ciphertext)
    ))
}

/// Unseal `token`, checking its age against the current time.
///
/// # Errors
///
/// Returns [`SealError::WeakPassword`] for an unusable password and
/// [`SealError::InvalidSeal`] for anything wrong with the token itself.
pub fn unseal<T: DeserializeOwned>(token: &str, options: &SealOptions<'_>) -> Result<T, SealError> {
    unseal_at(token, options, Utc::now())
}

/// Unseal `token`, checking its age against `now`.
///
/// # Errors
///
/// Returns [`SealError::WeakPassword`] for an unusable password and
/// [`SealError::InvalidSeal`] for anything wrong with the token itself.
pub fn unseal_at<T: DeserializeOwned>(
    token: &str,
    options: &SealOptions<'_>,
    now: DateTime<Utc>,
) -> Result<T, SealError> {
    check_password(options.password)?;

    let opened: OpenedEnvelope<T> = open(token, options.password).ok_or_else(|| {
        tracing::debug!("Rejected sealed token: malformed or failed authentication");
        SealError::InvalidSeal
    })?;

    let age_ms = now.timestamp_millis().saturating_sub(opened.iat);
    if age_ms < -CLOCK_SKEW_MS {
        tracing::debug!(age_ms, "Rejected sealed token issued in the future");
        return Err(SealError::InvalidSeal);
    }

    if let Some(exp) = opened.exp {
        if now.timestamp_millis() > exp {
            tracing::debug!(age_ms, "Rejected sealed token past its sealed expiry");
            return Err(SealError::InvalidSeal);
        }
    }

    if !options.ttl.is_zero() {
        let ttl_ms = ttl_millis(options.ttl);
        if age_ms > ttl_ms {
            tracing::debug!(age_ms, ttl_ms, "Rejected expired sealed token");
            return Err(SealError::InvalidSeal);
        }
    }

    Ok(opened.data)
}

fn check_password(password: &str) -> Result<(), SealError> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(SealError::WeakPassword {
            min: MIN_PASSWORD_LEN,
        });
    }
    Ok(())
}

fn derive_cipher(password: &str, salt: &[u8]) -> Option<Aes256Gcm> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), password.as_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(KEY_INFO, &mut key).ok()?;
    Aes256Gcm::new_from_slice(&key).ok()
}

fn open<T: DeserializeOwned>(token: &str, password: &str) -> Option<OpenedEnvelope<T>> {
    let mut segments = token.split('.');
    let (Some(version), Some(salt_b64), Some(nonce_b64), Some(ciphertext_b64), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return None;
    };

    if version != VERSION {
        return None;
    }

    let salt = URL_SAFE_NO_PAD.decode(salt_b64).ok()?;
    let nonce = URL_SAFE_NO_PAD.decode(nonce_b64).ok()?;
    let ciphertext = URL_SAFE_NO_PAD.decode(ciphertext_b64).ok()?;
    if salt.len() != SALT_LEN || nonce.len() != NONCE_LEN {
        return None;
    }

    let header = format!("{version}.{salt_b64}");
    let cipher = derive_cipher(password, &salt)?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &ciphertext,
                aad: header.as_bytes(),
            },
        )
        .ok()?;

    serde_json::from_slice(&plaintext).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    const PASSWORD: &str = "complex_password_at_least_32_characters_long";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct TestPayload {
        customer_id: String,
        role: String,
    }

    fn payload() -> TestPayload {
        TestPayload {
            customer_id: "cust-1".to_string(),
            role: "customer".to_string(),
        }
    }

    fn options(ttl_secs: u64) -> SealOptions<'static> {
        SealOptions {
            password: PASSWORD,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    #[test]
    fn test_seal_unseal_round_trip() {
        let token = seal(&payload(), &options(3600)).unwrap();
        let opened: TestPayload = unseal(&token, &options(3600)).unwrap();
        assert_eq!(opened, payload());
    }

    #[test]
    fn test_token_is_cookie_safe() {
        let token = seal(&payload(), &options(3600)).unwrap();
        assert!(token.starts_with("v1."));
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')));
    }

    #[test]
    fn test_each_seal_is_unique() {
        let first = seal(&payload(), &options(3600)).unwrap();
        let second = seal(&payload(), &options(3600)).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_expired_token_rejected() {
        let issued = Utc::now() - ChronoDuration::seconds(120);
        let token = seal_at(&payload(), &options(60), issued).unwrap();

        let result = unseal::<TestPayload>(&token, &options(60));
        assert!(matches!(result, Err(SealError::InvalidSeal)));
    }

    #[test]
    fn test_token_valid_until_ttl() {
        let issued = Utc::now();
        let token = seal_at(&payload(), &options(60), issued).unwrap();

        let at_edge = issued + ChronoDuration::seconds(60);
        assert!(unseal_at::<TestPayload>(&token, &options(60), at_edge).is_ok());

        let past_edge = issued + ChronoDuration::seconds(61);
        assert!(unseal_at::<TestPayload>(&token, &options(60), past_edge).is_err());
    }

    #[test]
    fn test_sealed_expiry_enforced_under_longer_unseal_ttl() {
        let issued = Utc::now() - ChronoDuration::hours(2);
        let token = seal_at(&payload(), &options(3600), issued).unwrap();

        let result = unseal::<TestPayload>(&token, &options(30 * 24 * 3600));
        assert!(matches!(result, Err(SealError::InvalidSeal)));

        let within = issued + ChronoDuration::minutes(59);
        let lenient = options(30 * 24 * 3600);
        assert!(unseal_at::<TestPayload>(&token, &lenient, within).is_ok());
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let issued = Utc::now() - ChronoDuration::days(365);
        let token = seal_at(&payload(), &options(0), issued).unwrap();
        assert!(unseal::<TestPayload>(&token, &options(0)).is_ok());
    }

    #[test]
    fn test_future_token_rejected() {
        let issued = Utc::now() + ChronoDuration::minutes(10);
        let token = seal_at(&payload(), &options(3600), issued).unwrap();
        assert!(unseal::<TestPayload>(&token, &options(3600)).is_err());
    }

    #[test]
    fn test_wrong_password_rejected() {
        let token = seal(&payload(), &options(3600)).unwrap();
        let other = SealOptions {
            password: "another_password_that_is_32_chars_or_more",
            ttl: Duration::from_secs(3600),
        };
        assert!(matches!(
            unseal::<TestPayload>(&token, &other),
            Err(SealError::InvalidSeal)
        ));
    }

    #[test]
    fn test_weak_password_rejected() {
        let weak = SealOptions {
            password: "short",
            ttl: Duration::from_secs(60),
        };
        assert!(matches!(
            seal(&payload(), &weak),
            Err(SealError::WeakPassword { min: MIN_PASSWORD_LEN })
        ));
        assert!(matches!(
            unseal::<TestPayload>("v1.a.b.c", &weak),
            Err(SealError::WeakPassword { .. })
        ));
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        for token in ["", "garbage", "v1.a.b", "v2.a.b.c", "v1.!!.b.c", "v1.a.b.c.d"] {
            assert!(
                matches!(unseal::<TestPayload>(token, &options(60)), Err(SealError::InvalidSeal)),
                "accepted {token:?}"
            );
        }
    }

    #[test]
    fn test_unexpected_payload_shape_rejected() {
        let token = seal(&serde_json::json!({ "customerId": "cust-1" }), &options(60)).unwrap();
        assert!(unseal::<TestPayload>(&token, &options(60)).is_err());
    }

    proptest! {
        #[test]
        fn prop_any_single_character_change_is_rejected(
            index in 0usize..512,
            replacement in "[A-Za-z0-9_.-]",
        ) {
            let token = seal(&payload(), &options(3600)).unwrap();
            let index = index % token.len();
            let replacement = replacement.chars().next().unwrap();
            prop_assume!(token.as_bytes()[index] != replacement as u8);

            let mut tampered = token.into_bytes();
            tampered[index] = replacement as u8;
            let tampered = String::from_utf8(tampered).unwrap();

            prop_assert!(unseal::<TestPayload>(&tampered, &options(3600)).is_err());
        }

        #[test]
        fn prop_round_trip_before_expiry(
            customer_id in "[a-zA-Z0-9-]{1,40}",
            role in "[a-z]{1,12}",
        ) {
            let original = TestPayload { customer_id, role };
            let token = seal(&original, &options(3600)).unwrap();
            let opened: TestPayload = unseal(&token, &options(3600)).unwrap();
            prop_assert_eq!(opened, original);
        }
    }
}
