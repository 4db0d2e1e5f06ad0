//! CSRF token generation and comparison

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use subtle::ConstantTimeEq;

/// Random bytes in a CSRF token
pub const CSRF_TOKEN_BYTES: usize = 32;

/// Random bytes in a session id
pub(crate) const SESSION_ID_BYTES: usize = 32;

/// Generate a random URL-safe token from `len` random bytes.
pub(crate) fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// Generate a fresh CSRF token.
#[must_use]
pub fn generate_csrf_token() -> String {
    random_token(CSRF_TOKEN_BYTES)
}

/// Compare a submitted token against the expected one in constant time.
///
/// Empty candidates never match.
#[must_use]
pub fn tokens_match(expected: &str, candidate: &str) -> bool {
    if candidate.is_empty() || expected.len() != candidate.len() {
        return false;
    }
    expected.as_bytes().ct_eq(candidate.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_length() {
        // Base64 URL-safe encoding: 32 bytes -> 43 characters (no padding)
        assert_eq!(generate_csrf_token().len(), 43);
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(generate_csrf_token(), generate_csrf_token());
    }

    #[test]
    fn test_tokens_match() {
        let token = generate_csrf_token();
        assert!(tokens_match(&token, &token));
        assert!(!tokens_match(&token, "wrong"));
        assert!(!tokens_match(&token, ""));
        assert!(!tokens_match("", ""));
    }
}
