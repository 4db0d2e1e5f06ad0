//! Per-request cookie jar
//!
//! Holds the cookies a request arrived with plus the `Set-Cookie` mutations
//! produced while handling it. Reads observe pending mutations, so a cookie
//! set earlier in the same request is visible and a removed one is not.

use http::header::{COOKIE, SET_COOKIE, USER_AGENT};
use http::{HeaderMap, HeaderValue};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// SameSite cookie policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SameSite {
    /// Strict same-site policy
    #[default]
    Strict,
    /// Lax same-site policy
    Lax,
    /// No same-site restriction (requires Secure)
    None,
}

impl SameSite {
    /// Convert to cookie attribute string
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "Strict",
            Self::Lax => "Lax",
            Self::None => "None",
        }
    }
}

/// Attributes of an outgoing cookie
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CookieOptions {
    /// Cookie path
    pub path: String,
    /// Cookie domain, host-only when `None`
    pub domain: Option<String>,
    /// Lifetime sent as `Max-Age`
    pub max_age: Duration,
    /// Hide from client script
    pub http_only: bool,
    /// HTTPS only
    pub secure: bool,
    /// SameSite policy
    pub same_site: SameSite,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            domain: None,
            max_age: Duration::ZERO,
            http_only: true,
            secure: true,
            same_site: SameSite::Strict,
        }
    }
}

/// One pending `Set-Cookie` mutation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetCookie {
    /// Cookie name
    pub name: String,
    /// Cookie value, empty for removals
    pub value: String,
    /// Cookie attributes
    pub options: CookieOptions,
}

impl SetCookie {
    /// Whether this mutation deletes the cookie
    #[must_use]
    pub fn is_removal(&self) -> bool {
        self.options.max_age.is_zero()
    }
}

impl fmt::Display for SetCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let options = &self.options;
        write!(
            f,
            "{}={}; Path={}; Max-Age={}; SameSite={}",
            self.name,
            self.value,
            options.path,
            options.max_age.as_secs(),
            options.same_site.as_str()
        )?;
        if let Some(domain) = &options.domain {
            write!(f, "; Domain={domain}")?;
        }
        if options.http_only {
            f.write_str("; HttpOnly")?;
        }
        if options.secure {
            f.write_str("; Secure")?;
        }
        Ok(())
    }
}

/// Request cookies plus pending response mutations
#[derive(Clone, Debug, Default)]
pub struct CookieJar {
    incoming: HashMap<String, String>,
    user_agent: Option<String>,
    pending: Vec<SetCookie>,
}

impl CookieJar {
    /// Create an empty jar.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a jar from request headers.
    ///
    /// Reads every `Cookie` header and the `User-Agent`. When a name appears
    /// more than once the first value wins.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut incoming = HashMap::new();
        for header in headers.get_all(COOKIE) {
            let Ok(cookie_str) = header.to_str() else {
                continue;
            };
            for cookie in cookie_str.split(';') {
                if let Some((name, value)) = cookie.trim().split_once('=') {
                    incoming
                        .entry(name.trim().to_string())
                        .or_insert_with(|| value.trim().to_string());
                }
            }
        }

        let user_agent = headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);

        Self {
            incoming,
            user_agent,
            pending: Vec::new(),
        }
    }

    /// Add an incoming cookie.
    #[must_use]
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.incoming.insert(name.into(), value.into());
        self
    }

    /// Set the request `User-Agent`.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Current value of a cookie, including mutations made on this jar.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        match self.pending.iter().rev().find(|c| c.name == name) {
            Some(cookie) if cookie.is_removal() => None,
            Some(cookie) => Some(cookie.value.as_str()),
            None => self.incoming.get(name).map(String::as_str),
        }
    }

    /// Request `User-Agent`, if any.
    #[must_use]
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// Queue a cookie to be set on the response.
    pub fn set(&mut self, name: &str, value: impl Into<String>, options: CookieOptions) {
        self.push(SetCookie {
            name: name.to_string(),
            value: value.into(),
            options,
        });
    }

    /// Queue removal of a cookie. Path and domain must match the ones it was
    /// set with.
    pub fn remove(&mut self, name: &str, options: CookieOptions) {
        self.push(SetCookie {
            name: name.to_string(),
            value: String::new(),
            options: CookieOptions {
                max_age: Duration::ZERO,
                ..options
            },
        });
    }

    fn push(&mut self, cookie: SetCookie) {
        // Last write wins; one Set-Cookie per name.
        self.pending.retain(|c| c.name != cookie.name);
        self.pending.push(cookie);
    }

    /// Pending response mutations, in the order they were made.
    #[must_use]
    pub fn pending(&self) -> &[SetCookie] {
        &self.pending
    }

    /// The pending mutation for one cookie.
    #[must_use]
    pub fn pending_for(&self, name: &str) -> Option<&SetCookie> {
        self.pending.iter().find(|c| c.name == name)
    }

    /// Append one `Set-Cookie` header per pending mutation.
    pub fn write_headers(&self, headers: &mut HeaderMap) {
        for cookie in &self.pending {
            match HeaderValue::from_str(&cookie.to_string()) {
                Ok(value) => {
                    headers.append(SET_COOKIE, value);
                }
                Err(_) => {
                    tracing::warn!(cookie = %cookie.name, "Dropping unencodable Set-Cookie header");
                }
            }
        }
    }
}
