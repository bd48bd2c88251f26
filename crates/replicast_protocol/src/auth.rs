//! Session and access credentials.
//!
//! Both token types redact themselves in `Debug` output so they can sit
//! inside structs that get logged.

use serde_json::Value;
use std::fmt;

/// Long-lived session credential obtained once at login.
///
/// Holds the `name=value` pairs of every cookie set by the login exchange,
/// joined with `"; "` so it can be sent back verbatim as a `Cookie` header.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    /// Wraps an already-formatted cookie header value.
    pub fn new(cookie_header: impl Into<String>) -> Self {
        Self(cookie_header.into())
    }

    /// Builds the session token from `Set-Cookie` header values, in receipt
    /// order. Attributes after the first `;` are dropped.
    pub fn from_set_cookie_headers<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let pairs: Vec<String> = headers
            .into_iter()
            .filter_map(|header| {
                let pair = header.as_ref().split(';').next().unwrap_or_default().trim();
                (!pair.is_empty()).then(|| pair.to_string())
            })
            .collect();
        Self(pairs.join("; "))
    }

    /// Returns the `Cookie` header value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if no cookie was captured.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of cookies carried.
    pub fn cookie_count(&self) -> usize {
        if self.0.is_empty() {
            0
        } else {
            self.0.split("; ").count()
        }
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({} cookies)", self.cookie_count())
    }
}

/// Short-lived credential applied to the transport.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wraps a signed token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Extracts the token from a refresh response body.
    ///
    /// Shapes are checked in order: `{"token": "…"}`, `{"auth": "…"}`, then
    /// a bare JSON string. An empty or blank value falls through to the next
    /// shape. Returns `None` when none of them matches.
    pub fn from_refresh_body(body: &Value) -> Option<Self> {
        fn usable(token: &str) -> Option<&str> {
            Some(token.trim()).filter(|token| !token.is_empty())
        }

        let found = match body {
            Value::Object(fields) => ["token", "auth"]
                .iter()
                .find_map(|key| fields.get(*key).and_then(Value::as_str).and_then(usable)),
            Value::String(token) => usable(token),
            _ => None,
        };
        found.map(Self::new)
    }

    /// Extracts the token from raw refresh response text.
    ///
    /// Text that is not JSON is taken as the token itself when it is a
    /// single whitespace-free word (some servers reply with the bare JWT).
    pub fn from_refresh_text(text: &str) -> Option<Self> {
        match serde_json::from_str::<Value>(text) {
            Ok(body) => Self::from_refresh_body(&body),
            Err(_) => {
                let text = text.trim();
                (!text.is_empty() && !text.contains(char::is_whitespace))
                    .then(|| Self::new(text))
            }
        }
    }

    /// Returns the signed token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the token length in characters.
    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    /// Returns true for an empty token.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a short prefix that is safe to log.
    pub fn preview(&self) -> String {
        let prefix: String = self.0.chars().take(12).collect();
        format!("{prefix}…")
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken({} chars)", self.len())
    }
}
