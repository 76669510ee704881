//! Session token and login result types.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// A cookie issued by the remote platform on login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub name: String,
    pub value: String,
    /// `None` means a browser-session cookie with no fixed expiry
    pub expires_at: Option<DateTime<Utc>>,
    pub domain: Option<String>,
    pub path: Option<String>,
}

impl SessionToken {
    /// Parse one `Set-Cookie` header value. `Max-Age` wins over `Expires`.
    pub fn from_set_cookie(header: &str, now: DateTime<Utc>) -> Option<Self> {
        let parsed = cookie::Cookie::parse(header).ok()?;

        let expires_at = match parsed.max_age() {
            Some(max_age) => Some(now + Duration::seconds(max_age.whole_seconds())),
            None => parsed
                .expires_datetime()
                .and_then(|at| DateTime::<Utc>::from_timestamp(at.unix_timestamp(), 0)),
        };

        Some(Self {
            name: parsed.name().to_string(),
            value: parsed.value().to_string(),
            expires_at,
            domain: parsed.domain().map(str::to_string),
            path: parsed.path().map(str::to_string),
        })
    }

    /// Expired at or before `now`. Tokens without expiry never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// `Set-Cookie` with an empty value or a past expiry deletes the cookie
    fn is_deletion(&self, now: DateTime<Utc>) -> bool {
        self.value.is_empty() || self.is_expired(now)
    }
}

/// Everything the password login flow remembers between calls
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub tokens: Vec<SessionToken>,
    pub last_login: Option<DateTime<Utc>>,
}

impl SessionState {
    /// Non-empty and nothing expired
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.tokens.is_empty() && !self.tokens.iter().any(|t| t.is_expired(now))
    }

    /// Merge freshly issued cookies, replacing tokens with the same name.
    pub fn absorb(&mut self, issued: Vec<SessionToken>, now: DateTime<Utc>) {
        for token in issued {
            self.tokens.retain(|t| t.name != token.name);
            if !token.is_deletion(now) {
                self.tokens.push(token);
            }
        }
    }

    /// `Cookie` header value for the live tokens
    pub fn cookie_header(&self, now: DateTime<Utc>) -> Option<String> {
        let pairs: Vec<String> = self
            .tokens
            .iter()
            .filter(|t| !t.is_expired(now))
            .map(|t| format!("{}={}", t.name, t.value))
            .collect();

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    pub fn soonest_expiry(&self) -> Option<DateTime<Utc>> {
        self.tokens.iter().filter_map(|t| t.expires_at).min()
    }
}

/// Outcome of a login attempt. Expected failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginOutcome {
    pub success: bool,
    pub message: String,
}

impl LoginOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}
