//! Establishes and tracks credentials for the remote platform.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, COOKIE, SET_COOKIE};
use std::sync::RwLock;
use std::time::Duration;

use super::types::{LoginOutcome, SessionState, SessionToken};
use crate::config::{AuthConfig, AuthMethod, SyncConfig};

/// Keep-alive cadence when no token carries an expiry
pub const KEEPALIVE_FALLBACK: Duration = Duration::from_secs(3600);
/// Refresh this long before the soonest token expires
pub const KEEPALIVE_SAFETY_BUFFER: Duration = Duration::from_secs(300);
/// Never schedule keep-alives closer together than this
pub const KEEPALIVE_MIN_DELAY: Duration = Duration::from_secs(60);

const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AuthManager {
    auth: AuthConfig,
    base_url: String,
    http: reqwest::Client,
    state: RwLock<SessionState>,
}

impl AuthManager {
    pub fn new(config: &SyncConfig, http: reqwest::Client) -> Self {
        Self {
            auth: config.auth.clone(),
            base_url: config.base_url().to_string(),
            http,
            state: RwLock::new(SessionState::default()),
        }
    }

    pub fn method(&self) -> AuthMethod {
        self.auth.method
    }

    /// Identity used for rate-limit keys. Never a secret.
    pub fn identity(&self) -> &str {
        match self.auth.method {
            AuthMethod::Password if !self.auth.username.is_empty() => &self.auth.username,
            AuthMethod::Password => "anonymous",
            AuthMethod::Token => "token",
        }
    }

    pub async fn login(&self) -> LoginOutcome {
        match self.auth.method {
            AuthMethod::Token => self.login_with_token(),
            AuthMethod::Password => self.login_with_password().await,
        }
    }

    fn login_with_token(&self) -> LoginOutcome {
        if self.base_url.is_empty() || self.auth.token.is_empty() {
            tracing::warn!("Token login attempted without base URL or token");
            return LoginOutcome::failed("Base URL and API token must both be configured");
        }
        tracing::debug!("Using static API token");
        LoginOutcome::ok("Using static API token")
    }

    async fn login_with_password(&self) -> LoginOutcome {
        if self.base_url.is_empty() {
            return LoginOutcome::failed("Base URL is not configured");
        }
        if self.auth.username.is_empty() || self.auth.password.is_empty() {
            tracing::warn!("Password login attempted without credentials");
            return LoginOutcome::failed("Username and password must both be configured");
        }

        let url = format!("{}/api/login", self.base_url);
        tracing::info!(username = %self.auth.username, "Logging in to {}", self.base_url);

        let response = match self
            .http
            .post(&url)
            .timeout(LOGIN_TIMEOUT)
            .json(&serde_json::json!({
                "username": self.auth.username,
                "password": self.auth.password,
            }))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("Login request failed: {}", e);
                return LoginOutcome::failed(format!("Could not reach the server: {}", e));
            }
        };

        let status = response.status();
        let now = Utc::now();
        let tokens = tokens_from_headers(response.headers(), now);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = server_message(&body).unwrap_or_else(|| status.to_string());
            tracing::warn!(status = status.as_u16(), "Login rejected: {}", reason);
            return LoginOutcome::failed(format!("Login rejected: {}", reason));
        }

        if tokens.is_empty() {
            tracing::warn!("Login returned no session cookie");
            return LoginOutcome::failed("Login succeeded but no session cookie was returned");
        }

        let count = tokens.len();
        {
            let mut state = self.write_state();
            state.tokens.clear();
            state.absorb(tokens, now);
            state.last_login = Some(now);
        }

        tracing::info!("Login successful ({} session tokens)", count);
        LoginOutcome::ok("Login successful")
    }

    pub fn is_authenticated(&self) -> bool {
        self.is_authenticated_at(Utc::now())
    }

    pub fn is_authenticated_at(&self, now: DateTime<Utc>) -> bool {
        match self.auth.method {
            AuthMethod::Token => !self.base_url.is_empty() && !self.auth.token.is_empty(),
            AuthMethod::Password => self.read_state().is_valid(now),
        }
    }

    pub fn logout(&self) {
        let mut state = self.write_state();
        *state = SessionState::default();
        tracing::info!("Session cleared");
    }

    pub fn last_login(&self) -> Option<DateTime<Utc>> {
        self.read_state().last_login
    }

    pub fn session(&self) -> SessionState {
        self.read_state().clone()
    }

    /// Headers that authenticate a request in the configured mode
    pub fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match self.auth.method {
            AuthMethod::Token => {
                let value = format!("Bearer {}", self.auth.token);
                if let Ok(value) = value.parse() {
                    headers.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
            AuthMethod::Password => {
                let cookie = self.read_state().cookie_header(Utc::now());
                if let Some(value) = cookie.and_then(|c| c.parse().ok()) {
                    headers.insert(COOKIE, value);
                }
            }
        }
        headers
    }

    /// Pick up rotated session cookies from any response.
    pub fn absorb_response_cookies(&self, headers: &HeaderMap) {
        if self.auth.method != AuthMethod::Password {
            return;
        }
        let now = Utc::now();
        let tokens = tokens_from_headers(headers, now);
        if !tokens.is_empty() {
            self.write_state().absorb(tokens, now);
        }
    }

    /// Validate the session and log in again when it has lapsed.
    ///
    /// Returns the delay until the next keep-alive should run.
    pub async fn keepalive(&self) -> Duration {
        if self.auth.method == AuthMethod::Token {
            return KEEPALIVE_FALLBACK;
        }

        let alive = self.is_authenticated() && self.validate_session().await;
        if alive {
            tracing::debug!("Session keep-alive succeeded");
        } else {
            let outcome = self.login().await;
            if !outcome.success {
                tracing::warn!("Keep-alive login failed: {}", outcome.message);
            }
        }

        next_keepalive_delay(&self.read_state(), Utc::now())
    }

    async fn validate_session(&self) -> bool {
        let url = format!("{}/api/whoami", self.base_url);
        match self
            .http
            .get(&url)
            .timeout(LOGIN_TIMEOUT)
            .headers(self.auth_headers())
            .send()
            .await
        {
            Ok(response) => {
                self.absorb_response_cookies(response.headers());
                response.status().is_success()
            }
            Err(e) => {
                tracing::warn!("Session validation request failed: {}", e);
                false
            }
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }
}

/// Soonest token expiry minus the safety buffer, or the hourly fallback.
pub fn next_keepalive_delay(state: &SessionState, now: DateTime<Utc>) -> Duration {
    let Some(soonest) = state.soonest_expiry() else {
        return KEEPALIVE_FALLBACK;
    };

    let until_expiry = (soonest - now).to_std().unwrap_or(Duration::ZERO);
    until_expiry
        .saturating_sub(KEEPALIVE_SAFETY_BUFFER)
        .max(KEEPALIVE_MIN_DELAY)
}

fn tokens_from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Vec<SessionToken> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| SessionToken::from_set_cookie(value, now))
        .collect()
}

/// `message` field of a JSON error body, if there is one
pub(crate) fn server_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("message")
        .and_then(|m| m.as_str())
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn password_config(base_url: &str, username: &str, password: &str) -> SyncConfig {
        SyncConfig::new(
            base_url,
            AuthConfig {
                method: AuthMethod::Password,
                username: username.to_string(),
                password: password.to_string(),
                token: String::new(),
            },
        )
    }

    fn token_config(base_url: &str, token: &str) -> SyncConfig {
        SyncConfig::new(
            base_url,
            AuthConfig {
                method: AuthMethod::Token,
                token: token.to_string(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_token_login_needs_url_and_token() {
        let manager = AuthManager::new(&token_config("https://x.test", "t"), reqwest::Client::new());
        assert!(manager.login().await.success);
        assert!(manager.is_authenticated());

        let manager = AuthManager::new(&token_config("https://x.test", ""), reqwest::Client::new());
        let outcome = manager.login().await;
        assert!(!outcome.success);
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_password_login_without_credentials_fails_softly() {
        let manager = AuthManager::new(
            &password_config("https://x.test", "", ""),
            reqwest::Client::new(),
        );
        let outcome = manager.login().await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("Username and password"));
    }

    #[tokio::test]
    async fn test_password_login_stores_session() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/login")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "username": "admin",
                "password": "hunter2",
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("set-cookie", "ChurchTools_ct_demo=sess1; Max-Age=7200; Path=/")
            .with_body(r#"{"data":{"status":"success","personId":1}}"#)
            .create_async()
            .await;

        let manager = AuthManager::new(
            &password_config(&server.url(), "admin", "hunter2"),
            reqwest::Client::new(),
        );
        assert!(!manager.is_authenticated());

        let outcome = manager.login().await;
        assert!(outcome.success, "{}", outcome.message);
        assert!(manager.is_authenticated());
        assert!(manager.last_login().is_some());

        let headers = manager.auth_headers();
        assert_eq!(
            headers.get(COOKIE).and_then(|v| v.to_str().ok()),
            Some("ChurchTools_ct_demo=sess1")
        );

        manager.logout();
        assert!(!manager.is_authenticated());
        assert!(manager.last_login().is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_login_reports_server_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/login")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":"Wrong password"}"#)
            .create_async()
            .await;

        let manager = AuthManager::new(
            &password_config(&server.url(), "admin", "nope"),
            reqwest::Client::new(),
        );
        let outcome = manager.login().await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("Wrong password"));
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_softly() {
        let manager = AuthManager::new(
            &password_config("http://127.0.0.1:1", "admin", "pw"),
            reqwest::Client::new(),
        );
        let outcome = manager.login().await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("Could not reach"));
    }

    #[test]
    fn test_bearer_header_in_token_mode() {
        let manager = AuthManager::new(&token_config("https://x.test", "abc"), reqwest::Client::new());
        let headers = manager.auth_headers();
        assert_eq!(
            headers
                .get(reqwest::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok()),
            Some("Bearer abc")
        );
        assert_eq!(manager.identity(), "token");
    }

    async fn mock_session_login(server: &mut mockito::Server, expected_calls: usize) -> mockito::Mock {
        server
            .mock("POST", "/api/login")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("set-cookie", "ChurchTools_ct_demo=sess1; Max-Age=7200; Path=/")
            .with_body(r#"{"data":{"status":"success"}}"#)
            .expect(expected_calls)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_keepalive_with_live_session_does_not_log_in() {
        let mut server = mockito::Server::new_async().await;
        let login = mock_session_login(&mut server, 1).await;
        let whoami = server
            .mock("GET", "/api/whoami")
            .match_header("cookie", "ChurchTools_ct_demo=sess1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":{"id":1}}"#)
            .expect(1)
            .create_async()
            .await;

        let manager = AuthManager::new(
            &password_config(&server.url(), "admin", "pw"),
            reqwest::Client::new(),
        );
        assert!(manager.login().await.success);

        let delay = manager.keepalive().await;
        assert!(delay > KEEPALIVE_MIN_DELAY);
        assert!(delay <= Duration::from_secs(7200) - KEEPALIVE_SAFETY_BUFFER);
        assert!(manager.is_authenticated());

        login.assert_async().await;
        whoami.assert_async().await;
    }

    #[tokio::test]
    async fn test_keepalive_logs_in_again_after_401() {
        let mut server = mockito::Server::new_async().await;
        // One login up front, exactly one more from the keep-alive
        let login = mock_session_login(&mut server, 2).await;
        let whoami = server
            .mock("GET", "/api/whoami")
            .with_status(401)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":"Session expired"}"#)
            .expect(1)
            .create_async()
            .await;

        let manager = AuthManager::new(
            &password_config(&server.url(), "admin", "pw"),
            reqwest::Client::new(),
        );
        assert!(manager.login().await.success);
        let first_login = manager.last_login();

        manager.keepalive().await;
        assert!(manager.is_authenticated());
        assert!(manager.last_login() >= first_login);

        login.assert_async().await;
        whoami.assert_async().await;
    }

    #[tokio::test]
    async fn test_keepalive_without_session_logs_in_directly() {
        let mut server = mockito::Server::new_async().await;
        let login = mock_session_login(&mut server, 1).await;
        let whoami = server
            .mock("GET", "/api/whoami")
            .expect(0)
            .create_async()
            .await;

        let manager = AuthManager::new(
            &password_config(&server.url(), "admin", "pw"),
            reqwest::Client::new(),
        );
        manager.keepalive().await;
        assert!(manager.is_authenticated());

        login.assert_async().await;
        whoami.assert_async().await;
    }

    #[tokio::test]
    async fn test_keepalive_in_token_mode_makes_no_calls() {
        let mut server = mockito::Server::new_async().await;
        let login = mock_session_login(&mut server, 0).await;
        let whoami = server
            .mock("GET", "/api/whoami")
            .expect(0)
            .create_async()
            .await;

        let manager = AuthManager::new(&token_config(&server.url(), "abc"), reqwest::Client::new());
        assert_eq!(manager.keepalive().await, KEEPALIVE_FALLBACK);

        login.assert_async().await;
        whoami.assert_async().await;
    }

    #[test]
    fn test_keepalive_delay() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut state = SessionState::default();
        assert_eq!(next_keepalive_delay(&state, now), KEEPALIVE_FALLBACK);

        state.tokens.push(SessionToken {
            name: "a".to_string(),
            value: "1".to_string(),
            expires_at: Some(now + ChronoDuration::hours(2)),
            domain: None,
            path: None,
        });
        state.tokens.push(SessionToken {
            name: "b".to_string(),
            value: "1".to_string(),
            expires_at: Some(now + ChronoDuration::minutes(30)),
            domain: None,
            path: None,
        });
        assert_eq!(
            next_keepalive_delay(&state, now),
            Duration::from_secs(25 * 60)
        );

        // Expiring inside the safety buffer clamps to the minimum delay
        assert_eq!(
            next_keepalive_delay(&state, now + ChronoDuration::minutes(28)),
            KEEPALIVE_MIN_DELAY
        );
    }

    #[test]
    fn test_server_message() {
        assert_eq!(
            server_message(r#"{"message":"Session expired"}"#).as_deref(),
            Some("Session expired")
        );
        assert_eq!(server_message("<html></html>"), None);
        assert_eq!(server_message(r#"{"message":""}"#), None);
    }
}
