//! HTTP client for the remote platform's REST API.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::query::QueryParams;
use super::types::{
    RemoteAppointmentItem, RemoteCalendar, RemoteEvent, RemoteService, RemoteServiceGroup,
    RemoteUser, SyncWindow,
};
use super::RemoteSource;
use crate::auth::{server_message, AuthManager};
use crate::config::{AuthMethod, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::rate_limiter::RateLimiter;

pub const API_PREFIX: &str = "/api";
pub const API_TIMEOUT: Duration = Duration::from_secs(30);
/// A 401 in password mode earns exactly this many re-login attempts
pub const MAX_REAUTH_RETRIES: u32 = 1;

const RATE_LIMIT_CONTEXT: &str = "api";

/// Status, content type and body of one HTTP exchange
struct RawReply {
    status: StatusCode,
    content_type: Option<String>,
    body: String,
}

pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
    auth: Arc<AuthManager>,
    limiter: Arc<RateLimiter>,
    /// `installation:identity`, so installations sharing a limiter count apart
    limit_key: String,
}

impl ApiClient {
    /// Build the HTTP client, auth manager and API client for a configuration
    pub fn from_config(config: &SyncConfig, limiter: Arc<RateLimiter>) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .user_agent(concat!("churchsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let auth = Arc::new(AuthManager::new(config, http.clone()));
        Ok(Self::new(config, http, auth, limiter))
    }

    pub fn new(
        config: &SyncConfig,
        http: reqwest::Client,
        auth: Arc<AuthManager>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let limit_key = format!("{}:{}", config.installation_id, auth.identity());
        Self {
            base_url: config.base_url().to_string(),
            http,
            auth,
            limiter,
            limit_key,
        }
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Identifier this client's calls are counted under
    pub fn limit_key(&self) -> &str {
        &self.limit_key
    }

    pub fn url(&self, path: &str, query: &QueryParams) -> String {
        let mut url = format!("{}{}{}", self.base_url, API_PREFIX, path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query.encode());
        }
        url
    }

    /// GET a resource and return its parsed JSON body.
    pub async fn get(&self, path: &str, query: &QueryParams) -> SyncResult<serde_json::Value> {
        self.ensure_authenticated().await?;
        let url = self.url(path, query);
        self.execute_with_reauth(path, &url).await
    }

    /// GET a `{ "data": [...] }` listing and deserialize each element,
    /// keeping the element's raw JSON alongside.
    pub async fn get_list<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &QueryParams,
    ) -> SyncResult<Vec<(T, serde_json::Value)>> {
        let body = self.get(path, query).await?;
        parse_data_list(path, body)
    }

    /// Confirms credentials against `/whoami`
    pub async fn check_connection(&self) -> SyncResult<serde_json::Value> {
        self.get("/whoami", &QueryParams::new()).await
    }

    /// The user the credentials belong to, unwrapped from the `data` envelope
    pub async fn whoami(&self) -> SyncResult<RemoteUser> {
        let mut body = self.check_connection().await?;
        let data = body
            .get_mut("data")
            .map(serde_json::Value::take)
            .ok_or_else(|| SyncError::InvalidResponse("/whoami: missing data".to_string()))?;
        serde_json::from_value(data)
            .map_err(|e| SyncError::InvalidResponse(format!("/whoami: {}", e)))
    }

    async fn ensure_authenticated(&self) -> SyncResult<()> {
        if self.auth.is_authenticated() {
            return Ok(());
        }
        let outcome = self.auth.login().await;
        if outcome.success {
            Ok(())
        } else {
            Err(SyncError::Authentication(outcome.message))
        }
    }

    /// Runs the request, re-logging in at most `MAX_REAUTH_RETRIES` times
    /// after a 401 in password mode. Token mode never retries.
    async fn execute_with_reauth(&self, path: &str, url: &str) -> SyncResult<serde_json::Value> {
        let mut reauths = 0;

        loop {
            let reply = self.send_once(path, url).await?;

            if reply.status != StatusCode::UNAUTHORIZED {
                return interpret_reply(path, reply);
            }

            let can_retry =
                self.auth.method() == AuthMethod::Password && reauths < MAX_REAUTH_RETRIES;
            if !can_retry {
                tracing::warn!(path, "Request unauthorized, giving up");
                return Err(SyncError::Authentication(format!(
                    "Request to {} was rejected as unauthorized",
                    path
                )));
            }

            reauths += 1;
            tracing::info!(
                path,
                "Session rejected, logging in again (retry {}/{})",
                reauths,
                MAX_REAUTH_RETRIES
            );
            self.auth.logout();
            let outcome = self.auth.login().await;
            if !outcome.success {
                return Err(SyncError::Authentication(outcome.message));
            }
        }
    }

    async fn send_once(&self, path: &str, url: &str) -> SyncResult<RawReply> {
        if !self.limiter.is_allowed(&self.limit_key, RATE_LIMIT_CONTEXT) {
            return Err(SyncError::RateLimited {
                identifier: self.limit_key.clone(),
                context: RATE_LIMIT_CONTEXT.to_string(),
            });
        }

        let started = Instant::now();
        tracing::debug!(path, "API request started");

        let response = self
            .http
            .get(url)
            .headers(self.auth.auth_headers())
            .timeout(API_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(path, "API request failed: {}", e);
                SyncError::Connection(e.to_string())
            })?;

        self.auth.absorb_response_cookies(response.headers());

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(|e| {
            tracing::error!(path, "Failed to read response body: {}", e);
            SyncError::Connection(e.to_string())
        })?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if status.is_success() {
            tracing::debug!(path, status = status.as_u16(), elapsed_ms, "API request succeeded");
        } else {
            tracing::warn!(path, status = status.as_u16(), elapsed_ms, "API request returned an error status");
        }

        Ok(RawReply {
            status,
            content_type,
            body,
        })
    }
}

fn interpret_reply(path: &str, reply: RawReply) -> SyncResult<serde_json::Value> {
    if reply.body.trim().is_empty() {
        return Err(SyncError::InvalidResponse(format!(
            "Empty response body from {} (status {})",
            path,
            reply.status.as_u16()
        )));
    }

    if looks_like_html(reply.content_type.as_deref(), &reply.body) {
        tracing::warn!(path, status = reply.status.as_u16(), "Received HTML where JSON was expected");
        return Err(SyncError::InvalidResponse(format!(
            "Received HTML instead of JSON from {}",
            path
        )));
    }

    if !reply.status.is_success() {
        let message = server_message(&reply.body).unwrap_or_else(|| {
            reply
                .status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        });
        return Err(SyncError::remote(reply.status.as_u16(), message));
    }

    serde_json::from_str(&reply.body).map_err(|e| {
        SyncError::InvalidResponse(format!("Malformed JSON from {}: {}", path, e))
    })
}

fn looks_like_html(content_type: Option<&str>, body: &str) -> bool {
    if content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html")) {
        return true;
    }
    let head: String = body.trim_start().chars().take(9).collect();
    let head = head.to_ascii_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html")
}

fn parse_data_list<T: DeserializeOwned>(
    path: &str,
    body: serde_json::Value,
) -> SyncResult<Vec<(T, serde_json::Value)>> {
    let serde_json::Value::Object(mut envelope) = body else {
        return Err(SyncError::InvalidResponse(format!(
            "Expected an object from {}",
            path
        )));
    };

    let items = match envelope.remove("data") {
        Some(serde_json::Value::Array(items)) => items,
        _ => {
            return Err(SyncError::InvalidResponse(format!(
                "Missing data array in response from {}",
                path
            )))
        }
    };

    items
        .into_iter()
        .map(|raw| {
            let typed = serde_json::from_value::<T>(raw.clone()).map_err(|e| {
                SyncError::InvalidResponse(format!("Unexpected item shape from {}: {}", path, e))
            })?;
            Ok((typed, raw))
        })
        .collect()
}

#[async_trait]
impl RemoteSource for ApiClient {
    async fn calendars(&self) -> SyncResult<Vec<RemoteCalendar>> {
        let items = self
            .get_list::<RemoteCalendar>("/calendars", &QueryParams::new())
            .await?;
        Ok(items.into_iter().map(|(calendar, _)| calendar).collect())
    }

    async fn appointments(
        &self,
        calendar_id: i64,
        window: &SyncWindow,
    ) -> SyncResult<Vec<RemoteAppointmentItem>> {
        let query = QueryParams::new()
            .push_array("calendar_ids", [calendar_id])
            .push("from", window.from_param())
            .push("to", window.to_param());

        let items = self
            .get_list::<RemoteAppointmentItem>("/calendars/appointments", &query)
            .await?;

        Ok(items
            .into_iter()
            .map(|(mut item, raw)| {
                item.raw = raw;
                item
            })
            .collect())
    }

    async fn events(&self, window: &SyncWindow) -> SyncResult<Vec<RemoteEvent>> {
        let query = QueryParams::new()
            .push("from", window.from_param())
            .push("to", window.to_param())
            .push_array("include", ["eventServices"]);

        let items = self.get_list::<RemoteEvent>("/events", &query).await?;

        Ok(items
            .into_iter()
            .map(|(mut event, raw)| {
                event.raw = raw;
                event
            })
            .collect())
    }

    async fn services(&self) -> SyncResult<Vec<RemoteService>> {
        let items = self
            .get_list::<RemoteService>("/services", &QueryParams::new())
            .await?;
        Ok(items.into_iter().map(|(service, _)| service).collect())
    }

    async fn service_groups(&self) -> SyncResult<Vec<RemoteServiceGroup>> {
        let items = self
            .get_list::<RemoteServiceGroup>("/servicegroups", &QueryParams::new())
            .await?;
        Ok(items.into_iter().map(|(group, _)| group).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, RateLimitConfig};
    use mockito::Matcher;

    fn token_client(base_url: &str, token: &str) -> ApiClient {
        let config = SyncConfig::new(
            base_url,
            AuthConfig {
                method: AuthMethod::Token,
                token: token.to_string(),
                ..Default::default()
            },
        );
        ApiClient::from_config(&config, Arc::new(RateLimiter::disabled())).unwrap()
    }

    fn password_client(base_url: &str) -> ApiClient {
        let config = SyncConfig::new(
            base_url,
            AuthConfig {
                method: AuthMethod::Password,
                username: "admin".to_string(),
                password: "pw".to_string(),
                token: String::new(),
            },
        );
        ApiClient::from_config(&config, Arc::new(RateLimiter::disabled())).unwrap()
    }

    async fn mock_login(server: &mut mockito::Server, expected_calls: usize) -> mockito::Mock {
        server
            .mock("POST", "/api/login")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("set-cookie", "sid=fresh; Max-Age=3600; Path=/")
            .with_body(r#"{"data":{"status":"success"}}"#)
            .expect(expected_calls)
            .create_async()
            .await
    }

    #[test]
    fn test_url_building() {
        let client = token_client("https://demo.church.tools/", "t");
        let query = QueryParams::new().push_array("calendar_ids", [1, 2]);
        assert_eq!(
            client.url("/calendars/appointments", &query),
            "https://demo.church.tools/api/calendars/appointments?calendar_ids[]=1&calendar_ids[]=2"
        );
        assert_eq!(
            client.url("/calendars", &QueryParams::new()),
            "https://demo.church.tools/api/calendars"
        );
    }

    #[tokio::test]
    async fn test_bearer_token_is_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/calendars")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r##"{"data":[{"id":1,"name":"Main","color":"#ff0000"}]}"##)
            .create_async()
            .await;

        let client = token_client(&server.url(), "secret");
        let calendars = client.calendars().await.unwrap();
        assert_eq!(calendars.len(), 1);
        assert_eq!(calendars[0].name, "Main");
        assert_eq!(calendars[0].color.as_deref(), Some("#ff0000"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_appointments_send_array_query_and_keep_raw() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/calendars/appointments")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("calendar_ids[]".into(), "4".into()),
                Matcher::UrlEncoded("from".into(), "2024-03-01".into()),
                Matcher::UrlEncoded("to".into(), "2024-03-31".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data":[{"base":{"id":9,"caption":"Choir","calendar":{"id":4},"extra":"kept"},
                "calculated":{"startDate":"2024-03-05T18:00:00Z","endDate":"2024-03-05T19:00:00Z"}}]}"#,
            )
            .create_async()
            .await;

        let client = token_client(&server.url(), "t");
        let window = SyncWindow {
            from: chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            to: chrono::NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        };
        let items = client.appointments(4, &window).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].base.caption, "Choir");
        assert_eq!(items[0].raw["base"]["extra"], "kept");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_token_mode_never_retries_on_401() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/calendars")
            .with_status(401)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":"Invalid token"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = token_client(&server.url(), "wrong");
        let result = client.calendars().await;
        assert!(matches!(result, Err(SyncError::Authentication(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_password_mode_relogs_in_exactly_once() {
        let mut server = mockito::Server::new_async().await;
        // One login before the first call, one after the first 401
        let login = mock_login(&mut server, 2).await;
        let calendars = server
            .mock("GET", "/api/calendars")
            .with_status(401)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":"Session expired"}"#)
            .expect(2)
            .create_async()
            .await;

        let client = password_client(&server.url());
        let result = client.calendars().await;
        assert!(matches!(result, Err(SyncError::Authentication(_))));

        login.assert_async().await;
        calendars.assert_async().await;
    }

    #[tokio::test]
    async fn test_password_mode_retry_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let _login = mock_login(&mut server, 2).await;
        // The retried request carries the fresh cookie; the first does not match it
        let _rejected = server
            .mock("GET", "/api/whoami")
            .match_header("cookie", "sid=stale")
            .with_status(401)
            .create_async()
            .await;
        let accepted = server
            .mock("GET", "/api/whoami")
            .match_header("cookie", "sid=fresh")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":{"id":1}}"#)
            .create_async()
            .await;

        let client = password_client(&server.url());
        client.auth().login().await;
        // Simulate the server rotating the session out from under us
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::SET_COOKIE,
            "sid=stale; Max-Age=3600".parse().unwrap(),
        );
        client.auth().absorb_response_cookies(&headers);

        let body = client.check_connection().await.unwrap();
        assert_eq!(body["data"]["id"], 1);
        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn test_whoami_reads_the_data_envelope() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/whoami")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":{"id":3,"firstName":"Ada","lastName":"Lovelace"}}"#)
            .create_async()
            .await;

        let client = token_client(&server.url(), "t");
        let user = client.whoami().await.unwrap();
        assert_eq!(user.id, Some(3));
        assert_eq!(user.display_name().as_deref(), Some("Ada Lovelace"));
    }

    #[tokio::test]
    async fn test_whoami_without_data_is_invalid_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/whoami")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"firstName":"Ada"}"#)
            .create_async()
            .await;

        let client = token_client(&server.url(), "t");
        assert!(matches!(
            client.whoami().await,
            Err(SyncError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_html_body_is_invalid_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/calendars")
            .with_status(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body("<!DOCTYPE html><html><body>Login</body></html>")
            .create_async()
            .await;

        let client = token_client(&server.url(), "t");
        assert!(matches!(
            client.calendars().await,
            Err(SyncError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_and_malformed_bodies_are_invalid_responses() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/services")
            .with_status(200)
            .with_body("")
            .create_async()
            .await;
        server
            .mock("GET", "/api/servicegroups")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data": [ "#)
            .create_async()
            .await;

        let client = token_client(&server.url(), "t");
        assert!(matches!(
            client.services().await,
            Err(SyncError::InvalidResponse(_))
        ));
        match client.service_groups().await {
            Err(SyncError::InvalidResponse(message)) => assert!(message.contains("Malformed")),
            other => panic!("expected invalid response, got {:?}", other.map(|v| v.len())),
        }
    }

    #[tokio::test]
    async fn test_non_2xx_carries_status_and_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/calendars")
            .with_status(503)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":"Down for maintenance"}"#)
            .create_async()
            .await;

        let client = token_client(&server.url(), "t");
        match client.calendars().await {
            Err(SyncError::RemoteApi { status, message }) => {
                assert_eq!(status, 503);
                assert_eq!(message, "Down for maintenance");
            }
            other => panic!("expected remote error, got {:?}", other.map(|v| v.len())),
        }
    }

    #[tokio::test]
    async fn test_rate_limiter_guards_every_call() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/whoami")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":{}}"#)
            .expect(2)
            .create_async()
            .await;

        let config = SyncConfig::new(
            server.url(),
            AuthConfig {
                method: AuthMethod::Token,
                token: "t".to_string(),
                ..Default::default()
            },
        );
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig {
            short_limit: 2,
            ..Default::default()
        }));
        let client = ApiClient::from_config(&config, limiter).unwrap();

        assert!(client.check_connection().await.is_ok());
        assert!(client.check_connection().await.is_ok());
        assert!(matches!(
            client.check_connection().await,
            Err(SyncError::RateLimited { .. })
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_installations_sharing_a_limiter_count_apart() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/whoami")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":{}}"#)
            .expect(2)
            .create_async()
            .await;

        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig {
            short_limit: 1,
            ..Default::default()
        }));
        let client_for = |installation: &str| {
            let mut config = SyncConfig::new(
                server.url(),
                AuthConfig {
                    method: AuthMethod::Token,
                    token: "t".to_string(),
                    ..Default::default()
                },
            );
            config.installation_id = installation.to_string();
            ApiClient::from_config(&config, limiter.clone()).unwrap()
        };
        let north = client_for("north");
        let south = client_for("south");
        assert_eq!(north.limit_key(), "north:token");

        assert!(north.check_connection().await.is_ok());
        assert!(south.check_connection().await.is_ok());
        match north.check_connection().await {
            Err(SyncError::RateLimited { identifier, context }) => {
                assert_eq!(identifier, "north:token");
                assert_eq!(context, "api");
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
        assert_eq!(limiter.get_status("south:token", "api").short.count, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_login_is_authentication_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/login")
            .with_status(401)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":"Invalid credentials"}"#)
            .create_async()
            .await;

        let client = password_client(&server.url());
        match client.calendars().await {
            Err(SyncError::Authentication(message)) => {
                assert!(message.contains("Invalid credentials"))
            }
            other => panic!("expected auth error, got {:?}", other.map(|v| v.len())),
        }
    }

    #[tokio::test]
    async fn test_html_error_page_is_invalid_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/events")
            .match_query(Matcher::Any)
            .with_status(502)
            .with_header("content-type", "text/html")
            .with_body("<html><body>Bad Gateway</body></html>")
            .create_async()
            .await;

        let client = token_client(&server.url(), "t");
        let window = SyncWindow::around(chrono::NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(), 7, 7);
        assert!(matches!(
            client.events(&window).await,
            Err(SyncError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_looks_like_html() {
        assert!(looks_like_html(Some("text/html"), "{}"));
        assert!(looks_like_html(None, "  <html><head>"));
        assert!(looks_like_html(None, "<!DOCTYPE html>"));
        assert!(!looks_like_html(Some("application/json"), r#"{"data":[]}"#));
    }
}
