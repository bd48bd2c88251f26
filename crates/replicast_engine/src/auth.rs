//! Session authentication.
//!
//! Login happens once per process and yields a [`SessionToken`] built from
//! the cookies the service sets. Access tokens are minted from that session
//! on demand, typically on every transport connect.

use crate::error::{EngineError, EngineResult};
use crate::http::HttpClient;
use async_trait::async_trait;
use replicast_protocol::{AccessToken, SessionToken};
use serde_json::{json, Value};
use std::fmt;
use tracing::{debug, info, warn};

/// Account credentials for the login exchange.
#[derive(Clone)]
pub struct LoginCredentials {
    /// Account user name (an email address on most deployments).
    pub user_name: String,
    /// Account password.
    pub password: String,
    /// Requests a long-lived session.
    pub stay_logged_in: bool,
}

impl LoginCredentials {
    /// Creates credentials with `stay_logged_in` enabled.
    pub fn new(user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            password: password.into(),
            stay_logged_in: true,
        }
    }

    /// Returns the login request body.
    pub fn to_json(&self) -> Value {
        json!({
            "userName": self.user_name,
            "password": self.password,
            "stayLoggedIn": self.stay_logged_in,
        })
    }
}

impl fmt::Debug for LoginCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginCredentials")
            .field("user_name", &self.user_name)
            .field("password", &"<redacted>")
            .field("stay_logged_in", &self.stay_logged_in)
            .finish()
    }
}

/// Performs the login and token refresh exchanges.
#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    /// Logs in and returns the session token.
    ///
    /// Fails with [`EngineError::Auth`] when the exchange does not succeed.
    async fn login(&self, credentials: &LoginCredentials) -> EngineResult<SessionToken>;

    /// Mints a fresh access token from the session.
    ///
    /// Returns `Ok(None)` when the service declines or the body holds no
    /// token; callers retry on their next opportunity. Transport failures
    /// surface as [`EngineError::RefreshFailure`].
    async fn refresh_access_token(
        &self,
        session: &SessionToken,
    ) -> EngineResult<Option<AccessToken>>;
}

/// [`SessionAuthenticator`] speaking JSON over HTTP.
pub struct HttpAuthenticator<C: HttpClient> {
    login_url: String,
    refresh_url: String,
    client: C,
}

impl<C: HttpClient> HttpAuthenticator<C> {
    /// Creates an authenticator for the given endpoints.
    pub fn new(login_url: impl Into<String>, refresh_url: impl Into<String>, client: C) -> Self {
        Self {
            login_url: login_url.into(),
            refresh_url: refresh_url.into(),
            client,
        }
    }

    /// Returns the login URL.
    pub fn login_url(&self) -> &str {
        &self.login_url
    }

    /// Returns the refresh URL.
    pub fn refresh_url(&self) -> &str {
        &self.refresh_url
    }
}

#[async_trait]
impl<C: HttpClient> SessionAuthenticator for HttpAuthenticator<C> {
    async fn login(&self, credentials: &LoginCredentials) -> EngineResult<SessionToken> {
        info!(url = %self.login_url, user = %credentials.user_name, "logging in");

        let response = self
            .client
            .post_json(&self.login_url, &credentials.to_json())
            .await
            .map_err(|e| EngineError::Auth(format!("login request failed: {e}")))?;

        if !response.is_success() {
            return Err(EngineError::Auth(format!(
                "login rejected: HTTP {}",
                response.status
            )));
        }

        // The body shape varies by deployment; only the cookies matter.
        match serde_json::from_str::<Value>(&response.body) {
            Ok(body) => debug!(%body, "login response"),
            Err(_) => debug!(bytes = response.body.len(), "login response is not JSON"),
        }

        let session = SessionToken::from_set_cookie_headers(&response.set_cookies);
        if session.is_empty() {
            warn!("login succeeded but set no cookies; token refresh will likely fail");
        } else {
            info!(cookies = session.cookie_count(), "login successful");
        }
        Ok(session)
    }

    async fn refresh_access_token(
        &self,
        session: &SessionToken,
    ) -> EngineResult<Option<AccessToken>> {
        debug!(url = %self.refresh_url, "requesting access token");

        let response = self
            .client
            .get_with_cookie(&self.refresh_url, session.as_str())
            .await
            .map_err(|e| EngineError::RefreshFailure(e.to_string()))?;

        if !response.is_success() {
            warn!(status = response.status, "access token refresh declined");
            return Ok(None);
        }

        match AccessToken::from_refresh_text(&response.body) {
            Some(token) => {
                info!(length = token.len(), preview = %token.preview(), "access token obtained");
                Ok(Some(token))
            }
            None => {
                warn!(body_len = response.body.len(), "access token not found in refresh response");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Scripted client returning queued responses.
    #[derive(Default)]
    struct TestClient {
        responses: Mutex<VecDeque<EngineResult<HttpResponse>>>,
        requests: Mutex<Vec<(String, String)>>,
    }

    impl TestClient {
        fn respond(&self, response: EngineResult<HttpResponse>) {
            self.responses.lock().push_back(response);
        }

        fn next(&self) -> EngineResult<HttpResponse> {
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(EngineError::Http("no response queued".into())))
        }
    }

    #[async_trait]
    impl HttpClient for TestClient {
        async fn post_json(&self, url: &str, body: &Value) -> EngineResult<HttpResponse> {
            self.requests.lock().push((url.to_string(), body.to_string()));
            self.next()
        }

        async fn get_with_cookie(&self, url: &str, cookie: &str) -> EngineResult<HttpResponse> {
            self.requests.lock().push((url.to_string(), cookie.to_string()));
            self.next()
        }
    }

    fn authenticator() -> HttpAuthenticator<TestClient> {
        HttpAuthenticator::new(
            "https://svc.test/api/login",
            "https://svc.test/api/load-token",
            TestClient::default(),
        )
    }

    #[tokio::test]
    async fn login_captures_all_cookies_in_order() {
        let auth = authenticator();
        auth.client.respond(Ok(HttpResponse::new(200, r#"{"ok":true}"#)
            .with_cookie("sid=s1; Path=/; HttpOnly")
            .with_cookie("remember=r1; Max-Age=86400")));

        let session = auth
            .login(&LoginCredentials::new("ops@example.tv", "pw"))
            .await
            .unwrap();

        assert_eq!(session.as_str(), "sid=s1; remember=r1");

        let requests = auth.client.requests.lock();
        assert_eq!(requests[0].0, "https://svc.test/api/login");
        let body: Value = serde_json::from_str(&requests[0].1).unwrap();
        assert_eq!(
            body,
            json!({"userName": "ops@example.tv", "password": "pw", "stayLoggedIn": true})
        );
    }

    #[tokio::test]
    async fn login_without_cookies_still_succeeds() {
        let auth = authenticator();
        auth.client.respond(Ok(HttpResponse::new(200, "<html>ok</html>")));

        let session = auth
            .login(&LoginCredentials::new("ops@example.tv", "pw"))
            .await
            .unwrap();
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn login_failures_are_auth_errors() {
        let auth = authenticator();
        auth.client.respond(Ok(HttpResponse::new(401, "bad credentials")));
        let err = auth
            .login(&LoginCredentials::new("ops@example.tv", "wrong"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("401"));

        auth.client
            .respond(Err(EngineError::Http("connection refused".into())));
        let err = auth
            .login(&LoginCredentials::new("ops@example.tv", "pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Auth(_)));
    }

    #[tokio::test]
    async fn refresh_sends_session_cookie() {
        let auth = authenticator();
        auth.client.respond(Ok(HttpResponse::new(200, r#"{"token":"t1"}"#)));

        let token = auth
            .refresh_access_token(&SessionToken::new("sid=s1; remember=r1"))
            .await
            .unwrap();

        assert_eq!(token, Some(AccessToken::new("t1")));
        let requests = auth.client.requests.lock();
        assert_eq!(
            requests[0],
            (
                "https://svc.test/api/load-token".to_string(),
                "sid=s1; remember=r1".to_string()
            )
        );
    }

    #[tokio::test]
    async fn refresh_token_shape_variance() {
        let auth = authenticator();
        let session = SessionToken::new("sid=s1");
        for body in [r#"{"token":"t1"}"#, r#"{"auth":"t2"}"#, r#""t3""#] {
            auth.client.respond(Ok(HttpResponse::new(200, body)));
        }

        let mut tokens = Vec::new();
        for _ in 0..3 {
            tokens.push(auth.refresh_access_token(&session).await.unwrap().unwrap());
        }

        assert_eq!(
            tokens,
            vec![
                AccessToken::new("t1"),
                AccessToken::new("t2"),
                AccessToken::new("t3")
            ]
        );
    }

    #[tokio::test]
    async fn refresh_absent_on_decline_or_unknown_shape() {
        let auth = authenticator();
        let session = SessionToken::new("sid=s1");

        auth.client.respond(Ok(HttpResponse::new(403, "")));
        assert_eq!(auth.refresh_access_token(&session).await.unwrap(), None);

        auth.client.respond(Ok(HttpResponse::new(200, r#"{"jwt":"x"}"#)));
        assert_eq!(auth.refresh_access_token(&session).await.unwrap(), None);
    }

    #[tokio::test]
    async fn refresh_transport_error_is_recoverable() {
        let auth = authenticator();
        auth.client.respond(Err(EngineError::Http("timed out".into())));

        let err = auth
            .refresh_access_token(&SessionToken::new("sid=s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RefreshFailure(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = LoginCredentials::new("ops@example.tv", "hunter2");
        let text = format!("{creds:?}");
        assert!(text.contains("ops@example.tv"));
        assert!(!text.contains("hunter2"));
    }
}
