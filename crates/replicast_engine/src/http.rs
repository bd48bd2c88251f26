//! HTTP client abstraction.
//!
//! The authenticator talks to the login and token endpoints through the
//! [`HttpClient`] trait so that tests can script responses without a
//! network. [`ReqwestClient`] is the production implementation.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use reqwest::header::{COOKIE, SET_COOKIE};
use serde_json::Value;
use std::time::Duration;

/// A response as seen by the authenticator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw `Set-Cookie` header values, in receipt order.
    pub set_cookies: Vec<String>,
    /// Response body as text.
    pub body: String,
}

impl HttpResponse {
    /// Creates a response with a status and body and no cookies.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            set_cookies: Vec::new(),
            body: body.into(),
        }
    }

    /// Adds a `Set-Cookie` header value.
    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.set_cookies.push(cookie.into());
        self
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// Errors are transport failures (DNS, TLS, timeouts). Non-2xx statuses are
/// not errors; they come back as a normal [`HttpResponse`].
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a JSON `POST`.
    async fn post_json(&self, url: &str, body: &Value) -> EngineResult<HttpResponse>;

    /// Sends a `GET` carrying a `Cookie` header.
    async fn get_with_cookie(&self, url: &str, cookie: &str) -> EngineResult<HttpResponse>;
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with a per-request timeout.
    pub fn new(timeout: Duration) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Http(format!("failed to build client: {e}")))?;
        Ok(Self { client })
    }

    async fn into_response(response: reqwest::Response) -> EngineResult<HttpResponse> {
        let status = response.status().as_u16();
        let set_cookies = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::Http(format!("failed to read body: {e}")))?;

        Ok(HttpResponse {
            status,
            set_cookies,
            body,
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn post_json(&self, url: &str, body: &Value) -> EngineResult<HttpResponse> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::Http(e.to_string()))?;
        Self::into_response(response).await
    }

    async fn get_with_cookie(&self, url: &str, cookie: &str) -> EngineResult<HttpResponse> {
        let response = self
            .client
            .get(url)
            .header(COOKIE, cookie)
            .send()
            .await
            .map_err(|e| EngineError::Http(e.to_string()))?;
        Self::into_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_range() {
        assert!(HttpResponse::new(200, "").is_success());
        assert!(HttpResponse::new(204, "").is_success());
        assert!(!HttpResponse::new(302, "").is_success());
        assert!(!HttpResponse::new(401, "").is_success());
    }

    #[test]
    fn response_builder() {
        let response = HttpResponse::new(200, "{}")
            .with_cookie("a=1; Path=/")
            .with_cookie("b=2");
        assert_eq!(response.set_cookies, vec!["a=1; Path=/", "b=2"]);
    }

    #[test]
    fn reqwest_client_builds() {
        assert!(ReqwestClient::new(Duration::from_secs(5)).is_ok());
    }
}
