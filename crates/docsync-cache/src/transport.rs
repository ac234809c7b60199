//! Outbound HTTP seam
//!
//! [`Transport`] is the only place the cache talks to the network. The
//! production implementation is [`ReqwestTransport`]; tests swap in an
//! in-memory service behind the same trait.

use crate::error::FetchError;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

/// HTTP method subset used by the document service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PATCH
    Patch,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl Method {
    /// Upper-case method name
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Patch => "PATCH",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Outbound request; `url` is relative to the service base (e.g. `/api/files/1`)
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method
    pub method: Method,
    /// Path and query string
    pub url: String,
    /// JSON body
    pub body: Option<Value>,
}

impl HttpRequest {
    /// Create request without body
    #[inline]
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
        }
    }

    /// With JSON body
    #[inline]
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Raw response as received from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Reason phrase
    pub status_text: String,
    /// Body text
    pub body: String,
}

impl HttpResponse {
    /// 200 response with a JSON body
    #[must_use]
    pub fn json(body: &Value) -> Self {
        Self::with_status(200, body)
    }

    /// Response with explicit status and JSON body
    #[must_use]
    pub fn with_status(status: u16, body: &Value) -> Self {
        Self {
            status,
            status_text: reason_phrase(status).to_string(),
            body: body.to_string(),
        }
    }

    /// Check for a 2xx status
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends requests to the remote service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one request
    ///
    /// Only transport failures are errors here; non-2xx statuses come back as
    /// a normal [`HttpResponse`].
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, FetchError>;
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    /// Create transport for a service base URL
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Create transport reusing an existing client
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    /// Base URL requests are resolved against
    #[inline]
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        let url = format!("{}{}", self.base_url, request.url);
        tracing::trace!("{} {}", request.method, url);

        let mut builder = self.client.request(request.method.into(), &url);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        let status_text = status.canonical_reason().unwrap_or_default().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text,
            body,
        })
    }
}

fn reason_phrase(status: u16) -> &'static str {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_helpers() {
        let ok = HttpResponse::json(&json!({"data": 1}));
        assert!(ok.is_success());
        assert_eq!(ok.status_text, "OK");

        let missing = HttpResponse::with_status(404, &json!({}));
        assert!(!missing.is_success());
        assert_eq!(missing.status_text, "Not Found");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let transport = ReqwestTransport::new("http://localhost:3000/");
        assert_eq!(transport.base_url(), "http://localhost:3000");
    }

    #[test]
    fn method_names() {
        assert_eq!(Method::Patch.to_string(), "PATCH");
        assert_eq!(reqwest::Method::from(Method::Post), reqwest::Method::POST);
    }
}
