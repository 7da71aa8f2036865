//! Clients for external services.
//!
//! A [`ServiceClient`] is constructed once at startup and handed to the
//! workers that need it. The wire is abstracted behind [`Transport`] so the
//! reqwest implementation can be swapped for an in-process fake in tests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::ServiceError;

/// Width responses are shortened to in error messages.
const ERROR_TEXT_WIDTH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Whether the request changes external state.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Method::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        })
    }
}

/// A request to an external service, relative to its endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    /// Status codes >= 400 the caller handles itself.
    pub allowed_status: Vec<u16>,
    pub headers: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            allowed_status: Vec::new(),
            headers: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).json(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Put, path).json(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Patch, path).json(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn allow(mut self, codes: &[u16]) -> Self {
        self.allowed_status.extend_from_slice(codes);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// What came back over the wire, before interpretation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub text: String,
}

impl RawResponse {
    pub fn new(status: u16, text: impl Into<String>) -> Self {
        Self {
            status,
            text: text.into(),
        }
    }

    pub fn json(status: u16, body: &Value) -> Self {
        Self::new(status, body.to_string())
    }

    pub fn empty(status: u16) -> Self {
        Self::new(status, "")
    }
}

/// Interpreted response. `body` is `None` for an empty response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Option<Value>,
}

impl ApiResponse {
    /// The body, or JSON null when empty.
    pub fn into_value(self) -> Value {
        self.body.unwrap_or(Value::Null)
    }

    pub fn is_success(&self) -> bool {
        self.status < 400
    }
}

/// Moves requests to a service and returns raw responses.
///
/// An `Err` is a transport-level failure (nothing was received).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<RawResponse, String>;
}

/// How the API token is presented to a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenScheme {
    /// `X-Auth-Token: <token>`
    #[default]
    AuthToken,
    /// `Authorization: Bearer <token>`
    Bearer,
}

/// reqwest-backed transport for one service endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    scheme: TokenScheme,
}

impl HttpTransport {
    pub fn new(
        endpoint: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            scheme: TokenScheme::default(),
        })
    }

    pub fn with_token_scheme(mut self, scheme: TokenScheme) -> Self {
        self.scheme = scheme;
        self
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<RawResponse, String> {
        let url = format!("{}{}", self.endpoint, request.path);
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, &url);
        if let Some(token) = &self.token {
            builder = match self.scheme {
                TokenScheme::AuthToken => builder.header("X-Auth-Token", token),
                TokenScheme::Bearer => builder.bearer_auth(token),
            };
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| e.to_string())?;
        Ok(RawResponse { status, text })
    }
}

/// Header carrying a service's API microversion.
#[derive(Debug, Clone)]
pub struct ApiVersion {
    pub header: String,
    pub value: String,
}

impl ApiVersion {
    pub fn new(header: &str, value: &str) -> Self {
        Self {
            header: header.to_string(),
            value: value.to_string(),
        }
    }
}

/// Authenticated request/response client for one external service.
#[derive(Clone)]
pub struct ServiceClient {
    service: String,
    transport: Arc<dyn Transport>,
    api_version: Option<ApiVersion>,
}

impl ServiceClient {
    pub fn new(service: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            service: service.to_string(),
            transport,
            api_version: None,
        }
    }

    pub fn with_api_version(mut self, version: ApiVersion) -> Self {
        self.api_version = Some(version);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Send a request and classify the outcome.
    pub async fn call(
        &self,
        request_id: &str,
        mut request: ApiRequest,
    ) -> Result<ApiResponse, ServiceError> {
        if let Some(version) = &self.api_version {
            request = request.header(&version.header, &version.value);
        }
        if !request_id.is_empty() {
            request = request.header("X-Request-ID", request_id);
        }

        debug!(service = %self.service, method = %request.method, path = %request.path, "calling service");

        let raw = self
            .transport
            .send(&request)
            .await
            .map_err(|message| ServiceError::Unavailable {
                service: self.service.clone(),
                message,
            })?;

        interpret(&self.service, &request, raw)
    }
}

fn interpret(
    service: &str,
    request: &ApiRequest,
    raw: RawResponse,
) -> Result<ApiResponse, ServiceError> {
    if raw.status >= 400 && !request.allowed_status.contains(&raw.status) {
        return Err(ServiceError::Api {
            service: service.to_string(),
            code: raw.status,
            text: shorten(&raw.text, ERROR_TEXT_WIDTH),
        });
    }

    if raw.text.trim().is_empty() {
        return Ok(ApiResponse {
            status: raw.status,
            body: None,
        });
    }

    match serde_json::from_str(&raw.text) {
        Ok(body) => Ok(ApiResponse {
            status: raw.status,
            body: Some(body),
        }),
        Err(_) => Err(ServiceError::MalformedResponse {
            service: service.to_string(),
            text: shorten(&raw.text, ERROR_TEXT_WIDTH),
        }),
    }
}

/// Collapse whitespace and cut `text` to at most `width` characters,
/// marking truncation with a trailing `" [...]"`.
pub fn shorten(text: &str, width: usize) -> String {
    const PLACEHOLDER: &str = " [...]";

    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= width {
        return collapsed;
    }

    let budget = width.saturating_sub(PLACEHOLDER.len());
    let mut cut: String = collapsed.chars().take(budget).collect();
    // Prefer breaking on a word boundary.
    if let Some(idx) = cut.rfind(' ') {
        cut.truncate(idx);
    }
    format!("{}{}", cut.trim_end(), PLACEHOLDER)
}
