//! # TapNTrip Net
//!
//! HTTP networking for the TapNTrip offline controller.
//!
//! ## Design Goals
//!
//! 1. **Async HTTP**: Non-blocking network requests
//! 2. **Injectable network**: the controller only sees the [`Network`] trait
//! 3. **Snapshot responses**: bodies are fully buffered so a response can be
//!    returned to the caller and written to the cache
//! 4. **Session tokens**: bearer tokens with expiry for authenticated fetches

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

pub mod token;

pub use token::{SessionToken, TokenSource, TokenStore};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable: {0}")]
    Offline(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Request mode, as seen by the fetch interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Full document navigation.
    Navigate,
    /// Same-origin sub-resource.
    SameOrigin,
    /// Opaque cross-origin sub-resource.
    NoCors,
    /// CORS sub-resource.
    #[default]
    Cors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
    pub mode: RequestMode,
}

impl Request {
    /// Create a request with an arbitrary method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            timeout: Some(Duration::from_secs(30)),
            mode: RequestMode::default(),
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        let mut request = Self::new(Method::POST, url);
        request.body = Some(body);
        request
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        let mut request = Self::get(url);
        request.mode = RequestMode::Navigate;
        request
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether this request loads a full document.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// HTTP response with a fully buffered body.
///
/// Cloning is cheap: the body is reference counted.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// Create a response.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Create a response with explicit headers.
    pub fn with_headers(
        url: Url,
        status: StatusCode,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            url,
            status,
            headers,
            body: body.into(),
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Canonical status text, empty for unknown codes.
    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("")
    }

    /// Get the body as bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Parsed `Content-Type` header.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }
}

/// Anything that can perform a request on behalf of the controller.
#[async_trait]
pub trait Network: Send + Sync {
    /// Perform the request.
    ///
    /// Any HTTP status counts as success; only transport failures are errors.
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("TapNTrip-SW/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            cookies_enabled: true,
        }
    }
}

/// Resource loader backed by `reqwest`.
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled)
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "ResourceLoader initialized");

        Ok(Self { client, config })
    }

    /// The loader's configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    fn classify(&self, error: reqwest::Error, timeout: Option<Duration>) -> NetError {
        if error.is_timeout() {
            NetError::Timeout(timeout.unwrap_or(self.config.default_timeout))
        } else if error.is_connect() {
            NetError::Offline(error.to_string())
        } else {
            NetError::HttpError(error)
        }
    }
}

#[async_trait]
impl Network for ResourceLoader {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut headers = request.headers.clone();
        if !headers.contains_key(header::ACCEPT_LANGUAGE) {
            if let Ok(value) = HeaderValue::from_str(&self.config.accept_language) {
                headers.insert(header::ACCEPT_LANGUAGE, value);
            }
        }

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(headers);

        if let Some(body) = request.body.clone() {
            req_builder = req_builder.body(body);
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| self.classify(e, request.timeout))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();

        let body = response
            .bytes()
            .await
            .map_err(|e| self.classify(e, request.timeout))?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response::with_headers(url, status, headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://tapntrip.example").unwrap();
        let request = Request::get(url.clone())
            .header(
                HeaderName::from_static("accept"),
                HeaderValue::from_static("application/json"),
            )
            .timeout(Duration::from_secs(10));

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.headers.contains_key("accept"));
        assert_eq!(request.timeout, Some(Duration::from_secs(10)));
        assert!(!request.is_navigation());
    }

    #[test]
    fn test_navigate_request() {
        let url = Url::parse("https://tapntrip.example/hotels").unwrap();
        let request = Request::navigate(url);
        assert!(request.is_navigation());
        assert_eq!(request.method, Method::GET);
    }

    #[test]
    fn test_response_clone_shares_body() {
        let url = Url::parse("https://tapntrip.example/app.js").unwrap();
        let response = Response::new(url, StatusCode::OK, "console.log(1)").header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/javascript"),
        );
        let copy = response.clone();

        assert_eq!(copy.bytes(), response.bytes());
        assert_eq!(copy.text().unwrap(), "console.log(1)");
        assert_eq!(
            copy.content_type().unwrap().essence_str(),
            "application/javascript"
        );
        assert_eq!(copy.status_text(), "OK");
    }

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("TapNTrip-SW/"));
        assert!(config.cookies_enabled);
    }

    #[tokio::test]
    async fn test_loader_fetches_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/manifest.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_string(r#"{"name":"TapNTrip"}"#),
            )
            .mount(&server)
            .await;

        let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/manifest.json", server.uri())).unwrap();
        let response = loader.fetch(Request::get(url)).await.unwrap();

        assert!(response.ok());
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["name"], "TapNTrip");
    }

    #[tokio::test]
    async fn test_loader_forwards_request_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/bookings"))
            .and(header_eq("authorization", "Bearer abc"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/api/bookings", server.uri())).unwrap();
        let request = Request::post(url, Bytes::from_static(b"{}")).header(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc"),
        );

        let response = loader.fetch(request).await.unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
    }

    fn accept_language(received: &wiremock::Request) -> Vec<String> {
        received
            .headers
            .get_all(header::ACCEPT_LANGUAGE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_loader_keeps_caller_accept_language() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/hotels"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/api/hotels", server.uri())).unwrap();
        let german = Request::get(url.clone())
            .header(header::ACCEPT_LANGUAGE, HeaderValue::from_static("de"));
        loader.fetch(german).await.unwrap();
        loader.fetch(Request::get(url)).await.unwrap();

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(accept_language(&received[0]), vec!["de"]);
        assert_eq!(accept_language(&received[1]), vec!["en-US,en;q=0.9"]);
    }

    #[tokio::test]
    async fn test_loader_reports_http_errors_as_responses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/missing.png", server.uri())).unwrap();
        let response = loader.fetch(Request::get(url)).await.unwrap();

        assert!(!response.ok());
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_loader_unreachable_host_is_error() {
        let loader = ResourceLoader::new(LoaderConfig::default()).unwrap();
        // Port 9 (discard) on localhost is not expected to accept connections
        let url = Url::parse("http://127.0.0.1:9/").unwrap();
        let result = loader
            .fetch(Request::get(url).timeout(Duration::from_secs(2)))
            .await;

        assert!(result.is_err());
    }
}
