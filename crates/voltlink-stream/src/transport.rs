//! HTTP transport seam.
//!
//! The session and REST helper talk to the network only through
//! [`Transport`], so tests can substitute scripted responses. The real
//! implementation, [`HttpTransport`], wraps a [`reqwest::Client`].

use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;

use crate::error::TransportError;

/// Timeout applied to ordinary request/response exchanges.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("voltlink/", env!("CARGO_PKG_VERSION"));

/// An outbound request, independent of the HTTP client in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    /// Full `Authorization` header value, if any.
    pub authorization: Option<String>,
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            authorization: None,
            body: None,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            ..Self::get(url)
        }
    }

    #[must_use]
    pub fn authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }

    #[must_use]
    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// A buffered response to an [`HttpRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A source of text lines from an open stream.
#[async_trait]
pub trait LineSource: Send {
    /// Next line without its terminator, or `None` at end of stream.
    async fn next_line(&mut self) -> io::Result<Option<String>>;
}

#[async_trait]
impl<R> LineSource for tokio::io::Lines<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        tokio::io::Lines::next_line(self).await
    }
}

impl fmt::Debug for dyn LineSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LineSource")
    }
}

/// Issues HTTP requests on behalf of the client.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send a request and buffer the whole response. Non-success statuses
    /// are returned as responses, not errors.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Open a long-lived response and read it line by line. Any status
    /// other than 200 is an error.
    async fn open_lines(
        &self,
        request: HttpRequest,
    ) -> Result<Box<dyn LineSource>, TransportError>;
}

/// [`Transport`] over `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: Client,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Create a transport with the default request timeout.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(request_timeout: Duration) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static("*/*"));
        // Streaming responses can stay open indefinitely, so no overall
        // timeout on the client; `send` applies one per request.
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            http,
            request_timeout,
        })
    }

    fn build(&self, request: HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(request.method, &request.url);
        if let Some(auth) = request.authorization {
            builder = builder.header(AUTHORIZATION, auth);
        }
        if let Some(body) = request.body {
            builder = builder.json(&body);
        }
        builder
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = request.url.clone();
        let response = self
            .build(request)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| classify(e, &url))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| classify(e, &url))?;
        Ok(HttpResponse { status, body })
    }

    async fn open_lines(
        &self,
        request: HttpRequest,
    ) -> Result<Box<dyn LineSource>, TransportError> {
        let url = request.url.clone();
        let response = self
            .build(request)
            .send()
            .await
            .map_err(|e| classify(e, &url))?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(TransportError::Status { status, url });
        }

        let body = response.bytes_stream().map_err(io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(body)).lines()))
    }
}

fn classify(error: reqwest::Error, url: &str) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(url.to_string())
    } else {
        TransportError::Request(error)
    }
}
