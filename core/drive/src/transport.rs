//! HTTP transport seam and its reqwest implementation.
//!
//! Everything above this module speaks in terms of [`HttpRequest`],
//! [`HttpResponse`] and [`NetworkFailure`], so the retry and upload logic can
//! run against a scripted transport in tests.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, TryStreamExt};
use reqwest::header::HeaderMap;
use reqwest::{redirect, Client, Method};
use std::error::Error as StdError;
use std::fmt;
use std::pin::Pin;

use drivestash_common::{DriveConfig, Error, Result};

/// Lazily read response body.
pub type BodyStream =
    Pin<Box<dyn Stream<Item = std::result::Result<Bytes, NetworkFailure>> + Send>>;

/// A fully resolved request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    /// Owned body bytes; cloning the request resends from the first byte.
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// A live response whose body has not been read yet.
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    body: BodyStream,
}

impl HttpResponse {
    pub fn new(status: u16, headers: HeaderMap, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Build a response around an already buffered body.
    pub fn from_bytes(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let chunk: std::result::Result<Bytes, NetworkFailure> = Ok(body.into());
        Self::new(status, headers, Box::pin(futures::stream::iter(vec![chunk])))
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Read the whole body.
    pub async fn bytes(self) -> std::result::Result<Bytes, NetworkFailure> {
        let buf = self
            .body
            .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await?;
        Ok(buf.freeze())
    }

    /// Hand the body over as a stream.
    pub fn into_stream(self) -> BodyStream {
        self.body
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Class of a transport-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Establishing the connection failed (includes lookups done while connecting).
    Connect,
    /// A resolver reported a failure of its own.
    Resolve,
    /// Connect or read timeout.
    Timeout,
    /// Anything else.
    Other,
}

/// A request that never produced an HTTP status.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?} failure: {message}")]
pub struct NetworkFailure {
    pub kind: FailureKind,
    /// OS error number of the underlying socket error, when one exists.
    pub os_error: Option<i32>,
    pub message: String,
}

/// `getaddrinfo` EAI_NONAME as surfaced by the socket layer.
const EAI_NONAME: i32 = -2;

/// Address not available, connection refused, WSAECONNREFUSED.
const CONNECTION_REFUSED: [i32; 3] = [99, 111, 10061];

/// Message fragments different platforms use for lookup failures.
const DNS_FAILURE_PATTERNS: [&str; 4] = [
    "domain name not found",
    "could not contact dns server",
    "failed to lookup address",
    "dns error",
];

impl NetworkFailure {
    pub fn new(kind: FailureKind, os_error: Option<i32>, message: impl Into<String>) -> Self {
        Self {
            kind,
            os_error,
            message: message.into(),
        }
    }

    pub fn connect(os_error: Option<i32>, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Connect, os_error, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, None, message)
    }

    pub fn resolve(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Resolve, None, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Other, None, message)
    }

    /// Whether a connect failure was really a name lookup failure.
    ///
    /// Platform dependent: this is the one place the error-code and message
    /// matching lives.
    pub fn is_dns_failure(&self) -> bool {
        if self.kind == FailureKind::Resolve || self.os_error == Some(EAI_NONAME) {
            return true;
        }
        let message = self.message.to_lowercase();
        DNS_FAILURE_PATTERNS.iter().any(|p| message.contains(p))
    }

    /// Whether the peer refused the connection.
    pub fn is_connection_refused(&self) -> bool {
        self.os_error
            .map(|code| CONNECTION_REFUSED.contains(&code))
            .unwrap_or(false)
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        let message = error_chain(&err);
        let io = io_source(&err);
        let os_error = io.and_then(|e| e.raw_os_error());
        let timed_out = io
            .map(|e| e.kind() == std::io::ErrorKind::TimedOut)
            .unwrap_or(false);

        if err.is_timeout() || timed_out {
            Self::timeout(message)
        } else if err.is_connect() {
            Self::connect(os_error, message)
        } else {
            Self::new(FailureKind::Other, os_error, message)
        }
    }
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(source) = current {
        message.push_str(": ");
        message.push_str(&source.to_string());
        current = source.source();
    }
    message
}

fn io_source<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a std::io::Error> {
    let mut current = err.source();
    while let Some(source) = current {
        if let Some(io) = source.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        current = source.source();
    }
    None
}

/// Sends one HTTP request.
///
/// Implementations must not retry and must not follow redirects.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, NetworkFailure>;
}

/// Transport backed by a shared reqwest client.
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    /// Build a client with the configured connect and read timeouts.
    pub fn new(config: &DriveConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("drivestash/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.timeout())
            .read_timeout(config.timeout())
            // 308 is the resumable-upload continue signal.
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, NetworkFailure> {
        let mut builder = self
            .http
            .request(request.method, &request.url)
            .headers(request.headers);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(NetworkFailure::from_reqwest)?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes_stream().map_err(NetworkFailure::from_reqwest);

        Ok(HttpResponse::new(status, headers, Box::pin(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("request failed")]
    struct Wrapped(#[source] std::io::Error);

    #[test]
    fn test_io_source_found_in_chain() {
        let err = Wrapped(std::io::Error::from_raw_os_error(111));
        let io = io_source(&err).expect("io error in chain");
        assert_eq!(io.raw_os_error(), Some(111));
        assert_eq!(error_chain(&err), format!("request failed: {}", io));

        let plain = std::io::Error::other("no source");
        assert!(io_source(&plain).is_none());
    }

    #[test]
    fn test_dns_failure_by_code() {
        let failure = NetworkFailure::connect(Some(-2), "Name or service not known");
        assert!(failure.is_dns_failure());
        assert!(!failure.is_connection_refused());
    }

    #[test]
    fn test_dns_failure_by_message() {
        assert!(NetworkFailure::connect(None, "Domain name not found").is_dns_failure());
        assert!(NetworkFailure::connect(None, "Could not contact DNS servers").is_dns_failure());
        assert!(NetworkFailure::connect(
            None,
            "error sending request: client error (Connect): dns error: failed to lookup address information"
        )
        .is_dns_failure());
        assert!(NetworkFailure::resolve("no nameservers").is_dns_failure());
    }

    #[test]
    fn test_connection_refused_codes() {
        for code in [99, 111, 10061] {
            let failure = NetworkFailure::connect(Some(code), "Connection refused");
            assert!(failure.is_connection_refused());
            assert!(!failure.is_dns_failure());
        }
        assert!(!NetworkFailure::connect(Some(104), "reset").is_connection_refused());
    }

    #[tokio::test]
    async fn test_response_bytes_concatenates_chunks() {
        let chunks: Vec<std::result::Result<Bytes, NetworkFailure>> =
            vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"world"))];
        let response = HttpResponse::new(200, HeaderMap::new(), Box::pin(futures::stream::iter(chunks)));

        assert_eq!(response.bytes().await.unwrap(), Bytes::from_static(b"hello world"));
    }

    #[test]
    fn test_response_header_lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("range", "bytes=0-9".parse().unwrap());
        let response = HttpResponse::from_bytes(308, headers, Bytes::new());

        assert_eq!(response.header("Range"), Some("bytes=0-9"));
        assert_eq!(response.header("Location"), None);
    }
}
