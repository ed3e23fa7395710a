//! Retrying request executor.
//!
//! Every remote call funnels through [`RequestExecutor::send`], which owns
//! authentication headers, status-based retries with exponential backoff, one
//! credential refresh after a 401, and translation of transport failures into
//! typed errors.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

use drivestash_common::{DriveConfig, Error, Result};

use crate::auth::CredentialStore;
use crate::classify::classify_failure;
use crate::retry::RetryState;
use crate::runtime::{Clock, ResolverSwitch};
use crate::transport::{FailureKind, HttpRequest, HttpResponse, HttpTransport, NetworkFailure};

/// Header identifying this installation on every call.
pub const CLIENT_IDENTIFIER_HEADER: &str = "client-identifier";

const RATE_LIMIT_EXCEEDED: u16 = 403;
const TOO_MANY_REQUESTS: u16 = 429;

/// One logical API call, before URL resolution and authentication.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    target: String,
    absolute: bool,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    bearer: bool,
    credential_retry: bool,
}

impl ApiRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            absolute: false,
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            bearer: true,
            credential_retry: true,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    pub fn put(target: impl Into<String>) -> Self {
        Self::new(Method::PUT, target)
    }

    pub fn patch(target: impl Into<String>) -> Self {
        Self::new(Method::PATCH, target)
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(Method::DELETE, target)
    }

    /// The target is a complete URL (e.g. an upload session) and must not be
    /// prefixed with the configured base.
    pub fn absolute(mut self) -> Self {
        self.absolute = true;
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.headers.push((name.into(), value.to_string()));
        self
    }

    /// Send a JSON body.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        self.body = Some(Bytes::from(serde_json::to_vec(body)?));
        Ok(self.header(CONTENT_TYPE.as_str(), "application/json"))
    }

    /// Send a form-encoded body.
    pub fn form<'a>(mut self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        self.body = Some(Bytes::from(encoded));
        self.header(CONTENT_TYPE.as_str(), "application/x-www-form-urlencoded")
    }

    /// Send raw bytes. Every retry resends the buffer from its first byte.
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Authenticate with the client identifier only. Used by the credential
    /// refresh call itself.
    pub fn without_bearer(mut self) -> Self {
        self.bearer = false;
        self
    }

    /// Do not refresh credentials and retry after a 401.
    pub fn no_credential_retry(mut self) -> Self {
        self.credential_retry = false;
        self
    }
}

/// Issues API calls with bounded retry.
pub struct RequestExecutor {
    config: DriveConfig,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn ResolverSwitch>,
    credentials: CredentialStore,
}

impl RequestExecutor {
    pub fn new(
        config: DriveConfig,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        resolver: Arc<dyn ResolverSwitch>,
    ) -> Self {
        let credentials = CredentialStore::load(&config, clock.now());
        Self {
            config,
            transport,
            clock,
            resolver,
            credentials,
        }
    }

    pub fn config(&self) -> &DriveConfig {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn transport(&self) -> &dyn HttpTransport {
        self.transport.as_ref()
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Headers every call carries besides the bearer token.
    pub fn client_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CLIENT_IDENTIFIER_HEADER,
            header_value(&self.config.client_identifier)?,
        );
        Ok(headers)
    }

    /// Send a request and decode a JSON response.
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let response = self.send(request).await?;
        let body = response.bytes().await.map_err(|e| self.translate(e))?;
        serde_json::from_slice(&body).map_err(|e| {
            Error::Serialization(format!("Failed to parse API response: {}", e))
        })
    }

    /// Send a request, retrying retryable statuses.
    ///
    /// Returns the live response for any status below 400; the caller owns
    /// its body.
    pub async fn send(&self, request: ApiRequest) -> Result<HttpResponse> {
        let url = self.resolve_url(&request)?;
        let mut extra = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::InvalidInput(format!("Invalid header name {}: {}", name, e)))?;
            extra.insert(name, header_value(value)?);
        }

        let mut state = RetryState::new(&self.config.backoff);
        loop {
            let mut headers = self.client_headers()?;
            if request.bearer {
                let token = self
                    .credentials
                    .access_token(self, state.take_refresh())
                    .await?;
                headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", token))?);
            }
            headers.extend(extra.clone());

            let attempt = state.begin_attempt();
            debug!(method = %request.method, attempt, "Making drive request: {}", url);

            let response = self
                .transport
                .send(HttpRequest {
                    method: request.method.clone(),
                    url: url.clone(),
                    headers,
                    body: request.body.clone(),
                })
                .await
                .map_err(|e| self.translate(e))?;

            let status = response.status;
            if status < 400 {
                return Ok(response);
            }

            // An unreadable failure body carries no extra information.
            let body = response.bytes().await.unwrap_or_default();
            if let Some(err) = classify_failure(&body) {
                return Err(err);
            }

            if state.exhausted() {
                error!(status, attempts = attempt, "Drive request failed, giving up: {}", url);
                return Err(match status {
                    500 | 503 => Error::InternalServer,
                    _ => http_error(status, &body),
                });
            }

            if status == 401 && request.credential_retry && state.can_refresh() {
                debug!("Drive credentials expired, retrying with refreshed ones");
                state.request_refresh();
            } else if status == RATE_LIMIT_EXCEEDED
                || status == TOO_MANY_REQUESTS
                || (500..600).contains(&status)
            {
                // Retried below.
            } else {
                return Err(http_error(status, &body));
            }

            let delay = state.next_delay();
            warn!(
                status,
                "Drive returned HTTP {}, retrying in {} seconds",
                status,
                delay.as_secs()
            );
            self.clock.sleep(delay).await;
        }
    }

    /// Map a transport failure to a typed error, switching name resolution
    /// when the failure happened while connecting.
    pub fn translate(&self, failure: NetworkFailure) -> Error {
        match failure.kind {
            FailureKind::Timeout => Error::Timeout,
            FailureKind::Connect => {
                debug!(
                    "Trouble reaching the drive servers ({}), using alternate name resolution next",
                    failure.message
                );
                self.resolver.toggle();
                if failure.is_dns_failure() {
                    Error::DnsFailure
                } else if failure.is_connection_refused() {
                    Error::CannotConnect
                } else {
                    Error::Network(failure.message)
                }
            }
            FailureKind::Resolve => {
                debug!("Name resolution failed: {}", failure.message);
                self.resolver.toggle();
                Error::DnsFailure
            }
            FailureKind::Other => Error::Network(failure.message),
        }
    }

    fn resolve_url(&self, request: &ApiRequest) -> Result<String> {
        let base = if request.absolute {
            request.target.clone()
        } else {
            format!("{}{}", self.config.drive_url, request.target)
        };

        if request.query.is_empty() {
            return Ok(base);
        }

        let mut url = url::Url::parse(&base)
            .map_err(|e| Error::InvalidInput(format!("Invalid request URL {}: {}", base, e)))?;
        url.query_pairs_mut().extend_pairs(&request.query);
        Ok(url.into())
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::InvalidInput(format!("Invalid header value: {}", e)))
}

pub(crate) fn http_error(status: u16, body: &[u8]) -> Error {
    let message = String::from_utf8_lossy(body).trim().to_string();
    let message = if message.is_empty() {
        reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown status")
            .to_string()
    } else {
        message
    };
    Error::Http { status, message }
}
