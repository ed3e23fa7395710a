//! Credential lifecycle for the drive API.
//!
//! Credentials are loaded once at startup, refreshed in place whenever the
//! bearer token is about to expire, and persisted only when a caller hands
//! over a newly issued record.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, CsrfToken, RedirectUrl, Scope};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use drivestash_common::{DriveConfig, Error, Result};

use crate::executor::{ApiRequest, RequestExecutor};
use crate::transport::{FailureKind, HttpRequest};

/// OAuth2 scope requested by the authorization flow.
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

/// Tokens closer than this to expiry are refreshed before use.
const EXPIRY_MARGIN_SECONDS: i64 = 60;

/// Version reported to the proxy refresh service.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Credentials record as persisted on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialsRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<String>,
}

impl CredentialsRecord {
    /// Parse a record from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// In-memory credentials. All fields are unset when nothing valid is loaded.
#[derive(Default, Zeroize, ZeroizeOnDrop)]
struct Credentials {
    bearer: Option<String>,
    refresh: Option<String>,
    client_id: Option<String>,
    secret: Option<String>,
    #[zeroize(skip)]
    expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("has_refresh", &self.refresh.is_some())
            .field("has_secret", &self.secret.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// What a refresh needs, copied out so no lock is held across the network.
struct RefreshParams {
    client_id: String,
    refresh_token: String,
    secret: Option<String>,
}

/// Loads, persists and refreshes the bearer/refresh token pair.
pub struct CredentialStore {
    path: PathBuf,
    default_client_id: String,
    state: RwLock<Credentials>,
}

impl CredentialStore {
    /// Load the persisted record.
    ///
    /// Never fails: a missing or malformed record leaves the store empty.
    pub fn load(config: &DriveConfig, now: DateTime<Utc>) -> Self {
        let state = read_credentials(&config.credentials_path, &config.default_client_id, now);
        Self {
            path: config.credentials_path.clone(),
            default_client_id: config.default_client_id.clone(),
            state: RwLock::new(state),
        }
    }

    /// Re-read the persisted record.
    pub async fn reload(&self, now: DateTime<Utc>) {
        let loaded = read_credentials(&self.path, &self.default_client_id, now);
        *self.state.write().await = loaded;
    }

    /// Persist newly issued credentials and load them.
    pub async fn save(&self, record: &CredentialsRecord, now: DateTime<Utc>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_vec(record)?).await?;
        info!("Saved new drive credentials to {}", self.path.display());
        self.reload(now).await;
        Ok(())
    }

    /// Whether a refresh token is available.
    pub async fn enabled(&self) -> bool {
        self.state.read().await.refresh.is_some()
    }

    /// Whether the credentials were issued for a client other than the
    /// shipped default.
    pub async fn is_custom(&self) -> bool {
        self.state.read().await.client_id.as_deref() != Some(self.default_client_id.as_str())
    }

    /// Whether refreshes go straight to the provider token endpoint.
    pub async fn has_client_secret(&self) -> bool {
        self.state.read().await.secret.is_some()
    }

    /// Current bearer token, refreshed first if it expires within a minute or
    /// `refresh` is set.
    ///
    /// Boxed because the provider refresh itself goes through the executor.
    pub fn access_token<'a>(
        &'a self,
        executor: &'a RequestExecutor,
        refresh: bool,
    ) -> BoxFuture<'a, Result<String>> {
        async move {
            let now = executor.clock().now();
            let params = {
                let creds = self.state.read().await;
                if !refresh {
                    if let (Some(token), Some(expires_at)) = (&creds.bearer, creds.expires_at) {
                        if now + Duration::seconds(EXPIRY_MARGIN_SECONDS) < expires_at {
                            return Ok(token.clone());
                        }
                    }
                }
                match (&creds.refresh, &creds.client_id) {
                    (Some(refresh_token), Some(client_id)) => RefreshParams {
                        client_id: client_id.clone(),
                        refresh_token: refresh_token.clone(),
                        secret: creds.secret.clone(),
                    },
                    _ => {
                        return Err(Error::Logic(
                            "Attempt to use the drive before credentials are configured"
                                .to_string(),
                        ))
                    }
                }
            };

            let grant = match &params.secret {
                Some(secret) => self.refresh_with_provider(executor, &params, secret).await?,
                None => self.refresh_with_proxy(executor, &params).await?,
            };
            let (token, expires_in) = parse_grant(&grant)?;

            let mut creds = self.state.write().await;
            creds.bearer = Some(token.clone());
            creds.expires_at = Some(executor.clock().now() + Duration::seconds(expires_in));
            info!(expires_in, "Refreshed drive credentials");
            Ok(token)
        }
        .boxed()
    }

    async fn refresh_with_provider(
        &self,
        executor: &RequestExecutor,
        params: &RefreshParams,
        secret: &str,
    ) -> Result<Value> {
        debug!("Requesting refreshed credentials from the token provider");
        let request = ApiRequest::post(executor.config().token_url.as_str())
            .absolute()
            .form([
                ("client_id", params.client_id.as_str()),
                ("client_secret", secret),
                ("refresh_token", params.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .without_bearer()
            .no_credential_retry();

        executor.send_json(request).await
    }

    async fn refresh_with_proxy(
        &self,
        executor: &RequestExecutor,
        params: &RefreshParams,
    ) -> Result<Value> {
        debug!("Requesting refreshed credentials from the refresh service");
        let config = executor.config();
        let mut url = url::Url::parse(&config.refresh_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid refresh URL: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("client_id", &params.client_id)
            .append_pair("refresh_token", &params.refresh_token)
            .append_pair("client", &config.client_identifier)
            .append_pair("version", VERSION);
        let host = url.host_str().unwrap_or("the refresh service").to_string();

        let request = HttpRequest {
            method: Method::POST,
            url: url.into(),
            headers: executor.client_headers()?,
            body: None,
        };

        let response = match executor.transport().send(request).await {
            Ok(response) => response,
            Err(failure) if matches!(failure.kind, FailureKind::Connect | FailureKind::Resolve) => {
                warn!("Unable to reach the refresh service: {}", failure.message);
                return Err(Error::RefreshService(format!("Unable to connect to {}", host)));
            }
            Err(failure) => return Err(executor.translate(failure)),
        };

        let status = response.status;
        let body = response.bytes().await.map_err(|e| executor.translate(e))?;
        match status {
            200 => serde_json::from_slice(&body).map_err(|e| {
                Error::Protocol(format!("Unreadable refresh service response: {}", e))
            }),
            503 => Err(Error::RefreshProvider(
                error_message(&body).unwrap_or_else(|| "unknown provider error".to_string()),
            )),
            401 => Err(Error::CredentialsExpired),
            _ => {
                let extra = error_message(&body).unwrap_or_default();
                Err(Error::RefreshService(
                    format!("HTTP {} {}", status, extra).trim_end().to_string(),
                ))
            }
        }
    }
}

/// Build the provider authorization URL for the out-of-band flow.
///
/// Returns the URL and the CSRF state token to compare on callback.
pub fn authorization_url(
    config: &DriveConfig,
    client_id: &str,
    redirect_url: &str,
) -> Result<(String, String)> {
    let client = BasicClient::new(ClientId::new(client_id.to_string()))
        .set_auth_uri(
            AuthUrl::new(config.authorize_url.clone())
                .map_err(|e| Error::InvalidInput(format!("Invalid auth URL: {}", e)))?,
        )
        .set_redirect_uri(
            RedirectUrl::new(redirect_url.to_string())
                .map_err(|e| Error::InvalidInput(format!("Invalid redirect URL: {}", e)))?,
        );

    let (auth_url, csrf_token) = client
        .authorize_url(CsrfToken::new_random)
        .add_scope(Scope::new(DRIVE_SCOPE.to_string()))
        .add_extra_param("access_type", "offline")
        .add_extra_param("prompt", "consent")
        .url();

    Ok((auth_url.to_string(), csrf_token.secret().clone()))
}

fn read_credentials(path: &Path, default_client_id: &str, now: DateTime<Utc>) -> Credentials {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            debug!("No drive credentials loaded from {}: {}", path.display(), e);
            return Credentials::default();
        }
    };

    match parse_record(&contents, default_client_id, now) {
        Ok((credentials, None)) => credentials,
        Ok((credentials, Some(migrated))) => {
            info!("Rewriting legacy credentials without the default client secret");
            let written = serde_json::to_vec(&migrated)
                .map_err(Error::from)
                .and_then(|bytes| std::fs::write(path, bytes).map_err(Error::from));
            if let Err(e) = written {
                warn!("Unable to rewrite legacy credentials: {}", e);
            }
            credentials
        }
        Err(e) => {
            warn!("Discarding unreadable drive credentials: {}", e);
            Credentials::default()
        }
    }
}

/// Parse a persisted record. The second value is a rewritten record when the
/// stored one needs migrating.
fn parse_record(
    contents: &str,
    default_client_id: &str,
    now: DateTime<Utc>,
) -> Result<(Credentials, Option<CredentialsRecord>)> {
    let record = CredentialsRecord::from_json(contents)?;

    // An unreadable expiry just means "refresh now".
    let expires_at = record
        .token_expiry
        .as_deref()
        .and_then(parse_expiry)
        .unwrap_or_else(|| now - Duration::minutes(1));

    let mut migrated = None;
    let secret = match &record.client_secret {
        Some(_) if record.client_id == default_client_id => {
            migrated = Some(CredentialsRecord {
                client_secret: None,
                ..record.clone()
            });
            None
        }
        other => other.clone(),
    };

    let credentials = Credentials {
        bearer: Some(record.access_token.clone()),
        refresh: Some(record.refresh_token.clone()),
        client_id: Some(record.client_id.clone()),
        secret,
        expires_at: Some(expires_at),
    };
    Ok((credentials, migrated))
}

fn parse_expiry(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// Access token and lifetime from a token response.
fn parse_grant(body: &Value) -> Result<(String, i64)> {
    let token = body
        .get("access_token")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol("Missing 'access_token' in credential response".to_string()))?;

    let expires_in = body
        .get("expires_in")
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .ok_or_else(|| Error::Protocol("Missing 'expires_in' in credential response".to_string()))?;

    Ok((token.to_string(), expires_in))
}

fn error_message(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    match value.get("error")? {
        Value::String(message) => Some(message.clone()),
        other => Some(other.to_string()),
    }
}
