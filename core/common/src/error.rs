//! Common error types for drivestash.

use thiserror::Error;

/// Top-level error type for remote drive operations.
///
/// The set is closed: every failure a caller can observe maps to exactly one
/// variant, so callers decide between re-authorizing, retrying later, or
/// giving up by matching on the variant.
#[derive(Debug, Error)]
pub enum Error {
    /// Name resolution for the remote API failed.
    #[error("Unable to resolve the remote API host (DNS failure)")]
    DnsFailure,

    /// The remote API refused or dropped the connection.
    #[error("Unable to connect to the remote API")]
    CannotConnect,

    /// A connect or read timeout expired.
    #[error("Timed out waiting for the remote API")]
    Timeout,

    /// The stored credentials were revoked or permanently expired.
    #[error("Credentials have expired and must be re-authorized")]
    CredentialsExpired,

    /// The token provider rejected a refresh.
    #[error("Token provider rejected the credential refresh: {0}")]
    RefreshProvider(String),

    /// The refresh service failed or could not be reached.
    #[error("Credential refresh failed: {0}")]
    RefreshService(String),

    /// The account is out of storage.
    #[error("Remote storage quota exceeded")]
    QuotaExceeded,

    /// The credentials lack permission for the requested object.
    #[error("Permission denied by the remote API")]
    PermissionDenied,

    /// The resumable upload session no longer exists on the remote side.
    #[error("Upload session was invalidated, the upload must restart")]
    SessionInvalidated,

    /// Server errors persisted past the retry budget.
    #[error("Remote API reported an internal error")]
    InternalServer,

    /// Unclassified HTTP failure.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The remote API answered with something that breaks the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An internal invariant was violated.
    #[error("Logic error: {0}")]
    Logic(String),

    /// Transport failure that matched no specific class.
    #[error("Network error: {0}")]
    Network(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Whether the user has to run the authorization flow again.
    pub fn needs_reauthorization(&self) -> bool {
        matches!(self, Error::CredentialsExpired)
    }

    /// Whether retrying the whole operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::QuotaExceeded
                | Error::InternalServer
                | Error::Timeout
                | Error::DnsFailure
                | Error::CannotConnect
                | Error::SessionInvalidated
        )
    }

    /// Protocol violations and logic errors are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Logic(_))
    }

    /// Status code carried by an unclassified HTTP failure.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
