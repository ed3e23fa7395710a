//! Maps failure response bodies to specific error kinds.

use serde::Deserialize;

use drivestash_common::Error;

#[derive(Debug, Deserialize)]
struct FailureBody {
    error: Option<ErrorField>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorField {
    /// Token services answer with a bare message.
    Message(String),
    /// The object API answers with a structured error.
    Detail {
        #[serde(default)]
        errors: Vec<ErrorEntry>,
    },
}

#[derive(Debug, Deserialize)]
struct ErrorEntry {
    reason: Option<String>,
}

/// Inspect a failed response body.
///
/// Returns `None` when the body carries no recognizable error, in which case
/// the status-based retry policy decides.
pub fn classify_failure(body: &[u8]) -> Option<Error> {
    let parsed: FailureBody = serde_json::from_slice(body).ok()?;

    match parsed.error? {
        ErrorField::Message(message) if message == "expired" => Some(Error::CredentialsExpired),
        ErrorField::Message(message) => Some(Error::RefreshProvider(message)),
        ErrorField::Detail { errors } => errors
            .iter()
            .filter_map(|entry| entry.reason.as_deref())
            .find_map(|reason| match reason {
                "storageQuotaExceeded" => Some(Error::QuotaExceeded),
                "forbidden" => Some(Error::PermissionDenied),
                _ => None,
            }),
    }
}
