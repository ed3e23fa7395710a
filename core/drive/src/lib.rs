//! Resilient client for the drive object-storage API.
//!
//! This crate provides everything a backup system needs to persist archives
//! remotely:
//! - Credential loading, migration and refresh through two token paths
//! - A retrying request executor with exponential backoff
//! - Resumable chunked uploads with adaptive chunk sizing
//! - Lazy, cursor-based listing
//!
//! Network, clock, name resolution and upload data are reached through traits
//! so the whole stack runs against scripted collaborators in tests.

pub mod auth;
pub mod classify;
pub mod client;
pub mod executor;
pub mod query;
pub mod retry;
pub mod runtime;
pub mod source;
pub mod transport;
pub mod upload;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{authorization_url, CredentialStore, CredentialsRecord};
pub use client::{DriveClient, DriveFile, Download, FileMetadata, ARCHIVE_MIME_TYPE};
pub use executor::{ApiRequest, RequestExecutor};
pub use query::QueryPaginator;
pub use runtime::{AlternateResolver, Clock, ResolverSwitch, SystemClock};
pub use source::{FileSource, MemorySource, UploadSource};
pub use transport::{HttpTransport, NetworkFailure, ReqwestTransport};
pub use upload::{next_chunk_size, UploadEvent, UploadSlot};
