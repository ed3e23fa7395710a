//! Resumable chunked upload.
//!
//! An upload either resumes the session cached in an [`UploadSlot`] (when the
//! metadata matches and the resume budget allows) or starts a fresh one, then
//! streams the source in adaptively sized chunks. Progress is reported as a
//! stream of [`UploadEvent`]s ending with the created record.

use bytes::Bytes;
use futures::stream::{self, Stream};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION};
use serde::Deserialize;
use tracing::{debug, info};

use drivestash_common::{Error, Result};

use crate::client::{get_file, DriveFile, FileMetadata};
use crate::executor::{http_error, ApiRequest, RequestExecutor};
use crate::source::UploadSource;
use crate::transport::HttpResponse;

/// Chunk granularity required by the upload protocol.
pub const BASE_CHUNK_SIZE: usize = 256 * 1024;

/// Largest chunk ever sent.
pub const MAX_CHUNK_SIZE: usize = 40 * BASE_CHUNK_SIZE;

/// Wall time each chunk should take.
const TARGET_CHUNK_SECONDS: f64 = 10.0;

/// Upload initiation endpoint.
pub const URL_UPLOAD: &str = "/upload/drive/v3/files/";

/// Size of the next chunk given how long the last one took.
///
/// Always a multiple of [`BASE_CHUNK_SIZE`] within
/// `[BASE_CHUNK_SIZE, MAX_CHUNK_SIZE]`.
pub fn next_chunk_size(last_size: usize, seconds: f64) -> usize {
    if !(seconds > 0.0) {
        return MAX_CHUNK_SIZE;
    }
    let target = TARGET_CHUNK_SECONDS * last_size as f64 / seconds;
    let clamped = target.clamp(BASE_CHUNK_SIZE as f64, MAX_CHUNK_SIZE as f64) as usize;
    clamped / BASE_CHUNK_SIZE * BASE_CHUNK_SIZE
}

/// Parse a `Range: bytes=0-<last>` header into `last`.
fn parse_range(value: &str) -> Option<u64> {
    let last = value.strip_prefix("bytes=0-")?;
    if last.is_empty() || !last.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    last.parse().ok()
}

/// Item produced while an upload runs.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// Fraction of the source sent so far.
    Progress(f64),
    /// The upload finished; always the last item.
    Completed(DriveFile),
}

/// The cached resumable session.
///
/// There is exactly one per client, so at most one upload may run at a time.
#[derive(Debug, Default)]
pub struct UploadSlot {
    pub(crate) location: Option<String>,
    pub(crate) fingerprint: Option<FileMetadata>,
    pub(crate) attempts: u32,
}

impl UploadSlot {
    /// Session URL of the last unfinished upload.
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// How many times the cached session has been checked for resumption.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn can_resume(&self, metadata: &FileMetadata, ceiling: u32) -> bool {
        self.location.is_some()
            && self.fingerprint.as_ref() == Some(metadata)
            && self.attempts < ceiling
    }

    fn clear(&mut self) {
        self.location = None;
        self.fingerprint = None;
    }
}

#[derive(Deserialize)]
struct CreatedFile {
    id: Option<String>,
}

enum Phase {
    Start,
    Uploading,
    Finished(String),
    Failed(Error),
    Done,
}

struct Upload<'a> {
    executor: &'a RequestExecutor,
    slot: &'a mut UploadSlot,
    source: &'a mut dyn UploadSource,
    metadata: FileMetadata,
    mime_type: String,
    total: u64,
    location: String,
    chunk_size: usize,
    phase: Phase,
}

/// Upload `source` as a new object described by `metadata`.
///
/// The returned stream yields progress after every chunk and finishes with
/// [`UploadEvent::Completed`]. Failures end the stream with an error; the slot
/// keeps the session for a later attempt unless the failure was a client
/// error.
pub fn upload<'a>(
    executor: &'a RequestExecutor,
    slot: &'a mut UploadSlot,
    source: &'a mut dyn UploadSource,
    metadata: FileMetadata,
    mime_type: String,
) -> impl Stream<Item = Result<UploadEvent>> + Send + 'a {
    let upload = Upload {
        executor,
        slot,
        source,
        metadata,
        mime_type,
        total: 0,
        location: String::new(),
        chunk_size: BASE_CHUNK_SIZE,
        phase: Phase::Start,
    };
    stream::try_unfold(upload, |upload| upload.step())
}

impl<'a> Upload<'a> {
    async fn step(mut self) -> Result<Option<(UploadEvent, Self)>> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Start => {
                    self.begin().await?;
                    self.phase = Phase::Uploading;
                }
                Phase::Uploading => {
                    let progress = self.send_chunk().await?;
                    return Ok(Some((UploadEvent::Progress(progress), self)));
                }
                Phase::Finished(id) => {
                    let file = get_file(self.executor, &id).await?;
                    info!(id = %file.id, bytes = self.total, "Upload complete: {}", file.name);
                    return Ok(Some((UploadEvent::Completed(file), self)));
                }
                Phase::Failed(err) => return Err(err),
                Phase::Done => return Ok(None),
            }
        }
    }

    async fn begin(&mut self) -> Result<()> {
        self.total = self.source.size();
        let ceiling = self.executor.config().resume_attempts;

        let resumed = if self.slot.can_resume(&self.metadata, ceiling) {
            self.check_session().await?
        } else {
            false
        };
        if !resumed {
            self.initiate().await?;
        }

        self.slot.location = Some(self.location.clone());
        self.slot.fingerprint = Some(self.metadata.clone());
        Ok(())
    }

    /// Ask the cached session how much it already has. Returns whether the
    /// session can be continued.
    async fn check_session(&mut self) -> Result<bool> {
        let Some(location) = self.slot.location.clone() else {
            return Ok(false);
        };
        self.slot.attempts += 1;
        debug!(attempt = self.slot.attempts, "Checking whether the last upload can be resumed");

        let request = ApiRequest::put(location.as_str())
            .absolute()
            .header(CONTENT_RANGE.as_str(), format!("bytes */{}", self.total))
            .body(Bytes::new());

        let response = match self.executor.send(request).await {
            Ok(response) if response.status == 308 => response,
            Ok(response) => {
                debug!(status = response.status, "Upload session is gone, starting over");
                self.slot.clear();
                return Ok(false);
            }
            Err(err) if answered_by_session(&err) => {
                debug!("Upload session is gone ({}), starting over", err);
                self.slot.clear();
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        let offset = match response.header("range") {
            Some(range) => parse_range(range)
                .map(|last| last + 1)
                .ok_or_else(|| malformed_range(range))?,
            None => 0,
        };
        self.source.seek(offset).await?;
        self.location = location;
        info!(offset, total = self.total, "Resuming upload");
        Ok(true)
    }

    async fn initiate(&mut self) -> Result<()> {
        let request = ApiRequest::post(URL_UPLOAD)
            .query("uploadType", "resumable")
            .query("supportsAllDrives", "true")
            .header("X-Upload-Content-Type", &self.mime_type)
            .header("X-Upload-Content-Length", self.total)
            .json(&self.metadata)?;

        let response = self.executor.send(request).await?;
        self.location = response
            .header(LOCATION.as_str())
            .ok_or_else(|| {
                Error::Protocol("Upload initiation response has no Location header".to_string())
            })?
            .to_string();
        self.slot.attempts = 0;
        self.source.seek(0).await?;
        debug!(total = self.total, "Started a new upload session");
        Ok(())
    }

    /// Send one chunk and return the progress fraction. The outcome of the
    /// chunk is stored in `phase`.
    async fn send_chunk(&mut self) -> Result<f64> {
        let start = self.source.position();
        let data = self.source.read(self.chunk_size).await?;
        if data.is_empty() {
            return Err(Error::Logic(format!(
                "Upload source ended at byte {} of {}",
                start, self.total
            )));
        }
        let len = data.len() as u64;

        let request = ApiRequest::put(self.location.as_str())
            .absolute()
            .header(CONTENT_LENGTH.as_str(), len)
            .header(
                CONTENT_RANGE.as_str(),
                format!("bytes {}-{}/{}", start, start + len - 1, self.total),
            )
            .body(data);

        let clock = self.executor.clock();
        let started = clock.now();
        let result = self.executor.send(request).await;
        let seconds = (clock.now() - started).num_milliseconds() as f64 / 1000.0;
        self.chunk_size = next_chunk_size(self.chunk_size, seconds);

        let response = match result {
            Ok(response) => response,
            Err(err) => return Err(self.chunk_failed(err)),
        };

        let progress = (start + len) as f64 / self.total as f64;
        let status = response.status;
        debug!(start, len, status, "Sent upload chunk");
        self.phase = match status {
            200 | 201 => {
                self.slot.clear();
                match created_id(response).await {
                    Ok(id) => Phase::Finished(id),
                    Err(err) => Phase::Failed(err),
                }
            }
            308 => {
                let offset = continue_offset(&response);
                match offset {
                    Ok(offset) => match self.source.seek(offset).await {
                        Ok(()) => Phase::Uploading,
                        Err(err) => Phase::Failed(err),
                    },
                    Err(err) => Phase::Failed(err),
                }
            }
            _ => {
                let body = response.bytes().await.unwrap_or_default();
                Phase::Failed(http_error(status, &body))
            }
        };
        Ok(progress)
    }

    fn chunk_failed(&mut self, err: Error) -> Error {
        match err.http_status() {
            Some(status) if (400..500).contains(&status) => {
                self.slot.clear();
                if status == 404 {
                    Error::SessionInvalidated
                } else {
                    err
                }
            }
            _ => err,
        }
    }
}

/// Offset to continue from after a 308.
fn continue_offset(response: &HttpResponse) -> Result<u64> {
    let range = response.header("range").ok_or_else(|| {
        Error::Protocol("Upload continue response has no Range header".to_string())
    })?;
    parse_range(range)
        .map(|last| last + 1)
        .ok_or_else(|| malformed_range(range))
}

/// Whether a failed resume check got an HTTP answer about the session itself.
///
/// Transport and credential failures say nothing about the session and keep
/// it cached.
fn answered_by_session(err: &Error) -> bool {
    matches!(
        err,
        Error::Http { .. }
            | Error::InternalServer
            | Error::PermissionDenied
            | Error::QuotaExceeded
            | Error::SessionInvalidated
    )
}

fn malformed_range(value: &str) -> Error {
    Error::Protocol(format!("Malformed upload Range header: {}", value))
}

async fn created_id(response: HttpResponse) -> Result<String> {
    let body = response
        .bytes()
        .await
        .map_err(|e| Error::Network(e.message))?;
    let created: CreatedFile = serde_json::from_slice(&body)?;
    created
        .id
        .ok_or_else(|| Error::Protocol("Upload completed without a file id".to_string()))
}
