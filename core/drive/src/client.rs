//! Drive API facade.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use drivestash_common::{DriveConfig, Error, Result};

use crate::auth::CredentialsRecord;
use crate::executor::{ApiRequest, RequestExecutor};
use crate::query::QueryPaginator;
use crate::runtime::{AlternateResolver, Clock, ResolverSwitch, SystemClock};
use crate::source::UploadSource;
use crate::transport::{BodyStream, HttpTransport, ReqwestTransport};
use crate::upload::{upload, UploadEvent, UploadSlot};

/// Object endpoint.
pub const URL_FILES: &str = "/drive/v3/files/";

/// Fields requested for every record.
pub const SELECT_FIELDS: &str =
    "id,name,appProperties,size,trashed,mimeType,modifiedTime,capabilities,parents";

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Content type archives are uploaded with unless told otherwise.
pub const ARCHIVE_MIME_TYPE: &str = "application/tar";

/// Remote file record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Key/value properties private to this application.
    #[serde(default)]
    pub app_properties: BTreeMap<String, String>,
    /// Size in bytes, as the API reports it (absent for folders).
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub capabilities: BTreeMap<String, Value>,
    #[serde(default)]
    pub parents: Vec<String>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    /// Get size as u64.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_ref().and_then(|s| s.parse().ok())
    }

    /// Whether the API granted capability `name` (e.g. `canDelete`).
    pub fn capability(&self, name: &str) -> bool {
        self.capabilities
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Metadata of an object to create.
///
/// Also the identity of an upload: a retried upload with equal metadata may
/// resume the previous session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub app_properties: BTreeMap<String, String>,
}

impl FileMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Metadata of a folder.
    pub fn folder(name: impl Into<String>) -> Self {
        Self::new(name).with_mime_type(FOLDER_MIME_TYPE)
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parents.push(parent.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.app_properties.insert(key.into(), value.into());
        self
    }
}

/// Fetch one record.
pub(crate) async fn get_file(executor: &RequestExecutor, id: &str) -> Result<DriveFile> {
    let request = ApiRequest::get(format!("{}{}", URL_FILES, id))
        .query("fields", SELECT_FIELDS)
        .query("supportsAllDrives", "true");
    executor.send_json(request).await
}

/// Content of a downloaded object.
pub struct Download {
    /// Size the caller expects, usually from the record.
    pub size: u64,
    body: BodyStream,
}

impl Download {
    /// Raw body chunks.
    pub fn into_stream(self) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
        self.body.map_err(std::io::Error::other)
    }

    /// The body as an async reader.
    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin {
        StreamReader::new(self.into_stream())
    }

    /// Copy the body into `writer`, returning the byte count.
    pub async fn write_to<W: AsyncWrite + Unpin>(self, writer: &mut W) -> Result<u64> {
        let mut reader = self.into_async_read();
        Ok(tokio::io::copy(&mut reader, writer).await?)
    }
}

/// Client for the drive API.
///
/// Owns the credentials and the single resumable-upload slot. `create` takes
/// `&mut self`, so uploads through one client are serialized; callers that
/// need concurrent uploads use one client each.
pub struct DriveClient {
    executor: RequestExecutor,
    upload_slot: UploadSlot,
}

impl DriveClient {
    /// Create a client talking to the real API.
    pub fn new(config: DriveConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&config)?);
        Ok(Self::with_parts(
            config,
            transport,
            Arc::new(SystemClock),
            Arc::new(AlternateResolver::new()),
        ))
    }

    /// Create a client over explicit collaborators.
    pub fn with_parts(
        config: DriveConfig,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        resolver: Arc<dyn ResolverSwitch>,
    ) -> Self {
        Self {
            executor: RequestExecutor::new(config, transport, clock, resolver),
            upload_slot: UploadSlot::default(),
        }
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    pub fn upload_slot(&self) -> &UploadSlot {
        &self.upload_slot
    }

    /// Whether credentials are configured.
    pub async fn enabled(&self) -> bool {
        self.executor.credentials().enabled().await
    }

    /// Whether the credentials belong to a client other than the default one.
    pub async fn is_custom_credentials(&self) -> bool {
        self.executor.credentials().is_custom().await
    }

    /// Persist credentials issued by the authorization flow and start using
    /// them.
    pub async fn save_credentials(&self, record: &CredentialsRecord) -> Result<()> {
        let now = self.executor.clock().now();
        self.executor.credentials().save(record, now).await
    }

    /// Get file metadata by ID.
    pub async fn get(&self, id: &str) -> Result<DriveFile> {
        get_file(&self.executor, id).await
    }

    /// Start downloading an object's content.
    pub async fn download(&self, id: &str, size: u64) -> Result<Download> {
        let request = ApiRequest::get(format!("{}{}", URL_FILES, id))
            .query("alt", "media")
            .query("supportsAllDrives", "true");
        let response = self.executor.send(request).await?;
        debug!(id, size, "Downloading file content");
        Ok(Download {
            size,
            body: response.into_stream(),
        })
    }

    /// Records matching `query`, fetched lazily page by page.
    pub fn query(&self, query: &str) -> impl Stream<Item = Result<DriveFile>> + Send + '_ {
        QueryPaginator::new(&self.executor, query).records()
    }

    /// Patch an object's metadata.
    pub async fn update(&self, id: &str, update: &Value) -> Result<DriveFile> {
        let request = ApiRequest::patch(format!("{}{}", URL_FILES, id))
            .query("fields", SELECT_FIELDS)
            .query("supportsAllDrives", "true")
            .json(update)?;
        self.executor.send_json(request).await
    }

    /// Delete an object.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let request = ApiRequest::delete(format!("{}{}", URL_FILES, id))
            .query("supportsAllDrives", "true");
        self.executor.send(request).await?;
        info!(id, "Deleted file");
        Ok(())
    }

    /// Upload `source` as a new object.
    ///
    /// Only one upload may run per client; a failed upload retried with the
    /// same metadata resumes where the server left off.
    pub fn create<'a>(
        &'a mut self,
        source: &'a mut dyn UploadSource,
        metadata: FileMetadata,
        mime_type: &str,
    ) -> impl Stream<Item = Result<UploadEvent>> + Send + 'a {
        upload(
            &self.executor,
            &mut self.upload_slot,
            source,
            metadata,
            mime_type.to_string(),
        )
    }

    /// Run [`create`](Self::create) to completion, reporting progress.
    pub async fn create_and_wait(
        &mut self,
        source: &mut dyn UploadSource,
        metadata: FileMetadata,
        mime_type: &str,
        mut on_progress: impl FnMut(f64),
    ) -> Result<DriveFile> {
        let mut events = Box::pin(self.create(source, metadata, mime_type));
        while let Some(event) = events.try_next().await? {
            match event {
                UploadEvent::Progress(fraction) => on_progress(fraction),
                UploadEvent::Completed(file) => return Ok(file),
            }
        }
        Err(Error::Logic("Upload ended without a result".to_string()))
    }

    /// Create a folder.
    pub async fn create_folder(&self, metadata: FileMetadata) -> Result<DriveFile> {
        let metadata = FileMetadata {
            mime_type: Some(FOLDER_MIME_TYPE.to_string()),
            ..metadata
        };
        let request = ApiRequest::post(URL_FILES)
            .query("fields", SELECT_FIELDS)
            .query("supportsAllDrives", "true")
            .json(&metadata)?;
        let folder: DriveFile = self.executor.send_json(request).await?;
        info!(id = %folder.id, "Created folder {}", folder.name);
        Ok(folder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use crate::testing::TestHarness;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    fn record(id: &str) -> Value {
        json!({
            "id": id,
            "name": "backup.tar",
            "appProperties": {"backup": "true"},
            "size": "12345",
            "trashed": false,
            "mimeType": "application/tar",
            "modifiedTime": "2024-01-01T10:00:00.000Z",
            "capabilities": {"canDelete": true, "canEdit": false},
            "parents": ["root"],
        })
    }

    #[test]
    fn test_drive_file_deserialization() {
        let file: DriveFile = serde_json::from_value(record("abc")).unwrap();

        assert_eq!(file.id, "abc");
        assert_eq!(file.size_bytes(), Some(12345));
        assert_eq!(file.app_properties.get("backup").map(String::as_str), Some("true"));
        assert!(file.capability("canDelete"));
        assert!(!file.capability("canEdit"));
        assert!(!file.capability("canRename"));
        assert!(file.modified_time.is_some());
        assert!(!file.is_folder());
    }

    #[test]
    fn test_drive_file_is_folder() {
        let folder: DriveFile =
            serde_json::from_value(json!({"id": "1", "mimeType": FOLDER_MIME_TYPE})).unwrap();

        assert!(folder.is_folder());
        assert_eq!(folder.size_bytes(), None);
        assert!(folder.parents.is_empty());
    }

    #[test]
    fn test_metadata_serialization_skips_empty_fields() {
        let value = serde_json::to_value(FileMetadata::new("a.tar")).unwrap();
        assert_eq!(value, json!({"name": "a.tar"}));

        let value = serde_json::to_value(
            FileMetadata::folder("Backups")
                .with_parent("root")
                .with_property("k", "v"),
        )
        .unwrap();
        assert_eq!(
            value,
            json!({
                "name": "Backups",
                "mimeType": FOLDER_MIME_TYPE,
                "parents": ["root"],
                "appProperties": {"k": "v"},
            })
        );
    }

    #[tokio::test]
    async fn test_get() {
        let harness = TestHarness::new();
        let client = harness.client();
        harness.transport.push_json(200, record("abc"));

        let file = client.get("abc").await.unwrap();

        assert_eq!(file.name, "backup.tar");
        let url = &harness.transport.requests()[0].url;
        assert!(url.starts_with("http://drive.test/drive/v3/files/abc?fields="));
        assert!(url.contains("appProperties"));
        assert!(url.ends_with("supportsAllDrives=true"));
    }

    #[tokio::test]
    async fn test_download() {
        let harness = TestHarness::new();
        let client = harness.client();
        harness.transport.push_response(200, &[], "archive bytes");

        let download = client.download("abc", 13).await.unwrap();
        assert_eq!(download.size, 13);
        let mut content = Vec::new();
        download
            .into_async_read()
            .read_to_end(&mut content)
            .await
            .unwrap();

        assert_eq!(content, b"archive bytes");
        assert!(harness.transport.requests()[0].url.contains("alt=media"));
    }

    #[tokio::test]
    async fn test_download_retries_server_errors() {
        let harness = TestHarness::new();
        let client = harness.client();
        harness.transport.push_status(502);
        harness.transport.push_response(200, &[], "ok");

        let mut out = Vec::new();
        let written = client
            .download("abc", 2)
            .await
            .unwrap()
            .write_to(&mut out)
            .await
            .unwrap();

        assert_eq!(written, 2);
        assert_eq!(harness.transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_query() {
        let harness = TestHarness::new();
        let client = harness.client();
        harness
            .transport
            .push_json(200, json!({"files": [record("a")], "nextPageToken": "next"}));
        harness.transport.push_json(200, json!({"files": [record("b")]}));

        let files: Vec<DriveFile> = client.query("trashed=false").try_collect().await.unwrap();

        let ids: Vec<&str> = files.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_update_patches_metadata() {
        let harness = TestHarness::new();
        let client = harness.client();
        harness.transport.push_json(200, record("abc"));

        client.update("abc", &json!({"name": "renamed.tar"})).await.unwrap();

        let request = &harness.transport.requests()[0];
        assert_eq!(request.method, reqwest::Method::PATCH);
        assert!(request.url.starts_with("http://drive.test/drive/v3/files/abc?"));
        assert_eq!(request.body.as_deref(), Some(&br#"{"name":"renamed.tar"}"#[..]));
    }

    #[tokio::test]
    async fn test_delete() {
        let harness = TestHarness::new();
        let client = harness.client();
        harness.transport.push_status(204);

        client.delete("abc").await.unwrap();

        let request = &harness.transport.requests()[0];
        assert_eq!(request.method, reqwest::Method::DELETE);
        assert_eq!(
            request.url,
            "http://drive.test/drive/v3/files/abc?supportsAllDrives=true"
        );
    }

    #[tokio::test]
    async fn test_create_folder() {
        let harness = TestHarness::new();
        let client = harness.client();
        harness
            .transport
            .push_json(200, json!({"id": "f", "name": "Backups", "mimeType": FOLDER_MIME_TYPE}));

        let folder = client
            .create_folder(FileMetadata::new("Backups").with_parent("root"))
            .await
            .unwrap();

        assert!(folder.is_folder());
        let request = &harness.transport.requests()[0];
        assert_eq!(request.method, reqwest::Method::POST);
        let body: Value = serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["mimeType"], FOLDER_MIME_TYPE);
        assert_eq!(body["parents"], json!(["root"]));
    }

    #[tokio::test]
    async fn test_create_and_wait_reports_progress() {
        let harness = TestHarness::new();
        let mut client = harness.client();
        harness.transport.push_response(
            200,
            &[("location", "http://upload.test/session")],
            "",
        );
        harness.transport.push_json(200, json!({"id": "new"}));
        harness.transport.push_json(200, record("new"));

        let mut reported = Vec::new();
        let mut source = MemorySource::new(vec![0u8; 1000]);
        let file = client
            .create_and_wait(
                &mut source,
                FileMetadata::new("backup.tar"),
                ARCHIVE_MIME_TYPE,
                |fraction| reported.push(fraction),
            )
            .await
            .unwrap();

        assert_eq!(file.id, "new");
        assert_eq!(reported, vec![1.0]);
        assert!(client.upload_slot().location().is_none());
    }

    #[tokio::test]
    async fn test_quota_exceeded_is_not_retried() {
        let harness = TestHarness::new();
        let client = harness.client();
        harness.transport.push_json(
            403,
            json!({"error": {"errors": [{"reason": "storageQuotaExceeded"}]}}),
        );

        let result = client.create_folder(FileMetadata::new("Backups")).await;

        assert!(matches!(result, Err(Error::QuotaExceeded)));
        assert_eq!(harness.transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_unconfigured_client_is_a_logic_error() {
        let harness = TestHarness::with_credentials(None);
        let client = harness.client();

        assert!(!client.enabled().await);
        let result = client.get("abc").await;

        match result {
            Err(Error::Logic(message)) => {
                assert!(message.contains("before credentials are configured"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(harness.transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_save_credentials_enables_client() {
        let harness = TestHarness::with_credentials(None);
        let client = harness.client();

        client
            .save_credentials(&CredentialsRecord {
                access_token: "a".to_string(),
                refresh_token: "r".to_string(),
                client_id: "custom".to_string(),
                client_secret: Some("s".to_string()),
                token_expiry: None,
            })
            .await
            .unwrap();

        assert!(client.enabled().await);
        assert!(client.is_custom_credentials().await);
        let saved = std::fs::read_to_string(harness.credentials_path()).unwrap();
        assert_eq!(CredentialsRecord::from_json(&saved).unwrap().client_id, "custom");
    }
}
