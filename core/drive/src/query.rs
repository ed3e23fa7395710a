//! Cursor-based listing.

use futures::stream::{self, Stream, TryStreamExt};
use serde::Deserialize;
use tracing::debug;

use drivestash_common::{Error, Result};

use crate::client::{DriveFile, SELECT_FIELDS, URL_FILES};
use crate::executor::{ApiRequest, RequestExecutor};

/// Response from listing files.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Lists the records matching a query, one page at a time.
///
/// Every call to [`pages`](Self::pages) or [`records`](Self::records) starts a
/// new cursor from the first page.
#[derive(Clone)]
pub struct QueryPaginator<'a> {
    executor: &'a RequestExecutor,
    query: String,
}

impl<'a> QueryPaginator<'a> {
    pub fn new(executor: &'a RequestExecutor, query: impl Into<String>) -> Self {
        Self {
            executor,
            query: query.into(),
        }
    }

    /// Lazily fetch pages until the server stops returning a continuation
    /// token.
    pub fn pages(&self) -> impl Stream<Item = Result<Vec<DriveFile>>> + Send + 'a {
        let executor = self.executor;
        let query = self.query.clone();

        // `None` once the last page has been fetched.
        let first: Option<Option<String>> = Some(None);
        stream::try_unfold(first, move |cursor| {
            let query = query.clone();
            async move {
                let Some(token) = cursor else {
                    return Ok(None);
                };
                let page = fetch_page(executor, &query, token.as_deref()).await?;
                let next = page.next_page_token.filter(|token| !token.is_empty());
                Ok::<_, Error>(Some((page.files, next.map(Some))))
            }
        })
    }

    /// Lazily yield every record across all pages.
    pub fn records(&self) -> impl Stream<Item = Result<DriveFile>> + Send + 'a {
        self.pages()
            .map_ok(|files| stream::iter(files.into_iter().map(Ok::<_, Error>)))
            .try_flatten()
    }
}

async fn fetch_page(
    executor: &RequestExecutor,
    query: &str,
    page_token: Option<&str>,
) -> Result<FileListResponse> {
    let mut request = ApiRequest::get(URL_FILES)
        .query("q", query)
        .query("fields", format!("nextPageToken,files({})", SELECT_FIELDS))
        .query("pageSize", executor.config().page_size.to_string())
        .query("supportsAllDrives", "true")
        .query("includeItemsFromAllDrives", "true")
        .query("corpora", "allDrives");
    if let Some(token) = page_token {
        request = request.query("pageToken", token);
    }

    let page: FileListResponse = executor.send_json(request).await?;
    debug!(
        records = page.files.len(),
        more = page.next_page_token.is_some(),
        "Fetched listing page"
    );
    Ok(page)
}
