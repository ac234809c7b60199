//! Typed client for the document/query service
//!
//! Every call goes through the shared [`RequestCache`]: reads use the
//! configured [`EndpointStrategies`], writes and query execution bypass it.

use crate::config::EndpointStrategies;
use crate::error::SyncError;
use crate::publish::{BatchSaveRequest, BatchSaveResponse};
use crate::query::{QueryRequest, QueryResult};
use crate::types::{Document, FileId, FileSummary, FileType};
use docsync_cache::error::extract_error_message;
use docsync_cache::{FetchError, FetchOptions, Method, RequestCache};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Files plus the referenced documents the service bundled with them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedDocuments {
    /// Requested documents that exist
    pub files: Vec<Document>,
    /// Documents referenced by `files`
    pub references: Vec<Document>,
}

/// Filter for a metadata-only listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCriteria {
    /// Folder paths to list under
    #[serde(default)]
    pub paths: Vec<String>,
    /// Restrict to one type
    #[serde(default, rename = "type")]
    pub file_type: Option<FileType>,
    /// Folder depth below each path
    #[serde(default)]
    pub depth: Option<u32>,
}

impl FileCriteria {
    /// Listing under one path
    #[must_use]
    pub fn under(path: impl Into<String>) -> Self {
        Self {
            paths: vec![path.into()],
            ..Self::default()
        }
    }

    /// Restrict to one type
    #[inline]
    #[must_use]
    pub fn of_type(mut self, file_type: FileType) -> Self {
        self.file_type = Some(file_type);
        self
    }

    /// With depth
    #[inline]
    #[must_use]
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }
}

/// Listing result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileListing {
    /// Matching files
    pub files: Vec<FileSummary>,
    /// Folders under the requested paths
    pub folders: Vec<FileSummary>,
}

/// Body of `POST /api/documents`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateFileRequest {
    /// Name
    pub name: String,
    /// Path
    pub path: String,
    /// Type
    #[serde(rename = "type")]
    pub file_type: FileType,
    /// Content
    pub content: Value,
    /// Referenced files
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<FileId>,
}

/// Body of `PATCH /api/files/{id}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveFileRequest {
    /// Name
    pub name: String,
    /// Path
    pub path: String,
    /// Content
    pub content: Value,
    /// Referenced files
    pub references: Vec<FileId>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct DocumentsPayload<T> {
    data: T,
    #[serde(default)]
    metadata: ReferencesMetadata,
}

#[derive(Default, Deserialize)]
struct ReferencesMetadata {
    #[serde(default)]
    references: Vec<Document>,
}

#[derive(Deserialize)]
struct ListPayload {
    #[serde(default)]
    data: Vec<FileSummary>,
    #[serde(default)]
    metadata: ListMetadata,
}

#[derive(Default, Deserialize)]
struct ListMetadata {
    #[serde(default)]
    folders: Vec<FileSummary>,
}

/// Typed endpoints of the document service
#[derive(Debug, Clone)]
pub struct FilesApi {
    cache: Arc<RequestCache>,
    strategies: EndpointStrategies,
}

impl FilesApi {
    /// Create API over a shared request cache
    #[must_use]
    pub fn new(cache: Arc<RequestCache>, strategies: EndpointStrategies) -> Self {
        Self { cache, strategies }
    }

    /// Shared request cache
    #[inline]
    #[must_use]
    pub fn request_cache(&self) -> &Arc<RequestCache> {
        &self.cache
    }

    /// `POST /api/files/batch`
    ///
    /// # Errors
    /// Classified [`SyncError`] for transport or server failures.
    pub async fn load_files(&self, ids: &[FileId]) -> Result<LoadedDocuments, SyncError> {
        let body = json!({ "ids": ids, "include": "references" });
        let options = FetchOptions::with_body(Method::Post, body, self.strategies.load_files);
        let payload: Envelope<DocumentsPayload<Vec<Document>>> = self
            .cache
            .fetch_json("/api/files/batch", options)
            .await
            .map_err(SyncError::from)?;

        Ok(LoadedDocuments {
            files: payload.data.data,
            references: payload.data.metadata.references,
        })
    }

    /// `GET /api/files/{id}?include=references&refresh=`
    ///
    /// `refresh` bypasses both the response cache and server-side caching.
    ///
    /// # Errors
    /// [`SyncError::NotFound`] for a 404, otherwise classified failures.
    pub async fn load_file(&self, id: FileId, refresh: bool) -> Result<LoadedDocuments, SyncError> {
        let url = format!("/api/files/{id}?include=references&refresh={refresh}");
        let options = if refresh {
            FetchOptions::direct(Method::Get, None)
        } else {
            FetchOptions::get(self.strategies.load_file)
        };
        let payload: Envelope<DocumentsPayload<Document>> = self
            .cache
            .fetch_json(&url, options)
            .await
            .map_err(|e| SyncError::classify(&e, Some(id)))?;

        Ok(LoadedDocuments {
            files: vec![payload.data.data],
            references: payload.data.metadata.references,
        })
    }

    /// `GET /api/files?paths=&type=&depth=`
    ///
    /// # Errors
    /// Classified [`SyncError`].
    pub async fn list_files(&self, criteria: &FileCriteria) -> Result<FileListing, SyncError> {
        let url = list_url(criteria);
        let payload: ListPayload = self
            .cache
            .fetch_json(&url, FetchOptions::get(self.strategies.list_files))
            .await
            .map_err(SyncError::from)?;

        Ok(FileListing {
            files: payload.data,
            folders: payload.metadata.folders,
        })
    }

    /// `POST /api/documents`
    ///
    /// # Errors
    /// [`SyncError::Conflict`] on unique-constraint violations, otherwise
    /// classified failures.
    pub async fn create_file(&self, request: &CreateFileRequest) -> Result<Document, SyncError> {
        let body = to_body(request)?;
        let payload: Envelope<Document> = self
            .cache
            .fetch_json("/api/documents", FetchOptions::direct(Method::Post, Some(body)))
            .await
            .map_err(SyncError::from)?;
        Ok(payload.data)
    }

    /// `PATCH /api/files/{id}`
    ///
    /// # Errors
    /// Classified [`SyncError`].
    pub async fn save_file(
        &self,
        id: FileId,
        request: &SaveFileRequest,
    ) -> Result<Document, SyncError> {
        let body = to_body(request)?;
        let payload: Envelope<Document> = self
            .cache
            .fetch_json(
                &format!("/api/files/{id}"),
                FetchOptions::direct(Method::Patch, Some(body)),
            )
            .await
            .map_err(|e| SyncError::classify(&e, Some(id)))?;
        Ok(payload.data)
    }

    /// `POST /api/files/batch-save`
    ///
    /// # Errors
    /// Classified [`SyncError`].
    pub async fn batch_save(
        &self,
        request: &BatchSaveRequest,
    ) -> Result<BatchSaveResponse, SyncError> {
        let body = to_body(request)?;
        let payload: Envelope<BatchSaveResponse> = self
            .cache
            .fetch_json("/api/files/batch-save", FetchOptions::direct(Method::Post, Some(body)))
            .await
            .map_err(SyncError::from)?;
        Ok(payload.data)
    }

    /// `POST /api/query`
    ///
    /// A 2xx body carrying `error` instead of `data` is a failure too.
    ///
    /// # Errors
    /// [`SyncError::ServerValidation`] for query errors, otherwise classified
    /// failures.
    pub async fn execute_query(&self, request: &QueryRequest) -> Result<QueryResult, SyncError> {
        let body = to_body(request)?;
        let value = self
            .cache
            .fetch_with_cache("/api/query", FetchOptions::direct(Method::Post, Some(body)))
            .await
            .map_err(SyncError::from)?;

        match value.get("data") {
            Some(data) if !data.is_null() => serde_json::from_value(data.clone())
                .map_err(|e| SyncError::from(FetchError::Decode(e.to_string()))),
            _ => Err(SyncError::ServerValidation(
                extract_error_message(&value)
                    .unwrap_or_else(|| "query returned no data".to_string()),
            )),
        }
    }

    /// Drop cached listings so renamed or created files show up
    pub fn invalidate_listings(&self) {
        self.cache.invalidate_matching(|key| key.starts_with("GET:/api/files?"));
    }
}

fn to_body<T: Serialize>(value: &T) -> Result<Value, SyncError> {
    serde_json::to_value(value).map_err(|e| SyncError::Validation(e.to_string()))
}

fn list_url(criteria: &FileCriteria) -> String {
    let mut url = match reqwest::Url::parse("http://docsync.local/api/files") {
        Ok(url) => url,
        Err(_) => return "/api/files".to_string(),
    };
    {
        let mut query = url.query_pairs_mut();
        if !criteria.paths.is_empty() {
            query.append_pair("paths", &criteria.paths.join(","));
        }
        if let Some(file_type) = criteria.file_type {
            query.append_pair("type", file_type.as_str());
        }
        if let Some(depth) = criteria.depth {
            query.append_pair("depth", &depth.to_string());
        }
    }
    match url.query() {
        Some(q) if !q.is_empty() => format!("{}?{q}", url.path()),
        _ => url.path().to_string(),
    }
}
