//! Batch publish
//!
//! [`PublishCoordinator::plan`] walks a root file's dirty-reference graph and
//! snapshots every file to send. [`PublishCoordinator::commit`] sends the plan
//! as one save call and reports exactly which ids the service confirmed. The
//! coordinator never clears local layers itself: on any failure, including a
//! partial save, every layer stays as it was.

use crate::api::{CreateFileRequest, FilesApi, SaveFileRequest};
use crate::error::SyncError;
use crate::state::{FileState, SentLayers};
use crate::types::{Document, FileId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};

/// One file inside a batch save
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSaveFile {
    /// Identifier
    pub id: FileId,
    /// Name with pending edits
    pub name: String,
    /// Path with pending edits
    pub path: String,
    /// Content with persistable edits
    pub content: Value,
    /// Referenced files
    pub references: Vec<FileId>,
}

/// Body of `POST /api/files/batch-save`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSaveRequest {
    /// Files to save atomically
    pub files: Vec<BatchSaveFile>,
    /// Owning company
    pub company_id: Option<i64>,
}

/// `data` of the batch-save response
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSaveResponse {
    /// Ids the service saved
    #[serde(default)]
    pub saved_file_ids: Vec<FileId>,
}

/// Snapshot of one file queued for saving
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedFile {
    /// Save payload
    pub payload: BatchSaveFile,
    /// Layers the payload was built from
    pub sent: SentLayers,
}

/// Files to send for one publish
#[derive(Debug, Clone, PartialEq)]
pub struct PublishPlan {
    /// File the publish was requested for
    pub root: FileId,
    /// Root first, then dirty references in traversal order
    pub files: Vec<PlannedFile>,
}

impl PublishPlan {
    /// Ids included
    #[must_use]
    pub fn ids(&self) -> Vec<FileId> {
        self.files.iter().map(|f| f.payload.id).collect()
    }

    /// Nothing to send
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Builds and sends publish requests
#[derive(Debug, Clone)]
pub struct PublishCoordinator {
    api: FilesApi,
    company_id: Option<i64>,
    max_depth: usize,
}

impl PublishCoordinator {
    /// Create coordinator
    #[must_use]
    pub fn new(api: FilesApi, company_id: Option<i64>, max_depth: usize) -> Self {
        Self {
            api,
            company_id,
            max_depth,
        }
    }

    /// Collect the root (when dirty) and every dirty file reachable through
    /// dirty references
    ///
    /// `lookup` reads the current state of a referenced file; unloaded
    /// references are skipped.
    ///
    /// # Errors
    /// [`SyncError::Validation`] when a reference is still virtual, or the
    /// content error of a file whose layers no longer merge.
    pub fn plan<L>(&self, root: &FileState, lookup: L) -> Result<PublishPlan, SyncError>
    where
        L: Fn(FileId) -> Option<FileState>,
    {
        let mut files = Vec::new();
        if root.is_dirty() || root.is_virtual() {
            files.push(planned(root)?);
        }

        let mut visited: HashSet<FileId> = HashSet::from([root.id]);
        let mut queue: VecDeque<(FileId, usize)> =
            root.effective_references().into_iter().map(|id| (id, 1)).collect();

        while let Some((id, depth)) = queue.pop_front() {
            if depth > self.max_depth || !visited.insert(id) {
                continue;
            }
            if id.is_virtual() {
                return Err(SyncError::Validation(format!(
                    "file {} references unpublished file {id}; publish it first",
                    root.id
                )));
            }
            let Some(state) = lookup(id) else { continue };
            if !state.is_dirty() {
                continue;
            }
            files.push(planned(&state)?);
            queue.extend(state.effective_references().into_iter().map(|r| (r, depth + 1)));
        }

        Ok(PublishPlan { root: root.id, files })
    }

    /// Send `files` (none virtual) as one save and return the saved ids
    ///
    /// A single file goes through `PATCH /api/files/{id}`, several through one
    /// batch save.
    ///
    /// # Errors
    /// The classified request failure, or [`SyncError::PartialPublish`] when
    /// the service confirms only a subset.
    pub async fn commit(&self, files: &[PlannedFile]) -> Result<Vec<FileId>, SyncError> {
        match files {
            [] => Ok(Vec::new()),
            [single] => {
                let request = SaveFileRequest {
                    name: single.payload.name.clone(),
                    path: single.payload.path.clone(),
                    content: single.payload.content.clone(),
                    references: single.payload.references.clone(),
                };
                tracing::info!(file = %single.payload.id, "saving file");
                self.api.save_file(single.payload.id, &request).await?;
                Ok(vec![single.payload.id])
            }
            many => {
                let request = BatchSaveRequest {
                    files: many.iter().map(|f| f.payload.clone()).collect(),
                    company_id: self.company_id,
                };
                let requested: Vec<FileId> = request.files.iter().map(|f| f.id).collect();
                tracing::info!(count = requested.len(), "batch saving files");

                let response = self.api.batch_save(&request).await?;
                check_saved(&requested, &response.saved_file_ids)?;
                Ok(requested)
            }
        }
    }

    /// Create a virtual file remotely
    ///
    /// # Errors
    /// [`SyncError::Conflict`] on name/path collisions, otherwise the
    /// classified request failure.
    pub async fn create(&self, state: &FileState) -> Result<Document, SyncError> {
        let content = state.persisted_content()?;
        let request = CreateFileRequest {
            name: state.effective_name().to_string(),
            path: state.effective_path().to_string(),
            file_type: content.file_type(),
            content: Value::Object(content.to_map()),
            references: state
                .effective_references()
                .into_iter()
                .filter(|id| !id.is_virtual())
                .collect(),
        };
        tracing::info!(virtual_id = %state.id, name = %request.name, "creating file");
        self.api.create_file(&request).await
    }
}

fn planned(state: &FileState) -> Result<PlannedFile, SyncError> {
    let content = state.persisted_content()?;
    Ok(PlannedFile {
        payload: BatchSaveFile {
            id: state.id,
            name: state.effective_name().to_string(),
            path: state.effective_path().to_string(),
            content: Value::Object(content.to_map()),
            references: state.effective_references(),
        },
        sent: state.snapshot_layers(),
    })
}

fn check_saved(requested: &[FileId], saved: &[FileId]) -> Result<(), SyncError> {
    let failed: Vec<FileId> = requested.iter().copied().filter(|id| !saved.contains(id)).collect();
    if failed.is_empty() {
        return Ok(());
    }
    tracing::warn!(?failed, "batch save confirmed only part of the request");
    Err(SyncError::PartialPublish {
        saved: requested.len() - failed.len(),
        requested: requested.len(),
        failed,
    })
}
