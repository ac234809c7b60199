//! Per-file cache entry
//!
//! A [`FileState`] wraps the last-known remote [`Document`] with three
//! independent layers of unpublished change:
//!
//! - `persistable_changes`: content edits destined for the server
//! - `ephemeral_changes`: session-only content, never sent
//! - `metadata_changes`: name/path edits
//!
//! Effective content is `base` overlaid by persistable then ephemeral.

use crate::content::FileContent;
use crate::error::{LoadError, SyncError};
use crate::query::QueryKey;
use crate::types::{ContentPatch, Document, FileId, MetadataChanges};
use serde::Serialize;
use serde_json::Value;

/// Cache entry for one file
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileState {
    /// Identifier
    pub id: FileId,
    /// Last-known remote document; `None` until a load succeeds
    pub base: Option<Document>,
    /// Content edits destined for the server
    pub persistable_changes: ContentPatch,
    /// Session-only content
    pub ephemeral_changes: ContentPatch,
    /// Name/path edits
    pub metadata_changes: MetadataChanges,
    /// A load is in progress
    pub loading: bool,
    /// Last load failure
    pub load_error: Option<LoadError>,
    /// When `base` was fetched (ms)
    pub fetched_at: Option<u64>,
    /// Result-cache key of the effective question content
    pub query_key: Option<QueryKey>,
}

impl FileState {
    /// Entry for a freshly fetched document
    #[must_use]
    pub fn loaded(document: Document, now: u64) -> Self {
        let mut state = Self::pending(document.id);
        state.apply_document(document, now);
        state
    }

    /// Placeholder while the first load runs
    #[must_use]
    pub fn pending(id: FileId) -> Self {
        Self {
            id,
            base: None,
            persistable_changes: ContentPatch::new(),
            ephemeral_changes: ContentPatch::new(),
            metadata_changes: MetadataChanges::default(),
            loading: true,
            load_error: None,
            fetched_at: None,
            query_key: None,
        }
    }

    /// Has unpublished persistable or metadata edits
    #[inline]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.persistable_changes.is_empty() || !self.metadata_changes.is_empty()
    }

    /// Local-only file
    #[inline]
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.id.is_virtual()
    }

    /// Dirty, or virtual and therefore not yet created remotely
    #[inline]
    #[must_use]
    pub fn needs_publish(&self) -> bool {
        self.is_dirty() || self.is_virtual()
    }

    /// Fetched less than `ttl_ms` ago; virtual files are always fresh
    #[must_use]
    pub fn is_fresh(&self, now: u64, ttl_ms: u64) -> bool {
        if self.is_virtual() {
            return self.base.is_some();
        }
        match (self.base.as_ref(), self.fetched_at) {
            (Some(_), Some(at)) => now.saturating_sub(at) < ttl_ms,
            _ => false,
        }
    }

    /// Base content overlaid by persistable then ephemeral changes
    ///
    /// # Errors
    /// [`SyncError::FileNotLoaded`] without a base, or
    /// [`SyncError::InvalidContent`] if the layers no longer fit the type.
    pub fn effective_content(&self) -> Result<FileContent, SyncError> {
        let base = self.base.as_ref().ok_or(SyncError::FileNotLoaded(self.id))?;
        Ok(base
            .content
            .apply(&[&self.persistable_changes, &self.ephemeral_changes])?)
    }

    /// Content as it would be saved (ephemeral layer excluded)
    ///
    /// # Errors
    /// As [`effective_content`](Self::effective_content).
    pub fn persisted_content(&self) -> Result<FileContent, SyncError> {
        let base = self.base.as_ref().ok_or(SyncError::FileNotLoaded(self.id))?;
        Ok(base.content.apply(&[&self.persistable_changes])?)
    }

    /// Name with pending edit applied
    #[must_use]
    pub fn effective_name(&self) -> &str {
        self.metadata_changes
            .name
            .as_deref()
            .or_else(|| self.base.as_ref().map(|b| b.name.as_str()))
            .unwrap_or_default()
    }

    /// Path with pending edit applied
    #[must_use]
    pub fn effective_path(&self) -> &str {
        self.metadata_changes
            .path
            .as_deref()
            .or_else(|| self.base.as_ref().map(|b| b.path.as_str()))
            .unwrap_or_default()
    }

    /// Stored references plus ids named by the effective content
    #[must_use]
    pub fn effective_references(&self) -> Vec<FileId> {
        let mut refs: Vec<FileId> = self
            .base
            .as_ref()
            .map(|b| b.references.clone())
            .unwrap_or_default();
        if let Ok(content) = self.effective_content() {
            for id in content.content_references() {
                if !refs.contains(&id) {
                    refs.push(id);
                }
            }
        }
        refs
    }

    /// Replace the base after a fetch, keeping local change layers
    pub fn apply_document(&mut self, document: Document, now: u64) {
        self.id = document.id;
        self.base = Some(document);
        self.fetched_at = Some(now);
        self.loading = false;
        self.load_error = None;
        self.refresh_query_key();
    }

    /// Replace the base and discard every change layer
    pub fn reset_to(&mut self, document: Document, now: u64) {
        self.persistable_changes.clear();
        self.ephemeral_changes.clear();
        self.metadata_changes = MetadataChanges::default();
        self.apply_document(document, now);
    }

    /// Discard every change layer, keeping the base
    pub fn clear_changes(&mut self) {
        self.persistable_changes.clear();
        self.ephemeral_changes.clear();
        self.metadata_changes = MetadataChanges::default();
        self.refresh_query_key();
    }

    /// Record a failed load
    pub fn record_error(&mut self, error: LoadError) {
        self.loading = false;
        self.load_error = Some(error);
    }

    /// Merge an edit into the metadata and persistable layers
    ///
    /// Keys whose new value equals the base are dropped from the layer so an
    /// edit that restores the remote value leaves the file clean. Nothing is
    /// changed when the merged content would be invalid.
    ///
    /// # Errors
    /// [`SyncError::FileNotLoaded`] or [`SyncError::InvalidContent`].
    pub fn merge_edit(
        &mut self,
        metadata: MetadataChanges,
        content: ContentPatch,
    ) -> Result<(), SyncError> {
        let base = self.base.as_ref().ok_or(SyncError::FileNotLoaded(self.id))?;
        let base_map = base.content.to_map();

        let mut persistable = self.persistable_changes.clone();
        for (key, value) in content {
            if base_map.get(&key) == Some(&value) {
                persistable.remove(&key);
            } else {
                persistable.insert(key, value);
            }
        }
        base.content.apply(&[&persistable, &self.ephemeral_changes])?;

        let mut meta = self.metadata_changes.clone();
        meta.merge(metadata);
        if meta.name.as_deref() == Some(base.name.as_str()) {
            meta.name = None;
        }
        if meta.path.as_deref() == Some(base.path.as_str()) {
            meta.path = None;
        }

        self.persistable_changes = persistable;
        self.metadata_changes = meta;
        self.refresh_query_key();
        Ok(())
    }

    /// Merge session-only content
    ///
    /// # Errors
    /// [`SyncError::FileNotLoaded`] or [`SyncError::InvalidContent`].
    pub fn merge_ephemeral(&mut self, content: ContentPatch) -> Result<(), SyncError> {
        let base = self.base.as_ref().ok_or(SyncError::FileNotLoaded(self.id))?;
        let mut ephemeral = self.ephemeral_changes.clone();
        ephemeral.extend(content);
        base.content.apply(&[&self.persistable_changes, &ephemeral])?;
        self.ephemeral_changes = ephemeral;
        self.refresh_query_key();
        Ok(())
    }

    /// Fold a confirmed save into the base and drop the edits it covered
    ///
    /// Only keys still holding the value that was sent are cleared; edits
    /// made while the save was in flight stay pending.
    pub fn acknowledge_saved(&mut self, sent: &SentLayers) {
        if let Some(base) = self.base.as_mut() {
            match base.content.apply(&[&sent.content]) {
                Ok(content) => base.content = content,
                Err(e) => tracing::warn!(file = %self.id, "saved content no longer merges: {e}"),
            }
            if let Some(name) = &sent.metadata.name {
                base.name.clone_from(name);
            }
            if let Some(path) = &sent.metadata.path {
                base.path.clone_from(path);
            }
        }
        self.persistable_changes
            .retain(|key, value| sent.content.get(key) != Some(value));
        if self.metadata_changes.name.is_some() && self.metadata_changes.name == sent.metadata.name
        {
            self.metadata_changes.name = None;
        }
        if self.metadata_changes.path.is_some() && self.metadata_changes.path == sent.metadata.path
        {
            self.metadata_changes.path = None;
        }
        self.refresh_query_key();
    }

    /// Point references at `to` instead of `from`
    ///
    /// Covers stored references plus dashboard tiles and alert targets in
    /// both content change layers.
    pub fn replace_reference(&mut self, from: FileId, to: FileId) {
        if let Some(base) = self.base.as_mut() {
            for id in &mut base.references {
                if *id == from {
                    *id = to;
                }
            }
        }
        let (from, to) = (Value::from(from.0), Value::from(to.0));
        let mut changed = false;
        for layer in [&mut self.persistable_changes, &mut self.ephemeral_changes] {
            if let Some(Value::Array(assets)) = layer.get_mut("assets") {
                for asset in assets {
                    if let Some(id) = asset.get_mut("id").filter(|id| **id == from) {
                        *id = to.clone();
                        changed = true;
                    }
                }
            }
            if let Some(id) = layer.get_mut("questionId").filter(|id| **id == from) {
                *id = to.clone();
                changed = true;
            }
        }
        if changed {
            self.refresh_query_key();
        }
    }

    /// Layers as they are right now, for a later [`acknowledge_saved`](Self::acknowledge_saved)
    #[must_use]
    pub fn snapshot_layers(&self) -> SentLayers {
        SentLayers {
            content: self.persistable_changes.clone(),
            metadata: self.metadata_changes.clone(),
        }
    }

    /// Recompute `query_key` from the effective content
    pub fn refresh_query_key(&mut self) {
        self.query_key = self
            .effective_content()
            .ok()
            .and_then(|content| QueryKey::for_content(&content));
    }
}

/// Change layers included in a save request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SentLayers {
    /// Persistable changes sent
    pub content: ContentPatch,
    /// Metadata changes sent
    pub metadata: MetadataChanges,
}
