//! File state manager
//!
//! Central entity cache: one [`FileState`] per id, each holding the last-known
//! remote document plus its unpublished change layers.
//!
//! Read paths never fail: load failures are recorded on the affected entries
//! as [`LoadError`]s. Write paths (edit, publish, create, reload) return
//! [`SyncError`]s and leave pending edits intact on failure.
//!
//! Concurrent reads of overlapping ids share one in-flight load per id
//! through a [`PromiseManager`].

use crate::api::{FileCriteria, FileListing, FilesApi};
use crate::config::SyncConfig;
use crate::content::{FileContent, TemplateOptions};
use crate::error::{LoadError, SyncError};
use crate::publish::{PlannedFile, PublishCoordinator};
use crate::query::{QueryExecutor, QueryKey, QueryRequest, QueryResult};
use crate::state::{FileState, SentLayers};
use crate::types::{ContentPatch, Document, FileChanges, FileId, FileType};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use docsync_cache::clock::duration_ms;
use docsync_cache::{Clock, PromiseManager, RequestCache, Transport};
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Options for [`FileStateManager::read_files`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Freshness override; the per-type default applies when unset
    pub ttl: Option<Duration>,
    /// Serve only what is cached, never fetch
    pub skip: bool,
}

impl ReadOptions {
    /// With freshness override
    #[inline]
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Cache-only read
    #[inline]
    #[must_use]
    pub fn cached_only() -> Self {
        Self {
            ttl: None,
            skip: true,
        }
    }
}

/// Cached query result attached to a read
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedQueryResult {
    /// Question the result belongs to
    pub file_id: FileId,
    /// Result-cache key
    pub query_key: QueryKey,
    /// Result
    pub data: Arc<QueryResult>,
}

/// One file returned by [`FileStateManager::read_files`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedFile {
    /// The file
    pub file_state: FileState,
    /// Cached files it references, transitively up to the depth bound
    pub references: Vec<FileState>,
    /// Cached results for the file and referenced questions
    pub query_results: Vec<CachedQueryResult>,
}

/// Result of [`FileStateManager::read_files_by_criteria`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CriteriaResult {
    /// Metadata listing
    pub listing: FileListing,
    /// Full reads of the listed files (empty for partial reads)
    pub files: Vec<LoadedFile>,
    /// Listing failure
    pub error: Option<LoadError>,
}

/// Outcome of a publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedFile {
    /// Id after publish (server-assigned for created files)
    pub id: FileId,
    /// Name after publish
    pub name: String,
}

/// Options for [`FileStateManager::create_virtual_file`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualFileOptions {
    /// Folder the file will be created in
    pub folder: String,
    /// Name; defaults to `Untitled <type>`
    pub name: Option<String>,
    /// Database for questions
    pub database_name: Option<String>,
    /// Initial SQL for questions
    pub query: Option<String>,
    /// Caller-chosen negative id
    pub virtual_id: Option<FileId>,
}

impl VirtualFileOptions {
    /// New file in `folder`
    #[must_use]
    pub fn in_folder(folder: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            ..Self::default()
        }
    }

    /// With name
    #[inline]
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// With initial query and database
    #[inline]
    #[must_use]
    pub fn with_query(
        mut self,
        query: impl Into<String>,
        database_name: impl Into<String>,
    ) -> Self {
        self.query = Some(query.into());
        self.database_name = Some(database_name.into());
        self
    }

    /// With caller-chosen virtual id
    #[inline]
    #[must_use]
    pub fn with_virtual_id(mut self, id: FileId) -> Self {
        self.virtual_id = Some(id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    Fresh,
    Stale,
    Expired,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    Foreground,
    Background,
}

struct Inner {
    config: SyncConfig,
    api: FilesApi,
    queries: Arc<QueryExecutor>,
    publisher: PublishCoordinator,
    clock: Arc<dyn Clock>,
    store: DashMap<FileId, FileState>,
    loads: PromiseManager<FileId, (), SyncError>,
    revalidations: PromiseManager<FileId, (), SyncError>,
}

/// Entity cache and edit buffer for remote documents
///
/// Cheap to clone; clones share one store.
#[derive(Clone)]
pub struct FileStateManager {
    inner: Arc<Inner>,
}

impl FileStateManager {
    /// Create manager over existing API and query executor
    #[must_use]
    pub fn new(
        config: SyncConfig,
        api: FilesApi,
        queries: Arc<QueryExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let publisher =
            PublishCoordinator::new(api.clone(), config.company_id, config.max_reference_depth);
        Self {
            inner: Arc::new(Inner {
                config,
                api,
                queries,
                publisher,
                clock,
                store: DashMap::new(),
                loads: PromiseManager::new(),
                revalidations: PromiseManager::new(),
            }),
        }
    }

    /// Build the full stack (request cache, API, query executor) over `transport`
    #[must_use]
    pub fn connect(
        config: SyncConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = RequestCache::new(transport, Arc::clone(&clock), config.request_cache_capacity);
        let api = FilesApi::new(Arc::new(cache), config.endpoints);
        let queries = Arc::new(QueryExecutor::new(
            api.clone(),
            Arc::clone(&clock),
            config.query_cache_capacity,
        ));
        Self::new(config, api, queries, clock)
    }

    /// Configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Typed API
    #[inline]
    #[must_use]
    pub fn api(&self) -> &FilesApi {
        &self.inner.api
    }

    /// Query executor
    #[inline]
    #[must_use]
    pub fn queries(&self) -> &Arc<QueryExecutor> {
        &self.inner.queries
    }

    /// Snapshot of one entry
    #[must_use]
    pub fn get(&self, id: FileId) -> Option<FileState> {
        self.inner.store.get(&id).map(|s| s.value().clone())
    }

    /// Check if `id` has unpublished edits
    #[must_use]
    pub fn is_dirty(&self, id: FileId) -> bool {
        self.inner.store.get(&id).is_some_and(|s| s.is_dirty())
    }

    /// Ids with unpublished edits, ascending
    #[must_use]
    pub fn dirty_files(&self) -> Vec<FileId> {
        let mut ids: Vec<FileId> = self
            .inner
            .store
            .iter()
            .filter(|s| s.is_dirty())
            .map(|s| *s.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Drop every entry, query result and cached response
    pub fn clear(&self) {
        self.inner.store.clear();
        self.inner.loads.clear();
        self.inner.revalidations.clear();
        self.inner.queries.clear();
        self.inner.api.request_cache().clear();
    }

    /// Read files, fetching missing or stale ones in one batch
    ///
    /// Never fails: a failed batch records a [`LoadError`] on every id in it,
    /// and ids absent from a successful response get `NOT_FOUND`. With
    /// `skip`, only cached entries are returned.
    pub async fn read_files(&self, ids: &[FileId], options: ReadOptions) -> Vec<LoadedFile> {
        let ids = unique(ids);
        let now = self.now();

        let mut fetch = Vec::new();
        let mut revalidate = Vec::new();
        for &id in &ids {
            match self.freshness(id, now, options.ttl) {
                Freshness::Fresh => {}
                Freshness::Stale => revalidate.push(id),
                Freshness::Expired | Freshness::Missing => {
                    if !id.is_virtual() {
                        fetch.push(id);
                    }
                }
            }
        }

        if !options.skip {
            if !fetch.is_empty() {
                self.load(&fetch, LoadMode::Foreground).await;
            }
            if !revalidate.is_empty() {
                self.spawn_revalidation(revalidate);
            }
            self.load_missing_references(&ids).await;
        }

        let mut files = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(file) = self.assemble(id).await {
                files.push(file);
            }
        }
        files
    }

    /// List files by folder/type, then read them unless `partial`
    ///
    /// Never fails: a listing failure is returned in [`CriteriaResult::error`].
    pub async fn read_files_by_criteria(
        &self,
        criteria: &FileCriteria,
        partial: bool,
    ) -> CriteriaResult {
        let listing = match self.inner.api.list_files(criteria).await {
            Ok(listing) => listing,
            Err(err) => {
                tracing::warn!(?criteria, "listing failed: {err}");
                return CriteriaResult {
                    error: Some(LoadError::from(&err)),
                    ..CriteriaResult::default()
                };
            }
        };
        if partial {
            return CriteriaResult {
                listing,
                ..CriteriaResult::default()
            };
        }

        let ids: Vec<FileId> = listing.files.iter().map(|f| f.id).collect();
        let files = self.read_files(&ids, ReadOptions::default()).await;
        CriteriaResult {
            listing,
            files,
            error: None,
        }
    }

    /// Merge `changes` into the file's metadata and persistable layers
    ///
    /// Local only: no network call and no query execution.
    ///
    /// # Errors
    /// [`SyncError::FileNotLoaded`] for ids not in the store, or
    /// [`SyncError::InvalidContent`] if the edit breaks the content type (the
    /// layers are then unchanged).
    pub fn edit_file(&self, id: FileId, changes: FileChanges) -> Result<FileState, SyncError> {
        let (metadata, content) = changes.split();
        let mut entry = self.inner.store.get_mut(&id).ok_or(SyncError::FileNotLoaded(id))?;
        entry.merge_edit(metadata, content)?;
        tracing::debug!(file = %id, dirty = entry.is_dirty(), "edit applied");
        Ok(entry.clone())
    }

    /// Merge session-only content; never makes the file dirty
    ///
    /// # Errors
    /// As [`edit_file`](Self::edit_file).
    pub fn set_ephemeral_changes(
        &self,
        id: FileId,
        changes: ContentPatch,
    ) -> Result<FileState, SyncError> {
        let mut entry = self.inner.store.get_mut(&id).ok_or(SyncError::FileNotLoaded(id))?;
        entry.merge_ephemeral(changes)?;
        Ok(entry.clone())
    }

    /// Run a question's effective query and remember what ran
    ///
    /// The executed query, parameters and database are recorded under
    /// `lastExecuted` in the ephemeral layer.
    ///
    /// # Errors
    /// [`SyncError::FileNotLoaded`], [`SyncError::Validation`] for
    /// non-questions, or the query failure.
    pub async fn execute_question(&self, id: FileId) -> Result<Arc<QueryResult>, SyncError> {
        let state = self.get(id).ok_or(SyncError::FileNotLoaded(id))?;
        let content = state.effective_content()?;
        let question = content.as_question().ok_or_else(|| {
            SyncError::Validation(format!("file {id} is a {}, not a question", content.file_type()))
        })?;

        let references = state
            .effective_references()
            .into_iter()
            .filter(|r| !r.is_virtual())
            .collect();
        let request = QueryRequest::new(
            question.query.clone(),
            question.parameters.clone(),
            question.database_name.clone(),
        )
        .with_references(references);

        let executed = json!({
            "query": request.query,
            "parameters": request.parameters,
            "database_name": request.database_name,
        });
        let result = self.inner.queries.run_query(request).await?;

        let mut patch = ContentPatch::new();
        patch.insert("lastExecuted".to_string(), executed);
        self.set_ephemeral_changes(id, patch)?;
        Ok(result)
    }

    /// Publish a file and its dirty references
    ///
    /// A file without pending edits returns its current id and name with no
    /// network call. A virtual file is created and its entry moves to the
    /// server-assigned id before its dirty references are saved.
    ///
    /// # Errors
    /// [`SyncError::FileNotLoaded`], [`SyncError::Validation`] for virtual
    /// references, [`SyncError::PartialPublish`], or the request failure. On
    /// error no unsaved change layer is cleared. A virtual file whose
    /// creation succeeded stays under its new id even if saving its
    /// references then fails.
    pub async fn publish_file(&self, id: FileId) -> Result<PublishedFile, SyncError> {
        let root = self.get(id).ok_or(SyncError::FileNotLoaded(id))?;
        if root.base.is_none() {
            return Err(SyncError::FileNotLoaded(id));
        }
        if !root.needs_publish() {
            tracing::debug!(file = %id, "nothing to publish");
            return Ok(PublishedFile {
                id,
                name: root.effective_name().to_string(),
            });
        }

        let plan = self.inner.publisher.plan(&root, |r| self.get(r))?;
        tracing::info!(file = %id, files = ?plan.ids(), "publishing");

        let published = if root.is_virtual() {
            let sent = plan
                .files
                .into_iter()
                .find(|f| f.payload.id == id)
                .map(|f| f.sent)
                .unwrap_or_default();
            let created = self.inner.publisher.create(&root).await?;
            let published = self.promote(id, created, &sent);
            self.inner.api.invalidate_listings();
            self.save_references(published.id).await?;
            published
        } else {
            let saved = self.inner.publisher.commit(&plan.files).await?;
            self.acknowledge(&plan.files, &saved);
            self.inner.api.invalidate_listings();
            let name = self.get(id).map_or_else(
                || root.effective_name().to_string(),
                |s| s.effective_name().to_string(),
            );
            PublishedFile { id, name }
        };

        Ok(published)
    }

    /// Save the dirty references of a just-created file
    ///
    /// Planned after promotion so the payloads carry the server id. On
    /// failure the file stays promoted and the references keep their edits.
    async fn save_references(&self, id: FileId) -> Result<(), SyncError> {
        let Some(root) = self.get(id) else {
            return Ok(());
        };
        let plan = self.inner.publisher.plan(&root, |r| self.get(r))?;
        let references: Vec<PlannedFile> =
            plan.files.into_iter().filter(|f| f.payload.id != id).collect();
        if references.is_empty() {
            return Ok(());
        }

        match self.inner.publisher.commit(&references).await {
            Ok(saved) => {
                self.acknowledge(&references, &saved);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(file = %id, "file created but its references were not saved: {err}");
                Err(err)
            }
        }
    }

    /// Fetch the file bypassing every cache and discard all change layers
    ///
    /// `silent` suppresses the `loading` flag. Virtual files only have their
    /// layers cleared.
    ///
    /// # Errors
    /// [`SyncError::FileNotLoaded`] for unknown virtual ids, or the fetch
    /// failure (also recorded on the entry).
    pub async fn reload_file(&self, id: FileId, silent: bool) -> Result<FileState, SyncError> {
        if id.is_virtual() {
            return self.clear_file_changes(id);
        }
        if !silent {
            self.mark_loading(&[id]);
        }

        match self.inner.api.load_file(id, true).await {
            Ok(loaded) => {
                let now = self.now();
                for doc in loaded.references {
                    self.store_document(doc, now);
                }
                let doc = loaded.files.into_iter().next().ok_or(SyncError::NotFound(id))?;
                let state = match self.inner.store.entry(id) {
                    Entry::Occupied(mut occupied) => {
                        occupied.get_mut().reset_to(doc, now);
                        occupied.get().clone()
                    }
                    Entry::Vacant(vacant) => vacant.insert(FileState::loaded(doc, now)).clone(),
                };
                tracing::info!(file = %id, "file reloaded; local changes discarded");
                Ok(state)
            }
            Err(err) => {
                tracing::warn!(file = %id, "reload failed: {err}");
                self.record_error(id, LoadError::from(&err));
                Err(err)
            }
        }
    }

    /// Discard every change layer, keeping the base; no network call
    ///
    /// # Errors
    /// [`SyncError::FileNotLoaded`] for ids not in the store.
    pub fn clear_file_changes(&self, id: FileId) -> Result<FileState, SyncError> {
        let mut entry = self.inner.store.get_mut(&id).ok_or(SyncError::FileNotLoaded(id))?;
        entry.clear_changes();
        Ok(entry.clone())
    }

    /// Seed a local-only file from the type's template
    ///
    /// # Errors
    /// [`SyncError::Validation`] for a non-negative `virtual_id`, or
    /// [`SyncError::Conflict`] if it is already taken.
    pub fn create_virtual_file(
        &self,
        file_type: FileType,
        options: VirtualFileOptions,
    ) -> Result<FileState, SyncError> {
        let now = self.now();
        let id = match options.virtual_id {
            Some(id) if !id.is_virtual() => {
                return Err(SyncError::Validation(format!(
                    "virtual ids must be negative, got {id}"
                )));
            }
            Some(id) if self.inner.store.contains_key(&id) => {
                return Err(SyncError::Conflict(format!("virtual id {id} is already in use")));
            }
            Some(id) => id,
            None => self.allocate_virtual_id(now),
        };

        let content = FileContent::template(
            file_type,
            &TemplateOptions {
                database_name: options.database_name,
                query: options.query,
            },
        );
        let document = Document {
            id,
            name: options.name.unwrap_or_else(|| format!("Untitled {file_type}")),
            path: options.folder,
            content,
            references: Vec::new(),
            created_at: None,
            updated_at: None,
            company_id: self.inner.config.company_id,
        };

        let state = FileState::loaded(document, now);
        self.inner.store.insert(id, state.clone());
        tracing::debug!(file = %id, %file_type, "virtual file created");
        Ok(state)
    }

    fn now(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    fn freshness(&self, id: FileId, now: u64, ttl: Option<Duration>) -> Freshness {
        let Some(state) = self.inner.store.get(&id) else {
            return Freshness::Missing;
        };
        let Some(base) = state.base.as_ref() else {
            return Freshness::Missing;
        };
        if state.is_virtual() {
            return Freshness::Fresh;
        }

        let ttl = ttl.unwrap_or_else(|| self.inner.config.ttl.for_type(base.file_type()));
        let ttl_ms = duration_ms(ttl);
        if state.is_fresh(now, ttl_ms) {
            return Freshness::Fresh;
        }

        let swr = self.inner.config.stale_while_revalidate_ms;
        let fetched_at = state.fetched_at.unwrap_or(0);
        if swr > 0 && now < fetched_at.saturating_add(ttl_ms).saturating_add(swr) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    // Foreground readers never join a revalidation; its failures are only logged.
    async fn load(&self, ids: &[FileId], mode: LoadMode) {
        let promises = match mode {
            LoadMode::Foreground => &self.inner.loads,
            LoadMode::Background => &self.inner.revalidations,
        };
        let manager = self.clone();
        let pending = promises.execute_batch(ids, move |missing| async move {
            manager.fetch_batch(missing, mode).await;
            Ok(())
        });
        join_all(pending).await;
    }

    async fn fetch_batch(&self, ids: Vec<FileId>, mode: LoadMode) {
        if mode == LoadMode::Foreground {
            self.mark_loading(&ids);
        }
        tracing::info!(count = ids.len(), ?mode, "loading files");

        match self.inner.api.load_files(&ids).await {
            Ok(loaded) => {
                let now = self.now();
                let found: HashSet<FileId> = loaded.files.iter().map(|d| d.id).collect();
                for doc in loaded.files.into_iter().chain(loaded.references) {
                    self.store_document(doc, now);
                }
                for id in ids.into_iter().filter(|id| !found.contains(id)) {
                    match mode {
                        LoadMode::Foreground => self.record_error(id, LoadError::not_found(id)),
                        LoadMode::Background => {
                            tracing::warn!(file = %id, "file vanished during revalidation");
                        }
                    }
                }
            }
            Err(err) => match mode {
                LoadMode::Foreground => {
                    tracing::warn!(?ids, "batch load failed: {err}");
                    let error = LoadError::from(&err);
                    for id in ids {
                        self.record_error(id, error.clone());
                    }
                }
                LoadMode::Background => {
                    tracing::warn!(?ids, "background revalidation failed: {err}");
                }
            },
        }
    }

    fn spawn_revalidation(&self, ids: Vec<FileId>) {
        let ids: Vec<FileId> =
            ids.into_iter().filter(|id| !self.inner.loads.is_pending(id)).collect();
        if ids.is_empty() {
            return;
        }
        tracing::debug!(?ids, "serving stale files; revalidating in background");
        let manager = self.clone();
        tokio::spawn(async move {
            manager.load(&ids, LoadMode::Background).await;
        });
    }

    async fn load_missing_references(&self, roots: &[FileId]) {
        let mut visited: HashSet<FileId> = roots.iter().copied().collect();
        let mut frontier: Vec<FileId> = roots.to_vec();

        for _ in 0..self.inner.config.max_reference_depth {
            let mut next = Vec::new();
            let mut missing = Vec::new();
            for id in &frontier {
                for r in self.references_of(*id) {
                    if !visited.insert(r) {
                        continue;
                    }
                    next.push(r);
                    if !r.is_virtual()
                        && self.freshness(r, self.now(), None) == Freshness::Missing
                    {
                        missing.push(r);
                    }
                }
            }
            if !missing.is_empty() {
                self.load(&missing, LoadMode::Foreground).await;
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
    }

    fn references_of(&self, id: FileId) -> Vec<FileId> {
        self.inner
            .store
            .get(&id)
            .map(|s| s.effective_references())
            .unwrap_or_default()
    }

    async fn assemble(&self, id: FileId) -> Option<LoadedFile> {
        let file_state = self.get(id)?;
        let mut query_results = Vec::new();
        self.attach_query_result(&file_state, &mut query_results).await;

        let mut references = Vec::new();
        let mut visited: HashSet<FileId> = HashSet::from([id]);
        let mut queue: VecDeque<(FileId, usize)> =
            file_state.effective_references().into_iter().map(|r| (r, 1)).collect();

        while let Some((r, depth)) = queue.pop_front() {
            if depth > self.inner.config.max_reference_depth || !visited.insert(r) {
                continue;
            }
            let Some(state) = self.get(r) else { continue };
            self.attach_query_result(&state, &mut query_results).await;
            queue.extend(state.effective_references().into_iter().map(|n| (n, depth + 1)));
            references.push(state);
        }

        Some(LoadedFile {
            file_state,
            references,
            query_results,
        })
    }

    async fn attach_query_result(&self, state: &FileState, out: &mut Vec<CachedQueryResult>) {
        let Some(query_key) = state.query_key else { return };
        if let Some(data) = self.inner.queries.cached_result(&query_key).await {
            out.push(CachedQueryResult {
                file_id: state.id,
                query_key,
                data,
            });
        }
    }

    fn store_document(&self, doc: Document, now: u64) {
        match self.inner.store.entry(doc.id) {
            Entry::Occupied(mut occupied) => occupied.get_mut().apply_document(doc, now),
            Entry::Vacant(vacant) => {
                vacant.insert(FileState::loaded(doc, now));
            }
        }
    }

    fn mark_loading(&self, ids: &[FileId]) {
        for &id in ids {
            self.inner
                .store
                .entry(id)
                .or_insert_with(|| FileState::pending(id))
                .loading = true;
        }
    }

    fn record_error(&self, id: FileId, error: LoadError) {
        self.inner
            .store
            .entry(id)
            .or_insert_with(|| FileState::pending(id))
            .record_error(error);
    }

    fn acknowledge(&self, files: &[PlannedFile], saved: &[FileId]) {
        for file in files.iter().filter(|f| saved.contains(&f.payload.id)) {
            if let Some(mut entry) = self.inner.store.get_mut(&file.payload.id) {
                entry.acknowledge_saved(&file.sent);
            }
        }
    }

    fn promote(&self, virtual_id: FileId, created: Document, sent: &SentLayers) -> PublishedFile {
        let now = self.now();
        let new_id = created.id;
        let mut state = FileState::loaded(created, now);

        if let Some((_, mut previous)) = self.inner.store.remove(&virtual_id) {
            previous.acknowledge_saved(sent);
            state.persistable_changes = previous.persistable_changes;
            state.ephemeral_changes = previous.ephemeral_changes;
            state.metadata_changes = previous.metadata_changes;
            state.refresh_query_key();
        }

        for mut entry in self.inner.store.iter_mut() {
            entry.replace_reference(virtual_id, new_id);
        }

        let published = PublishedFile {
            id: new_id,
            name: state.effective_name().to_string(),
        };
        self.inner.store.insert(new_id, state);
        tracing::info!(virtual_id = %virtual_id, file = %new_id, "virtual file promoted");
        published
    }

    fn allocate_virtual_id(&self, now: u64) -> FileId {
        let mut candidate = -i64::try_from(now.max(1)).unwrap_or(i64::MAX);
        while self.inner.store.contains_key(&FileId(candidate)) {
            candidate -= 1;
        }
        FileId(candidate)
    }
}

impl std::fmt::Debug for FileStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStateManager")
            .field("files", &self.inner.store.len())
            .field("pending_loads", &self.inner.loads.pending_count())
            .field("pending_revalidations", &self.inner.revalidations.pending_count())
            .field("queries", &self.inner.queries)
            .finish_non_exhaustive()
    }
}

fn unique(ids: &[FileId]) -> Vec<FileId> {
    let mut seen = HashSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}
