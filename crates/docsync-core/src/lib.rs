//! docsync core - client-side sync for remote documents
//!
//! Keeps an in-memory entity cache of remote documents and their unpublished
//! edits:
//! - Reads documents with per-type freshness and optional stale-while-revalidate
//! - Tracks content, session-only and metadata edits as separate layers
//! - Executes queries once per distinct request
//! - Publishes a document and its dirty references in one save
//!
//! # Example
//!
//! ```rust,ignore
//! use docsync_core::prelude::*;
//! use docsync_cache::{ReqwestTransport, SystemClock};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), docsync_core::SyncError> {
//! let config = SyncConfig::new().with_base_url("http://localhost:3000");
//! let transport = Arc::new(ReqwestTransport::new(config.base_url.clone()));
//! let files = FileStateManager::connect(config, transport, Arc::new(SystemClock));
//!
//! files.read_files(&[FileId(1)], ReadOptions::default()).await;
//! files.edit_file(FileId(1), FileChanges::default().set("query", "SELECT 2".into()))?;
//! let published = files.publish_file(FileId(1)).await?;
//! println!("published {}", published.name);
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![warn(missing_docs)]

pub mod api;
pub mod config;
pub mod content;
pub mod error;
pub mod manager;
pub mod publish;
pub mod query;
pub mod state;
pub mod types;

pub use api::{
    CreateFileRequest, FileCriteria, FileListing, FilesApi, LoadedDocuments, SaveFileRequest,
};
pub use config::{ConfigError, EndpointStrategies, SyncConfig, TtlPolicy};
pub use content::{
    AlertContent, ConfigContent, DashboardAsset, DashboardContent, FileContent, FolderContent,
    QueryParameter, QuestionContent, ReportContent, TemplateOptions,
};
pub use error::{ContentError, LoadError, LoadErrorCode, SyncError};
pub use manager::{
    CachedQueryResult, CriteriaResult, FileStateManager, LoadedFile, PublishedFile, ReadOptions,
    VirtualFileOptions,
};
pub use publish::{
    BatchSaveFile, BatchSaveRequest, BatchSaveResponse, PlannedFile, PublishCoordinator,
    PublishPlan,
};
pub use query::{
    normalize_query, QueryExecutor, QueryKey, QueryRequest, QueryResult, QueryResultEntry,
};
pub use state::{FileState, SentLayers};
pub use types::{
    ContentPatch, Document, FileChanges, FileId, FileSummary, FileType, MetadataChanges,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with docsync
    pub use crate::{
        FileChanges, FileCriteria, FileId, FileState, FileStateManager, FileType, ReadOptions,
        SyncConfig, SyncError, VirtualFileOptions,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
