//! Deduplicated query execution
//!
//! [`QueryExecutor::run_query`] executes each distinct
//! `(query, parameters, database)` once: cached results are returned without
//! a network call, and concurrent callers for an uncached key share a single
//! in-flight request through the [`PromiseManager`].

use crate::api::FilesApi;
use crate::content::{FileContent, QueryParameter};
use crate::error::SyncError;
use crate::types::FileId;
use docsync_cache::{Clock, PromiseManager};
use moka::future::Cache;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

/// Hash of normalized query text, parameters and database (Blake3)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryKey([u8; 32]);

impl QueryKey {
    /// Compute the key for a query request
    ///
    /// Query text is whitespace-normalized so formatting-only differences
    /// share a cache entry.
    #[must_use]
    pub fn compute(query: &str, parameters: &[QueryParameter], database_name: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(normalize_query(query).as_bytes());
        hasher.update(&[0]);
        hasher.update(database_name.as_bytes());
        hasher.update(&[0]);
        hasher.update(&serde_json::to_vec(parameters).unwrap_or_default());
        Self(*hasher.finalize().as_bytes())
    }

    /// Key derived from a question's effective content
    #[must_use]
    pub fn for_content(content: &FileContent) -> Option<Self> {
        content
            .as_question()
            .map(|q| Self::compute(&q.query, &q.parameters, &q.database_name))
    }

    /// Short string representation (first 16 hex chars)
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl Display for QueryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({})", self.short())
    }
}

impl Serialize for QueryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for QueryKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("query key must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

/// Collapse whitespace runs outside quoted literals and trim
///
/// Text between matching `'` or `"` quotes is kept verbatim. A doubled quote
/// (`'it''s'`) closes and reopens the literal, so it survives unchanged.
#[must_use]
pub fn normalize_query(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for c in query.chars() {
        match quote {
            Some(open) => {
                out.push(c);
                if c == open {
                    quote = None;
                }
            }
            None if c.is_whitespace() => pending_space = !out.is_empty(),
            None => {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }
    out
}

/// Body of `POST /api/query`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Target database
    pub database_name: String,
    /// SQL text
    pub query: String,
    /// Bound parameters
    #[serde(default)]
    pub parameters: Vec<QueryParameter>,
    /// Files the query depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<FileId>,
}

impl QueryRequest {
    /// Request without references
    #[must_use]
    pub fn new(
        query: impl Into<String>,
        parameters: Vec<QueryParameter>,
        database_name: impl Into<String>,
    ) -> Self {
        Self {
            database_name: database_name.into(),
            query: query.into(),
            parameters,
            references: Vec::new(),
        }
    }

    /// With referenced files
    #[inline]
    #[must_use]
    pub fn with_references(mut self, references: Vec<FileId>) -> Self {
        self.references = references;
        self
    }

    /// Cache key of this request
    #[inline]
    #[must_use]
    pub fn key(&self) -> QueryKey {
        QueryKey::compute(&self.query, &self.parameters, &self.database_name)
    }
}

/// Tabular query result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names
    #[serde(default)]
    pub columns: Vec<String>,
    /// Column types
    #[serde(default)]
    pub types: Vec<String>,
    /// Row values
    #[serde(default)]
    pub rows: Vec<Value>,
}

/// Result cache entry; an error entry is kept for display but is never a hit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResultEntry {
    /// Result of the last successful run
    pub data: Option<Arc<QueryResult>>,
    /// Message of the last failed run
    pub error: Option<String>,
    /// When the run settled (ms)
    pub fetched_at: u64,
}

/// Executes queries at most once per distinct request
pub struct QueryExecutor {
    api: FilesApi,
    clock: Arc<dyn Clock>,
    results: Cache<QueryKey, QueryResultEntry>,
    inflight: PromiseManager<QueryKey, Arc<QueryResult>, SyncError>,
}

impl QueryExecutor {
    /// Create executor keeping at most `max_capacity` results
    #[must_use]
    pub fn new(api: FilesApi, clock: Arc<dyn Clock>, max_capacity: u64) -> Self {
        Self {
            api,
            clock,
            results: Cache::new(max_capacity),
            inflight: PromiseManager::new(),
        }
    }

    /// Run a query, serving cached results and joining in-flight runs
    ///
    /// # Errors
    /// The failure of the underlying request, identical for every caller that
    /// joined it. Failures are not served from cache on later calls.
    pub async fn run_query(&self, request: QueryRequest) -> Result<Arc<QueryResult>, SyncError> {
        let key = request.key();

        if let Some(data) = self.cached_result(&key).await {
            tracing::debug!(key = %key.short(), "query result served from cache");
            return Ok(data);
        }

        let api = self.api.clone();
        let results = self.results.clone();
        let clock = Arc::clone(&self.clock);

        self.inflight
            .execute(key, move || async move {
                tracing::info!(
                    key = %key.short(),
                    database = %request.database_name,
                    "executing query"
                );
                match api.execute_query(&request).await {
                    Ok(data) => {
                        let data = Arc::new(data);
                        let entry = QueryResultEntry {
                            data: Some(Arc::clone(&data)),
                            error: None,
                            fetched_at: clock.now_ms(),
                        };
                        results.insert(key, entry).await;
                        Ok(data)
                    }
                    Err(err) => {
                        let entry = QueryResultEntry {
                            data: None,
                            error: Some(err.to_string()),
                            fetched_at: clock.now_ms(),
                        };
                        results.insert(key, entry).await;
                        Err(err)
                    }
                }
            })
            .await
    }

    /// Entry for `key` including recorded errors; never executes
    pub async fn lookup(&self, key: &QueryKey) -> Option<QueryResultEntry> {
        self.results.get(key).await
    }

    /// Successful result for `key`; never executes
    pub async fn cached_result(&self, key: &QueryKey) -> Option<Arc<QueryResult>> {
        self.results.get(key).await.and_then(|entry| entry.data)
    }

    /// Check if a run for `key` is in flight
    #[inline]
    #[must_use]
    pub fn is_running(&self, key: &QueryKey) -> bool {
        self.inflight.is_pending(key)
    }

    /// Drop the result for `key`
    pub async fn invalidate(&self, key: &QueryKey) {
        self.results.invalidate(key).await;
    }

    /// Drop all results and forget in-flight runs
    pub fn clear(&self) {
        self.results.invalidate_all();
        self.inflight.clear();
    }
}

impl fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("entries", &self.results.entry_count())
            .field("inflight", &self.inflight)
            .finish_non_exhaustive()
    }
}
