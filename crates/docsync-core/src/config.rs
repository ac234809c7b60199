//! docsync configuration
//!
//! Loaded from TOML, optionally overlaid by `DOCSYNC_*` environment
//! variables, and adjusted with builder-style `with_*` methods.

use crate::types::FileType;
use docsync_cache::CacheStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config {path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// TOML did not parse
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Environment variable held an unusable value
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Variable name
        key: String,
        /// Offending value
        value: String,
    },
}

/// Default freshness per document type, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlPolicy {
    /// Questions
    pub question_ms: u64,
    /// Dashboards
    pub dashboard_ms: u64,
    /// Folders
    pub folder_ms: u64,
    /// Every other type
    pub default_ms: u64,
}

impl TtlPolicy {
    /// TTL for a document type
    #[must_use]
    pub fn for_type(&self, file_type: FileType) -> Duration {
        let ms = match file_type {
            FileType::Question => self.question_ms,
            FileType::Dashboard => self.dashboard_ms,
            FileType::Folder => self.folder_ms,
            FileType::Report | FileType::Alert | FileType::Config => self.default_ms,
        };
        Duration::from_millis(ms)
    }

    /// TTL when the type is not known yet
    #[inline]
    #[must_use]
    pub fn fallback(&self) -> Duration {
        Duration::from_millis(self.default_ms)
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            question_ms: 60_000,
            dashboard_ms: 60_000,
            folder_ms: 30_000,
            default_ms: 120_000,
        }
    }
}

/// Cache strategies of the cacheable endpoints
///
/// Writes and query execution always bypass the response cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointStrategies {
    /// `POST /api/files/batch`
    pub load_files: CacheStrategy,
    /// `GET /api/files/{id}`
    pub load_file: CacheStrategy,
    /// `GET /api/files?paths=&type=&depth=`
    pub list_files: CacheStrategy,
}

impl Default for EndpointStrategies {
    fn default() -> Self {
        Self {
            // Freshness of file content is owned by the file state manager
            load_files: CacheStrategy::NONE.deduplicated(),
            load_file: CacheStrategy::NONE.deduplicated(),
            list_files: CacheStrategy::with_ttl(Duration::from_secs(30))
                .deduplicated()
                .with_stale_while_revalidate(Duration::from_secs(60)),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Service base URL
    pub base_url: String,
    /// Company sent with batch saves
    pub company_id: Option<i64>,
    /// Default freshness per type
    pub ttl: TtlPolicy,
    /// Window past expiry in which a stale file is served while it refreshes
    /// in the background (0 = disabled)
    pub stale_while_revalidate_ms: u64,
    /// Depth bound for reference loading, augmentation and publish cascade
    pub max_reference_depth: usize,
    /// Maximum stored responses
    pub request_cache_capacity: u64,
    /// Maximum stored query results
    pub query_cache_capacity: u64,
    /// Endpoint cache strategies
    pub endpoints: EndpointStrategies,
}

impl SyncConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse TOML
    ///
    /// # Errors
    /// [`ConfigError::Parse`] on malformed input.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a TOML file
    ///
    /// # Errors
    /// [`ConfigError::Io`] or [`ConfigError::Parse`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Overlay `DOCSYNC_BASE_URL`, `DOCSYNC_COMPANY_ID` and
    /// `DOCSYNC_STALE_WHILE_REVALIDATE_MS` from the environment
    ///
    /// # Errors
    /// [`ConfigError::InvalidValue`] when a numeric variable does not parse.
    pub fn from_env(self) -> Result<Self, ConfigError> {
        self.overlay(|key| std::env::var(key).ok())
    }

    fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(url) = lookup("DOCSYNC_BASE_URL") {
            self.base_url = url;
        }
        if let Some(raw) = lookup("DOCSYNC_COMPANY_ID") {
            self.company_id = Some(parse_env("DOCSYNC_COMPANY_ID", &raw)?);
        }
        if let Some(raw) = lookup("DOCSYNC_STALE_WHILE_REVALIDATE_MS") {
            self.stale_while_revalidate_ms = parse_env("DOCSYNC_STALE_WHILE_REVALIDATE_MS", &raw)?;
        }
        Ok(self)
    }

    /// With service base URL
    #[inline]
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// With company id
    #[inline]
    #[must_use]
    pub fn with_company_id(mut self, company_id: i64) -> Self {
        self.company_id = Some(company_id);
        self
    }

    /// With TTL policy
    #[inline]
    #[must_use]
    pub fn with_ttl(mut self, ttl: TtlPolicy) -> Self {
        self.ttl = ttl;
        self
    }

    /// With stale-while-revalidate window for file reads
    #[inline]
    #[must_use]
    pub fn with_stale_while_revalidate(mut self, window: Duration) -> Self {
        self.stale_while_revalidate_ms = docsync_cache::clock::duration_ms(window);
        self
    }

    /// With reference depth bound
    #[inline]
    #[must_use]
    pub fn with_max_reference_depth(mut self, depth: usize) -> Self {
        self.max_reference_depth = depth;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            company_id: None,
            ttl: TtlPolicy::default(),
            stale_while_revalidate_ms: 0,
            max_reference_depth: 4,
            request_cache_capacity: 1_000,
            query_cache_capacity: 500,
            endpoints: EndpointStrategies::default(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = SyncConfig::new();
        assert_eq!(config.max_reference_depth, 4);
        assert_eq!(config.ttl.for_type(FileType::Folder), Duration::from_secs(30));
        assert_eq!(config.ttl.for_type(FileType::Alert), Duration::from_secs(120));
        assert!(config.endpoints.list_files.deduplicate);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            base_url = "https://bi.example.com"
            company_id = 9

            [ttl]
            question_ms = 5000

            [endpoints.list_files]
            ttl_ms = 1000
            deduplicate = true
            "#,
        )
        .unwrap();

        assert_eq!(config.base_url, "https://bi.example.com");
        assert_eq!(config.company_id, Some(9));
        assert_eq!(config.ttl.question_ms, 5_000);
        assert_eq!(config.ttl.dashboard_ms, 60_000);
        assert_eq!(config.endpoints.list_files.ttl_ms, 1_000);
        assert_eq!(config.endpoints.list_files.stale_while_revalidate_ms, None);
        assert_eq!(config.max_reference_depth, 4);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docsync.toml");
        std::fs::write(&path, "stale_while_revalidate_ms = 250\n").unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.stale_while_revalidate_ms, 250);

        assert!(matches!(
            SyncConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("DOCSYNC_BASE_URL", "http://svc:8080"),
            ("DOCSYNC_COMPANY_ID", "12"),
        ]
        .into_iter()
        .collect();

        let config = SyncConfig::new()
            .overlay(|k| vars.get(k).map(|v| (*v).to_string()))
            .unwrap();
        assert_eq!(config.base_url, "http://svc:8080");
        assert_eq!(config.company_id, Some(12));

        let bad =
            SyncConfig::new().overlay(|k| (k == "DOCSYNC_COMPANY_ID").then(|| "abc".to_string()));
        assert!(matches!(bad, Err(ConfigError::InvalidValue { .. })));
    }
}
