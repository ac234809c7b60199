//! Core types for docsync
//!
//! Defines the document model shared by every component:
//! - File identifiers (negative = virtual)
//! - Document types and the typed [`Document`]
//! - Listing summaries and edit payloads

use crate::content::FileContent;
use crate::error::ContentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Partial content: top-level keys overwrite the layer below
pub type ContentPatch = Map<String, Value>;

/// Document identifier; negative ids are virtual (not yet created remotely)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub i64);

impl FileId {
    /// Check if this id names a local-only file
    #[inline]
    #[must_use]
    pub const fn is_virtual(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for FileId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Document type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    /// Saved query
    Question,
    /// Grid of questions
    Dashboard,
    /// Scheduled digest
    Report,
    /// Condition on a question
    Alert,
    /// Container
    Folder,
    /// Settings document
    Config,
}

impl FileType {
    /// Wire name
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Question => "question",
            Self::Dashboard => "dashboard",
            Self::Report => "report",
            Self::Alert => "alert",
            Self::Folder => "folder",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "question" => Ok(Self::Question),
            "dashboard" => Ok(Self::Dashboard),
            "report" => Ok(Self::Report),
            "alert" => Ok(Self::Alert),
            "folder" => Ok(Self::Folder),
            "config" => Ok(Self::Config),
            other => Err(format!("unknown file type: {other}")),
        }
    }
}

/// A typed, addressable document
///
/// On the wire `type` and `content` are sibling keys; here they are fused
/// into one [`FileContent`] variant so content always matches its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireDocument", into = "WireDocument")]
pub struct Document {
    /// Identifier
    pub id: FileId,
    /// Display name
    pub name: String,
    /// Folder path
    pub path: String,
    /// Type-specific content
    pub content: FileContent,
    /// Ids of referenced documents
    pub references: Vec<FileId>,
    /// Creation time
    pub created_at: Option<DateTime<Utc>>,
    /// Last update time
    pub updated_at: Option<DateTime<Utc>>,
    /// Owning company
    pub company_id: Option<i64>,
}

impl Document {
    /// Document type
    #[inline]
    #[must_use]
    pub fn file_type(&self) -> FileType {
        self.content.file_type()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDocument {
    id: FileId,
    #[serde(default)]
    name: String,
    #[serde(default)]
    path: String,
    #[serde(rename = "type")]
    file_type: FileType,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    references: Vec<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    company_id: Option<i64>,
}

impl TryFrom<WireDocument> for Document {
    type Error = ContentError;

    fn try_from(wire: WireDocument) -> Result<Self, Self::Error> {
        let raw = match wire.content {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        Ok(Self {
            id: wire.id,
            name: wire.name,
            path: wire.path,
            content: FileContent::from_value(wire.file_type, raw)?,
            references: wire.references,
            created_at: wire.created_at,
            updated_at: wire.updated_at,
            company_id: wire.company_id,
        })
    }
}

impl From<Document> for WireDocument {
    fn from(doc: Document) -> Self {
        Self {
            id: doc.id,
            file_type: doc.file_type(),
            content: Value::Object(doc.content.to_map()),
            name: doc.name,
            path: doc.path,
            references: doc.references,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
            company_id: doc.company_id,
        }
    }
}

/// Metadata-only listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    /// Identifier
    pub id: FileId,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Folder path
    #[serde(default)]
    pub path: String,
    /// Document type
    #[serde(rename = "type")]
    pub file_type: FileType,
    /// Last update time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Unpublished name/path edits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataChanges {
    /// New name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl MetadataChanges {
    /// Check if nothing is pending
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.path.is_none()
    }

    /// Overlay `other` (set fields win)
    pub fn merge(&mut self, other: MetadataChanges) {
        if other.name.is_some() {
            self.name = other.name;
        }
        if other.path.is_some() {
            self.path = other.path;
        }
    }
}

/// Edit payload accepted by `edit_file`
///
/// `name`/`path` land in the metadata layer, `content` in the persistable
/// layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileChanges {
    /// New name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Content keys to overwrite
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub content: ContentPatch,
}

impl FileChanges {
    /// Content-only change
    #[inline]
    #[must_use]
    pub fn content(patch: ContentPatch) -> Self {
        Self {
            content: patch,
            ..Self::default()
        }
    }

    /// Set a single content key
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.content.insert(key.into(), value);
        self
    }

    /// With new name
    #[inline]
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// With new path
    #[inline]
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Split into metadata and content parts
    #[must_use]
    pub fn split(self) -> (MetadataChanges, ContentPatch) {
        (
            MetadataChanges {
                name: self.name,
                path: self.path,
            },
            self.content,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_wire_roundtrip_keeps_type_and_content() {
        let raw = json!({
            "id": 7,
            "name": "Revenue",
            "path": "/org/finance",
            "type": "question",
            "content": {
                "query": "SELECT 1",
                "database_name": "main",
                "vizSettings": {"type": "table"}
            },
            "references": [],
            "createdAt": "2024-01-01T00:00:00Z",
            "companyId": 3
        });

        let doc: Document = serde_json::from_value(raw).unwrap();
        assert_eq!(doc.id, FileId(7));
        assert_eq!(doc.file_type(), FileType::Question);
        assert_eq!(doc.company_id, Some(3));
        assert!(doc.created_at.is_some());

        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["type"], "question");
        assert_eq!(back["content"]["query"], "SELECT 1");
        assert_eq!(back["content"]["vizSettings"]["type"], "table");
    }

    #[test]
    fn null_content_builds_default_variant() {
        let doc: Document = serde_json::from_value(json!({
            "id": 1,
            "name": "f",
            "path": "/",
            "type": "folder",
            "content": null
        }))
        .unwrap();
        assert_eq!(doc.file_type(), FileType::Folder);
    }

    #[test]
    fn wrongly_typed_required_field_is_rejected() {
        let result: Result<Document, _> = serde_json::from_value(json!({
            "id": 1, "type": "question", "content": {"query": 42}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn file_changes_split() {
        let changes = FileChanges::default()
            .with_name("New")
            .set("query", json!("SELECT 2"));
        let (meta, content) = changes.split();
        assert_eq!(meta.name.as_deref(), Some("New"));
        assert!(meta.path.is_none());
        assert_eq!(content["query"], "SELECT 2");
    }

    #[test]
    fn metadata_merge_keeps_unset_fields() {
        let mut meta = MetadataChanges {
            name: Some("a".into()),
            path: None,
        };
        meta.merge(MetadataChanges {
            name: None,
            path: Some("/x".into()),
        });
        assert_eq!(meta.name.as_deref(), Some("a"));
        assert_eq!(meta.path.as_deref(), Some("/x"));
    }

    #[test]
    fn file_type_parse() {
        assert_eq!("dashboard".parse::<FileType>(), Ok(FileType::Dashboard));
        assert!("spreadsheet".parse::<FileType>().is_err());
        assert!(FileId(-5).is_virtual());
        assert!(!FileId(5).is_virtual());
    }
}
