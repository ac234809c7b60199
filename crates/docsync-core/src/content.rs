//! Type-specific document content
//!
//! One variant per [`FileType`]. Effective content is computed by
//! [`FileContent::apply`]: the base is flattened to its top-level keys, each
//! layer overwrites keys, and the result is rebuilt as the same variant. A
//! layer that would null out or mistype a field fails the rebuild instead of
//! silently dropping it.

use crate::error::ContentError;
use crate::types::{ContentPatch, FileId, FileType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Named query parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryParameter {
    /// Parameter name as referenced in the query
    pub name: String,
    /// Declared type (`text`, `number`, `date`, ...)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Current value
    #[serde(default)]
    pub value: Value,
    /// Unmodelled keys
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QueryParameter {
    /// Parameter with a value and no declared type
    #[must_use]
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            kind: None,
            value,
            extra: Map::new(),
        }
    }
}

/// Content of a question
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestionContent {
    /// SQL text
    #[serde(default)]
    pub query: String,
    /// Target database
    #[serde(default)]
    pub database_name: String,
    /// Bound parameters
    #[serde(default)]
    pub parameters: Vec<QueryParameter>,
    /// Visualization settings
    #[serde(rename = "vizSettings", default, skip_serializing_if = "Value::is_null")]
    pub viz_settings: Value,
    /// Unmodelled keys
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One tile on a dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardAsset {
    /// Asset kind (`question`, `text`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Referenced file for question tiles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<FileId>,
    /// Unmodelled keys
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DashboardAsset {
    /// Question tile
    #[must_use]
    pub fn question(id: FileId) -> Self {
        Self {
            kind: FileType::Question.as_str().to_string(),
            id: Some(id),
            extra: Map::new(),
        }
    }
}

/// Content of a dashboard
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardContent {
    /// Tiles
    #[serde(default)]
    pub assets: Vec<DashboardAsset>,
    /// Grid layout
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub layout: Value,
    /// Unmodelled keys
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DashboardContent {
    /// Ids of question tiles
    #[must_use]
    pub fn question_ids(&self) -> Vec<FileId> {
        self.assets
            .iter()
            .filter(|a| a.kind == FileType::Question.as_str())
            .filter_map(|a| a.id)
            .collect()
    }
}

/// Content of a report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportContent {
    /// Cron-like schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Delivery addresses
    #[serde(default)]
    pub emails: Vec<String>,
    /// Unmodelled keys
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Content of an alert
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertContent {
    /// Watched question
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<FileId>,
    /// Trigger condition
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub condition: Value,
    /// Notification targets
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Unmodelled keys
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Content of a folder
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FolderContent {
    /// Free-text description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Unmodelled keys
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Content of a config document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigContent {
    /// Settings
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

/// Content tagged by document type
#[derive(Debug, Clone, PartialEq)]
pub enum FileContent {
    /// Question
    Question(QuestionContent),
    /// Dashboard
    Dashboard(DashboardContent),
    /// Report
    Report(ReportContent),
    /// Alert
    Alert(AlertContent),
    /// Folder
    Folder(FolderContent),
    /// Config
    Config(ConfigContent),
}

/// Seed values for a locally created file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateOptions {
    /// Database for questions
    pub database_name: Option<String>,
    /// Initial SQL for questions
    pub query: Option<String>,
}

impl FileContent {
    /// Document type of this variant
    #[must_use]
    pub fn file_type(&self) -> FileType {
        match self {
            Self::Question(_) => FileType::Question,
            Self::Dashboard(_) => FileType::Dashboard,
            Self::Report(_) => FileType::Report,
            Self::Alert(_) => FileType::Alert,
            Self::Folder(_) => FileType::Folder,
            Self::Config(_) => FileType::Config,
        }
    }

    /// Build the variant for `file_type` from raw JSON
    ///
    /// # Errors
    /// [`ContentError`] if `raw` is not an object or does not fit the type.
    pub fn from_value(file_type: FileType, raw: Value) -> Result<Self, ContentError> {
        if !raw.is_object() {
            return Err(ContentError::NotAnObject(file_type));
        }
        Ok(match file_type {
            FileType::Question => Self::Question(decode(file_type, raw)?),
            FileType::Dashboard => Self::Dashboard(decode(file_type, raw)?),
            FileType::Report => Self::Report(decode(file_type, raw)?),
            FileType::Alert => Self::Alert(decode(file_type, raw)?),
            FileType::Folder => Self::Folder(decode(file_type, raw)?),
            FileType::Config => Self::Config(decode(file_type, raw)?),
        })
    }

    /// Flatten to top-level keys
    #[must_use]
    pub fn to_map(&self) -> Map<String, Value> {
        let value = match self {
            Self::Question(c) => serde_json::to_value(c),
            Self::Dashboard(c) => serde_json::to_value(c),
            Self::Report(c) => serde_json::to_value(c),
            Self::Alert(c) => serde_json::to_value(c),
            Self::Folder(c) => serde_json::to_value(c),
            Self::Config(c) => serde_json::to_value(c),
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Overlay `layers` in order (later wins per top-level key)
    ///
    /// # Errors
    /// [`ContentError`] if the merged keys no longer fit the variant.
    pub fn apply(&self, layers: &[&ContentPatch]) -> Result<Self, ContentError> {
        if layers.iter().all(|layer| layer.is_empty()) {
            return Ok(self.clone());
        }
        let mut merged = self.to_map();
        for layer in layers {
            for (key, value) in *layer {
                merged.insert(key.clone(), value.clone());
            }
        }
        Self::from_value(self.file_type(), Value::Object(merged))
    }

    /// Initial content for a new local file
    #[must_use]
    pub fn template(file_type: FileType, options: &TemplateOptions) -> Self {
        match file_type {
            FileType::Question => Self::Question(QuestionContent {
                query: options.query.clone().unwrap_or_default(),
                database_name: options.database_name.clone().unwrap_or_default(),
                viz_settings: serde_json::json!({ "type": "table" }),
                ..QuestionContent::default()
            }),
            FileType::Dashboard => Self::Dashboard(DashboardContent {
                layout: serde_json::json!({ "columns": 12, "items": [] }),
                ..DashboardContent::default()
            }),
            FileType::Report => Self::Report(ReportContent::default()),
            FileType::Alert => Self::Alert(AlertContent::default()),
            FileType::Folder => Self::Folder(FolderContent::default()),
            FileType::Config => Self::Config(ConfigContent::default()),
        }
    }

    /// Question content, if this is a question
    #[inline]
    #[must_use]
    pub fn as_question(&self) -> Option<&QuestionContent> {
        match self {
            Self::Question(q) => Some(q),
            _ => None,
        }
    }

    /// Ids this content points at (dashboard tiles, alert target)
    #[must_use]
    pub fn content_references(&self) -> Vec<FileId> {
        match self {
            Self::Dashboard(d) => d.question_ids(),
            Self::Alert(a) => a.question_id.into_iter().collect(),
            _ => Vec::new(),
        }
    }
}

fn decode<T: DeserializeOwned>(file_type: FileType, raw: Value) -> Result<T, ContentError> {
    serde_json::from_value(raw).map_err(|e| ContentError::Invalid {
        file_type,
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn question(query: &str) -> FileContent {
        FileContent::Question(QuestionContent {
            query: query.to_string(),
            database_name: "main".to_string(),
            ..QuestionContent::default()
        })
    }

    fn patch(value: Value) -> ContentPatch {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("patch must be an object"),
        }
    }

    #[test]
    fn later_layers_win_per_key() {
        let base = question("SELECT 1");
        let persistable = patch(json!({"query": "SELECT 2", "database_name": "warehouse"}));
        let ephemeral = patch(json!({"query": "SELECT 3"}));

        let merged = base.apply(&[&persistable, &ephemeral]).unwrap();
        let q = merged.as_question().unwrap();
        assert_eq!(q.query, "SELECT 3");
        assert_eq!(q.database_name, "warehouse");
    }

    #[test]
    fn nested_values_replace_rather_than_merge() {
        let base = FileContent::Question(QuestionContent {
            viz_settings: json!({"type": "bar", "xAxis": "month"}),
            ..QuestionContent::default()
        });
        let merged = base
            .apply(&[&patch(json!({"vizSettings": {"type": "line"}}))])
            .unwrap();
        assert_eq!(merged.as_question().unwrap().viz_settings, json!({"type": "line"}));
    }

    #[test]
    fn nulling_a_required_field_fails() {
        let base = question("SELECT 1");
        let err = base.apply(&[&patch(json!({"query": null}))]).unwrap_err();
        assert!(matches!(err, ContentError::Invalid { file_type: FileType::Question, .. }));
    }

    #[test]
    fn unknown_keys_survive_merge() {
        let base = question("SELECT 1");
        let merged = base.apply(&[&patch(json!({"lastExecuted": {"at": 1}}))]).unwrap();
        assert_eq!(merged.as_question().unwrap().extra["lastExecuted"], json!({"at": 1}));
        assert_eq!(merged.to_map()["lastExecuted"], json!({"at": 1}));
    }

    #[test]
    fn dashboard_references_from_assets() {
        let content = FileContent::from_value(
            FileType::Dashboard,
            json!({"assets": [
                {"type": "question", "id": 4},
                {"type": "text", "content": "hi"},
                {"type": "question", "id": 5},
            ]}),
        )
        .unwrap();
        assert_eq!(content.content_references(), vec![FileId(4), FileId(5)]);
    }

    #[test]
    fn template_seeds_question_fields() {
        let content = FileContent::template(
            FileType::Question,
            &TemplateOptions {
                database_name: Some("main".into()),
                query: Some("SELECT 1".into()),
            },
        );
        let q = content.as_question().unwrap();
        assert_eq!(q.query, "SELECT 1");
        assert_eq!(q.database_name, "main");
    }

    #[test]
    fn non_object_content_is_rejected() {
        assert_eq!(
            FileContent::from_value(FileType::Folder, json!([1, 2])),
            Err(ContentError::NotAnObject(FileType::Folder))
        );
    }

    proptest! {
        #[test]
        fn empty_layers_are_identity(query in "[A-Z ]{0,20}") {
            let base = question(&query);
            let empty = ContentPatch::new();
            prop_assert_eq!(base.apply(&[&empty, &empty]).unwrap(), base);
        }

        #[test]
        fn last_layer_value_is_observed(a in "[a-z]{1,8}", b in "[a-z]{1,8}") {
            let base = question("SELECT 1");
            let first = patch(json!({"query": a}));
            let second = patch(json!({"query": b.clone()}));
            let merged = base.apply(&[&first, &second]).unwrap();
            prop_assert_eq!(&merged.as_question().unwrap().query, &b);
        }
    }
}
