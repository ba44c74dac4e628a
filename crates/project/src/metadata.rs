use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::snapshot::{SnapshotError, SnapshotFiles};
use crate::util::current_timestamp_millis;

/// File stem of the metadata snapshot inside each project directory.
pub const METADATA_STEM: &str = "metadata";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to encode project metadata: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Descriptive record kept for every project.
/// 每個專案的描述資料。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMetadata {
    pub name: String,
    /// Unix epoch milliseconds.
    pub created: i64,
    /// Unix epoch milliseconds.
    pub modified: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding_confidence: Option<u8>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom: BTreeMap<String, Value>,
}

impl ProjectMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        let now = current_timestamp_millis();
        Self {
            name: name.into(),
            created: now,
            modified: now,
            password: None,
            encoding: None,
            encoding_confidence: None,
            tags: Vec::new(),
            custom: BTreeMap::new(),
        }
    }

    /// Marks the project as modified now.
    /// 將修改時間更新為現在。
    pub fn touch(&mut self) {
        self.modified = current_timestamp_millis().max(self.modified);
    }

    /// Reads metadata from `project_dir`, recovering from an interrupted save.
    /// Missing or unparsable files yield `None`.
    /// 從專案資料夾讀取描述資料；檔案遺失或無法解析時回傳 `None`。
    pub fn load_from(project_dir: &Path) -> Option<Self> {
        SnapshotFiles::new(project_dir, METADATA_STEM)
            .load_with(|bytes| serde_json::from_slice::<Self>(bytes))
            .map(|(_, metadata)| metadata)
    }

    /// Writes metadata into `project_dir` through the crash-safe rotation.
    /// 以防當機的輪替流程寫入專案資料夾。
    pub fn save_to(&self, project_dir: &Path) -> Result<(), MetadataError> {
        let payload = serde_json::to_vec_pretty(self)?;
        SnapshotFiles::new(project_dir, METADATA_STEM).save(&payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let mut metadata = ProjectMetadata::new("Census 2020");
        metadata.tags.push("public".into());
        metadata.custom.insert("source".into(), json!({ "url": "https://example.org" }));
        metadata.encoding = Some("UTF-8".into());

        metadata.save_to(dir.path()).unwrap();
        assert!(dir.path().join("metadata.json").exists());
        assert_eq!(ProjectMetadata::load_from(dir.path()), Some(metadata));
    }

    #[test]
    fn json_uses_camel_case_field_names() {
        let mut metadata = ProjectMetadata::new("x");
        metadata.encoding_confidence = Some(80);
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["encodingConfidence"], json!(80));
        assert!(value.get("password").is_none());
    }

    #[test]
    fn corrupt_file_reads_as_absent() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("metadata.json"), b"{ \"name\": ").unwrap();
        assert!(ProjectMetadata::load_from(dir.path()).is_none());
    }

    #[test]
    fn missing_directory_reads_as_absent() {
        let dir = tempdir().unwrap();
        assert!(ProjectMetadata::load_from(&dir.path().join("nope")).is_none());
    }

    #[test]
    fn minimal_legacy_record_parses() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("metadata.json"),
            br#"{ "name": "old", "created": 1, "modified": 2 }"#,
        )
        .unwrap();
        let metadata = ProjectMetadata::load_from(dir.path()).unwrap();
        assert_eq!(metadata.name, "old");
        assert!(metadata.tags.is_empty());
    }
}
