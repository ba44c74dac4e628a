use std::collections::BTreeMap;
use std::path::Path;

use gridvault_settings::PreferenceStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::metadata::ProjectMetadata;
use crate::snapshot::{SnapshotError, SnapshotFiles, SnapshotSlot};
use crate::store::{ProjectId, ProjectStore};

/// File stem of the workspace index inside the workspace root.
pub const INDEX_STEM: &str = "workspace";

/// Errors raised while persisting the index.
/// 索引儲存時的錯誤。
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to encode workspace index: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

#[derive(Debug, Deserialize)]
struct IndexFile {
    #[serde(rename = "projectIDs")]
    project_ids: Vec<ProjectId>,
    #[serde(default)]
    preferences: Option<PreferenceStore>,
    /// Expression history written by older releases at the top level.
    #[serde(default)]
    expressions: Option<Vec<String>>,
}

#[derive(Serialize)]
struct IndexFileRef<'a> {
    #[serde(rename = "projectIDs")]
    project_ids: Vec<ProjectId>,
    preferences: &'a PreferenceStore,
}

/// Outcome of [`WorkspaceIndex::load`].
/// 載入結果。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Which file was authoritative; `None` on a cold start.
    pub source: Option<SnapshotSlot>,
    pub loaded: usize,
    /// Listed identifiers whose metadata could not be resolved.
    pub dropped: Vec<ProjectId>,
}

#[derive(Debug, Clone)]
struct Registered {
    metadata: ProjectMetadata,
    /// Changed since it was last written to the project directory.
    dirty: bool,
}

/// Registry parsed from one candidate file.
struct Candidate {
    projects: BTreeMap<ProjectId, Registered>,
    preferences: PreferenceStore,
    dropped: Vec<ProjectId>,
}

/// In-memory registry of projects and preferences plus the index files
/// backing it.
/// 專案與偏好設定的記憶體索引，以及對應的索引檔案。
#[derive(Debug)]
pub struct WorkspaceIndex {
    store: ProjectStore,
    files: SnapshotFiles,
    projects: BTreeMap<ProjectId, Registered>,
    preferences: PreferenceStore,
    dropped_metadata: u64,
}

impl WorkspaceIndex {
    /// Empty registry over `store`; nothing is read until [`load`](Self::load).
    pub fn new(store: ProjectStore) -> Self {
        let files = SnapshotFiles::new(store.root(), INDEX_STEM);
        Self {
            store,
            files,
            projects: BTreeMap::new(),
            preferences: PreferenceStore::with_defaults(),
            dropped_metadata: 0,
        }
    }

    /// Replaces the registry with the newest usable index on disk.
    /// 以磁碟上最新且可用的索引取代目前內容。
    ///
    /// Candidates are tried primary, staging, backup. Each attempt starts from
    /// an empty registry. When none parses the registry is left empty.
    pub fn load(&mut self) -> LoadReport {
        let store = &self.store;
        let loaded = self.files.load_with(|bytes| parse_candidate(store, bytes));

        let Some((slot, candidate)) = loaded else {
            info!(root = %self.store.root().display(), "no workspace index found, starting empty");
            self.projects.clear();
            self.preferences = PreferenceStore::with_defaults();
            return LoadReport::default();
        };

        for id in &candidate.dropped {
            warn!(project_id = %id, "dropping project with missing or unreadable metadata");
        }
        self.dropped_metadata += candidate.dropped.len() as u64;
        self.projects = candidate.projects;
        self.preferences = candidate.preferences;

        if slot != SnapshotSlot::Primary {
            match self.files.restore(slot) {
                Ok(()) => info!(%slot, "recovered workspace index from fallback file"),
                Err(err) => warn!(%slot, %err, "failed to promote recovered workspace index"),
            }
        }

        let report = LoadReport {
            source: Some(slot),
            loaded: self.projects.len(),
            dropped: candidate.dropped,
        };
        debug!(
            %slot,
            loaded = report.loaded,
            dropped = report.dropped.len(),
            "loaded workspace index"
        );
        report
    }

    /// Writes dirty metadata into project directories, then the full index
    /// through the staging/primary/backup rotation.
    /// 先寫入已變更的專案描述，再以輪替流程寫入完整索引。
    pub fn save(&mut self) -> Result<(), IndexError> {
        self.flush_metadata();

        let payload = serde_json::to_vec_pretty(&IndexFileRef {
            project_ids: self.ids(),
            preferences: &self.preferences,
        })?;
        if let Err(err) = self.files.save(&payload) {
            warn!(%err, "workspace index save failed, previous snapshot kept");
            return Err(err.into());
        }
        debug!(
            path = %self.files.primary().display(),
            projects = self.projects.len(),
            "saved workspace index"
        );
        Ok(())
    }

    /// Writes every dirty metadata record to its project directory. Failures
    /// are logged and leave the record dirty for the next save.
    pub fn flush_metadata(&mut self) {
        for (id, entry) in self.projects.iter_mut().filter(|(_, entry)| entry.dirty) {
            match self.store.save_metadata(&entry.metadata, *id) {
                Ok(()) => entry.dirty = false,
                Err(err) => warn!(project_id = %id, %err, "failed to flush project metadata"),
            }
        }
    }

    /// Registers `metadata` under `id`, marking it for the next flush.
    pub fn insert(&mut self, id: ProjectId, metadata: ProjectMetadata) -> Option<ProjectMetadata> {
        self.projects
            .insert(id, Registered { metadata, dirty: true })
            .map(|previous| previous.metadata)
    }

    /// Registers metadata that already matches what is on disk.
    pub fn insert_clean(
        &mut self,
        id: ProjectId,
        metadata: ProjectMetadata,
    ) -> Option<ProjectMetadata> {
        self.projects
            .insert(id, Registered { metadata, dirty: false })
            .map(|previous| previous.metadata)
    }

    pub fn remove(&mut self, id: ProjectId) -> Option<ProjectMetadata> {
        self.projects.remove(&id).map(|entry| entry.metadata)
    }

    pub fn get(&self, id: ProjectId) -> Option<&ProjectMetadata> {
        self.projects.get(&id).map(|entry| &entry.metadata)
    }

    /// Applies `f` to the metadata of `id` and marks it dirty.
    pub fn update<R>(
        &mut self,
        id: ProjectId,
        f: impl FnOnce(&mut ProjectMetadata) -> R,
    ) -> Option<R> {
        let entry = self.projects.get_mut(&id)?;
        entry.dirty = true;
        Some(f(&mut entry.metadata))
    }

    pub fn contains(&self, id: ProjectId) -> bool {
        self.projects.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ProjectId> {
        self.projects.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProjectId, &ProjectMetadata)> {
        self.projects.iter().map(|(id, entry)| (*id, &entry.metadata))
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    pub fn preferences(&self) -> &PreferenceStore {
        &self.preferences
    }

    pub fn preferences_mut(&mut self) -> &mut PreferenceStore {
        &mut self.preferences
    }

    /// Identifiers dropped for missing metadata since this index was built.
    pub fn dropped_metadata(&self) -> u64 {
        self.dropped_metadata
    }

    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    pub fn index_path(&self) -> &Path {
        self.files.primary()
    }
}

fn parse_candidate(store: &ProjectStore, bytes: &[u8]) -> Result<Candidate, serde_json::Error> {
    let file: IndexFile = serde_json::from_slice(bytes)?;

    let mut preferences = PreferenceStore::with_defaults();
    if let Some(stored) = file.preferences {
        preferences.merge(stored);
    }
    if let Some(legacy) = file.expressions {
        preferences.expressions_mut().replace_entries(legacy);
    }

    let mut projects = BTreeMap::new();
    let mut dropped = Vec::new();
    for id in file.project_ids {
        match store.load_metadata(id) {
            Some(metadata) => {
                projects.insert(id, Registered { metadata, dirty: false });
            }
            None => dropped.push(id),
        }
    }

    Ok(Candidate {
        projects,
        preferences,
        dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SavePhase;
    use serde_json::{json, Value};
    use std::fs;
    use tempfile::tempdir;

    fn seeded(root: &Path, ids: &[u64]) -> WorkspaceIndex {
        let mut index = WorkspaceIndex::new(ProjectStore::new(root));
        for id in ids {
            index.insert(ProjectId::new(*id), ProjectMetadata::new(format!("p{id}")));
        }
        index.save().unwrap();
        index
    }

    fn reloaded(root: &Path) -> (WorkspaceIndex, LoadReport) {
        let mut index = WorkspaceIndex::new(ProjectStore::new(root));
        let report = index.load();
        (index, report)
    }

    #[test]
    fn save_then_load_restores_registry_and_preferences() {
        let dir = tempdir().unwrap();
        let mut index = seeded(dir.path(), &[1, 2]);
        index.preferences_mut().set("ui.locale", json!("zh-TW"));
        index.preferences_mut().expressions_mut().add("value.trim()");
        index.save().unwrap();

        let (loaded, report) = reloaded(dir.path());
        assert_eq!(report.source, Some(SnapshotSlot::Primary));
        assert_eq!(report.loaded, 2);
        assert_eq!(loaded.get(ProjectId::new(2)).unwrap().name, "p2");
        assert_eq!(loaded.preferences().get_json("ui.locale"), Some(&json!("zh-TW")));
        let history: Vec<_> = loaded.preferences().expressions().unwrap().iter().collect();
        assert_eq!(history, vec!["value.trim()"]);
    }

    #[test]
    fn index_file_layout() {
        let dir = tempdir().unwrap();
        let index = seeded(dir.path(), &[5, 3]);
        let text = fs::read_to_string(index.index_path()).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["projectIDs"], json!([3, 5]));
        assert_eq!(value["preferences"]["entries"]["expressions"]["class"], json!("TopList"));
        assert!(value.get("expressions").is_none());
    }

    #[test]
    fn missing_metadata_is_dropped_and_counted() {
        let dir = tempdir().unwrap();
        let index = seeded(dir.path(), &[1, 2, 3]);
        fs::remove_dir_all(index.store().project_dir(ProjectId::new(2))).unwrap();

        let (loaded, report) = reloaded(dir.path());
        assert_eq!(loaded.ids(), vec![ProjectId::new(1), ProjectId::new(3)]);
        assert_eq!(report.dropped, vec![ProjectId::new(2)]);
        assert_eq!(loaded.dropped_metadata(), 1);
    }

    #[test]
    fn legacy_expressions_seed_the_history() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("workspace.json"),
            br#"{ "projectIDs": [], "preferences": null, "expressions": ["a", "b", "a"] }"#,
        )
        .unwrap();

        let (loaded, report) = reloaded(dir.path());
        assert_eq!(report.source, Some(SnapshotSlot::Primary));
        let history: Vec<_> = loaded.preferences().expressions().unwrap().iter().collect();
        assert_eq!(history, vec!["a", "b"]);
    }

    #[test]
    fn corrupt_primary_falls_back_and_is_repaired() {
        let dir = tempdir().unwrap();
        let index = seeded(dir.path(), &[4]);
        let files = SnapshotFiles::new(dir.path(), INDEX_STEM);
        let good = fs::read(index.index_path()).unwrap();
        fs::write(files.path(SnapshotSlot::Backup), &good).unwrap();
        fs::write(files.primary(), b"{ \"projectIDs\": [4").unwrap();

        let (loaded, report) = reloaded(dir.path());
        assert_eq!(report.source, Some(SnapshotSlot::Backup));
        assert!(loaded.contains(ProjectId::new(4)));
        assert_eq!(fs::read(files.primary()).unwrap(), good);
    }

    #[test]
    fn interrupted_save_keeps_every_project_reachable() {
        let dir = tempdir().unwrap();
        let mut index = seeded(dir.path(), &[1]);
        index.insert(ProjectId::new(2), ProjectMetadata::new("p2"));
        index.flush_metadata();
        let payload = serde_json::to_vec(&IndexFileRef {
            project_ids: index.ids(),
            preferences: index.preferences(),
        })
        .unwrap();
        SnapshotFiles::new(dir.path(), INDEX_STEM)
            .save_until(&payload, SavePhase::PromoteStaging)
            .unwrap();

        let (loaded, report) = reloaded(dir.path());
        assert_eq!(report.source, Some(SnapshotSlot::Staging));
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn unreadable_files_give_a_cold_start() {
        let dir = tempdir().unwrap();
        for name in ["workspace.json", "workspace.temp.json", "workspace.old.json"] {
            fs::write(dir.path().join(name), b"not json").unwrap();
        }
        let mut index = WorkspaceIndex::new(ProjectStore::new(dir.path()));
        index.insert(ProjectId::new(1), ProjectMetadata::new("stale"));
        index.preferences_mut().set("stale", json!(true));

        let report = index.load();
        assert_eq!(report, LoadReport::default());
        assert!(index.is_empty());
        assert!(index.preferences().get("stale").is_none());
        assert!(index.preferences().expressions().is_some());
    }

    #[test]
    fn failed_attempt_does_not_leak_into_the_next() {
        let dir = tempdir().unwrap();
        let store = ProjectStore::new(dir.path());
        store.save_metadata(&ProjectMetadata::new("one"), ProjectId::new(1)).unwrap();
        store.save_metadata(&ProjectMetadata::new("two"), ProjectId::new(2)).unwrap();
        // Valid ids but a malformed preferences block, then a good staging copy.
        fs::write(
            dir.path().join("workspace.json"),
            br#"{ "projectIDs": [1, 2], "preferences": { "entries": 7 } }"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("workspace.temp.json"),
            br#"{ "projectIDs": [2], "preferences": null }"#,
        )
        .unwrap();

        let (loaded, report) = reloaded(dir.path());
        assert_eq!(report.source, Some(SnapshotSlot::Staging));
        assert_eq!(loaded.ids(), vec![ProjectId::new(2)]);
    }

    #[test]
    fn dirty_metadata_is_flushed_on_save() {
        let dir = tempdir().unwrap();
        let mut index = seeded(dir.path(), &[8]);
        index.update(ProjectId::new(8), |metadata| metadata.name = "renamed".into());
        index.save().unwrap();

        let on_disk = index.store().load_metadata(ProjectId::new(8)).unwrap();
        assert_eq!(on_disk.name, "renamed");
    }

    #[test]
    fn update_of_unknown_project_is_none() {
        let dir = tempdir().unwrap();
        let mut index = WorkspaceIndex::new(ProjectStore::new(dir.path()));
        assert!(index.update(ProjectId::new(1), |_| ()).is_none());
    }
}
