use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use gridvault_archive::{export_directory, import_archive, ArchiveError, Compression, ImportSummary};
use gridvault_settings::{PreferenceError, PreferenceValue};
use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::{debug, info};

use crate::index::{IndexError, LoadReport, WorkspaceIndex};
use crate::metadata::ProjectMetadata;
use crate::store::{ProjectData, ProjectId, ProjectStore, StoreError};
use crate::util::current_timestamp_millis;

/// Live managers keyed by canonical workspace root.
static OPEN_WORKSPACES: Lazy<Mutex<HashMap<PathBuf, Weak<WorkspaceManager>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Errors surfaced by [`WorkspaceManager`].
/// [`WorkspaceManager`] 回報的錯誤。
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("workspace IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to save workspace index: {0}")]
    Index(#[from] IndexError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("archive error for project {id}: {source}")]
    Archive {
        id: ProjectId,
        #[source]
        source: ArchiveError,
    },
    #[error("project {0} not found")]
    UnknownProject(ProjectId),
    #[error("project {0} has no readable metadata")]
    MissingMetadata(ProjectId),
    #[error(transparent)]
    Preference(#[from] PreferenceError),
    #[error("no project identifier above the highest one in use is left")]
    IdSpaceExhausted,
}

/// Owns one workspace directory: its project registry, preferences and
/// project directories. All registry mutations and index saves are
/// serialised by one lock; bulk data and archive streams run outside it.
/// 管理單一工作區資料夾：專案索引、偏好設定與各專案資料夾。
#[derive(Debug)]
pub struct WorkspaceManager {
    store: ProjectStore,
    index: Mutex<WorkspaceIndex>,
    last_id: AtomicU64,
}

impl WorkspaceManager {
    /// Opens the workspace at `root`, creating the directory if needed and
    /// loading the newest usable index.
    /// 開啟工作區；必要時建立資料夾並載入索引。
    pub fn open(root: impl AsRef<Path>) -> Result<Self, ManagerError> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|source| ManagerError::Io {
            path: root.to_path_buf(),
            source,
        })?;

        let store = ProjectStore::new(root);
        let mut index = WorkspaceIndex::new(store.clone());
        let report = index.load();
        let manager = Self {
            store,
            index: Mutex::new(index),
            last_id: AtomicU64::new(0),
        };
        manager.note_loaded(&report);
        info!(
            root = %root.display(),
            projects = report.loaded,
            dropped = report.dropped.len(),
            "opened workspace"
        );
        Ok(manager)
    }

    /// Returns the process-wide manager for `root`, opening it on first use.
    /// While a previous handle is alive the same instance comes back and the
    /// disk is not re-read.
    /// 每個工作區資料夾在行程內只有一個管理器。
    pub fn initialize(root: impl AsRef<Path>) -> Result<Arc<Self>, ManagerError> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|source| ManagerError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        let key = root.canonicalize().map_err(|source| ManagerError::Io {
            path: root.to_path_buf(),
            source,
        })?;

        let mut open = OPEN_WORKSPACES
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = open.get(&key).and_then(Weak::upgrade) {
            debug!(root = %key.display(), "reusing open workspace");
            return Ok(existing);
        }
        open.retain(|_, handle| handle.strong_count() > 0);

        let manager = Arc::new(Self::open(&key)?);
        open.insert(key, Arc::downgrade(&manager));
        Ok(manager)
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    pub fn store(&self) -> &ProjectStore {
        &self.store
    }

    fn lock(&self) -> MutexGuard<'_, WorkspaceIndex> {
        // Every statement leaves the registry consistent, so a panic elsewhere
        // does not invalidate it.
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn note_id(&self, id: ProjectId) {
        self.last_id.fetch_max(id.get(), Ordering::SeqCst);
    }

    fn note_loaded(&self, report: &LoadReport) {
        if let Some(max) = self.lock().ids().last() {
            self.note_id(*max);
        }
        for id in &report.dropped {
            self.note_id(*id);
        }
    }

    /// Millisecond-clock identifier, strictly above every one seen so far.
    /// `None` once `u64::MAX` has been handed out or observed.
    fn next_id(&self) -> Option<ProjectId> {
        let now = u64::try_from(current_timestamp_millis()).unwrap_or_default();
        let advance = |last: u64| last.checked_add(1).map(|floor| now.max(floor));
        let previous = self
            .last_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, advance)
            .ok()?;
        advance(previous).map(ProjectId::new)
    }

    /// Must be called with the registry locked.
    fn allocate_id(&self, index: &WorkspaceIndex) -> Result<ProjectId, ManagerError> {
        loop {
            let id = self.next_id().ok_or(ManagerError::IdSpaceExhausted)?;
            if !index.contains(id) && !self.store.project_dir(id).exists() {
                return Ok(id);
            }
        }
    }

    /// Allocates a fresh identifier and creates its empty directory so no
    /// other caller can claim it. The id is not registered.
    /// 配置新的專案代號並預先建立資料夾（尚未登記）。
    pub fn reserve_project_id(&self) -> Result<ProjectId, ManagerError> {
        let index = self.lock();
        let id = self.allocate_id(&index)?;
        self.store.ensure_project_dir(id)?;
        Ok(id)
    }

    /// Creates a project directory for `metadata`, registers it and saves.
    /// 建立新專案並儲存工作區。
    pub fn create_project(&self, metadata: ProjectMetadata) -> Result<ProjectId, ManagerError> {
        let mut index = self.lock();
        let id = self.allocate_id(&index)?;
        self.store.save_metadata(&metadata, id)?;
        index.insert_clean(id, metadata);
        index.save()?;
        info!(project_id = %id, "created project");
        Ok(id)
    }

    /// Registers (or replaces) `id` with `metadata` and saves.
    /// 登記或更新專案並儲存工作區。
    pub fn register_project(
        &self,
        id: ProjectId,
        metadata: ProjectMetadata,
    ) -> Result<(), ManagerError> {
        let mut index = self.lock();
        self.note_id(id);
        index.insert(id, metadata);
        index.save()?;
        Ok(())
    }

    /// Re-reads the metadata of `id` from its directory into the registry.
    /// Returns `false` when no readable metadata exists there.
    pub fn reload_project_metadata(&self, id: ProjectId) -> Result<bool, ManagerError> {
        let Some(metadata) = self.store.load_metadata(id) else {
            return Ok(false);
        };
        let mut index = self.lock();
        self.note_id(id);
        index.insert_clean(id, metadata);
        index.save()?;
        Ok(true)
    }

    /// Applies `f` to the metadata of `id`, bumps its modification time and
    /// saves.
    pub fn update_metadata<R>(
        &self,
        id: ProjectId,
        f: impl FnOnce(&mut ProjectMetadata) -> R,
    ) -> Result<R, ManagerError> {
        let mut index = self.lock();
        let result = index
            .update(id, |metadata| {
                let result = f(metadata);
                metadata.touch();
                result
            })
            .ok_or(ManagerError::UnknownProject(id))?;
        index.save()?;
        Ok(result)
    }

    /// Unregisters `id`, removes its directory and saves. Returns whether the
    /// id was registered.
    /// 移除專案登記與資料夾，並儲存工作區。
    pub fn delete_project(&self, id: ProjectId) -> Result<bool, ManagerError> {
        let registered = self.lock().remove(id).is_some();
        let deleted = self.store.delete(id);
        // Save even when the directory could not be removed.
        let saved = self.lock().save();
        deleted?;
        saved?;
        if registered {
            info!(project_id = %id, "deleted project");
        }
        Ok(registered)
    }

    /// Extracts an archive into the directory of `id`, then registers the
    /// project from the metadata found in it.
    /// 將封存檔解開至專案資料夾，並依其描述資料登記專案。
    ///
    /// Nothing is registered unless extraction succeeds and metadata loads.
    /// A partially written directory stays behind; see
    /// [`discard_project_dir`](Self::discard_project_dir).
    pub fn import_project<R: Read>(
        &self,
        id: ProjectId,
        reader: R,
        compression: Compression,
    ) -> Result<ImportSummary, ManagerError> {
        let dir = self.store.ensure_project_dir(id)?;
        let summary = import_archive(reader, &dir, compression)
            .map_err(|source| ManagerError::Archive { id, source })?;
        let metadata = self
            .store
            .load_metadata(id)
            .ok_or(ManagerError::MissingMetadata(id))?;

        let mut index = self.lock();
        self.note_id(id);
        index.insert_clean(id, metadata);
        index.save()?;
        info!(project_id = %id, files = summary.files, bytes = summary.bytes, "imported project");
        Ok(summary)
    }

    /// Streams the directory of `id` into `writer`. The registry is not
    /// consulted, so an unregistered directory can still be exported.
    pub fn export_project<W: Write>(
        &self,
        id: ProjectId,
        writer: W,
        compression: Compression,
    ) -> Result<W, ManagerError> {
        let dir = self.store.project_dir(id);
        if !dir.is_dir() {
            return Err(ManagerError::UnknownProject(id));
        }
        let writer = export_directory(&dir, writer, compression)
            .map_err(|source| ManagerError::Archive { id, source })?;
        debug!(project_id = %id, "exported project");
        Ok(writer)
    }

    /// Removes the directory of an unregistered project, typically the
    /// leftovers of a failed import. Registered projects are left alone and
    /// `false` is returned.
    pub fn discard_project_dir(&self, id: ProjectId) -> Result<bool, ManagerError> {
        if self.lock().contains(id) {
            debug!(project_id = %id, "refusing to discard a registered project");
            return Ok(false);
        }
        Ok(self.store.delete(id)?)
    }

    /// Loads the bulk data of a registered project through `backend`.
    pub fn load_project<B: ProjectData>(
        &self,
        backend: &B,
        id: ProjectId,
    ) -> Result<B::Project, ManagerError> {
        if !self.lock().contains(id) {
            return Err(ManagerError::UnknownProject(id));
        }
        Ok(self.store.load_bulk(backend, id)?)
    }

    /// Saves bulk data through `backend` and records the modification in the
    /// project's metadata.
    pub fn save_project<B: ProjectData>(
        &self,
        backend: &B,
        project: &B::Project,
    ) -> Result<ProjectId, ManagerError> {
        let id = self.store.save_bulk(backend, project)?;
        let mut index = self.lock();
        if index.update(id, ProjectMetadata::touch).is_some() {
            index.flush_metadata();
        }
        Ok(id)
    }

    pub fn history_manager<B: ProjectData>(&self, backend: &B) -> B::History {
        self.store.history_manager(backend)
    }

    pub fn project_ids(&self) -> Vec<ProjectId> {
        self.lock().ids()
    }

    pub fn contains(&self, id: ProjectId) -> bool {
        self.lock().contains(id)
    }

    pub fn metadata(&self, id: ProjectId) -> Option<ProjectMetadata> {
        self.lock().get(id).cloned()
    }

    /// Snapshot of every registered project, ordered by id.
    pub fn projects(&self) -> Vec<(ProjectId, ProjectMetadata)> {
        self.lock()
            .iter()
            .map(|(id, metadata)| (id, metadata.clone()))
            .collect()
    }

    pub fn preference(&self, key: &str) -> Option<PreferenceValue> {
        self.lock().preferences().get(key).cloned()
    }

    pub fn preference_keys(&self) -> Vec<String> {
        self.lock().preferences().keys().map(str::to_string).collect()
    }

    /// Recent expressions, newest first.
    pub fn expressions(&self) -> Vec<String> {
        self.lock()
            .preferences()
            .expressions()
            .map(|list| list.iter().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn set_preference(
        &self,
        key: impl Into<String>,
        value: impl Into<PreferenceValue>,
    ) -> Result<(), ManagerError> {
        let mut index = self.lock();
        index.preferences_mut().set(key, value);
        index.save()?;
        Ok(())
    }

    /// Parses `raw` as JSON before storing it under `key`.
    pub fn set_preference_json(&self, key: &str, raw: &str) -> Result<(), ManagerError> {
        let mut index = self.lock();
        index.preferences_mut().set_from_str(key, raw)?;
        index.save()?;
        Ok(())
    }

    pub fn remove_preference(&self, key: &str) -> Result<Option<PreferenceValue>, ManagerError> {
        let mut index = self.lock();
        let removed = index.preferences_mut().remove(key);
        if removed.is_some() {
            index.save()?;
        }
        Ok(removed)
    }

    /// Promotes `expression` to the top of the recent-expression list.
    pub fn add_expression(&self, expression: impl Into<String>) -> Result<(), ManagerError> {
        let mut index = self.lock();
        index.preferences_mut().expressions_mut().add(expression);
        index.save()?;
        Ok(())
    }

    /// Writes the full registry through the crash-safe rotation.
    pub fn save(&self) -> Result<(), ManagerError> {
        self.lock().save()?;
        Ok(())
    }

    /// Discards in-memory state and re-reads the index from disk.
    pub fn reload(&self) -> LoadReport {
        let report = self.lock().load();
        self.note_loaded(&report);
        report
    }

    /// Identifiers dropped for missing metadata since the workspace opened.
    pub fn dropped_metadata(&self) -> u64 {
        self.lock().dropped_metadata()
    }
}
