use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::{self, ErrorKind};
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::metadata::{MetadataError, ProjectMetadata};

/// Suffix of every project directory name.
pub const PROJECT_DIR_SUFFIX: &str = ".project";

/// Stable numeric identifier of a project.
/// 專案的穩定數字代號。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(u64);

impl ProjectId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for ProjectId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Bulk project storage owned by the data-model layer. The store only hands
/// it a resolved directory.
/// 由資料模型層實作的專案資料存取；本模組只負責提供資料夾。
pub trait ProjectData {
    type Project;
    type History;
    type Error: StdError + Send + Sync + 'static;

    fn project_id(&self, project: &Self::Project) -> ProjectId;

    fn save(&self, project: &Self::Project, dir: &Path) -> Result<(), Self::Error>;

    fn load(&self, dir: &Path, id: ProjectId) -> Result<Self::Project, Self::Error>;

    fn history_manager(&self) -> Self::History;
}

/// Errors raised by [`ProjectStore`].
/// [`ProjectStore`] 可能拋出的錯誤。
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("project store IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to save metadata of project {id}: {source}")]
    Metadata {
        id: ProjectId,
        #[source]
        source: MetadataError,
    },
    #[error("project data error for project {id}: {source}")]
    Backend {
        id: ProjectId,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

/// Maps project identifiers to `<id>.project` directories under a workspace root.
/// 將專案代號對應到工作區下的 `<id>.project` 資料夾。
#[derive(Debug, Clone)]
pub struct ProjectStore {
    root: PathBuf,
}

impl ProjectStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the project directory; touches nothing on disk.
    /// 專案資料夾位置（不觸碰磁碟）。
    pub fn project_dir(&self, id: ProjectId) -> PathBuf {
        self.root.join(format!("{id}{PROJECT_DIR_SUFFIX}"))
    }

    /// Resolves the project directory, creating it on first use.
    /// 取得專案資料夾，首次使用時建立。
    pub fn ensure_project_dir(&self, id: ProjectId) -> Result<PathBuf, StoreError> {
        let dir = self.project_dir(id);
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    /// Reads the metadata of `id`; `None` when missing or unreadable.
    pub fn load_metadata(&self, id: ProjectId) -> Option<ProjectMetadata> {
        ProjectMetadata::load_from(&self.project_dir(id))
    }

    pub fn save_metadata(
        &self,
        metadata: &ProjectMetadata,
        id: ProjectId,
    ) -> Result<(), StoreError> {
        let dir = self.ensure_project_dir(id)?;
        metadata
            .save_to(&dir)
            .map_err(|source| StoreError::Metadata { id, source })
    }

    pub fn load_bulk<B: ProjectData>(
        &self,
        backend: &B,
        id: ProjectId,
    ) -> Result<B::Project, StoreError> {
        let dir = self.ensure_project_dir(id)?;
        backend.load(&dir, id).map_err(|err| StoreError::Backend {
            id,
            source: Box::new(err),
        })
    }

    pub fn save_bulk<B: ProjectData>(
        &self,
        backend: &B,
        project: &B::Project,
    ) -> Result<ProjectId, StoreError> {
        let id = backend.project_id(project);
        let dir = self.ensure_project_dir(id)?;
        backend.save(project, &dir).map_err(|err| StoreError::Backend {
            id,
            source: Box::new(err),
        })?;
        Ok(id)
    }

    pub fn history_manager<B: ProjectData>(&self, backend: &B) -> B::History {
        backend.history_manager()
    }

    /// Removes the project directory tree. Entries vanishing underneath the
    /// walk are ignored. Returns whether the directory existed.
    /// 刪除整個專案資料夾；回傳資料夾原本是否存在。
    pub fn delete(&self, id: ProjectId) -> Result<bool, StoreError> {
        let dir = self.project_dir(id);
        let Ok(entry) = fs::symlink_metadata(&dir) else {
            return Ok(false);
        };
        // A linked project directory loses the link only, never the target.
        let removed = if entry.file_type().is_symlink() {
            remove_link(&dir)
        } else {
            remove_tree(&dir)
        };
        removed.map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        debug!(project_id = %id, dir = %dir.display(), "deleted project directory");
        Ok(true)
    }
}

/// Unlinks `path` without following it. Windows directory links are
/// removed with `remove_dir`.
fn remove_link(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(_) if cfg!(windows) => tolerate_missing(fs::remove_dir(path)),
        other => tolerate_missing(other),
    }
}

/// Depth-first removal driven by an explicit stack. A directory is pushed
/// twice: once to expand its children, once (marked) to remove it after them.
fn remove_tree(root: &Path) -> io::Result<()> {
    let mut stack = vec![(root.to_path_buf(), false)];
    while let Some((dir, expanded)) = stack.pop() {
        if expanded {
            tolerate_missing(fs::remove_dir(&dir))?;
            continue;
        }
        stack.push((dir.clone(), true));

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            let path = entry.path();
            match entry.file_type() {
                Ok(kind) if kind.is_dir() => stack.push((path, false)),
                Ok(_) => tolerate_missing(fs::remove_file(&path))?,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
    }
    Ok(())
}

fn tolerate_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
