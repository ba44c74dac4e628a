//! Workspace persistence for gridvault: project directories, the workspace
//! index with its crash-safe save rotation, and the manager tying them to
//! archive import/export.
//! gridvault 的工作區儲存：專案資料夾、防當機的工作區索引，以及整合封存匯入匯出的管理器。

mod util;

pub mod index;
pub mod manager;
pub mod metadata;
pub mod snapshot;
pub mod store;

pub use gridvault_archive::{ArchiveError, Compression, ImportSummary};
pub use index::{IndexError, LoadReport, WorkspaceIndex, INDEX_STEM};
pub use manager::{ManagerError, WorkspaceManager};
pub use metadata::{MetadataError, ProjectMetadata, METADATA_STEM};
pub use snapshot::{SavePhase, SnapshotError, SnapshotFiles, SnapshotSlot};
pub use store::{ProjectData, ProjectId, ProjectStore, StoreError, PROJECT_DIR_SUFFIX};
