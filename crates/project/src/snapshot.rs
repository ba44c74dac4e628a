use std::fmt;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::util::{sync_dir, write_synced};

/// One of the three files a snapshot rotates through.
/// 快照輪替使用的三個檔案之一。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSlot {
    Primary,
    Staging,
    Backup,
}

impl SnapshotSlot {
    /// Load order: the first slot that parses wins.
    pub const RECOVERY_ORDER: [SnapshotSlot; 3] = [
        SnapshotSlot::Primary,
        SnapshotSlot::Staging,
        SnapshotSlot::Backup,
    ];
}

impl fmt::Display for SnapshotSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SnapshotSlot::Primary => "primary",
            SnapshotSlot::Staging => "staging",
            SnapshotSlot::Backup => "backup",
        };
        f.write_str(label)
    }
}

/// Steps of the save routine, in execution order.
/// 儲存流程的各個階段（依執行順序）。
///
/// | phase            | precondition                          | postcondition                           |
/// |------------------|---------------------------------------|-----------------------------------------|
/// | `WriteStaging`   | primary (if any) is a valid snapshot  | staging holds the new payload, synced   |
/// | `RetirePrimary`  | staging complete                      | old primary (if any) renamed to backup  |
/// | `PromoteStaging` | staging complete, no primary          | new payload is primary                  |
/// | `DropBackup`     | primary holds the new payload         | backup removed                          |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SavePhase {
    WriteStaging,
    RetirePrimary,
    PromoteStaging,
    DropBackup,
    Done,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to write staging file {}: {source}", path.display())]
    WriteStaging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to rename {} to {}: {source}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove stale backup {}: {source}", path.display())]
    ClearBackup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Crash-safe single-document storage built from a primary, a staging and a
/// backup file living side by side. The primary is never written in place.
/// 以 primary / staging / backup 三個檔案實現的防當機儲存；primary 永不就地覆寫。
#[derive(Debug, Clone)]
pub struct SnapshotFiles {
    dir: PathBuf,
    primary: PathBuf,
    staging: PathBuf,
    backup: PathBuf,
}

impl SnapshotFiles {
    /// `stem` of `workspace` yields `workspace.json`, `workspace.temp.json`
    /// and `workspace.old.json` inside `dir`.
    pub fn new(dir: impl AsRef<Path>, stem: &str) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            primary: dir.join(format!("{stem}.json")),
            staging: dir.join(format!("{stem}.temp.json")),
            backup: dir.join(format!("{stem}.old.json")),
            dir,
        }
    }

    pub fn path(&self, slot: SnapshotSlot) -> &Path {
        match slot {
            SnapshotSlot::Primary => &self.primary,
            SnapshotSlot::Staging => &self.staging,
            SnapshotSlot::Backup => &self.backup,
        }
    }

    pub fn primary(&self) -> &Path {
        &self.primary
    }

    /// Runs the full save routine for `payload`.
    /// 以完整流程儲存 `payload`。
    pub fn save(&self, payload: &[u8]) -> Result<(), SnapshotError> {
        self.save_until(payload, SavePhase::Done).map(|_| ())
    }

    /// Runs the save routine but stops before executing `stop`, returning the
    /// phase it stopped at. Used to reproduce a crash between two steps.
    pub fn save_until(
        &self,
        payload: &[u8],
        stop: SavePhase,
    ) -> Result<SavePhase, SnapshotError> {
        let mut phase = SavePhase::WriteStaging;
        while phase < stop {
            phase = self.step(phase, payload)?;
        }
        Ok(phase)
    }

    fn step(&self, phase: SavePhase, payload: &[u8]) -> Result<SavePhase, SnapshotError> {
        match phase {
            SavePhase::WriteStaging => {
                write_synced(&self.staging, payload).map_err(|source| {
                    SnapshotError::WriteStaging {
                        path: self.staging.clone(),
                        source,
                    }
                })?;
                Ok(SavePhase::RetirePrimary)
            }
            SavePhase::RetirePrimary => {
                if self.primary.exists() {
                    // The primary is still complete here, so a leftover backup is redundant.
                    remove_if_present(&self.backup).map_err(|source| {
                        SnapshotError::ClearBackup {
                            path: self.backup.clone(),
                            source,
                        }
                    })?;
                    rename(&self.primary, &self.backup)?;
                }
                Ok(SavePhase::PromoteStaging)
            }
            SavePhase::PromoteStaging => {
                rename(&self.staging, &self.primary)?;
                if let Err(err) = sync_dir(&self.dir) {
                    debug!(dir = %self.dir.display(), %err, "directory sync failed");
                }
                Ok(SavePhase::DropBackup)
            }
            SavePhase::DropBackup => {
                // The new primary is in place; a stuck backup only costs disk space.
                if let Err(err) = remove_if_present(&self.backup) {
                    warn!(path = %self.backup.display(), %err, "failed to remove backup");
                }
                Ok(SavePhase::Done)
            }
            SavePhase::Done => Ok(SavePhase::Done),
        }
    }

    /// Promotes a recovered staging or backup file to primary so the next
    /// save starts from a settled state. A no-op for the primary slot.
    /// 將復原所用的 staging 或 backup 檔案升為 primary。
    pub fn restore(&self, slot: SnapshotSlot) -> Result<(), SnapshotError> {
        if slot == SnapshotSlot::Primary {
            return Ok(());
        }
        let source = self.path(slot);
        // Whatever sits at the primary path failed to parse.
        remove_if_present(&self.primary).map_err(|err| SnapshotError::Rename {
            from: source.to_path_buf(),
            to: self.primary.clone(),
            source: err,
        })?;
        rename(source, &self.primary)?;
        if slot == SnapshotSlot::Staging {
            if let Err(err) = remove_if_present(&self.backup) {
                warn!(path = %self.backup.display(), %err, "failed to remove backup");
            }
        }
        Ok(())
    }

    /// Tries primary, staging, then backup, returning the first slot whose
    /// contents `parse` accepts. `None` means nothing usable exists.
    /// 依序嘗試 primary、staging、backup，回傳第一個可解析的結果。
    pub fn load_with<T, E, F>(&self, mut parse: F) -> Option<(SnapshotSlot, T)>
    where
        E: fmt::Display,
        F: FnMut(&[u8]) -> Result<T, E>,
    {
        for slot in SnapshotSlot::RECOVERY_ORDER {
            let path = self.path(slot);
            match fs::read(path) {
                Ok(bytes) => match parse(&bytes) {
                    Ok(value) => return Some((slot, value)),
                    Err(err) => warn!(path = %path.display(), %err, "unusable snapshot file"),
                },
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!(path = %path.display(), "snapshot file absent");
                }
                Err(err) => warn!(path = %path.display(), %err, "failed to read snapshot file"),
            }
        }
        None
    }
}

fn rename(from: &Path, to: &Path) -> Result<(), SnapshotError> {
    fs::rename(from, to).map_err(|source| SnapshotError::Rename {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    })
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
