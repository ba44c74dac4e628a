use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{debug, warn};

use crate::{ArchiveError, Compression};

/// Counts of what an import wrote.
/// 匯入結果統計。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

/// Unpacks a tar stream into `destination`, creating it if needed.
/// 將 tar 串流解開至 `destination`。
///
/// Missing parent directories are created for every record, whatever order
/// the records arrive in. Entries with absolute paths or `..` components are
/// refused with [`ArchiveError::UnsafePath`]. On error the destination is left
/// partially populated; callers must treat it as invalid and remove it.
pub fn import_archive<R: Read>(
    reader: R,
    destination: &Path,
    compression: Compression,
) -> Result<ImportSummary, ArchiveError> {
    fs::create_dir_all(destination)?;
    match compression {
        Compression::None => unpack(reader, destination),
        Compression::Gzip => unpack(GzDecoder::new(reader), destination),
    }
}

fn unpack<R: Read>(reader: R, destination: &Path) -> Result<ImportSummary, ArchiveError> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_mtime(true);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut summary = ImportSummary::default();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.into_owned();
        let relative = sanitize_entry_path(&raw)?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        let target = destination.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            fs::create_dir_all(&target)?;
            summary.directories += 1;
        } else if entry_type.is_file() {
            summary.bytes += entry.size();
            entry.unpack(&target)?;
            summary.files += 1;
        } else {
            warn!(entry = %raw.display(), ?entry_type, "skipping unsupported archive entry");
        }
    }

    debug!(
        destination = %destination.display(),
        files = summary.files,
        bytes = summary.bytes,
        "imported archive"
    );
    Ok(summary)
}

fn sanitize_entry_path(raw: &Path) -> Result<PathBuf, ArchiveError> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::UnsafePath {
                    path: raw.to_path_buf(),
                });
            }
        }
    }
    Ok(clean)
}
