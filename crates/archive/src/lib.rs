//! Streams project directory trees into and out of tar archives.
//! 將專案資料夾樹以 tar 封存檔串流匯入與匯出。
//!
//! Callers own per-directory serialisation: importing into a directory while
//! it is being exported is undefined.

mod export;
mod import;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use export::export_directory;
pub use import::{import_archive, ImportSummary};

/// Permission bits recorded for every exported file.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Compression envelope around the tar stream.
/// tar 串流外層的壓縮格式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl Compression {
    pub fn from_flag(gzip: bool) -> Self {
        if gzip {
            Compression::Gzip
        } else {
            Compression::None
        }
    }

    /// Infers gzip from `.gz` / `.tgz` file names.
    /// 依副檔名 `.gz` / `.tgz` 判斷是否為 gzip。
    pub fn from_path(path: &Path) -> Self {
        let is_gzip = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("tgz"));
        Self::from_flag(is_gzip)
    }
}

/// Errors raised while archiving.
/// 封存過程中的錯誤。
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive IO error: {0}")]
    Io(#[from] io::Error),
    #[error("archive entry '{}' escapes the destination directory", path.display())]
    UnsafePath { path: PathBuf },
    #[error("'{}' is not a directory", path.display())]
    NotADirectory { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_is_inferred_from_extension() {
        assert_eq!(Compression::from_path(Path::new("p.tar.gz")), Compression::Gzip);
        assert_eq!(Compression::from_path(Path::new("p.TGZ")), Compression::Gzip);
        assert_eq!(Compression::from_path(Path::new("p.tar")), Compression::None);
        assert_eq!(Compression::from_path(Path::new("p")), Compression::None);
    }
}
