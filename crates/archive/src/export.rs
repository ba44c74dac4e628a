use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use flate2::write::GzEncoder;
use tar::{Builder, EntryType, Header};
use tracing::debug;

use crate::{ArchiveError, Compression, DEFAULT_FILE_MODE};

enum Pending {
    Dir { path: PathBuf, relative: PathBuf },
    File { path: PathBuf, relative: PathBuf },
}

/// Writes every non-hidden file below `source` into a tar stream on `writer`
/// and returns the writer once the archive (and gzip trailer) is complete.
/// 將 `source` 下所有非隱藏檔案寫成 tar 串流，完成後交還 `writer`。
///
/// Records are emitted depth-first with siblings in file-name order, so a
/// fixed tree always produces the same record sequence. Directories are not
/// stored as records of their own.
pub fn export_directory<W: Write>(
    source: &Path,
    writer: W,
    compression: Compression,
) -> Result<W, ArchiveError> {
    if !source.is_dir() {
        return Err(ArchiveError::NotADirectory {
            path: source.to_path_buf(),
        });
    }
    match compression {
        Compression::None => write_tree(source, writer),
        Compression::Gzip => {
            let encoder = GzEncoder::new(writer, flate2::Compression::default());
            let encoder = write_tree(source, encoder)?;
            Ok(encoder.finish()?)
        }
    }
}

fn write_tree<W: Write>(source: &Path, writer: W) -> Result<W, ArchiveError> {
    let mut builder = Builder::new(writer);
    let mut stack = vec![Pending::Dir {
        path: source.to_path_buf(),
        relative: PathBuf::new(),
    }];
    let mut files = 0usize;
    let mut bytes = 0u64;

    while let Some(next) = stack.pop() {
        match next {
            Pending::Dir { path, relative } => {
                // Reverse order so the smallest name is popped first.
                for child in list_children(&path, &relative)?.into_iter().rev() {
                    stack.push(child);
                }
            }
            Pending::File { path, relative } => {
                bytes += append_file(&mut builder, &path, &relative)?;
                files += 1;
            }
        }
    }

    debug!(source = %source.display(), files, bytes, "exported directory");
    Ok(builder.into_inner()?)
}

fn list_children(dir: &Path, relative: &Path) -> io::Result<Vec<Pending>> {
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut children = Vec::with_capacity(entries.len());
    for entry in entries {
        let path = entry.path();
        if is_hidden(&entry)? {
            debug!(path = %path.display(), "skipping hidden entry");
            continue;
        }
        let relative = relative.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            children.push(Pending::Dir { path, relative });
        } else if file_type.is_file() {
            children.push(Pending::File { path, relative });
        } else {
            debug!(path = %path.display(), "skipping special file");
        }
    }
    Ok(children)
}

fn append_file<W: Write>(
    builder: &mut Builder<W>,
    path: &Path,
    relative: &Path,
) -> io::Result<u64> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    let len = metadata.len();
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(len);
    header.set_mtime(mtime);
    header.set_mode(DEFAULT_FILE_MODE);
    builder.append_data(&mut header, relative, ExactLen::new(file, len))?;
    Ok(len)
}

/// Yields exactly `len` bytes of `inner`. A file that grows mid-export is cut
/// at its declared size; one that shrinks fails with `UnexpectedEof` instead
/// of leaving a padded record behind.
struct ExactLen<R> {
    inner: io::Take<R>,
    remaining: u64,
}

impl<R: Read> ExactLen<R> {
    fn new(inner: R, len: u64) -> Self {
        Self {
            inner: inner.take(len),
            remaining: len,
        }
    }
}

impl<R: Read> Read for ExactLen<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let read = self.inner.read(buf)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank by {} bytes while being archived", self.remaining),
            ));
        }
        self.remaining -= read as u64;
        Ok(read)
    }
}

fn is_hidden(entry: &fs::DirEntry) -> io::Result<bool> {
    if entry.file_name().to_string_lossy().starts_with('.') {
        return Ok(true);
    }
    has_hidden_attribute(entry)
}

#[cfg(windows)]
fn has_hidden_attribute(entry: &fs::DirEntry) -> io::Result<bool> {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    Ok(entry.metadata()?.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0)
}

#[cfg(not(windows))]
fn has_hidden_attribute(_entry: &fs::DirEntry) -> io::Result<bool> {
    Ok(false)
}
