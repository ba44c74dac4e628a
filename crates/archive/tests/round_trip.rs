use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use gridvault_archive::{export_directory, import_archive, Compression};
use tempfile::tempdir;
use walkdir::WalkDir;

fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .map(|entry| entry.expect("walk entry"))
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let relative = entry
                .path()
                .strip_prefix(root)
                .expect("relative path")
                .to_string_lossy()
                .replace('\\', "/");
            (relative, fs::read(entry.path()).expect("read file"))
        })
        .collect()
}

fn populate(root: &Path) {
    fs::create_dir_all(root.join("history/2024")).unwrap();
    fs::create_dir_all(root.join(".git/objects")).unwrap();
    fs::write(root.join("metadata.json"), br#"{"name":"demo"}"#).unwrap();
    fs::write(root.join("data.zip"), vec![42u8; 70_000]).unwrap();
    fs::write(root.join("history/empty.change"), b"").unwrap();
    fs::write(root.join("history/2024/1.change"), b"op=rename").unwrap();
    fs::write(root.join(".DS_Store"), b"junk").unwrap();
    fs::write(root.join(".git/objects/abc"), b"blob").unwrap();
}

#[test]
fn tree_survives_export_then_import() {
    let source = tempdir().unwrap();
    populate(source.path());

    let archive = export_directory(source.path(), Vec::new(), Compression::None).unwrap();
    let dest = tempdir().unwrap();
    let summary = import_archive(archive.as_slice(), dest.path(), Compression::None).unwrap();

    let imported = snapshot(dest.path());
    let mut expected = snapshot(source.path());
    expected.retain(|path, _| !path.split('/').any(|part| part.starts_with('.')));

    assert_eq!(imported, expected);
    assert_eq!(summary.files, 4);
    assert!(!dest.path().join(".DS_Store").exists());
    assert!(!dest.path().join(".git").exists());
}

#[test]
fn gzip_envelope_round_trips() {
    let source = tempdir().unwrap();
    populate(source.path());

    let archive = export_directory(source.path(), Vec::new(), Compression::Gzip).unwrap();
    assert_eq!(&archive[..2], &[0x1f, 0x8b], "gzip magic header");

    let dest = tempdir().unwrap();
    import_archive(archive.as_slice(), dest.path(), Compression::Gzip).unwrap();
    assert_eq!(
        fs::read(dest.path().join("history/2024/1.change")).unwrap(),
        b"op=rename"
    );
    assert_eq!(fs::read(dest.path().join("data.zip")).unwrap().len(), 70_000);
}

#[test]
fn modification_times_are_preserved() {
    let source = tempdir().unwrap();
    let file = source.path().join("rows.csv");
    fs::write(&file, b"a,b\n1,2\n").unwrap();
    let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
    fs::File::options()
        .write(true)
        .open(&file)
        .unwrap()
        .set_modified(stamp)
        .unwrap();

    let archive = export_directory(source.path(), Vec::new(), Compression::None).unwrap();
    let dest = tempdir().unwrap();
    import_archive(archive.as_slice(), dest.path(), Compression::None).unwrap();

    let restored = fs::metadata(dest.path().join("rows.csv"))
        .unwrap()
        .modified()
        .unwrap();
    assert_eq!(restored, stamp);
}

#[test]
fn import_into_existing_directory_overwrites_files() {
    let source = tempdir().unwrap();
    fs::write(source.path().join("metadata.json"), b"new").unwrap();
    let archive = export_directory(source.path(), Vec::new(), Compression::None).unwrap();

    let dest = tempdir().unwrap();
    fs::write(dest.path().join("metadata.json"), b"old contents").unwrap();
    import_archive(archive.as_slice(), dest.path(), Compression::None).unwrap();
    assert_eq!(fs::read(dest.path().join("metadata.json")).unwrap(), b"new");
}
