use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fileserver_core::{
    ArchiveFormat, Error, NoopAuditSink, PackageDownload, PackageStatus, TaskEngine,
};
use flate2::read::GzDecoder;
use tempfile::TempDir;

fn write_file(path: PathBuf, bytes: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

fn engine(temp: &TempDir) -> TaskEngine {
    let engine = TaskEngine::new(temp.path().join("tmp"), Arc::new(NoopAuditSink));
    engine.prepare_temp_dir().unwrap();
    engine
}

/// `src/a.txt` (3 bytes) and `src/sub/b.txt` (5 bytes).
fn sample_tree(temp: &TempDir) -> PathBuf {
    let source = temp.path().join("src");
    write_file(source.join("a.txt"), b"abc");
    write_file(source.join("sub").join("b.txt"), b"hello");
    source
}

fn zip_files(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut archive = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    let mut out = BTreeMap::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).unwrap();
        if entry.is_dir() {
            continue;
        }
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).unwrap();
        assert!(out.insert(entry.name().to_string(), bytes).is_none());
    }
    out
}

fn zip_dirs(path: &Path) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .filter_map(|i| {
            let entry = archive.by_index(i).unwrap();
            entry.is_dir().then(|| entry.name().to_string())
        })
        .collect()
}

fn tar_gz_files(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut out = BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).unwrap();
        assert!(out.insert(name, bytes).is_none());
    }
    out
}

fn expected_tree() -> BTreeMap<String, Vec<u8>> {
    BTreeMap::from([
        ("src/a.txt".to_string(), b"abc".to_vec()),
        ("src/sub/b.txt".to_string(), b"hello".to_vec()),
    ])
}

#[tokio::test]
async fn directory_zip_contains_every_file_once() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp);
    let source = sample_tree(&temp);

    let id = engine.create_package(&source, Some(".zip"), "alice").unwrap();
    let status = engine.join_package(&id).await.unwrap();

    assert!(status.finished);
    assert_eq!(status.error, None);
    assert_eq!(status.files_finished, 2);
    assert_eq!(status.total_files, 2);
    assert_eq!(status.bytes_read, 8);
    assert_eq!(status.total_bytes, 8);
    assert_eq!(status.extension, ".zip");
    assert_eq!(status.file_name, "src.zip");

    let PackageDownload::Ready { path, file_name, .. } = engine.download_package(&id).unwrap()
    else {
        panic!("package should be ready");
    };
    assert_eq!(file_name, "src.zip");
    assert_eq!(path, engine.temp_dir().join(format!("{id}.zip")));

    let files = zip_files(&path);
    assert_eq!(files, expected_tree());
    assert_eq!(files.values().map(|b| b.len()).sum::<usize>(), 8);
    assert_eq!(zip_dirs(&path), vec!["src/".to_string(), "src/sub/".to_string()]);
}

#[tokio::test]
async fn directory_tar_gz_contains_every_file_once() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp);
    let source = sample_tree(&temp);

    let id = engine
        .create_package(&source, Some(".tar.gz"), "alice")
        .unwrap();
    let status = engine.join_package(&id).await.unwrap();

    assert!(status.finished);
    assert_eq!(status.error, None);
    assert_eq!(status.files_finished, status.total_files);
    assert_eq!(status.files_finished, 2);
    assert_eq!(status.bytes_read, 8);
    assert_eq!(status.bytes_written, 8);

    let path = engine.temp_dir().join(format!("{id}.tar.gz"));
    assert_eq!(tar_gz_files(&path), expected_tree());
}

#[tokio::test]
async fn single_file_is_the_only_entry() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp);
    let source = temp.path().join("report.pdf");
    write_file(source.clone(), b"%PDF-1.");

    let id = engine.create_package(&source, Some(".zip"), "bob").unwrap();
    let status = engine.join_package(&id).await.unwrap();
    assert_eq!(status.total_files, 1);
    assert_eq!(status.files_finished, 1);
    assert_eq!(status.file_name, "report.pdf.zip");

    let files = zip_files(&engine.temp_dir().join(format!("{id}.zip")));
    assert_eq!(
        files,
        BTreeMap::from([("report.pdf".to_string(), b"%PDF-1.".to_vec())])
    );
}

#[tokio::test]
async fn unknown_extension_becomes_tar_gz() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp);
    let source = sample_tree(&temp);

    let id = engine.create_package(&source, Some(".7z"), "alice").unwrap();
    let status = engine.join_package(&id).await.unwrap();
    assert_eq!(status.extension, ".tar.gz");
    assert_eq!(status.file_name, "src.tar.gz");

    let id = engine.create_package(&source, None, "alice").unwrap();
    let status = engine.join_package(&id).await.unwrap();
    assert_eq!(
        status.extension,
        ArchiveFormat::platform_default().extension()
    );
}

#[tokio::test]
async fn progress_counters_never_decrease() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp);
    let source = temp.path().join("big");
    for i in 0..64 {
        write_file(source.join(format!("d{}", i % 4)).join(format!("f{i:02}.bin")), &[i as u8; 8192]);
    }

    let id = engine.create_package(&source, Some(".zip"), "alice").unwrap();
    let mut last = engine.query_package(&id).unwrap();
    loop {
        let now = engine.query_package(&id).unwrap();
        assert!(now.bytes_read >= last.bytes_read);
        assert!(now.bytes_written >= last.bytes_written);
        assert!(now.files_finished >= last.files_finished);
        let done = now.finished;
        last = now;
        if done {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    assert_eq!(last.error, None);
    assert_eq!(last.files_finished, 64);
    assert_eq!(last.total_files, 64);
    assert_eq!(last.bytes_read, 64 * 8192);
}

#[cfg(unix)]
async fn assert_vanished_entry_fails_build(ext: &str) -> PackageStatus {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp);
    let source = temp.path().join("src");
    write_file(source.join("a.txt"), b"abc");
    std::os::unix::fs::symlink(temp.path().join("gone"), source.join("z-link")).unwrap();

    let id = engine.create_package(&source, Some(ext), "alice").unwrap();
    let status = engine.join_package(&id).await.unwrap();

    assert!(status.finished);
    assert!(status.error.is_some());
    assert_eq!(status.files_finished, 1);
    assert_eq!(status.bytes_read, 3);

    // Later polls see the same frozen counters.
    let again = engine.query_package(&id).unwrap();
    assert_eq!(again.bytes_read, status.bytes_read);
    assert_eq!(again.bytes_written, status.bytes_written);
    assert_eq!(again.files_finished, status.files_finished);

    let err = engine.download_package(&id).unwrap_err();
    assert!(matches!(err, Error::TerminalArchive { .. }));
    assert_eq!(err.code(), "task.archive_failed");

    // The partial artifact stays until the task is deleted.
    let artifact = engine.temp_dir().join(format!("{id}{ext}"));
    assert!(artifact.exists());
    engine.delete_package(&id).unwrap();
    assert!(!artifact.exists());
    status
}

#[cfg(unix)]
#[tokio::test]
async fn vanished_entry_fails_zip_build_and_freezes_progress() {
    assert_vanished_entry_fails_build(".zip").await;
}

#[cfg(unix)]
#[tokio::test]
async fn vanished_entry_fails_tar_gz_build_and_freezes_progress() {
    let status = assert_vanished_entry_fails_build(".tar.gz").await;
    // tar copies entry data straight through.
    assert_eq!(status.bytes_written, status.bytes_read);
}

/// Sysfs attributes report a page-sized length but yield only their text.
#[cfg(target_os = "linux")]
fn short_reading_file() -> Option<PathBuf> {
    [
        "/sys/kernel/mm/transparent_hugepage/enabled",
        "/sys/power/state",
        "/sys/kernel/profiling",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| {
        let Ok(meta) = std::fs::metadata(p) else {
            return false;
        };
        std::fs::read(p).is_ok_and(|bytes| (bytes.len() as u64) < meta.len())
    })
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn short_reading_source_fails_tar_gz_build() {
    let Some(source) = short_reading_file() else {
        return;
    };
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp);

    let id = engine.create_package(&source, Some(".tar.gz"), "alice").unwrap();
    let status = engine.join_package(&id).await.unwrap();

    assert!(status.finished);
    let error = status.error.expect("short entry must fail the build");
    assert!(error.contains("bytes"), "{error}");
    assert_eq!(status.files_finished, 0);
    assert!(matches!(
        engine.download_package(&id).unwrap_err(),
        Error::TerminalArchive { .. }
    ));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn short_reading_source_zip_totals_match_content() {
    let Some(source) = short_reading_file() else {
        return;
    };
    let content = std::fs::read(&source).unwrap();
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp);

    let id = engine.create_package(&source, Some(".zip"), "alice").unwrap();
    let status = engine.join_package(&id).await.unwrap();

    assert!(status.error.is_none());
    assert_eq!(status.total_bytes, content.len() as u64);
    assert_eq!(status.bytes_read, content.len() as u64);
    let PackageDownload::Ready { path, .. } = engine.download_package(&id).unwrap() else {
        panic!("finished build must be ready");
    };
    let files = zip_files(&path);
    assert_eq!(files.values().next(), Some(&content));
}

#[tokio::test]
async fn missing_source_is_not_found() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp);

    let err = engine
        .create_package(temp.path().join("nope"), None, "alice")
        .unwrap_err();
    assert!(matches!(err, Error::PathNotFound { .. }));
    assert!(err.is_not_found());
    assert!(engine.list().packages.is_empty());
}

#[tokio::test]
async fn downloads_are_counted() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp);
    let source = sample_tree(&temp);

    let id = engine.create_package(&source, Some(".zip"), "alice").unwrap();
    engine.join_package(&id).await.unwrap();

    for expected in 1..=2 {
        match engine.download_package(&id).unwrap() {
            PackageDownload::Ready { download_count, .. } => assert_eq!(download_count, expected),
            PackageDownload::InProgress(_) => panic!("package should be ready"),
        }
    }
    assert_eq!(engine.query_package(&id).unwrap().download_count, 2);
}

#[tokio::test]
async fn delete_removes_artifact_and_entry() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp);
    let source = sample_tree(&temp);

    let id = engine.create_package(&source, Some(".tar.gz"), "alice").unwrap();
    engine.join_package(&id).await.unwrap();
    let artifact = engine.temp_dir().join(format!("{id}.tar.gz"));
    assert!(artifact.exists());

    engine.delete_package(&id).unwrap();
    assert!(!artifact.exists());
    assert!(engine.query_package(&id).unwrap_err().is_not_found());
    assert!(engine.delete_package(&id).unwrap_err().is_not_found());
}

#[tokio::test]
async fn delete_during_build_leaves_no_artifact() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp);
    let source = temp.path().join("src");
    for i in 0..64 {
        write_file(source.join(format!("f{i:02}.bin")), &[i as u8; 4096]);
    }

    let id = engine.create_package(&source, Some(".zip"), "alice").unwrap();
    let task = engine.registry().package(&id).unwrap();
    engine.delete_package(&id).unwrap();

    task.join().await;
    assert!(task.is_finished());
    assert!(!task.dest_path().exists());
    assert!(engine.list().packages.is_empty());
}

#[test]
fn create_package_without_runtime_is_rejected() {
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp);
    let source = sample_tree(&temp);

    let err = engine.create_package(&source, None, "alice").unwrap_err();
    assert!(matches!(err, Error::RuntimeUnavailable));
    assert!(engine.list().packages.is_empty());
}

#[test]
fn builds_run_on_the_supplied_runtime() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let temp = TempDir::new().unwrap();
    let engine = engine(&temp).with_runtime(rt.handle().clone());
    let source = sample_tree(&temp);

    let id = engine.create_package(&source, Some(".zip"), "alice").unwrap();
    let status = rt.block_on(engine.join_package(&id)).unwrap();
    assert!(status.finished);
    assert!(status.error.is_none());
    assert_eq!(status.files_finished, 2);
}
