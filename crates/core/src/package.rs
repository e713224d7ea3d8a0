use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::archive::{ArchiveFormat, build_archive};
use crate::lock_unpoisoned;
use crate::progress::PackageProgress;
use crate::reaper::remove_artifact;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageStatus {
    pub id: String,
    pub source_path: PathBuf,
    pub file_name: String,
    pub extension: String,
    pub started_at: DateTime<Utc>,
    pub files_finished: u64,
    pub total_files: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub total_bytes: u64,
    pub finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub download_count: u64,
}

/// An archive build and its artifact under the temp directory.
#[derive(Debug)]
pub struct PackageTask {
    id: String,
    source_path: PathBuf,
    dest_path: PathBuf,
    file_name: String,
    format: ArchiveFormat,
    owner: String,
    created_at: DateTime<Utc>,
    progress: Arc<PackageProgress>,
    download_count: AtomicU64,
    discarded: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PackageTask {
    pub fn new(
        id: &str,
        source_path: PathBuf,
        temp_dir: &Path,
        format: ArchiveFormat,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let ext = format.extension();
        let base = source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "archive".to_string());
        Self {
            id: id.to_string(),
            dest_path: temp_dir.join(format!("{id}{ext}")),
            file_name: format!("{base}{ext}"),
            source_path,
            format,
            owner: owner.to_string(),
            created_at: now,
            progress: Arc::new(PackageProgress::new()),
            download_count: AtomicU64::new(0),
            discarded: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn dest_path(&self) -> &Path {
        &self.dest_path
    }

    /// Download name: source base name plus the container extension.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn progress(&self) -> &Arc<PackageProgress> {
        &self.progress
    }

    pub fn is_finished(&self) -> bool {
        self.progress.is_finished()
    }

    pub fn download_count(&self) -> u64 {
        self.download_count.load(Ordering::SeqCst)
    }

    pub fn record_download(&self) -> u64 {
        self.download_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn status(&self) -> PackageStatus {
        let p = self.progress.snapshot();
        PackageStatus {
            id: self.id.clone(),
            source_path: self.source_path.clone(),
            file_name: self.file_name.clone(),
            extension: self.format.extension().to_string(),
            started_at: self.created_at,
            files_finished: p.files_finished,
            total_files: p.total_files,
            bytes_written: p.bytes_written,
            bytes_read: p.bytes_read,
            total_bytes: p.total_bytes,
            finished: p.finished,
            error: p.error,
            download_count: self.download_count(),
        }
    }

    /// Runs the build on `runtime`'s blocking pool. The build cannot be
    /// stopped once started.
    pub fn start(&self, runtime: &Handle) {
        let id = self.id.clone();
        let source = self.source_path.clone();
        let dest = self.dest_path.clone();
        let format = self.format;
        let progress = self.progress.clone();
        let discarded = self.discarded.clone();

        let handle = runtime.spawn_blocking(move || {
            match build_archive(&source, &dest, format, &progress) {
                Ok(totals) => {
                    progress.finish_with_totals(totals.files, totals.bytes);
                    tracing::info!(
                        event = "package.finished",
                        task_id = %id,
                        files = totals.files,
                        bytes = totals.bytes,
                        "package.finished"
                    );
                }
                Err(e) => {
                    progress.fail(e.to_string());
                    tracing::warn!(
                        event = "package.failed",
                        task_id = %id,
                        source_path = %source.display(),
                        error = %e,
                        "package.failed"
                    );
                }
            }
            // Deleted while building: nothing owns the artifact any more.
            if discarded.load(Ordering::SeqCst) {
                remove_artifact(&id, &dest);
            }
        });
        *lock_unpoisoned(&self.handle) = Some(handle);
    }

    /// Marks the task as deleted. A build still running removes its own
    /// artifact when it ends.
    pub fn discard(&self) {
        self.discarded.store(true, Ordering::SeqCst);
    }

    /// Waits for the build started by [`PackageTask::start`]. The first
    /// caller consumes the handle; later callers return immediately.
    pub async fn join(&self) {
        let handle = lock_unpoisoned(&self.handle).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            self.progress.fail(format!("archive worker aborted: {e}"));
        }
    }
}
