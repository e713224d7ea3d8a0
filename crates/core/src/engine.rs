use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::archive::ArchiveFormat;
use crate::audit::{
    ACTION_CREATE_PACKAGE, ACTION_CREATE_UPLOAD, ACTION_UPLOAD_FINISHED, AuditEvent, AuditSink,
};
use crate::package::{PackageStatus, PackageTask};
use crate::reaper::remove_artifact;
use crate::registry::{TaskListing, TaskRegistry};
use crate::upload::{ChunkAck, UploadStatus, UploadTask};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUpload {
    pub dest_path: PathBuf,
    pub total_size: u64,
    /// Client hint; never used for sizing.
    pub chunk_count: Option<u64>,
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCreated {
    pub id: String,
    pub temp_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageDownload {
    InProgress(PackageStatus),
    Ready {
        path: PathBuf,
        file_name: String,
        download_count: u64,
    },
}

/// Transfer and archival tasks for one server process.
pub struct TaskEngine {
    registry: TaskRegistry,
    temp_dir: PathBuf,
    audit: Arc<dyn AuditSink>,
    runtime: Option<Handle>,
}

impl TaskEngine {
    /// Package builds run on the runtime current at construction, if any.
    /// Otherwise `create_package` looks for one when it is called.
    pub fn new(temp_dir: impl Into<PathBuf>, audit: Arc<dyn AuditSink>) -> Self {
        Self::with_registry(TaskRegistry::new(), temp_dir, audit)
    }

    pub fn with_registry(
        registry: TaskRegistry,
        temp_dir: impl Into<PathBuf>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            registry,
            temp_dir: temp_dir.into(),
            audit,
            runtime: Handle::try_current().ok(),
        }
    }

    /// Runs package builds on `runtime` from any thread.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    fn runtime(&self) -> Result<Handle> {
        self.runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
            .ok_or(Error::RuntimeUnavailable)
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Wipes leftovers of a previous process and recreates the temp dir.
    pub fn prepare_temp_dir(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.temp_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::fs::create_dir_all(&self.temp_dir)?;
        tracing::info!(
            event = "engine.temp_dir_ready",
            path = %self.temp_dir.display(),
            "engine.temp_dir_ready"
        );
        Ok(())
    }

    pub fn create_upload(&self, req: NewUpload) -> Result<UploadCreated> {
        let now = Utc::now();
        let task = self.registry.insert_upload(|id| {
            UploadTask::new(id, req.dest_path.clone(), req.total_size, &req.owner, now)
        })?;

        if let Err(e) = task.create_temp_file() {
            let _ = self.registry.remove_upload(task.id());
            tracing::warn!(
                event = "upload.create_failed",
                task_id = %task.id(),
                temp_path = %task.temp_path().display(),
                error = %e,
                "upload.create_failed"
            );
            return Err(e);
        }

        tracing::info!(
            event = "upload.created",
            task_id = %task.id(),
            dest_path = %task.dest_path().display(),
            total_size = req.total_size,
            chunk_count = req.chunk_count,
            "upload.created"
        );
        let mut event = AuditEvent::new(ACTION_CREATE_UPLOAD, task.id(), &req.owner)
            .detail("destPath", task.dest_path().display())
            .detail("totalSize", req.total_size);
        if let Some(n) = req.chunk_count {
            event = event.detail("chunkCount", n);
        }
        self.audit.record(event);

        Ok(UploadCreated {
            id: task.id().to_string(),
            temp_path: task.temp_path().to_path_buf(),
        })
    }

    pub fn write_chunk(&self, id: &str, position: u64, data: &[u8]) -> Result<ChunkAck> {
        let task = self.registry.upload(id)?;
        let write = task.write_chunk(position, data, Utc::now())?;
        if write.finalized {
            self.audit.record(
                AuditEvent::new(ACTION_UPLOAD_FINISHED, task.id(), task.owner())
                    .detail("destPath", task.dest_path().display())
                    .detail("totalSize", task.total_size()),
            );
        }
        Ok(write.ack)
    }

    pub fn upload_status(&self, id: &str) -> Result<UploadStatus> {
        Ok(self.registry.upload(id)?.status())
    }

    /// Drops the session and its staging file. A finalized destination is kept.
    pub fn delete_upload(&self, id: &str) -> Result<()> {
        let task = self.registry.remove_upload(id)?;
        remove_artifact(task.id(), task.temp_path());
        tracing::info!(event = "upload.deleted", task_id = %id, "upload.deleted");
        Ok(())
    }

    /// Starts a background build. Fails with `RuntimeUnavailable`, before
    /// registering anything, when no tokio runtime can be found.
    pub fn create_package(
        &self,
        source_path: impl Into<PathBuf>,
        ext_hint: Option<&str>,
        owner: &str,
    ) -> Result<String> {
        let source_path = source_path.into();
        if let Err(e) = std::fs::metadata(&source_path) {
            return Err(match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    Error::PathNotFound { path: source_path }
                }
                _ => Error::Io(e),
            });
        }

        let runtime = self.runtime()?;
        let format = ArchiveFormat::from_hint(ext_hint);
        let now = Utc::now();
        let task = self.registry.insert_package(|id| {
            PackageTask::new(id, source_path.clone(), &self.temp_dir, format, owner, now)
        })?;
        task.start(&runtime);

        tracing::info!(
            event = "package.created",
            task_id = %task.id(),
            source_path = %source_path.display(),
            extension = format.extension(),
            "package.created"
        );
        self.audit.record(
            AuditEvent::new(ACTION_CREATE_PACKAGE, task.id(), owner)
                .detail("sourcePath", source_path.display())
                .detail("extension", format.extension()),
        );
        Ok(task.id().to_string())
    }

    pub fn query_package(&self, id: &str) -> Result<PackageStatus> {
        Ok(self.registry.package(id)?.status())
    }

    pub fn download_package(&self, id: &str) -> Result<PackageDownload> {
        let task = self.registry.package(id)?;
        let status = task.status();
        if let Some(message) = status.error {
            return Err(Error::TerminalArchive {
                id: id.to_string(),
                message,
            });
        }
        if !status.finished {
            return Ok(PackageDownload::InProgress(status));
        }
        let download_count = task.record_download();
        tracing::info!(
            event = "package.downloaded",
            task_id = %id,
            download_count,
            "package.downloaded"
        );
        Ok(PackageDownload::Ready {
            path: task.dest_path().to_path_buf(),
            file_name: task.file_name().to_string(),
            download_count,
        })
    }

    /// Removes the entry and its artifact whether or not the build finished.
    /// A build still running deletes whatever it wrote when it ends.
    pub fn delete_package(&self, id: &str) -> Result<()> {
        let task = self.registry.remove_package(id)?;
        task.discard();
        remove_artifact(task.id(), task.dest_path());
        tracing::info!(event = "package.deleted", task_id = %id, "package.deleted");
        Ok(())
    }

    pub async fn join_package(&self, id: &str) -> Result<PackageStatus> {
        let task = self.registry.package(id)?;
        task.join().await;
        Ok(task.status())
    }

    pub fn list(&self) -> TaskListing {
        self.registry.list()
    }
}
