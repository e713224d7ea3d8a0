use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod archive;
pub mod audit;
pub mod config;
pub mod control;
mod engine;
mod error;
pub mod logging;
pub mod package;
pub mod progress;
pub mod reaper;
pub mod registry;
pub mod upload;

pub const APP_NAME: &str = "FileServer";

pub use archive::ArchiveFormat;
pub use audit::{AuditEvent, AuditSink, NdjsonAuditSink, NoopAuditSink, TracingAuditSink};
pub use engine::{NewUpload, PackageDownload, TaskEngine, UploadCreated};
pub use error::{Error, Result};
pub use package::{PackageStatus, PackageTask};
pub use progress::{PackageProgress, ProgressSnapshot};
pub use reaper::{ReaperPolicy, SweepReport, spawn_reaper, sweep};
pub use registry::{IdGenerator, RandomIdGenerator, TaskListing, TaskRegistry};
pub use upload::{ChunkAck, UploadPhase, UploadStatus, UploadTask};

/// Task state stays usable after a panicking holder; every critical section
/// leaves it consistent.
pub(crate) fn lock_unpoisoned<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
