use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    #[error("path not found: {path:?}")]
    PathNotFound { path: PathBuf },

    #[error("chunk at {position} (+{len} bytes) exceeds declared size {total}")]
    SizeExceeded { position: u64, len: u64, total: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload {id} failed: {message}")]
    UploadFailed { id: String, message: String },

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("task id allocation exhausted after {attempts} attempts")]
    TaskAllocationExhausted { attempts: usize },

    #[error("package {id} failed: {message}")]
    TerminalArchive { id: String, message: String },

    #[error("no tokio runtime available for background builds")]
    RuntimeUnavailable,
}

impl Error {
    /// Stable dotted code shared by the control protocol and the CLI.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "config.invalid",
            Self::TaskNotFound { .. } | Self::PathNotFound { .. } => "task.not_found",
            Self::SizeExceeded { .. } => "task.size_exceeded",
            Self::Io(_) | Self::UploadFailed { .. } | Self::Zip(_) => "task.io_failed",
            Self::TaskAllocationExhausted { .. } => "task.allocation_exhausted",
            Self::TerminalArchive { .. } => "task.archive_failed",
            Self::RuntimeUnavailable => "engine.runtime_unavailable",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TaskNotFound { .. } | Self::PathNotFound { .. })
    }

    pub(crate) fn task_not_found(id: &str) -> Self {
        Self::TaskNotFound { id: id.to_string() }
    }
}
