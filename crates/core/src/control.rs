use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Error;

pub const MAX_REQUEST_BYTES: usize = 8 * 1024 * 1024;

pub const METHOD_PING: &str = "control.ping";
pub const METHOD_UPLOAD_CREATE: &str = "upload.create";
pub const METHOD_UPLOAD_WRITE_CHUNK: &str = "upload.writeChunk";
pub const METHOD_UPLOAD_STATUS: &str = "upload.status";
pub const METHOD_UPLOAD_DELETE: &str = "upload.delete";
pub const METHOD_PACKAGE_CREATE: &str = "package.create";
pub const METHOD_PACKAGE_QUERY: &str = "package.query";
pub const METHOD_PACKAGE_DOWNLOAD: &str = "package.download";
pub const METHOD_PACKAGE_DELETE: &str = "package.delete";
pub const METHOD_TASKS_LIST: &str = "tasks.list";

pub fn control_ipc_socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join("ipc").join("control.sock")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ControlError {
    pub fn unavailable(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: "control.unavailable".to_string(),
            message: message.into(),
            retryable: true,
            details,
        }
    }

    pub fn invalid_request(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: "control.invalid_request".to_string(),
            message: message.into(),
            retryable: false,
            details,
        }
    }

    pub fn method_not_found(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: "control.method_not_found".to_string(),
            message: message.into(),
            retryable: false,
            details,
        }
    }

    pub fn internal(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: "control.internal".to_string(),
            message: message.into(),
            retryable: false,
            details,
        }
    }
}

impl From<&Error> for ControlError {
    fn from(e: &Error) -> Self {
        let details = match e {
            Error::TaskNotFound { id }
            | Error::UploadFailed { id, .. }
            | Error::TerminalArchive { id, .. } => serde_json::json!({ "taskId": id }),
            Error::PathNotFound { path } => serde_json::json!({ "path": path }),
            Error::SizeExceeded {
                position,
                len,
                total,
            } => serde_json::json!({ "position": position, "len": len, "totalSize": total }),
            Error::TaskAllocationExhausted { attempts } => {
                serde_json::json!({ "attempts": attempts })
            }
            _ => serde_json::json!({}),
        };
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
            retryable: false,
            details,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(rename = "type")]
    pub type_: String,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ControlRequest {
    pub fn new(
        id: impl Into<String>,
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            type_: "control.request".to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    #[serde(rename = "type")]
    pub type_: String,
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

impl ControlResponse {
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            type_: "control.response".to_string(),
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ControlError) -> Self {
        Self {
            type_: "control.response".to_string(),
            id: id.into(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCreateParams {
    pub dest_path: PathBuf,
    pub total_size: u64,
    #[serde(default)]
    pub chunk_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteChunkParams {
    pub task_id: String,
    pub position: u64,
    /// Standard base64.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIdParams {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageCreateParams {
    pub source_path: PathBuf,
    #[serde(default)]
    pub ext: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageCreateResult {
    pub task_id: String,
}

/// `ready == false` carries the current progress instead of a path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageDownloadResult {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<crate::PackageStatus>,
}
