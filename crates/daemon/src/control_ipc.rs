use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, oneshot};

use fileserver_core::control::{
    ControlError, ControlRequest, ControlResponse, MAX_REQUEST_BYTES, METHOD_PACKAGE_CREATE,
    METHOD_PACKAGE_DELETE, METHOD_PACKAGE_DOWNLOAD, METHOD_PACKAGE_QUERY, METHOD_PING,
    METHOD_TASKS_LIST, METHOD_UPLOAD_CREATE, METHOD_UPLOAD_DELETE, METHOD_UPLOAD_STATUS,
    METHOD_UPLOAD_WRITE_CHUNK, PackageCreateParams, PackageCreateResult, PackageDownloadResult,
    TaskIdParams, UploadCreateParams, WriteChunkParams,
};
use fileserver_core::{NewUpload, PackageDownload, TaskEngine};

/// Principal recorded for requests arriving over the local socket.
const LOCAL_OWNER: &str = "local";

pub struct ControlIpcServerHandle {
    socket_path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ControlIpcServerHandle {
    pub async fn shutdown(self) {
        let mut this = self;
        if let Some(tx) = this.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = this.task.take() {
            let _ = task.await;
        }
        let _ = std::fs::remove_file(&this.socket_path);
    }
}

impl Drop for ControlIpcServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

pub fn spawn_control_ipc_server(
    socket_path: PathBuf,
    engine: Arc<TaskEngine>,
) -> std::io::Result<ControlIpcServerHandle> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
            {
                tracing::error!(
                    event = "control.ipc_permissions_failed",
                    error = %e,
                    path = %parent.display(),
                    "control.ipc_permissions_failed"
                );
                return Err(e);
            }
        }
    }

    match std::fs::remove_file(&socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(&socket_path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
        {
            tracing::error!(
                event = "control.ipc_permissions_failed",
                error = %e,
                path = %socket_path.display(),
                "control.ipc_permissions_failed"
            );
            drop(listener);
            let _ = std::fs::remove_file(&socket_path);
            return Err(e);
        }
    }

    let handle_socket_path = socket_path.clone();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let (shutdown_broadcast, _) = broadcast::channel::<()>(8);

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    let _ = shutdown_broadcast.send(());
                    break;
                }
                accept = listener.accept() => {
                    let (stream, _) = match accept {
                        Ok(x) => x,
                        Err(e) => {
                            tracing::warn!(
                                event = "control.ipc_accept_failed",
                                error = %e,
                                path = %socket_path.display(),
                                "control.ipc_accept_failed"
                            );
                            continue;
                        }
                    };

                    let mut shutdown = shutdown_broadcast.subscribe();
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_control_ipc_client(stream, engine, &mut shutdown).await {
                            tracing::debug!(
                                event = "control.ipc_client_failed",
                                error = %e,
                                "control.ipc_client_failed"
                            );
                        }
                    });
                }
            }
        }
    });

    tracing::info!(
        event = "control.ipc_listening",
        path = %handle_socket_path.display(),
        "control.ipc_listening"
    );

    Ok(ControlIpcServerHandle {
        socket_path: handle_socket_path,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn handle_control_ipc_client(
    stream: UnixStream,
    engine: Arc<TaskEngine>,
    shutdown: &mut broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let (r, w) = stream.into_split();
    let mut r = BufReader::new(r);
    let mut w = BufWriter::new(w);

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 64 * 1024];
    loop {
        if buf.len() > MAX_REQUEST_BYTES {
            break;
        }

        tokio::select! {
            res = r.read(&mut chunk) => {
                let n = res?;
                if n == 0 {
                    break;
                }

                if let Some(pos) = chunk[..n].iter().position(|b| *b == b'\n') {
                    buf.extend_from_slice(&chunk[..pos]);
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            _ = shutdown.recv() => return Ok(()),
        }
    }

    if buf.is_empty() {
        return Ok(());
    }

    if buf.len() > MAX_REQUEST_BYTES {
        write_json_line(
            &mut w,
            &ControlResponse::err(
                "unknown",
                ControlError::invalid_request(
                    "request too large",
                    serde_json::json!({ "maxBytes": MAX_REQUEST_BYTES }),
                ),
            ),
        )
        .await?;
        return Ok(());
    }

    let req: ControlRequest = match serde_json::from_slice(&buf) {
        Ok(x) => x,
        Err(e) => {
            write_json_line(
                &mut w,
                &ControlResponse::err(
                    "unknown",
                    ControlError::invalid_request(
                        "invalid json",
                        serde_json::json!({ "error": e.to_string() }),
                    ),
                ),
            )
            .await?;
            return Ok(());
        }
    };

    let req_id = req.id.clone();
    let resp = match tokio::task::spawn_blocking(move || handle_request(&req, &engine)).await {
        Ok(resp) => resp,
        Err(e) => ControlResponse::err(
            req_id,
            ControlError::unavailable(
                "request handler failed",
                serde_json::json!({ "error": e.to_string() }),
            ),
        ),
    };
    write_json_line(&mut w, &resp).await?;
    Ok(())
}

fn parse_params<T: DeserializeOwned>(req: &ControlRequest) -> Result<T, ControlResponse> {
    serde_json::from_value(req.params.clone()).map_err(|e| {
        ControlResponse::err(
            req.id.clone(),
            ControlError::invalid_request(
                "invalid params",
                serde_json::json!({ "error": e.to_string() }),
            ),
        )
    })
}

fn respond<T: Serialize>(
    req: &ControlRequest,
    result: fileserver_core::Result<T>,
) -> ControlResponse {
    match result {
        Ok(v) => match serde_json::to_value(v) {
            Ok(value) => ControlResponse::ok(req.id.clone(), value),
            Err(e) => {
                tracing::warn!(
                    event = "control.encode_failed",
                    method = %req.method,
                    error = %e,
                    "control.encode_failed"
                );
                ControlResponse::err(
                    req.id.clone(),
                    ControlError::internal(
                        "failed to encode result",
                        serde_json::json!({ "error": e.to_string() }),
                    ),
                )
            }
        },
        Err(e) => ControlResponse::err(req.id.clone(), ControlError::from(&e)),
    }
}

fn ok_flag() -> serde_json::Value {
    serde_json::json!({ "ok": true })
}

/// Runs on the blocking pool: every engine call may touch the filesystem.
fn handle_request(req: &ControlRequest, engine: &TaskEngine) -> ControlResponse {
    if req.type_ != "control.request" || req.id.trim().is_empty() || req.method.trim().is_empty() {
        return ControlResponse::err(
            req.id.clone(),
            ControlError::invalid_request(
                "invalid request envelope",
                serde_json::json!({
                    "type": req.type_,
                    "method": req.method,
                }),
            ),
        );
    }

    match req.method.as_str() {
        METHOD_PING => ControlResponse::ok(
            req.id.clone(),
            serde_json::json!({ "ok": true, "app": fileserver_core::APP_NAME }),
        ),
        METHOD_UPLOAD_CREATE => {
            let params: UploadCreateParams = match parse_params(req) {
                Ok(p) => p,
                Err(resp) => return resp,
            };
            respond(
                req,
                engine.create_upload(NewUpload {
                    dest_path: params.dest_path,
                    total_size: params.total_size,
                    chunk_count: params.chunk_count,
                    owner: LOCAL_OWNER.to_string(),
                }),
            )
        }
        METHOD_UPLOAD_WRITE_CHUNK => {
            let params: WriteChunkParams = match parse_params(req) {
                Ok(p) => p,
                Err(resp) => return resp,
            };
            let data = match base64::engine::general_purpose::STANDARD.decode(params.data) {
                Ok(d) => d,
                Err(e) => {
                    return ControlResponse::err(
                        req.id.clone(),
                        ControlError::invalid_request(
                            "invalid chunk data",
                            serde_json::json!({ "error": e.to_string() }),
                        ),
                    );
                }
            };
            respond(req, engine.write_chunk(&params.task_id, params.position, &data))
        }
        METHOD_UPLOAD_STATUS => match parse_params::<TaskIdParams>(req) {
            Ok(p) => respond(req, engine.upload_status(&p.task_id)),
            Err(resp) => resp,
        },
        METHOD_UPLOAD_DELETE => match parse_params::<TaskIdParams>(req) {
            Ok(p) => respond(req, engine.delete_upload(&p.task_id).map(|()| ok_flag())),
            Err(resp) => resp,
        },
        METHOD_PACKAGE_CREATE => {
            let params: PackageCreateParams = match parse_params(req) {
                Ok(p) => p,
                Err(resp) => return resp,
            };
            let created = engine
                .create_package(params.source_path, params.ext.as_deref(), LOCAL_OWNER)
                .map(|task_id| PackageCreateResult { task_id });
            respond(req, created)
        }
        METHOD_PACKAGE_QUERY => match parse_params::<TaskIdParams>(req) {
            Ok(p) => respond(req, engine.query_package(&p.task_id)),
            Err(resp) => resp,
        },
        METHOD_PACKAGE_DOWNLOAD => match parse_params::<TaskIdParams>(req) {
            Ok(p) => {
                let result = engine.download_package(&p.task_id).map(|d| match d {
                    PackageDownload::InProgress(status) => PackageDownloadResult {
                        ready: false,
                        path: None,
                        file_name: None,
                        download_count: None,
                        progress: Some(status),
                    },
                    PackageDownload::Ready {
                        path,
                        file_name,
                        download_count,
                    } => PackageDownloadResult {
                        ready: true,
                        path: Some(path),
                        file_name: Some(file_name),
                        download_count: Some(download_count),
                        progress: None,
                    },
                });
                respond(req, result)
            }
            Err(resp) => resp,
        },
        METHOD_PACKAGE_DELETE => match parse_params::<TaskIdParams>(req) {
            Ok(p) => respond(req, engine.delete_package(&p.task_id).map(|()| ok_flag())),
            Err(resp) => resp,
        },
        METHOD_TASKS_LIST => respond(req, Ok(engine.list())),
        other => ControlResponse::err(
            req.id.clone(),
            ControlError::method_not_found(
                "unknown method",
                serde_json::json!({ "method": other }),
            ),
        ),
    }
}

async fn write_json_line(
    w: &mut BufWriter<tokio::net::unix::OwnedWriteHalf>,
    v: &ControlResponse,
) -> std::io::Result<()> {
    let line = serde_json::to_string(v).map_err(|e| std::io::Error::other(e.to_string()))?;
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await?;
    Ok(())
}
