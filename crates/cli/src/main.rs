use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use clap::{Parser, Subcommand};
use fileserver_core::config as settings_config;
use fileserver_core::control::{
    ControlError, ControlRequest, ControlResponse, MAX_REQUEST_BYTES, METHOD_PACKAGE_CREATE,
    METHOD_PACKAGE_DELETE, METHOD_PACKAGE_DOWNLOAD, METHOD_PACKAGE_QUERY, METHOD_PING,
    METHOD_TASKS_LIST, METHOD_UPLOAD_CREATE, METHOD_UPLOAD_WRITE_CHUNK, PackageCreateResult,
    PackageDownloadResult, control_ipc_socket_path,
};
use fileserver_core::{ChunkAck, PackageStatus, TaskListing, UploadCreated};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Base64 grows a chunk by 4/3; keep the encoded request under the daemon's cap.
const MAX_CHUNK_BYTES: u64 = (MAX_REQUEST_BYTES as u64 / 4) * 2;
const CHUNK_WRITE_ATTEMPTS: usize = 3;

#[derive(Parser)]
#[command(name = "fileserver")]
#[command(about = "FileServer transfer and archive client", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Ping,
    Upload {
        file: PathBuf,
        #[arg(long)]
        dest: PathBuf,
        #[arg(long)]
        chunk_bytes: Option<u64>,
    },
    Pkg {
        #[command(subcommand)]
        cmd: PkgCmd,
    },
    Tasks {
        #[command(subcommand)]
        cmd: TasksCmd,
    },
}

#[derive(Subcommand)]
enum PkgCmd {
    Create {
        source: PathBuf,
        #[arg(long)]
        ext: Option<String>,
    },
    Query {
        id: String,
    },
    Wait {
        id: String,
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    Fetch {
        id: String,
        #[arg(long)]
        out: PathBuf,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum TasksCmd {
    List,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: String,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }

    fn io(context: &str, e: std::io::Error) -> Self {
        Self::new("cli.io_failed", format!("{context}: {e}"))
    }
}

impl From<ControlError> for CliError {
    fn from(e: ControlError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
            retryable: e.retryable,
        }
    }
}

struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, CliError> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            let mut err = CliError::retryable("control.unavailable", format!("daemon unreachable: {e}"));
            err.details = serde_json::json!({ "socketPath": self.socket_path });
            err
        })?;
        let (r, mut w) = stream.into_split();

        let req = ControlRequest::new(uuid::Uuid::new_v4().to_string(), method, params);
        let line = serde_json::to_string(&req)
            .map_err(|e| CliError::new("cli.encode_failed", e.to_string()))?
            + "\n";
        w.write_all(line.as_bytes())
            .await
            .map_err(|e| CliError::retryable("control.unavailable", e.to_string()))?;
        w.flush()
            .await
            .map_err(|e| CliError::retryable("control.unavailable", e.to_string()))?;

        let resp_line = BufReader::new(r)
            .lines()
            .next_line()
            .await
            .map_err(|e| CliError::retryable("control.unavailable", e.to_string()))?
            .ok_or_else(|| CliError::retryable("control.unavailable", "daemon closed connection"))?;
        let resp: ControlResponse = serde_json::from_str(&resp_line)
            .map_err(|e| CliError::new("control.invalid_response", e.to_string()))?;

        if !resp.ok {
            let err = resp.error.unwrap_or_else(|| {
                ControlError::invalid_request("error response without error", serde_json::json!({}))
            });
            return Err(err.into());
        }
        serde_json::from_value(resp.result.unwrap_or(serde_json::Value::Null))
            .map_err(|e| CliError::new("control.invalid_response", e.to_string()))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .unwrap_or_else(settings_config::config_dir_from_env);
    let data_dir = cli
        .data_dir
        .unwrap_or_else(settings_config::data_dir_from_env);
    let client = ControlClient {
        socket_path: control_ipc_socket_path(&data_dir),
    };

    match cli.cmd {
        Command::Ping => {
            let v: serde_json::Value = client.call(METHOD_PING, serde_json::json!({})).await?;
            if cli.json {
                println!("{v}");
            } else {
                println!("pong");
            }
            Ok(())
        }
        Command::Upload {
            file,
            dest,
            chunk_bytes,
        } => {
            let chunk_bytes = match chunk_bytes {
                Some(n) => n,
                None => {
                    settings_config::load_settings(&config_dir)
                        .map_err(|e| CliError::new(e.code(), e.to_string()))?
                        .transfer
                        .default_chunk_bytes
                }
            };
            upload(&client, &file, &dest, chunk_bytes, cli.json, cli.events).await
        }
        Command::Pkg { cmd } => match cmd {
            PkgCmd::Create { source, ext } => {
                let source = absolute(&source)?;
                let created: PackageCreateResult = client
                    .call(
                        METHOD_PACKAGE_CREATE,
                        serde_json::json!({ "sourcePath": source, "ext": ext }),
                    )
                    .await?;
                if cli.json {
                    print_json(&created);
                } else {
                    println!("{}", created.task_id);
                }
                Ok(())
            }
            PkgCmd::Query { id } => {
                let status = query_package(&client, &id).await?;
                print_status(&status, cli.json);
                Ok(())
            }
            PkgCmd::Wait { id, interval_ms } => {
                let status =
                    wait_package(&client, &id, Duration::from_millis(interval_ms), cli.events).await?;
                print_status(&status, cli.json);
                Ok(())
            }
            PkgCmd::Fetch { id, out } => fetch_package(&client, &id, &out, cli.json).await,
            PkgCmd::Delete { id } => {
                let _: serde_json::Value = client
                    .call(METHOD_PACKAGE_DELETE, serde_json::json!({ "taskId": id }))
                    .await?;
                if cli.json {
                    println!("{}", serde_json::json!({ "ok": true, "taskId": id }));
                } else {
                    println!("deleted {id}");
                }
                Ok(())
            }
        },
        Command::Tasks { cmd } => match cmd {
            TasksCmd::List => {
                let listing: TaskListing =
                    client.call(METHOD_TASKS_LIST, serde_json::json!({})).await?;
                if cli.json {
                    print_json(&listing);
                } else {
                    for id in &listing.uploads {
                        println!("upload  {id}");
                    }
                    for id in &listing.packages {
                        println!("package {id}");
                    }
                }
                Ok(())
            }
        },
    }
}

async fn upload(
    client: &ControlClient,
    file: &Path,
    dest: &Path,
    chunk_bytes: u64,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    if chunk_bytes == 0 || chunk_bytes > MAX_CHUNK_BYTES {
        return Err(CliError::new(
            "cli.invalid_argument",
            format!("--chunk-bytes must be within 1..={MAX_CHUNK_BYTES}"),
        ));
    }

    let mut input = std::fs::File::open(file).map_err(|e| CliError::io("open input", e))?;
    let total_size = input
        .metadata()
        .map_err(|e| CliError::io("stat input", e))?
        .len();
    let chunk_count = total_size.div_ceil(chunk_bytes).max(1);
    let dest = absolute(dest)?;

    let created: UploadCreated = client
        .call(
            METHOD_UPLOAD_CREATE,
            serde_json::json!({
                "destPath": dest,
                "totalSize": total_size,
                "chunkCount": chunk_count,
            }),
        )
        .await?;

    let mut buf = vec![0u8; chunk_bytes as usize];
    let mut position = 0u64;
    let mut last_ack = None;
    loop {
        let n = read_full(&mut input, &mut buf).map_err(|e| CliError::io("read input", e))?;
        // An empty file still needs one (empty) chunk to finalize.
        if n == 0 && position > 0 {
            break;
        }
        let ack = write_chunk(client, &created.id, position, &buf[..n]).await?;
        position += n as u64;
        if events {
            println!(
                "{}",
                serde_json::json!({
                    "type": "upload.progress",
                    "taskId": created.id,
                    "receivedSize": ack.received_size,
                    "totalSize": ack.total_size,
                })
            );
        }
        let finished = ack.finished;
        last_ack = Some(ack);
        if finished || n == 0 {
            break;
        }
    }

    let ack = last_ack.ok_or_else(|| CliError::new("cli.upload_incomplete", "no chunk sent"))?;
    if !ack.finished {
        let mut err = CliError::new(
            "cli.upload_incomplete",
            format!("daemon holds {}/{} bytes", ack.received_size, ack.total_size),
        );
        err.details = serde_json::json!({ "taskId": created.id });
        return Err(err);
    }

    if json {
        println!(
            "{}",
            serde_json::json!({
                "taskId": created.id,
                "destPath": dest,
                "totalSize": ack.total_size,
                "finished": true,
            })
        );
    } else {
        println!("uploaded {} bytes to {}", ack.total_size, dest.display());
    }
    Ok(())
}

/// Resends a chunk only when the daemon could not be reached. Chunk writes
/// are idempotent; a task error means the session itself has failed.
async fn write_chunk(
    client: &ControlClient,
    task_id: &str,
    position: u64,
    data: &[u8],
) -> Result<ChunkAck, CliError> {
    let params = serde_json::json!({
        "taskId": task_id,
        "position": position,
        "data": base64::engine::general_purpose::STANDARD.encode(data),
    });
    let mut attempt = 1;
    loop {
        match client.call(METHOD_UPLOAD_WRITE_CHUNK, params.clone()).await {
            Ok(ack) => return Ok(ack),
            Err(e) if is_transport_failure(&e) && attempt < CHUNK_WRITE_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_transport_failure(e: &CliError) -> bool {
    e.retryable && e.code == "control.unavailable"
}

fn read_full(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

async fn query_package(client: &ControlClient, id: &str) -> Result<PackageStatus, CliError> {
    client
        .call(METHOD_PACKAGE_QUERY, serde_json::json!({ "taskId": id }))
        .await
}

async fn wait_package(
    client: &ControlClient,
    id: &str,
    interval: Duration,
    events: bool,
) -> Result<PackageStatus, CliError> {
    loop {
        let status = query_package(client, id).await?;
        if events {
            println!(
                "{}",
                serde_json::json!({
                    "type": "package.progress",
                    "taskId": id,
                    "filesFinished": status.files_finished,
                    "totalFiles": status.total_files,
                    "bytesWritten": status.bytes_written,
                    "totalBytes": status.total_bytes,
                })
            );
        }
        if let Some(message) = &status.error {
            let mut err = CliError::new("task.archive_failed", message.clone());
            err.details = serde_json::json!({ "taskId": id });
            return Err(err);
        }
        if status.finished {
            return Ok(status);
        }
        tokio::time::sleep(interval).await;
    }
}

async fn fetch_package(
    client: &ControlClient,
    id: &str,
    out: &Path,
    json: bool,
) -> Result<(), CliError> {
    let download: PackageDownloadResult = client
        .call(METHOD_PACKAGE_DOWNLOAD, serde_json::json!({ "taskId": id }))
        .await?;

    let (Some(path), Some(file_name)) = (download.path, download.file_name) else {
        let mut err = CliError::retryable("package.not_ready", "package is still being built");
        if let Some(progress) = download.progress {
            err.details = serde_json::to_value(progress).unwrap_or(serde_json::json!({}));
        }
        return Err(err);
    };

    let target = if out.is_dir() {
        out.join(&file_name)
    } else {
        out.to_path_buf()
    };
    let bytes = std::fs::copy(&path, &target).map_err(|e| CliError::io("copy package", e))?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "taskId": id,
                "path": target,
                "bytes": bytes,
                "downloadCount": download.download_count,
            })
        );
    } else {
        println!("saved {} ({bytes} bytes)", target.display());
    }
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf, CliError> {
    std::path::absolute(path).map_err(|e| CliError::io("resolve path", e))
}

fn print_status(status: &PackageStatus, json: bool) {
    if json {
        print_json(status);
        return;
    }
    let state = match (&status.error, status.finished) {
        (Some(e), _) => format!("failed: {e}"),
        (None, true) => "finished".to_string(),
        (None, false) => "running".to_string(),
    };
    println!(
        "{} {} files {}/{} bytes {}/{} ({state})",
        status.id,
        status.file_name,
        status.files_finished,
        status.total_files,
        status.bytes_written,
        status.total_bytes,
    );
}

fn print_json<T: Serialize>(v: &T) {
    match serde_json::to_string(v) {
        Ok(s) => println!("{s}"),
        Err(e) => emit_error(&CliError::new("cli.encode_failed", e.to_string())),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_limit_fits_request_cap() {
        let encoded = MAX_CHUNK_BYTES.div_ceil(3) * 4;
        assert!((encoded as usize) < MAX_REQUEST_BYTES);
    }

    #[test]
    fn read_full_fills_across_short_reads() {
        struct Trickle<'a>(&'a [u8]);
        impl Read for Trickle<'_> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let n = self.0.len().min(buf.len()).min(2);
                buf[..n].copy_from_slice(&self.0[..n]);
                self.0 = &self.0[n..];
                Ok(n)
            }
        }

        let mut buf = [0u8; 5];
        let mut r = Trickle(b"abcdefg");
        assert_eq!(read_full(&mut r, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"abcde");
        assert_eq!(read_full(&mut r, &mut buf).unwrap(), 2);
        assert_eq!(read_full(&mut r, &mut buf).unwrap(), 0);
    }

    #[test]
    fn control_errors_carry_over() {
        let e: CliError = ControlError::invalid_request("bad", serde_json::json!({ "x": 1 })).into();
        assert_eq!(e.code, "control.invalid_request");
        assert!(!e.retryable);
        assert_eq!(e.details["x"], 1);
    }

    #[test]
    fn only_transport_failures_resend_chunks() {
        assert!(is_transport_failure(&CliError::retryable(
            "control.unavailable",
            "daemon unreachable"
        )));
        let task_failure: CliError =
            ControlError::from(&fileserver_core::Error::Io(std::io::Error::other("disk"))).into();
        assert!(!is_transport_failure(&task_failure));
        assert!(!is_transport_failure(&CliError::retryable(
            "package.not_ready",
            "still building"
        )));
    }
}
