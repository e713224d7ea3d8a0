use std::sync::Arc;
use std::time::Duration;

use fileserver_core::config::{self as settings_config, Settings};
use fileserver_core::control::control_ipc_socket_path;
use fileserver_core::{
    AuditSink, NdjsonAuditSink, ReaperPolicy, TaskEngine, TracingAuditSink, logging, spawn_reaper,
};
use tokio_util::sync::CancellationToken;

mod control_ipc;

fn build_audit_sink(settings: &Settings) -> Arc<dyn AuditSink> {
    match &settings.logging.audit_log {
        Some(path) => Arc::new(NdjsonAuditSink::new(path.clone())),
        None => Arc::new(TracingAuditSink),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_root = settings_config::config_dir_from_env();
    let data_root = settings_config::data_dir_from_env();

    let settings = settings_config::load_settings(&config_root)?;
    settings_config::validate_settings(&settings)?;
    logging::init_logging(settings.logging.level.as_deref());

    tracing::info!(
        event = "daemon.starting",
        config_dir = %config_root.display(),
        data_dir = %data_root.display(),
        root_dir = %settings.server.root_dir.display(),
        "daemon.starting"
    );

    let engine = Arc::new(TaskEngine::new(
        settings.server.effective_temp_dir(),
        build_audit_sink(&settings),
    ));
    engine.prepare_temp_dir()?;

    let cancel = CancellationToken::new();
    let reaper = spawn_reaper(
        engine.clone(),
        ReaperPolicy::from_settings(&settings.transfer),
        Duration::from_secs(settings.transfer.reap_interval_secs),
        cancel.clone(),
    );

    let socket_path = control_ipc_socket_path(&data_root);
    let control_server = control_ipc::spawn_control_ipc_server(socket_path, engine.clone())?;

    tracing::info!(event = "daemon.ready", "daemon.ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!(event = "daemon.stopping", "daemon.stopping");

    cancel.cancel();
    if let Err(e) = reaper.await {
        tracing::warn!(event = "reaper.join_failed", error = %e, "reaper.join_failed");
    }
    control_server.shutdown().await;

    let listing = engine.list();
    tracing::info!(
        event = "daemon.stopped",
        uploads_dropped = listing.uploads.len(),
        packages_dropped = listing.packages.len(),
        "daemon.stopped"
    );
    Ok(())
}
