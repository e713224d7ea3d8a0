use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use fileserver_core::config::TransferSettings;
use fileserver_core::{
    ArchiveFormat, NoopAuditSink, PackageTask, ReaperPolicy, TaskEngine, TaskRegistry, UploadTask,
    spawn_reaper, sweep,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn finished_package(
    registry: &TaskRegistry,
    temp_dir: &Path,
    created_at: DateTime<Utc>,
    downloads: u64,
) -> Arc<PackageTask> {
    let task = registry
        .insert_package(|id| {
            PackageTask::new(
                id,
                temp_dir.join("src"),
                temp_dir,
                ArchiveFormat::Zip,
                "alice",
                created_at,
            )
        })
        .unwrap();
    std::fs::write(task.dest_path(), b"archive").unwrap();
    task.progress().finish();
    for _ in 0..downloads {
        task.record_download();
    }
    task
}

fn idle_upload(
    registry: &TaskRegistry,
    dir: &Path,
    last_activity: DateTime<Utc>,
) -> Arc<UploadTask> {
    let task = registry
        .insert_upload(|id| UploadTask::new(id, dir.join(format!("{id}.bin")), 8, "alice", last_activity))
        .unwrap();
    task.create_temp_file().unwrap();
    task
}

#[test]
fn undownloaded_package_expires_after_one_minute() {
    let temp = TempDir::new().unwrap();
    let registry = TaskRegistry::new();
    let now = Utc::now();

    let old = finished_package(&registry, temp.path(), now - TimeDelta::seconds(61), 0);
    let young = finished_package(&registry, temp.path(), now - TimeDelta::seconds(30), 0);

    let report = sweep(&registry, &ReaperPolicy::default(), now);
    assert_eq!(report.packages_removed, vec![old.id().to_string()]);
    assert!(!old.dest_path().exists());
    assert!(young.dest_path().exists());
    assert!(registry.package(young.id()).is_ok());
    assert!(registry.package(old.id()).unwrap_err().is_not_found());
}

#[test]
fn downloaded_package_lives_for_a_day() {
    let temp = TempDir::new().unwrap();
    let registry = TaskRegistry::new();
    let now = Utc::now();

    let recent = finished_package(&registry, temp.path(), now - TimeDelta::hours(23), 1);
    let stale = finished_package(&registry, temp.path(), now - TimeDelta::hours(25), 1);

    let report = sweep(&registry, &ReaperPolicy::default(), now);
    assert_eq!(report.packages_removed, vec![stale.id().to_string()]);
    assert!(registry.package(recent.id()).is_ok());
    assert!(recent.dest_path().exists());
    assert!(!stale.dest_path().exists());
}

#[test]
fn running_builds_are_never_reaped() {
    let temp = TempDir::new().unwrap();
    let registry = TaskRegistry::new();
    let now = Utc::now();

    let task = registry
        .insert_package(|id| {
            PackageTask::new(
                id,
                temp.path().join("src"),
                temp.path(),
                ArchiveFormat::TarGz,
                "alice",
                now - TimeDelta::hours(48),
            )
        })
        .unwrap();

    let report = sweep(&registry, &ReaperPolicy::default(), now);
    assert!(report.is_empty());
    assert!(registry.package(task.id()).is_ok());
}

#[test]
fn idle_uploads_expire_whether_finished_or_not() {
    let temp = TempDir::new().unwrap();
    let registry = TaskRegistry::new();
    let now = Utc::now();

    let stalled = idle_upload(&registry, temp.path(), now - TimeDelta::seconds(61));
    let active = idle_upload(&registry, temp.path(), now - TimeDelta::seconds(10));

    let done = idle_upload(&registry, temp.path(), now - TimeDelta::seconds(120));
    let w = done
        .write_chunk(0, b"complete", now - TimeDelta::seconds(90))
        .unwrap();
    assert!(w.ack.finished);

    let mut report = sweep(&registry, &ReaperPolicy::default(), now);
    report.uploads_removed.sort();
    let mut expected = vec![stalled.id().to_string(), done.id().to_string()];
    expected.sort();
    assert_eq!(report.uploads_removed, expected);

    assert!(!stalled.temp_path().exists());
    assert!(active.temp_path().exists());
    assert!(registry.upload(active.id()).is_ok());
    // The finalized destination belongs to the user and is kept.
    assert_eq!(std::fs::read(done.dest_path()).unwrap(), b"complete");
}

#[test]
fn chunk_activity_keeps_upload_alive() {
    let temp = TempDir::new().unwrap();
    let registry = TaskRegistry::new();
    let now = Utc::now();

    let task = idle_upload(&registry, temp.path(), now - TimeDelta::seconds(300));
    task.write_chunk(0, b"abcd", now - TimeDelta::seconds(5)).unwrap();

    assert!(sweep(&registry, &ReaperPolicy::default(), now).is_empty());
    assert!(task.temp_path().exists());
}

#[test]
fn policy_follows_transfer_settings() {
    let transfer = TransferSettings {
        upload_idle_secs: 5,
        package_ttl_secs: 7,
        downloaded_package_ttl_secs: 11,
        ..TransferSettings::default()
    };
    let policy = ReaperPolicy::from_settings(&transfer);
    assert_eq!(policy.upload_idle, Duration::from_secs(5));
    assert_eq!(policy.package_ttl, Duration::from_secs(7));
    assert_eq!(policy.downloaded_package_ttl, Duration::from_secs(11));

    let temp = TempDir::new().unwrap();
    let registry = TaskRegistry::new();
    let now = Utc::now();
    let pkg = finished_package(&registry, temp.path(), now - TimeDelta::seconds(8), 0);
    assert!(policy.package_expired(&pkg, now));
    assert!(!ReaperPolicy::default().package_expired(&pkg, now));
}

#[tokio::test]
async fn background_reaper_sweeps_until_cancelled() {
    let temp = TempDir::new().unwrap();
    let engine = Arc::new(TaskEngine::new(temp.path().join("tmp"), Arc::new(NoopAuditSink)));
    engine.prepare_temp_dir().unwrap();

    let policy = ReaperPolicy {
        upload_idle: Duration::from_millis(10),
        ..ReaperPolicy::default()
    };
    let stale = idle_upload(
        engine.registry(),
        temp.path(),
        Utc::now() - TimeDelta::seconds(1),
    );

    let cancel = CancellationToken::new();
    let handle = spawn_reaper(
        engine.clone(),
        policy,
        Duration::from_millis(20),
        cancel.clone(),
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while engine.registry().upload(stale.id()).is_ok() {
        assert!(tokio::time::Instant::now() < deadline, "reaper never swept");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!stale.temp_path().exists());

    cancel.cancel();
    handle.await.unwrap();
}
