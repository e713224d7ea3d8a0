use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::TaskEngine;
use crate::config::TransferSettings;
use crate::package::PackageTask;
use crate::registry::TaskRegistry;
use crate::upload::UploadTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperPolicy {
    /// Uploads with no chunk activity for longer than this expire, finished or not.
    pub upload_idle: Duration,
    /// Finished packages never downloaded.
    pub package_ttl: Duration,
    /// Finished packages downloaded at least once.
    pub downloaded_package_ttl: Duration,
}

impl Default for ReaperPolicy {
    fn default() -> Self {
        Self {
            upload_idle: Duration::from_secs(60),
            package_ttl: Duration::from_secs(60),
            downloaded_package_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl ReaperPolicy {
    pub fn from_settings(transfer: &TransferSettings) -> Self {
        Self {
            upload_idle: Duration::from_secs(transfer.upload_idle_secs),
            package_ttl: Duration::from_secs(transfer.package_ttl_secs),
            downloaded_package_ttl: Duration::from_secs(transfer.downloaded_package_ttl_secs),
        }
    }

    pub fn upload_expired(&self, task: &UploadTask, now: DateTime<Utc>) -> bool {
        older_than(task.last_activity_at(), now, self.upload_idle)
    }

    /// Builds still running are never expired.
    pub fn package_expired(&self, task: &PackageTask, now: DateTime<Utc>) -> bool {
        if !task.is_finished() {
            return false;
        }
        let ttl = if task.download_count() > 0 {
            self.downloaded_package_ttl
        } else {
            self.package_ttl
        };
        older_than(task.created_at(), now, ttl)
    }
}

fn older_than(since: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    (now - since).to_std().is_ok_and(|age| age > limit)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub uploads_removed: Vec<String>,
    pub packages_removed: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.uploads_removed.is_empty() && self.packages_removed.is_empty()
    }
}

/// One pass over the registry. Candidates come from a snapshot; each removal
/// re-checks expiry under the registry lock, and files are deleted after the
/// lock is released.
pub fn sweep(registry: &TaskRegistry, policy: &ReaperPolicy, now: DateTime<Utc>) -> SweepReport {
    let mut report = SweepReport::default();

    let upload_candidates: Vec<String> = registry
        .uploads()
        .iter()
        .filter(|t| policy.upload_expired(t, now))
        .map(|t| t.id().to_string())
        .collect();
    for id in upload_candidates {
        if let Some(task) = registry.remove_upload_if(&id, |t| policy.upload_expired(t, now)) {
            remove_artifact(task.id(), task.temp_path());
            tracing::info!(
                event = "reaper.upload_expired",
                task_id = %id,
                finished = task.is_finished(),
                "reaper.upload_expired"
            );
            report.uploads_removed.push(id);
        }
    }

    let package_candidates: Vec<String> = registry
        .packages()
        .iter()
        .filter(|t| policy.package_expired(t, now))
        .map(|t| t.id().to_string())
        .collect();
    for id in package_candidates {
        if let Some(task) = registry.remove_package_if(&id, |t| policy.package_expired(t, now)) {
            remove_artifact(task.id(), task.dest_path());
            tracing::info!(
                event = "reaper.package_expired",
                task_id = %id,
                download_count = task.download_count(),
                "reaper.package_expired"
            );
            report.packages_removed.push(id);
        }
    }

    report
}

/// Best-effort file removal; a missing file is not an error.
pub(crate) fn remove_artifact(task_id: &str, path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(
                event = "task.artifact_remove_failed",
                task_id = %task_id,
                path = %path.display(),
                error = %e,
                "task.artifact_remove_failed"
            );
        }
    }
}

/// Sweeps every `interval` until `cancel` fires. The first sweep happens one
/// interval after start.
pub fn spawn_reaper(
    engine: Arc<TaskEngine>,
    policy: ReaperPolicy,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let engine = engine.clone();
            let swept =
                tokio::task::spawn_blocking(move || sweep(engine.registry(), &policy, Utc::now()))
                    .await;
            match swept {
                Ok(report) if !report.is_empty() => {
                    tracing::info!(
                        event = "reaper.sweep",
                        uploads_removed = report.uploads_removed.len(),
                        packages_removed = report.packages_removed.len(),
                        "reaper.sweep"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(event = "reaper.sweep_failed", error = %e, "reaper.sweep_failed");
                }
            }
        }
        tracing::debug!(event = "reaper.stopped", "reaper.stopped");
    })
}
