use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lock_unpoisoned;

pub const ACTION_CREATE_UPLOAD: &str = "create_upload_task";
pub const ACTION_UPLOAD_FINISHED: &str = "upload_task_finished";
pub const ACTION_CREATE_PACKAGE: &str = "create_package_task";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub action: String,
    pub task_id: String,
    pub owner: String,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: &str, task_id: &str, owner: &str) -> Self {
        Self {
            action: action.to_string(),
            task_id: task_id.to_string(),
            owner: owner.to_string(),
            details: BTreeMap::new(),
            at: Utc::now(),
        }
    }

    pub fn detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }
}

/// Fire-and-forget history of task lifecycle events. Implementations handle
/// their own failures; callers never observe them.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: AuditEvent) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::info!(
            event = "audit.record",
            action = %event.action,
            task_id = %event.task_id,
            owner = %event.owner,
            details = ?event.details,
            "audit.record"
        );
    }
}

/// Appends one JSON object per line.
#[derive(Debug)]
pub struct NdjsonAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl NdjsonAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &AuditEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(event).map_err(std::io::Error::other)?;
        line.push(b'\n');

        let _guard = lock_unpoisoned(&self.write_lock);
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }
}

impl AuditSink for NdjsonAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.append(&event) {
            tracing::warn!(
                event = "audit.write_failed",
                action = %event.action,
                task_id = %event.task_id,
                path = %self.path.display(),
                error = %e,
                "audit.write_failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ndjson_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = NdjsonAuditSink::new(dir.path().join("audit").join("events.ndjson"));

        sink.record(AuditEvent::new(ACTION_CREATE_UPLOAD, "t1", "alice").detail("totalSize", 10));
        sink.record(AuditEvent::new(ACTION_UPLOAD_FINISHED, "t1", "alice"));

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let events: Vec<AuditEvent> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, ACTION_CREATE_UPLOAD);
        assert_eq!(events[0].details.get("totalSize").map(String::as_str), Some("10"));
        assert_eq!(events[1].action, ACTION_UPLOAD_FINISHED);
    }

    #[test]
    fn ndjson_failures_are_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for append.
        let sink = NdjsonAuditSink::new(dir.path());
        sink.record(AuditEvent::new(ACTION_CREATE_PACKAGE, "p1", "bob"));
    }
}
