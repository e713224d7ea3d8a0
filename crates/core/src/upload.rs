use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, lock_unpoisoned};

pub const UPLOAD_FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPhase {
    Pending,
    Receiving,
    Finalizing,
    Completed,
    Failed,
}

/// Sorted, disjoint, non-adjacent half-open byte ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkCoverage {
    ranges: Vec<(u64, u64)>,
}

impl ChunkCoverage {
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let (mut s, mut e) = (start, end);
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;
        for &(rs, re) in &self.ranges {
            if re < s {
                merged.push((rs, re));
            } else if rs > e {
                if !placed {
                    merged.push((s, e));
                    placed = true;
                }
                merged.push((rs, re));
            } else {
                s = s.min(rs);
                e = e.max(re);
            }
        }
        if !placed {
            merged.push((s, e));
        }
        self.ranges = merged;
    }

    /// Distinct bytes covered so far.
    pub fn covered(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub received_size: u64,
    pub total_size: u64,
    pub finished: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWrite {
    pub ack: ChunkAck,
    /// True only for the call that performed the rename.
    pub finalized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub id: String,
    pub dest_path: PathBuf,
    pub total_size: u64,
    pub received_size: u64,
    pub phase: UploadPhase,
    pub finished: bool,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
struct UploadState {
    phase: UploadPhase,
    coverage: ChunkCoverage,
    last_activity_at: DateTime<Utc>,
    failure: Option<String>,
}

#[derive(Debug)]
pub struct UploadTask {
    id: String,
    dest_path: PathBuf,
    temp_path: PathBuf,
    total_size: u64,
    owner: String,
    started_at: DateTime<Utc>,
    state: Mutex<UploadState>,
}

pub fn temp_path_for(dest_path: &Path, id: &str) -> PathBuf {
    let mut name = dest_path.as_os_str().to_owned();
    name.push(".");
    name.push(id);
    PathBuf::from(name)
}

impl UploadTask {
    pub fn new(
        id: &str,
        dest_path: PathBuf,
        total_size: u64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.to_string(),
            temp_path: temp_path_for(&dest_path, id),
            dest_path,
            total_size,
            owner: owner.to_string(),
            started_at: now,
            state: Mutex::new(UploadState {
                phase: UploadPhase::Pending,
                coverage: ChunkCoverage::default(),
                last_activity_at: now,
                failure: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dest_path(&self) -> &Path {
        &self.dest_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        lock_unpoisoned(&self.state).last_activity_at
    }

    pub fn phase(&self) -> UploadPhase {
        lock_unpoisoned(&self.state).phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase() == UploadPhase::Completed
    }

    pub fn status(&self) -> UploadStatus {
        let state = lock_unpoisoned(&self.state);
        UploadStatus {
            id: self.id.clone(),
            dest_path: self.dest_path.clone(),
            total_size: self.total_size,
            received_size: state.coverage.covered(),
            phase: state.phase,
            finished: state.phase == UploadPhase::Completed,
            started_at: self.started_at,
            last_activity_at: state.last_activity_at,
            error: state.failure.clone(),
        }
    }

    /// Creates (or truncates) the empty staging file.
    pub fn create_temp_file(&self) -> Result<()> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.temp_path)?;
        Ok(())
    }

    /// Writes `data` at `position` in the staging file and finalizes the
    /// upload once every declared byte has been covered.
    pub fn write_chunk(&self, position: u64, data: &[u8], now: DateTime<Utc>) -> Result<ChunkWrite> {
        let len = data.len() as u64;
        let end = {
            let mut state = lock_unpoisoned(&self.state);
            match state.phase {
                UploadPhase::Completed | UploadPhase::Finalizing => {
                    state.last_activity_at = now;
                    return Ok(self.unchanged(&state));
                }
                UploadPhase::Failed => return Err(self.failed(&state)),
                UploadPhase::Pending | UploadPhase::Receiving => {}
            }
            match position.checked_add(len) {
                Some(end) if end <= self.total_size => end,
                _ => {
                    return Err(Error::SizeExceeded {
                        position,
                        len,
                        total: self.total_size,
                    });
                }
            }
        };

        if !data.is_empty()
            && let Err(e) = self.write_at(position, data)
        {
            let mut state = lock_unpoisoned(&self.state);
            if matches!(
                state.phase,
                UploadPhase::Completed | UploadPhase::Finalizing
            ) {
                return Ok(self.unchanged(&state));
            }
            state.phase = UploadPhase::Failed;
            state.failure = Some(e.to_string());
            tracing::warn!(
                event = "upload.write_failed",
                task_id = %self.id,
                position,
                len,
                error = %e,
                "upload.write_failed"
            );
            return Err(Error::Io(e));
        }

        {
            let mut state = lock_unpoisoned(&self.state);
            state.last_activity_at = now;
            match state.phase {
                UploadPhase::Failed => return Err(self.failed(&state)),
                UploadPhase::Completed | UploadPhase::Finalizing => {
                    return Ok(self.unchanged(&state));
                }
                UploadPhase::Pending | UploadPhase::Receiving => {}
            }
            state.coverage.insert(position, end);
            if state.coverage.covered() < self.total_size {
                state.phase = UploadPhase::Receiving;
                return Ok(self.unchanged(&state));
            }
            state.phase = UploadPhase::Finalizing;
        }

        let result = self.finalize();
        let mut state = lock_unpoisoned(&self.state);
        match result {
            Ok(()) => {
                state.phase = UploadPhase::Completed;
                tracing::info!(
                    event = "upload.finalized",
                    task_id = %self.id,
                    dest_path = %self.dest_path.display(),
                    total_size = self.total_size,
                    "upload.finalized"
                );
                Ok(ChunkWrite {
                    ack: self.ack(&state),
                    finalized: true,
                })
            }
            Err(e) => {
                state.phase = UploadPhase::Failed;
                state.failure = Some(e.to_string());
                tracing::warn!(
                    event = "upload.finalize_failed",
                    task_id = %self.id,
                    dest_path = %self.dest_path.display(),
                    error = %e,
                    "upload.finalize_failed"
                );
                Err(Error::Io(e))
            }
        }
    }

    fn write_at(&self, position: u64, data: &[u8]) -> std::io::Result<()> {
        // No create: a late write must not resurrect a finalized temp file.
        let file = OpenOptions::new().write(true).open(&self.temp_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            file.write_all_at(data, position)?;
        }
        #[cfg(not(unix))]
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = file;
            file.seek(SeekFrom::Start(position))?;
            file.write_all(data)?;
        }
        Ok(())
    }

    fn finalize(&self) -> std::io::Result<()> {
        std::fs::rename(&self.temp_path, &self.dest_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                &self.dest_path,
                std::fs::Permissions::from_mode(UPLOAD_FILE_MODE),
            )?;
        }
        Ok(())
    }

    fn ack(&self, state: &UploadState) -> ChunkAck {
        ChunkAck {
            received_size: state.coverage.covered(),
            total_size: self.total_size,
            finished: state.phase == UploadPhase::Completed,
        }
    }

    fn unchanged(&self, state: &UploadState) -> ChunkWrite {
        ChunkWrite {
            ack: self.ack(state),
            finalized: false,
        }
    }

    fn failed(&self, state: &UploadState) -> Error {
        Error::UploadFailed {
            id: self.id.clone(),
            message: state
                .failure
                .clone()
                .unwrap_or_else(|| "upload failed".to_string()),
        }
    }
}
