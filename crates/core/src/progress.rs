use std::io::{Read, Write};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::lock_unpoisoned;

/// Point-in-time copy of a package build's counters.
///
/// `total_files` and `total_bytes` come from an advisory scan that races the
/// archive writer; until `finished` they are estimates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub files_finished: u64,
    pub total_files: u64,
    pub total_bytes: u64,
    pub error: Option<String>,
    pub finished: bool,
}

/// Counters written by one archive builder and polled by many readers.
///
/// All fields live behind one mutex, so a snapshot never pairs `finished`
/// with counters that have not reached their terminal values.
#[derive(Debug, Default)]
pub struct PackageProgress {
    state: Mutex<ProgressSnapshot>,
}

impl PackageProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_read(&self, n: u64) {
        self.update(|s| s.bytes_read += n);
    }

    pub fn add_written(&self, n: u64) {
        self.update(|s| s.bytes_written += n);
    }

    pub fn finish_file(&self) {
        self.update(|s| s.files_finished += 1);
    }

    pub fn add_scanned(&self, files: u64, bytes: u64) {
        self.update(|s| {
            s.total_files += files;
            s.total_bytes += bytes;
        });
    }

    /// Records a terminal error and completes the build. Only the first error sticks.
    pub fn fail(&self, message: impl Into<String>) {
        let mut s = lock_unpoisoned(&self.state);
        if s.finished {
            return;
        }
        s.error = Some(message.into());
        s.finished = true;
    }

    pub fn finish(&self) {
        lock_unpoisoned(&self.state).finished = true;
    }

    /// Completes a successful build, replacing the scan estimate with the
    /// totals the writer actually measured.
    pub fn finish_with_totals(&self, files: u64, bytes: u64) {
        let mut s = lock_unpoisoned(&self.state);
        if s.finished {
            return;
        }
        s.total_files = files;
        s.total_bytes = bytes;
        s.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        lock_unpoisoned(&self.state).finished
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        lock_unpoisoned(&self.state).clone()
    }

    fn update(&self, f: impl FnOnce(&mut ProgressSnapshot)) {
        let mut s = lock_unpoisoned(&self.state);
        if s.finished {
            return;
        }
        f(&mut s);
    }
}

/// Counts bytes pulled from `inner` as read. In mirrored mode every byte is
/// also counted as written, for sinks that copy the stream straight through.
pub struct ProgressReader<'a, R> {
    inner: R,
    progress: &'a PackageProgress,
    mirror_writes: bool,
    copied: u64,
}

impl<'a, R: Read> ProgressReader<'a, R> {
    pub fn new(inner: R, progress: &'a PackageProgress) -> Self {
        Self {
            inner,
            progress,
            mirror_writes: false,
            copied: 0,
        }
    }

    pub fn mirrored(inner: R, progress: &'a PackageProgress) -> Self {
        Self {
            inner,
            progress,
            mirror_writes: true,
            copied: 0,
        }
    }

    /// Bytes pulled from `inner` so far.
    pub fn copied(&self) -> u64 {
        self.copied
    }
}

impl<R: Read> Read for ProgressReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.copied += n as u64;
            self.progress.add_read(n as u64);
            if self.mirror_writes {
                self.progress.add_written(n as u64);
            }
        }
        Ok(n)
    }
}

pub struct ProgressWriter<'a, W> {
    inner: W,
    progress: &'a PackageProgress,
}

impl<'a, W: Write> ProgressWriter<'a, W> {
    pub fn new(inner: W, progress: &'a PackageProgress) -> Self {
        Self { inner, progress }
    }
}

impl<W: Write> Write for ProgressWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.progress.add_written(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounting_stops_after_failure() {
        let p = PackageProgress::new();
        p.add_read(3);
        p.add_written(3);
        p.finish_file();
        p.fail("boom");
        p.add_read(10);
        p.finish_file();
        p.fail("second");

        let s = p.snapshot();
        assert_eq!(s.bytes_read, 3);
        assert_eq!(s.bytes_written, 3);
        assert_eq!(s.files_finished, 1);
        assert_eq!(s.error.as_deref(), Some("boom"));
        assert!(s.finished);
    }

    #[test]
    fn finish_replaces_scan_estimate() {
        let p = PackageProgress::new();
        p.add_scanned(5, 100);
        p.finish_with_totals(2, 8);
        p.add_scanned(1, 1);

        let s = p.snapshot();
        assert_eq!((s.total_files, s.total_bytes), (2, 8));
        assert!(s.finished);
        assert!(s.error.is_none());
    }

    #[test]
    fn reader_counts_reads_and_treats_empty_read_as_eof() {
        let p = PackageProgress::new();
        let mut out = Vec::new();
        let mut r = ProgressReader::new(&b"hello"[..], &p);
        std::io::copy(&mut r, &mut out).unwrap();
        assert_eq!(out, b"hello");
        let s = p.snapshot();
        assert_eq!(s.bytes_read, 5);
        assert_eq!(s.bytes_written, 0);
    }

    #[test]
    fn mirrored_reader_and_writer_count_written() {
        let p = PackageProgress::new();
        let mut r = ProgressReader::mirrored(&b"abc"[..], &p);
        std::io::copy(&mut r, &mut std::io::sink()).unwrap();

        let mut w = ProgressWriter::new(Vec::new(), &p);
        w.write_all(b"defg").unwrap();

        let s = p.snapshot();
        assert_eq!(s.bytes_read, 3);
        assert_eq!(s.bytes_written, 7);
    }
}
