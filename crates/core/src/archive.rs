use std::fs::{File, Metadata};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::Result;
use crate::progress::{PackageProgress, ProgressReader, ProgressWriter};

const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    /// Missing or empty hints pick the platform default; anything other than
    /// `.zip` becomes `.tar.gz`.
    pub fn from_hint(hint: Option<&str>) -> Self {
        match hint.map(str::trim) {
            None | Some("") => Self::platform_default(),
            Some(".zip") => Self::Zip,
            Some(_) => Self::TarGz,
        }
    }

    pub fn platform_default() -> Self {
        if cfg!(windows) { Self::Zip } else { Self::TarGz }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Zip => ".zip",
            Self::TarGz => ".tar.gz",
        }
    }
}

/// Totals measured by the writer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveTotals {
    pub files: u64,
    pub bytes: u64,
}

/// Container-relative entry name: `path` minus the parent of the source
/// root, with `/` separators.
pub fn entry_name(root_parent: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root_parent).unwrap_or(path);
    let name = rel.to_string_lossy().replace('\\', "/");
    name.trim_start_matches('/').to_string()
}

enum ArchiveWriter {
    Zip(ZipWriter<BufWriter<File>>),
    TarGz(tar::Builder<GzEncoder<BufWriter<File>>>),
}

impl ArchiveWriter {
    fn create(dest: &Path, format: ArchiveFormat) -> Result<Self> {
        let out = BufWriter::new(File::create(dest)?);
        Ok(match format {
            ArchiveFormat::Zip => Self::Zip(ZipWriter::new(out)),
            ArchiveFormat::TarGz => {
                Self::TarGz(tar::Builder::new(GzEncoder::new(out, Compression::default())))
            }
        })
    }

    fn add_dir(&mut self, name: &str, meta: &Metadata) -> Result<()> {
        match self {
            Self::Zip(zip) => {
                zip.add_directory(name, zip_options(meta))?;
            }
            Self::TarGz(tar) => {
                let mut header = tar::Header::new_gnu();
                header.set_metadata(meta);
                header.set_size(0);
                tar.append_data(&mut header, name, std::io::empty())?;
            }
        }
        Ok(())
    }

    /// Copies one file into the container, accounting every byte, and
    /// returns the number of bytes copied.
    ///
    /// A tar entry that yields fewer bytes than its header declares is an
    /// `UnexpectedEof` error: the container would be unreadable past it.
    fn add_file(
        &mut self,
        name: &str,
        meta: &Metadata,
        file: impl Read,
        progress: &PackageProgress,
    ) -> Result<u64> {
        match self {
            Self::Zip(zip) => {
                zip.start_file(name, zip_options(meta))?;
                let mut reader = ProgressReader::new(file, progress);
                let mut writer = ProgressWriter::new(&mut *zip, progress);
                std::io::copy(&mut reader, &mut writer)?;
                Ok(reader.copied())
            }
            Self::TarGz(tar) => {
                let declared = meta.len();
                let mut header = tar::Header::new_gnu();
                header.set_metadata(meta);
                // Never copy past the size recorded in the header.
                let mut reader = ProgressReader::mirrored(file.take(declared), progress);
                tar.append_data(&mut header, name, &mut reader)?;
                let copied = reader.copied();
                if copied != declared {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("{name}: read {copied} of {declared} bytes"),
                    )
                    .into());
                }
                Ok(copied)
            }
        }
    }

    fn finish(self) -> Result<()> {
        match self {
            Self::Zip(mut zip) => {
                let mut out = zip.finish()?;
                out.flush()?;
            }
            Self::TarGz(tar) => {
                let encoder = tar.into_inner()?;
                let mut out = encoder.finish()?;
                out.flush()?;
            }
        }
        Ok(())
    }
}

fn zip_options(meta: &Metadata) -> FileOptions {
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(meta.len() >= ZIP64_THRESHOLD);
    #[cfg(unix)]
    let options = {
        use std::os::unix::fs::PermissionsExt;
        options.unix_permissions(meta.permissions().mode() & 0o7777)
    };
    options
}

/// Builds the container at `dest` from `source`.
///
/// Directory sources also start an advisory size scan that races the writer.
/// Any error aborts the remaining traversal; the partial container is left
/// on disk for the caller to clean up.
pub fn build_archive(
    source: &Path,
    dest: &Path,
    format: ArchiveFormat,
    progress: &Arc<PackageProgress>,
) -> Result<ArchiveTotals> {
    let meta = std::fs::metadata(source)?;
    let root_parent = source.parent().unwrap_or(Path::new(""));
    let mut writer = ArchiveWriter::create(dest, format)?;

    let totals = if meta.is_dir() {
        spawn_size_scan(source.to_path_buf(), progress.clone());
        write_tree(&mut writer, source, root_parent, progress)?
    } else {
        progress.add_scanned(1, meta.len());
        let name = entry_name(root_parent, source);
        let file = File::open(source)?;
        let copied = writer.add_file(&name, &meta, file, progress)?;
        progress.finish_file();
        ArchiveTotals {
            files: 1,
            bytes: copied,
        }
    };

    writer.finish()?;
    Ok(totals)
}

fn write_tree(
    writer: &mut ArchiveWriter,
    source: &Path,
    root_parent: &Path,
    progress: &PackageProgress,
) -> Result<ArchiveTotals> {
    let mut totals = ArchiveTotals::default();
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        let path = entry.path();
        let name = entry_name(root_parent, path);
        // Follows symlinks: a dangling link fails the build here.
        let meta = std::fs::metadata(path)?;

        if meta.is_dir() {
            writer.add_dir(&name, &meta)?;
            continue;
        }

        let file = File::open(path)?;
        let copied = writer.add_file(&name, &meta, file, progress)?;
        progress.finish_file();
        totals.files += 1;
        totals.bytes += copied;
        tracing::debug!(
            event = "package.entry_written",
            entry = %name,
            size = copied,
            "package.entry_written"
        );
    }
    Ok(totals)
}

fn spawn_size_scan(source: PathBuf, progress: Arc<PackageProgress>) {
    let spawned = std::thread::Builder::new()
        .name("package-scan".to_string())
        .spawn(move || {
            for entry in WalkDir::new(&source).into_iter().flatten() {
                if progress.is_finished() {
                    return;
                }
                if let Ok(meta) = std::fs::metadata(entry.path())
                    && meta.is_file()
                {
                    progress.add_scanned(1, meta.len());
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(event = "package.scan_spawn_failed", error = %e, "package.scan_spawn_failed");
    }
}
