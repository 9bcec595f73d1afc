//! Compressed archives of retired log files and their retention sweep.
//!
//! Each archive is a gzip stream holding exactly one retired file; the
//! file's original name is kept in the gzip header.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use tracing::{debug, info, warn};

/// File extension of archives.
pub const ARCHIVE_EXTENSION: &str = "gz";

/// First free archive path for `file_name`: `<file_name>.gz`, then
/// `<file_name>.1.gz`, `<file_name>.2.gz`, ...
pub fn archive_path_for(archive_dir: &Path, file_name: &str) -> PathBuf {
    let mut candidate = archive_dir.join(format!("{}.{}", file_name, ARCHIVE_EXTENSION));
    let mut suffix = 1u32;
    while candidate.exists() {
        candidate = archive_dir.join(format!("{}.{}.{}", file_name, suffix, ARCHIVE_EXTENSION));
        suffix += 1;
    }
    candidate
}

/// Compress `source` into a new archive inside `archive_dir` and return the
/// archive path. The source file is left in place; a partially written
/// archive is removed on failure.
pub fn archive_file(source: &Path, archive_dir: &Path) -> io::Result<PathBuf> {
    let file_name = source
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot archive {}: no usable file name", source.display()),
            )
        })?
        .to_string();

    let destination = archive_path_for(archive_dir, &file_name);

    match write_archive(source, &destination, &file_name) {
        Ok(()) => {
            debug!(
                source = %source.display(),
                archive = %destination.display(),
                "Archived log file"
            );
            Ok(destination)
        }
        Err(e) => {
            if destination.exists() {
                if let Err(cleanup) = fs::remove_file(&destination) {
                    warn!(
                        archive = %destination.display(),
                        error = %cleanup,
                        "Failed to remove partial archive"
                    );
                }
            }
            Err(e)
        }
    }
}

fn write_archive(source: &Path, destination: &Path, file_name: &str) -> io::Result<()> {
    let mut input = BufReader::new(File::open(source)?);
    let output = File::options()
        .write(true)
        .create_new(true)
        .open(destination)?;

    let mut encoder = GzBuilder::new()
        .filename(file_name)
        .write(BufWriter::new(output), Compression::default());
    io::copy(&mut input, &mut encoder)?;

    let output = encoder.finish()?.into_inner().map_err(|e| e.into_error())?;
    output.sync_all()
}

/// Open an archive for reading its single contained file.
pub fn open_archive(path: &Path) -> io::Result<BufReader<GzDecoder<File>>> {
    Ok(BufReader::new(GzDecoder::new(File::open(path)?)))
}

/// Archives in `archive_dir`, sorted by name. A missing directory holds no
/// archives.
pub fn list_archives(archive_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(archive_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut archives = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == ARCHIVE_EXTENSION) {
            archives.push(path);
        }
    }
    archives.sort();
    Ok(archives)
}

/// Delete every archive whose age in whole days exceeds `retention_days`.
/// Returns the deleted paths. Failures on individual archives are logged and
/// skipped.
pub fn sweep_expired(
    archive_dir: &Path,
    retention_days: u32,
    now: DateTime<Utc>,
) -> io::Result<Vec<PathBuf>> {
    let mut deleted = Vec::new();

    for archive in list_archives(archive_dir)? {
        let modified = match fs::metadata(&archive).and_then(|meta| meta.modified()) {
            Ok(modified) => DateTime::<Utc>::from(modified),
            Err(e) => {
                warn!(archive = %archive.display(), error = %e, "Cannot read archive age");
                continue;
            }
        };

        let age_days = (now - modified).num_days();
        if age_days <= i64::from(retention_days) {
            continue;
        }

        match fs::remove_file(&archive) {
            Ok(()) => {
                info!(
                    archive = %archive.display(),
                    age_days = age_days,
                    retention_days = retention_days,
                    "Deleted expired archive"
                );
                deleted.push(archive);
            }
            Err(e) => {
                warn!(archive = %archive.display(), error = %e, "Failed to delete expired archive");
            }
        }
    }

    Ok(deleted)
}
