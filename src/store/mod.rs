//! Buffered, rotating log store.
//!
//! Records are buffered in memory and appended to the active file in
//! batches. The active file is retired into a gzip archive whenever the
//! [`RotationPolicy`](rotation::RotationPolicy) fires, and archives older than
//! the retention window are swept after every rotation. Everything on disk
//! can be scanned back with [`LogStore::read`].
//!
//! `LogStore` is a plain single-owner value. Concurrent producers go through
//! a [`StoreHandle`](writer::StoreHandle), which serializes them onto one
//! writer task.

pub mod archive;
pub mod record;
pub mod replay;
pub mod rotation;
pub mod writer;

use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, StoreConfig};
use record::{LogRecord, HEADER};
use replay::{Replay, ReplayQuery, ReplayScope};
use rotation::RotationPolicy;

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("filename pattern '{0}' is not a valid date format")]
    InvalidPattern(String),

    #[error("{pending} records already pending (limit {limit}), rejecting record")]
    Backpressure { pending: usize, limit: usize },

    #[error("log store is closed")]
    Closed,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Lifecycle of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Open,
    Rotating,
    Closed,
}

/// The file currently receiving flushed records.
#[derive(Debug)]
struct ActiveFile {
    path: PathBuf,
    file: File,
    opened_at: Instant,
    line_count: u64,
    size_bytes: u64,
}

impl ActiveFile {
    /// Open `path` for appending. An existing file is rescanned for its row
    /// count and completed with a trailing line break if it lacks one; a new
    /// or empty file gets the header row.
    fn open(path: &Path, opened_at: Instant) -> Result<Self, StoreError> {
        if !path.exists() {
            let mut file = File::options()
                .create_new(true)
                .append(true)
                .open(path)
                .map_err(io_error(path))?;
            writeln!(file, "{}", HEADER).map_err(io_error(path))?;
            file.sync_data().map_err(io_error(path))?;
            return Self::finish(path, file, opened_at, 0);
        }

        let scan = scan_lines(path).map_err(io_error(path))?;
        let mut file = File::options()
            .append(true)
            .open(path)
            .map_err(io_error(path))?;
        if scan.lines == 0 {
            writeln!(file, "{}", HEADER).map_err(io_error(path))?;
        } else if !scan.ends_with_newline {
            warn!(path = %path.display(), "Log file ends mid-line, terminating it");
            file.write_all(b"\n").map_err(io_error(path))?;
        }
        file.sync_data().map_err(io_error(path))?;
        Self::finish(path, file, opened_at, scan.lines.saturating_sub(1))
    }

    fn finish(
        path: &Path,
        file: File,
        opened_at: Instant,
        line_count: u64,
    ) -> Result<Self, StoreError> {
        let size_bytes = file.metadata().map_err(io_error(path))?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            opened_at,
            line_count,
            size_bytes,
        })
    }
}

struct LineScan {
    lines: u64,
    ends_with_newline: bool,
}

fn scan_lines(path: &Path) -> io::Result<LineScan> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = Vec::new();
    let mut scan = LineScan {
        lines: 0,
        ends_with_newline: true,
    };
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(scan);
        }
        scan.lines += 1;
        scan.ends_with_newline = line.last() == Some(&b'\n');
    }
}

/// Render `pattern` for `now`, rejecting patterns chrono cannot format.
fn file_name_for(pattern: &str, now: DateTime<Utc>) -> Result<String, StoreError> {
    let mut name = String::new();
    write!(name, "{}", now.format(pattern))
        .map_err(|_| StoreError::InvalidPattern(pattern.to_string()))?;
    if name.is_empty() || name.contains(['/', '\\']) {
        return Err(StoreError::InvalidPattern(pattern.to_string()));
    }
    Ok(name)
}

/// Append-only sensor log with size, time and line based rotation.
pub struct LogStore {
    config: StoreConfig,
    policy: RotationPolicy,
    buffer: Vec<LogRecord>,
    active: Option<ActiveFile>,
    state: StoreState,
}

impl LogStore {
    /// Validate `config`, create the log and archive directories and open the
    /// active file for the current period.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        fs::create_dir_all(&config.log_dir).map_err(io_error(&config.log_dir))?;
        fs::create_dir_all(&config.archive_dir).map_err(io_error(&config.archive_dir))?;

        let mut store = Self {
            policy: RotationPolicy::from_config(&config),
            buffer: Vec::with_capacity(config.buffer_size),
            config,
            active: None,
            state: StoreState::Open,
        };
        store.open_active()?;

        if let Some(active) = &store.active {
            info!(
                path = %active.path.display(),
                existing_rows = active.line_count,
                size_bytes = active.size_bytes,
                "Log store opened"
            );
        }
        Ok(store)
    }

    fn open_active(&mut self) -> Result<(), StoreError> {
        let name = file_name_for(&self.config.filename_pattern, Utc::now())?;
        let path = self.config.log_dir.join(name);
        let active = ActiveFile::open(&path, Instant::now())?;
        debug!(path = %path.display(), rows = active.line_count, "Opened active log file");
        self.active = Some(active);
        Ok(())
    }

    /// Buffer one record, flushing once `buffer_size` records are pending and
    /// rotating afterwards if the policy fires.
    ///
    /// When a flush fails the record stays buffered and the error is
    /// returned. Once `max_pending` records are waiting, new records are
    /// rejected with [`StoreError::Backpressure`].
    pub fn ingest(&mut self, record: LogRecord) -> Result<(), StoreError> {
        if self.state == StoreState::Closed {
            return Err(StoreError::Closed);
        }
        if self.buffer.len() >= self.config.max_pending {
            return Err(StoreError::Backpressure {
                pending: self.buffer.len(),
                limit: self.config.max_pending,
            });
        }

        self.buffer.push(record);

        if self.buffer.len() >= self.config.buffer_size {
            self.flush()?;
            self.maybe_rotate()?;
        }
        Ok(())
    }

    /// Write every buffered record to the active file, in arrival order, and
    /// sync it. Returns the number of records written. On failure nothing is
    /// removed from the buffer.
    pub fn flush(&mut self) -> Result<usize, StoreError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        if self.state == StoreState::Closed {
            return Err(StoreError::Closed);
        }

        let mut payload = String::new();
        for record in &self.buffer {
            payload.push_str(&record.to_row());
            payload.push('\n');
        }

        if self.active.is_none() {
            self.open_active()?;
        }
        let Some(active) = self.active.as_mut() else {
            return Err(StoreError::Closed);
        };
        active
            .file
            .write_all(payload.as_bytes())
            .and_then(|()| active.file.sync_data())
            .map_err(io_error(&active.path))?;

        let written = self.buffer.len();
        active.line_count += written as u64;
        active.size_bytes += payload.len() as u64;
        self.buffer.clear();

        debug!(
            records = written,
            rows = active.line_count,
            size_bytes = active.size_bytes,
            "Flushed buffer"
        );
        Ok(written)
    }

    /// Rotate if the policy fires for the active file. A file without data
    /// rows is never rotated.
    pub fn maybe_rotate(&mut self) -> Result<Option<PathBuf>, StoreError> {
        let Some(active) = &self.active else {
            return Ok(None);
        };
        if active.line_count == 0 {
            return Ok(None);
        }

        match self.policy.evaluate(
            active.opened_at.elapsed(),
            active.size_bytes,
            active.line_count,
        ) {
            Some(trigger) => {
                info!(
                    trigger = %trigger,
                    path = %active.path.display(),
                    rows = active.line_count,
                    size_bytes = active.size_bytes,
                    "Rotation triggered"
                );
                self.rotate().map(Some)
            }
            None => Ok(None),
        }
    }

    /// Flush, archive the active file, sweep expired archives and start a
    /// fresh active file. Returns the new archive's path.
    ///
    /// If archiving fails, the active file is reopened unchanged and the
    /// error is returned.
    pub fn rotate(&mut self) -> Result<PathBuf, StoreError> {
        if self.state == StoreState::Closed {
            return Err(StoreError::Closed);
        }
        self.flush()?;

        if self.active.is_none() {
            self.open_active()?;
        }
        let Some(active) = self.active.take() else {
            return Err(StoreError::Closed);
        };
        self.state = StoreState::Rotating;

        let ActiveFile {
            path,
            file,
            opened_at,
            ..
        } = active;
        drop(file);

        match self.retire(&path) {
            Ok(archive) => {
                self.state = StoreState::Open;
                self.sweep();
                self.open_active()?;
                Ok(archive)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Rotation failed, keeping active file");
                self.state = StoreState::Open;
                self.active = Some(ActiveFile::open(&path, opened_at)?);
                Err(e)
            }
        }
    }

    /// Archive `path` and delete it. The archive is removed again if the
    /// source cannot be deleted, so no record ends up stored twice.
    fn retire(&self, path: &Path) -> Result<PathBuf, StoreError> {
        let archive = archive::archive_file(path, &self.config.archive_dir)
            .map_err(io_error(&self.config.archive_dir))?;

        if let Err(e) = fs::remove_file(path) {
            if let Err(cleanup) = fs::remove_file(&archive) {
                warn!(archive = %archive.display(), error = %cleanup, "Failed to remove duplicate archive");
            }
            return Err(io_error(path)(e));
        }

        info!(
            source = %path.display(),
            archive = %archive.display(),
            "Log file archived"
        );
        Ok(archive)
    }

    fn sweep(&self) {
        match archive::sweep_expired(
            &self.config.archive_dir,
            self.config.retention_days,
            Utc::now(),
        ) {
            Ok(deleted) if !deleted.is_empty() => {
                info!(deleted = deleted.len(), "Retention sweep removed archives");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(dir = %self.config.archive_dir.display(), error = %e, "Retention sweep failed");
            }
        }
    }

    /// Periodic maintenance: flush whatever is buffered, then apply the
    /// rotation policy so elapsed-time rotation happens without traffic.
    pub fn tick(&mut self) -> Result<Option<PathBuf>, StoreError> {
        if self.state == StoreState::Closed {
            return Ok(None);
        }
        self.flush()?;
        self.maybe_rotate()
    }

    /// Flush, close the active file and archive it if the policy fires one
    /// last time. No new active file is opened.
    pub fn close(&mut self) -> Result<Option<PathBuf>, StoreError> {
        if self.state == StoreState::Closed {
            return Ok(None);
        }
        self.flush()?;
        self.state = StoreState::Closed;

        let Some(active) = self.active.take() else {
            return Ok(None);
        };
        let trigger = self.policy.evaluate(
            active.opened_at.elapsed(),
            active.size_bytes,
            active.line_count,
        );
        let path = active.path.clone();
        drop(active);

        let archived = match trigger {
            Some(trigger) => {
                info!(trigger = %trigger, path = %path.display(), "Rotating on close");
                let archive = self.retire(&path)?;
                self.sweep();
                Some(archive)
            }
            None => None,
        };

        info!(path = %path.display(), "Log store closed");
        Ok(archived)
    }

    /// Scan flushed and archived records. Records still buffered are not
    /// visible until the next flush.
    pub fn read(&self, query: ReplayQuery) -> Replay {
        ReplayScope::from_config(&self.config).read(query)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn state(&self) -> StoreState {
        self.state
    }

    /// Records waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn active_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|active| active.path.as_path())
    }

    /// Data rows in the active file, header excluded.
    pub fn line_count(&self) -> u64 {
        self.active.as_ref().map_or(0, |active| active.line_count)
    }

    pub fn size_bytes(&self) -> u64 {
        self.active.as_ref().map_or(0, |active| active.size_bytes)
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        if self.state != StoreState::Closed && !self.buffer.is_empty() {
            if let Err(e) = self.flush() {
                error!(error = %e, lost = self.buffer.len(), "Failed to flush log store on drop");
            }
        }
    }
}
