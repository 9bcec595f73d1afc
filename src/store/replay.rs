//! Range-bounded replay over live log files and archives.
//!
//! A [`Replay`] enumerates its sources when it is created and then reads
//! them lazily, one row at a time. Each call to [`ReplayScope::read`] starts
//! a fresh scan of whatever is on disk at that moment.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::string::FromUtf8Error;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::store::archive;
use crate::store::record::LogRecord;

/// Extension assumed for log files when the filename pattern has none.
const DEFAULT_LOG_EXTENSION: &str = "csv";

/// Filter applied to replayed records. Missing bounds are open; present
/// bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub sensor_id: Option<String>,
}

impl ReplayQuery {
    /// Every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Records with `start <= timestamp <= end`.
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            sensor_id: None,
        }
    }

    /// Restrict to one sensor.
    pub fn for_sensor(mut self, sensor_id: impl Into<String>) -> Self {
        self.sensor_id = Some(sensor_id.into());
        self
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        self.start.map_or(true, |start| record.timestamp >= start)
            && self.end.map_or(true, |end| record.timestamp <= end)
            && self
                .sensor_id
                .as_deref()
                .map_or(true, |sensor_id| record.sensor_id == sensor_id)
    }
}

/// Where a store keeps its data. Cheap to clone and independent of the
/// store itself, so replay never has to wait for the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayScope {
    log_dir: PathBuf,
    archive_dir: PathBuf,
    log_extension: String,
}

impl ReplayScope {
    pub fn from_config(config: &StoreConfig) -> Self {
        let log_extension = Path::new(&config.filename_pattern)
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.contains('%'))
            .unwrap_or(DEFAULT_LOG_EXTENSION)
            .to_string();

        Self {
            log_dir: config.log_dir.clone(),
            archive_dir: config.archive_dir.clone(),
            log_extension,
        }
    }

    /// Start a lazy scan over every live log file and every archive.
    pub fn read(&self, query: ReplayQuery) -> Replay {
        let mut sources = VecDeque::new();

        match self.list_log_files() {
            Ok(files) => sources.extend(files.into_iter().map(Source::Log)),
            Err(e) => warn!(dir = %self.log_dir.display(), error = %e, "Cannot list log files"),
        }
        match archive::list_archives(&self.archive_dir) {
            Ok(archives) => sources.extend(archives.into_iter().map(Source::Archive)),
            Err(e) => warn!(dir = %self.archive_dir.display(), error = %e, "Cannot list archives"),
        }

        Replay {
            query,
            sources,
            current: None,
            skipped: 0,
        }
    }

    fn list_log_files(&self) -> io::Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.log_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext == self.log_extension.as_str())
            {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[derive(Debug)]
enum Source {
    Log(PathBuf),
    Archive(PathBuf),
}

impl Source {
    fn path(&self) -> &Path {
        match self {
            Source::Log(path) | Source::Archive(path) => path,
        }
    }

    fn open(&self) -> io::Result<Box<dyn BufRead + Send>> {
        Ok(match self {
            Source::Log(path) => Box::new(BufReader::new(File::open(path)?)),
            Source::Archive(path) => Box::new(archive::open_archive(path)?),
        })
    }
}

struct OpenSource {
    path: PathBuf,
    reader: Box<dyn BufRead + Send>,
}

impl OpenSource {
    /// Next row without its line terminator, or `None` at the end of the
    /// source. Bytes that are not UTF-8 only spoil their own row.
    fn next_row(&mut self) -> io::Result<Option<Result<String, FromUtf8Error>>> {
        let mut buf = Vec::new();
        if self.reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(None);
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        Ok(Some(String::from_utf8(buf)))
    }
}

/// Lazy iterator of matching records.
///
/// Rows that fail to parse are skipped and counted. A source that vanished
/// before it could be opened is skipped; a read error ends that source.
pub struct Replay {
    query: ReplayQuery,
    sources: VecDeque<Source>,
    current: Option<OpenSource>,
    skipped: u64,
}

impl Replay {
    /// Rows skipped so far because they could not be parsed.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn open_next(&mut self) -> bool {
        while let Some(source) = self.sources.pop_front() {
            match source.open() {
                Ok(reader) => {
                    let mut open = OpenSource {
                        path: source.path().to_path_buf(),
                        reader,
                    };
                    // header row
                    match open.next_row() {
                        Ok(Some(_)) => {}
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(path = %source.path().display(), error = %e, "Cannot read log header");
                            continue;
                        }
                    }
                    self.current = Some(open);
                    return true;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %source.path().display(), "Source disappeared before replay");
                }
                Err(e) => {
                    warn!(path = %source.path().display(), error = %e, "Cannot open source for replay");
                }
            }
        }
        false
    }
}

impl Iterator for Replay {
    type Item = LogRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() && !self.open_next() {
                return None;
            }
            let source = self.current.as_mut()?;

            match source.next_row() {
                Ok(None) => self.current = None,
                Err(e) => {
                    warn!(path = %source.path.display(), error = %e, "Replay read failed, skipping rest of source");
                    self.current = None;
                }
                Ok(Some(Err(e))) => {
                    debug!(path = %source.path.display(), error = %e, "Skipping row that is not UTF-8");
                    self.skipped += 1;
                }
                Ok(Some(Ok(line))) if line.trim().is_empty() => {}
                Ok(Some(Ok(line))) => match LogRecord::parse_row(&line) {
                    Ok(record) if self.query.matches(&record) => return Some(record),
                    Ok(_) => {}
                    Err(e) => {
                        debug!(path = %source.path.display(), error = %e, "Skipping malformed row");
                        self.skipped += 1;
                    }
                },
            }
        }
    }
}
