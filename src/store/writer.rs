//! Single writer task in front of a [`LogStore`].
//!
//! The store is moved onto a blocking task that drains a bounded command
//! channel, so every mutation is serialized without a lock. [`StoreHandle`]
//! is the cloneable producer side. Replay bypasses the task entirely and
//! reads the filesystem directly.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::server::{Ingest, IngestError};
use crate::store::record::LogRecord;
use crate::store::replay::{Replay, ReplayQuery, ReplayScope};
use crate::store::{LogStore, StoreError, StoreState};

/// Default capacity of the command channel.
pub const DEFAULT_COMMAND_CAPACITY: usize = 1_024;

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

enum Command {
    Ingest { record: LogRecord, reply: Reply<()> },
    Flush { reply: Reply<usize> },
    Rotate { reply: Reply<PathBuf> },
    Tick,
    Close { reply: Reply<Option<PathBuf>> },
}

/// Cloneable handle to a store running on its writer task.
///
/// When every handle has been dropped the task closes the store and exits.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<Command>,
    scope: ReplayScope,
}

impl StoreHandle {
    /// Move `store` onto a blocking writer task with a command channel of
    /// `capacity` slots. If the store's config sets a `flush_interval`, a
    /// ticker task drives [`LogStore::tick`] at that period.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(store: LogStore, capacity: usize) -> (Self, JoinHandle<()>) {
        let scope = ReplayScope::from_config(store.config());
        let flush_interval = store.config().flush_interval;
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let task = tokio::task::spawn_blocking(move || run_writer(store, rx));

        if let Some(period) = flush_interval {
            tokio::spawn(run_ticker(tx.downgrade(), period));
        }

        (Self { tx, scope }, task)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, StoreError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| StoreError::Closed)?;
        response.await.map_err(|_| StoreError::Closed)?
    }

    /// Hand one record to the store, waiting for it to be buffered.
    pub async fn ingest_record(&self, record: LogRecord) -> Result<(), StoreError> {
        self.request(|reply| Command::Ingest { record, reply }).await
    }

    /// Flush the store's buffer; returns the number of records written.
    pub async fn flush(&self) -> Result<usize, StoreError> {
        self.request(|reply| Command::Flush { reply }).await
    }

    /// Force a rotation; returns the new archive's path.
    pub async fn rotate(&self) -> Result<PathBuf, StoreError> {
        self.request(|reply| Command::Rotate { reply }).await
    }

    /// Close the store. Later requests from any handle fail with
    /// [`StoreError::Closed`].
    pub async fn close(&self) -> Result<Option<PathBuf>, StoreError> {
        self.request(|reply| Command::Close { reply }).await
    }

    /// Scan flushed and archived records. This reads files synchronously;
    /// run large scans on a blocking thread.
    pub fn replay(&self, query: ReplayQuery) -> Replay {
        self.scope.read(query)
    }
}

impl Ingest for StoreHandle {
    fn ingest(&self, record: LogRecord) -> impl Future<Output = Result<(), IngestError>> + Send {
        async move { self.ingest_record(record).await.map_err(IngestError::from) }
    }
}

fn run_writer(mut store: LogStore, mut rx: mpsc::Receiver<Command>) {
    info!("Store writer started");

    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Ingest { record, reply } => {
                let result = store.ingest(record);
                if let Err(e) = &result {
                    warn!(error = %e, "Failed to store record");
                }
                let _ = reply.send(result);
            }
            Command::Flush { reply } => {
                let _ = reply.send(store.flush());
            }
            Command::Rotate { reply } => {
                let _ = reply.send(store.rotate());
            }
            Command::Tick => {
                if let Err(e) = store.tick() {
                    warn!(error = %e, "Store maintenance failed");
                }
            }
            Command::Close { reply } => {
                let _ = reply.send(store.close());
                break;
            }
        }
    }

    if store.state() != StoreState::Closed {
        debug!("All store handles dropped, closing store");
        if let Err(e) = store.close() {
            error!(error = %e, "Failed to close store");
        }
    }
    info!("Store writer stopped");
}

async fn run_ticker(tx: mpsc::WeakSender<Command>, period: Duration) {
    let mut ticker = interval(period);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(tx) = tx.upgrade() else {
            break;
        };
        if tx.send(Command::Tick).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use chrono::{TimeZone, Utc};
    use tokio::time::sleep;

    fn record(second: u32) -> LogRecord {
        LogRecord::new(
            "1",
            Utc.with_ymd_and_hms(2024, 7, 2, 10, 0, second).unwrap(),
            1.5,
            "hPa",
        )
    }

    fn config(dir: &std::path::Path) -> StoreConfig {
        let mut config = StoreConfig::new(dir);
        config.buffer_size = 100;
        config.flush_interval = None;
        config
    }

    #[tokio::test]
    async fn test_ingest_flush_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(config(dir.path())).unwrap();
        let (handle, _task) = StoreHandle::spawn(store, 16);

        handle.ingest_record(record(1)).await.unwrap();
        handle.ingest_record(record(2)).await.unwrap();
        assert_eq!(handle.replay(ReplayQuery::all()).count(), 0);

        assert_eq!(handle.flush().await.unwrap(), 2);
        let records: Vec<_> = handle.replay(ReplayQuery::all()).collect();
        assert_eq!(records, vec![record(1), record(2)]);
    }

    #[tokio::test]
    async fn test_ingest_trait_forwards_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(config(dir.path())).unwrap();
        let (handle, _task) = StoreHandle::spawn(store, 16);

        Ingest::ingest(&handle, record(3)).await.unwrap();
        handle.flush().await.unwrap();

        assert_eq!(handle.replay(ReplayQuery::all()).count(), 1);
    }

    #[tokio::test]
    async fn test_rotate_through_handle() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(config(dir.path())).unwrap();
        let (handle, _task) = StoreHandle::spawn(store, 16);

        handle.ingest_record(record(1)).await.unwrap();
        let archive = handle.rotate().await.unwrap();

        assert!(archive.exists());
        assert_eq!(handle.replay(ReplayQuery::all()).count(), 1);
    }

    #[tokio::test]
    async fn test_close_stops_writer() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(config(dir.path())).unwrap();
        let (handle, task) = StoreHandle::spawn(store, 16);
        let other = handle.clone();

        handle.ingest_record(record(1)).await.unwrap();
        assert_eq!(handle.close().await.unwrap(), None);
        task.await.unwrap();

        assert!(matches!(
            other.ingest_record(record(2)).await,
            Err(StoreError::Closed)
        ));
        assert_eq!(other.replay(ReplayQuery::all()).count(), 1);
    }

    #[tokio::test]
    async fn test_dropping_handles_closes_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let store = LogStore::open(config.clone()).unwrap();
        let (handle, task) = StoreHandle::spawn(store, 16);

        handle.ingest_record(record(1)).await.unwrap();
        handle.ingest_record(record(2)).await.unwrap();
        drop(handle);
        task.await.unwrap();

        assert_eq!(ReplayScope::from_config(&config).read(ReplayQuery::all()).count(), 2);
    }

    #[tokio::test]
    async fn test_ticker_flushes_idle_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.flush_interval = Some(Duration::from_millis(20));
        let store = LogStore::open(config).unwrap();
        let (handle, _task) = StoreHandle::spawn(store, 16);

        handle.ingest_record(record(1)).await.unwrap();
        sleep(Duration::from_millis(200)).await;

        assert_eq!(handle.replay(ReplayQuery::all()).count(), 1);
    }

    #[tokio::test]
    async fn test_store_errors_reach_caller() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.buffer_size = 1;
        config.max_pending = 1;
        let archive_dir = config.archive_dir.clone();
        let store = LogStore::open(config).unwrap();
        let (handle, _task) = StoreHandle::spawn(store, 16);

        handle.ingest_record(record(1)).await.unwrap();
        std::fs::remove_dir_all(&archive_dir).unwrap();
        std::fs::File::create(&archive_dir).unwrap();

        assert!(matches!(handle.rotate().await, Err(StoreError::Io { .. })));
        handle.ingest_record(record(2)).await.unwrap();
        assert_eq!(handle.replay(ReplayQuery::all()).count(), 2);
    }
}
