//! Acknowledging TCP delivery server.
//!
//! Each accepted connection runs on its own task and may carry any number of
//! newline-terminated JSON readings. A reading that decodes is handed to the
//! [`Ingest`] consumer and answered with `ACK`; anything that fails to decode
//! closes the connection without an answer.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::reading::{WireMessage, ACK, FRAME_DELIMITER, MAX_MESSAGE_BYTES};
use crate::store::record::LogRecord;

/// Error returned by an [`Ingest`] consumer.
pub type IngestError = Box<dyn std::error::Error + Send + Sync>;

/// Destination for decoded readings.
pub trait Ingest {
    fn ingest(&self, record: LogRecord) -> impl Future<Output = Result<(), IngestError>> + Send;
}

/// Errors that stop the server itself. Per-connection failures never do.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("server I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Statistics about server operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Connections accepted
    pub connections: u64,

    /// Readings acknowledged
    pub acknowledged: u64,

    /// Frames that failed to decode or exceeded the size limit
    pub decode_errors: u64,

    /// Readings acknowledged although the consumer rejected them
    pub ingest_errors: u64,

    /// Read timeouts and transport failures
    pub io_errors: u64,
}

/// Shared view of a server's statistics, usable after the server has been
/// moved into its run loop.
#[derive(Debug, Clone, Default)]
pub struct StatsHandle {
    inner: Arc<RwLock<ServerStats>>,
}

impl StatsHandle {
    pub fn snapshot(&self) -> ServerStats {
        self.inner.read().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, update: impl FnOnce(&mut ServerStats)) {
        if let Ok(mut stats) = self.inner.write() {
            update(&mut stats);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ConnectionSettings {
    trust_client_timestamp: bool,
    read_timeout: Duration,
}

/// TCP server that acknowledges every reading it can decode.
pub struct DeliveryServer {
    listener: TcpListener,
    settings: ConnectionSettings,
    stats: StatsHandle,
}

impl DeliveryServer {
    /// Bind the listening socket described by `config`.
    pub async fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen_addr.clone(),
                source,
            })?;

        info!(
            addr = %listener.local_addr()?,
            trust_client_timestamp = config.trust_client_timestamp,
            "Delivery server listening"
        );

        Ok(Self {
            listener,
            settings: ConnectionSettings {
                trust_client_timestamp: config.trust_client_timestamp,
                read_timeout: config.read_timeout,
            },
            stats: StatsHandle::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }

    /// Serve until the process ends.
    pub async fn run<C>(self, consumer: Arc<C>) -> Result<(), ServerError>
    where
        C: Ingest + Send + Sync + 'static,
    {
        self.run_until(consumer, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves. Connections still open at that point
    /// get one read timeout to finish before they are aborted.
    pub async fn run_until<C, F>(self, consumer: Arc<C>, shutdown: F) -> Result<(), ServerError>
    where
        C: Ingest + Send + Sync + 'static,
        F: Future<Output = ()>,
    {
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(open_connections = connections.len(), "Shutdown requested, no longer accepting");
                    break;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.stats.record(|s| s.connections += 1);
                        debug!(peer = %peer, "Accepted connection");
                        connections.spawn(handle_connection(
                            stream,
                            peer,
                            consumer.clone(),
                            self.stats.clone(),
                            self.settings,
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },

                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        let drain = async { while connections.join_next().await.is_some() {} };
        if timeout(self.settings.read_timeout, drain).await.is_err() {
            warn!(
                aborted = connections.len(),
                "Connections still open after grace period, aborting"
            );
            connections.shutdown().await;
        }

        info!("Delivery server stopped");
        Ok(())
    }
}

/// Read one frame into `frame`: everything up to and including the next
/// delimiter, or up to EOF. Reads at most one byte beyond the message limit
/// so oversized frames are detected without buffering them whole.
async fn read_frame<R>(reader: &mut R, frame: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_MESSAGE_BYTES as u64 + 1;
    (&mut *reader)
        .take(limit)
        .read_until(FRAME_DELIMITER, frame)
        .await
}

async fn handle_connection<C>(
    stream: TcpStream,
    peer: SocketAddr,
    consumer: Arc<C>,
    stats: StatsHandle,
    settings: ConnectionSettings,
) where
    C: Ingest + Send + Sync + 'static,
{
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut frame = Vec::with_capacity(256);
    let ack = format!("{}\n", ACK);

    loop {
        frame.clear();
        match timeout(settings.read_timeout, read_frame(&mut reader, &mut frame)).await {
            Ok(Ok(0)) => {
                debug!(peer = %peer, "Peer closed connection");
                return;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "Failed to read from peer");
                stats.record(|s| s.io_errors += 1);
                return;
            }
            Err(_) if frame.is_empty() => {
                debug!(peer = %peer, "Idle connection timed out");
                return;
            }
            Err(_) => {
                warn!(peer = %peer, received = frame.len(), "Timed out waiting for end of message");
                stats.record(|s| s.io_errors += 1);
                return;
            }
        }

        let message = match WireMessage::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Dropping undecodable message");
                stats.record(|s| s.decode_errors += 1);
                return;
            }
        };

        let received_at = Utc::now();
        let timestamp = match message.timestamp {
            Some(sent_at) if settings.trust_client_timestamp => sent_at,
            _ => received_at,
        };
        let message_id = message.message_id;
        let reading = message.into_reading(timestamp);

        debug!(
            peer = %peer,
            sensor_id = reading.sensor_id(),
            name = reading.name(),
            value = reading.value(),
            message_id = ?message_id,
            "Received reading"
        );

        if let Err(e) = consumer.ingest(LogRecord::from(&reading)).await {
            warn!(
                peer = %peer,
                sensor_id = reading.sensor_id(),
                error = %e,
                "Consumer failed to ingest reading"
            );
            stats.record(|s| s.ingest_errors += 1);
        }

        if let Err(e) = write_half.write_all(ack.as_bytes()).await {
            warn!(peer = %peer, error = %e, "Failed to acknowledge reading");
            stats.record(|s| s.io_errors += 1);
            return;
        }
        stats.record(|s| s.acknowledged += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct Collecting {
        records: Mutex<Vec<LogRecord>>,
        fail: bool,
    }

    impl Collecting {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn records(&self) -> Vec<LogRecord> {
            self.records.lock().unwrap().clone()
        }
    }

    impl Ingest for Collecting {
        fn ingest(&self, record: LogRecord) -> impl Future<Output = Result<(), IngestError>> + Send {
            let result = if self.fail {
                Err("store unavailable".into())
            } else {
                self.records.lock().unwrap().push(record);
                Ok(())
            };
            async move { result }
        }
    }

    struct Running {
        addr: SocketAddr,
        stats: StatsHandle,
        stop: oneshot::Sender<()>,
        task: tokio::task::JoinHandle<Result<(), ServerError>>,
    }

    async fn start(consumer: Arc<Collecting>, trust_client_timestamp: bool) -> Running {
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            trust_client_timestamp,
            read_timeout: Duration::from_secs(2),
        };
        let server = DeliveryServer::bind(&config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let stats = server.stats();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(consumer, async {
            let _ = stopped.await;
        }));
        Running {
            addr,
            stats,
            stop,
            task,
        }
    }

    /// Send `payload`, half-close, and collect everything the server answers.
    async fn exchange(addr: SocketAddr, payload: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(payload).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut response = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .expect("server should close the connection")
            .unwrap();
        String::from_utf8(response).unwrap()
    }

    fn client_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap()
    }

    fn message_json() -> String {
        format!(
            r#"{{"sensor_id": "1", "name": "Temp Room", "value": 21.5, "unit": "°C", "timestamp": "{}"}}"#,
            client_time().to_rfc3339()
        )
    }

    #[tokio::test]
    async fn test_acknowledges_valid_reading() {
        let consumer = Arc::new(Collecting::default());
        let server = start(consumer.clone(), false).await;

        let response = exchange(server.addr, format!("{}\n", message_json()).as_bytes()).await;
        assert_eq!(response, "ACK\n");

        let records = consumer.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sensor_id, "1");
        assert_eq!(records[0].value, 21.5);
        assert_eq!(records[0].unit, "°C");
        // receipt time, not the client's clock
        assert!(records[0].timestamp > client_time());
        assert_eq!(server.stats.snapshot().acknowledged, 1);
    }

    #[tokio::test]
    async fn test_trusted_client_timestamp_is_kept() {
        let consumer = Arc::new(Collecting::default());
        let server = start(consumer.clone(), true).await;

        exchange(server.addr, format!("{}\n", message_json()).as_bytes()).await;
        assert_eq!(consumer.records()[0].timestamp, client_time());
    }

    #[tokio::test]
    async fn test_trusted_mode_without_timestamp_uses_receipt_time() {
        let consumer = Arc::new(Collecting::default());
        let server = start(consumer.clone(), true).await;
        let before = Utc::now();

        let response = exchange(
            server.addr,
            br#"{"sensor_id": 4, "name": "Light Window", "value": 300, "unit": "lx"}"#,
        )
        .await;

        assert_eq!(response, "ACK\n");
        let records = consumer.records();
        assert_eq!(records[0].sensor_id, "4");
        assert!(records[0].timestamp >= before);
    }

    #[tokio::test]
    async fn test_malformed_message_gets_no_ack() {
        let consumer = Arc::new(Collecting::default());
        let server = start(consumer.clone(), false).await;

        let response = exchange(server.addr, b"{\"sensor_id\": \n").await;
        assert_eq!(response, "");
        assert!(consumer.records().is_empty());
        assert_eq!(server.stats.snapshot().decode_errors, 1);

        // the accept loop is unaffected
        let response = exchange(server.addr, format!("{}\n", message_json()).as_bytes()).await;
        assert_eq!(response, "ACK\n");
    }

    #[tokio::test]
    async fn test_oversized_message_gets_no_ack() {
        let consumer = Arc::new(Collecting::default());
        let server = start(consumer.clone(), false).await;

        let mut payload = vec![b' '; MAX_MESSAGE_BYTES + 10];
        payload.push(b'\n');
        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        // the server may close before the whole payload is written
        let _ = stream.write_all(&payload).await;

        let mut response = Vec::new();
        let _ = timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await;
        assert!(response.is_empty());
        assert!(consumer.records().is_empty());
    }

    #[tokio::test]
    async fn test_acks_even_when_ingest_fails() {
        let consumer = Arc::new(Collecting::failing());
        let server = start(consumer, false).await;

        let response = exchange(server.addr, format!("{}\n", message_json()).as_bytes()).await;
        assert_eq!(response, "ACK\n");

        let stats = server.stats.snapshot();
        assert_eq!(stats.ingest_errors, 1);
        assert_eq!(stats.acknowledged, 1);
    }

    #[tokio::test]
    async fn test_message_terminated_by_eof() {
        let consumer = Arc::new(Collecting::default());
        let server = start(consumer.clone(), false).await;

        let response = exchange(server.addr, message_json().as_bytes()).await;
        assert_eq!(response, "ACK\n");
        assert_eq!(consumer.records().len(), 1);
    }

    #[tokio::test]
    async fn test_multiple_messages_on_one_connection() {
        let consumer = Arc::new(Collecting::default());
        let server = start(consumer.clone(), false).await;

        let payload = format!("{0}\n{0}\r\n{0}\n", message_json());
        let response = exchange(server.addr, payload.as_bytes()).await;

        assert_eq!(response, "ACK\nACK\nACK\n");
        assert_eq!(consumer.records().len(), 3);
        assert_eq!(server.stats.snapshot().connections, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_server() {
        let consumer = Arc::new(Collecting::default());
        let server = start(consumer, false).await;

        server.stop.send(()).unwrap();
        let result = timeout(Duration::from_secs(5), server.task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
