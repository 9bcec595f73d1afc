//! Delivery client for sending sensor readings to the collector.
//!
//! Every reading is written as one JSON line and must be answered with
//! `ACK`. Failed attempts are retried with exponential backoff and jitter,
//! each attempt bounded by the configured timeout.

use std::io;
use std::sync::RwLock;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

use crate::config::{ClientConfig, ConnectionMode};
use crate::reading::{Reading, ReadingError, ACK};

/// Maximum delay between attempts (in milliseconds).
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Errors that can occur while delivering a reading.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to {target}: {source}")]
    Connect { target: String, source: io::Error },

    #[error("Transport error: {0}")]
    Io(#[from] io::Error),

    #[error("No acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("Unexpected response '{0}' instead of acknowledgement")]
    UnexpectedAck(String),

    #[error("Connection closed before acknowledgement")]
    ConnectionClosed,

    #[error("Cannot encode reading: {0}")]
    Encode(#[from] ReadingError),

    #[error("All {attempts} delivery attempts exhausted. Last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

/// Statistics about client operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Total number of attempts made
    pub attempts: u64,

    /// Attempts that ended without an acknowledgement
    pub failed_attempts: u64,

    /// Readings acknowledged by the collector
    pub delivered: u64,

    /// Readings given up on after every attempt failed
    pub failed: u64,
}

/// Client that delivers readings over TCP and waits for an `ACK` for each.
///
/// # Example
///
/// ```no_run
/// use sensor_telemetry::client::DeliveryClient;
/// use sensor_telemetry::config::ClientConfig;
/// use sensor_telemetry::reading::Reading;
///
/// #[tokio::main]
/// async fn main() {
///     let client = DeliveryClient::new(&ClientConfig::default());
///     let reading = Reading::new("1", "Temp Room", 21.4, "°C");
///
///     if !client.send(&reading).await {
///         eprintln!("Reading was not delivered");
///     }
/// }
/// ```
pub struct DeliveryClient {
    /// Collector address as `host:port`
    target: String,

    /// Bound on a single send-and-acknowledge attempt
    timeout: Duration,

    /// Total attempts per reading
    retries: u32,

    /// Base delay of the exponential backoff
    retry_base_delay: Duration,

    connection_mode: ConnectionMode,

    /// Open connection, kept between sends in persistent mode
    connection: Mutex<Option<BufReader<TcpStream>>>,

    stats: RwLock<ClientStats>,
}

impl DeliveryClient {
    /// Create a client from the node's client settings.
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_settings(config.target(), config.timeout, config.retries)
            .with_retry_base_delay(config.retry_base_delay)
            .with_connection_mode(config.connection_mode)
    }

    /// Create a per-message client with custom settings.
    ///
    /// This is useful for testing or when you need more control over the client.
    pub fn with_settings(target: impl Into<String>, timeout: Duration, retries: u32) -> Self {
        Self {
            target: target.into(),
            timeout,
            retries: retries.max(1),
            retry_base_delay: ClientConfig::default().retry_base_delay,
            connection_mode: ConnectionMode::PerMessage,
            connection: Mutex::new(None),
            stats: RwLock::new(ClientStats::default()),
        }
    }

    /// Base delay between attempts; zero disables sleeping.
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_connection_mode(mut self, mode: ConnectionMode) -> Self {
        self.connection_mode = mode;
        self
    }

    /// Deliver `reading`, returning whether the collector acknowledged it.
    pub async fn send(&self, reading: &Reading) -> bool {
        self.try_send(reading).await.is_ok()
    }

    /// Deliver `reading`, making at most `retries` attempts in total.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Encode` if the reading cannot be serialized and
    /// `ClientError::RetriesExhausted` once every attempt has failed.
    pub async fn try_send(&self, reading: &Reading) -> Result<(), ClientError> {
        let message = reading.to_wire();
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!(sensor_id = reading.sensor_id(), error = %e, "Reading cannot be encoded");
                self.record(|s| s.failed += 1);
                return Err(e.into());
            }
        };

        let mut last_error: Option<ClientError> = None;

        for attempt in 0..self.retries {
            if attempt > 0 {
                let delay = self.calculate_backoff_delay(attempt - 1);
                if !delay.is_zero() {
                    debug!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Backing off before retry"
                    );
                    sleep(delay).await;
                }
            }

            self.record(|s| s.attempts += 1);

            let outcome = match timeout(self.timeout, self.attempt(&frame)).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout(self.timeout)),
            };

            match outcome {
                Ok(()) => {
                    self.record(|s| s.delivered += 1);
                    debug!(
                        sensor_id = reading.sensor_id(),
                        message_id = ?message.message_id,
                        attempt = attempt + 1,
                        "Reading acknowledged"
                    );
                    return Ok(());
                }
                Err(e) => {
                    self.record(|s| s.failed_attempts += 1);
                    warn!(
                        target_addr = %self.target,
                        attempt = attempt + 1,
                        max_attempts = self.retries,
                        error = %e,
                        "Delivery attempt failed"
                    );
                    self.drop_connection().await;
                    last_error = Some(e);
                }
            }
        }

        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "Unknown error".to_string());

        error!(
            sensor_id = reading.sensor_id(),
            message_id = ?message.message_id,
            attempts = self.retries,
            last_error = %last_error,
            "Giving up on reading"
        );
        self.record(|s| s.failed += 1);

        Err(ClientError::RetriesExhausted {
            attempts: self.retries,
            last_error,
        })
    }

    /// One send-and-acknowledge exchange without retry logic.
    ///
    /// A kept connection the collector has since closed is replaced once
    /// within the same attempt.
    async fn attempt(&self, frame: &[u8]) -> Result<(), ClientError> {
        let mut connection = self.connection.lock().await;

        let reused = connection.is_some();
        if !reused {
            *connection = Some(self.connect().await?);
        }
        let mut result = match connection.as_mut() {
            Some(stream) => exchange(stream, frame).await,
            None => Err(ClientError::ConnectionClosed),
        };

        if reused && matches!(result, Err(ClientError::ConnectionClosed | ClientError::Io(_))) {
            debug!(target_addr = %self.target, "Kept connection is stale, reconnecting");
            let stream = connection.insert(self.connect().await?);
            result = exchange(stream, frame).await;
        }
        result?;

        if self.connection_mode == ConnectionMode::PerMessage {
            *connection = None;
        }
        Ok(())
    }

    async fn connect(&self) -> Result<BufReader<TcpStream>, ClientError> {
        let stream = TcpStream::connect(&self.target)
            .await
            .map_err(|source| ClientError::Connect {
                target: self.target.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        Ok(BufReader::new(stream))
    }

    async fn drop_connection(&self) {
        self.connection.lock().await.take();
    }

    /// Calculate the backoff delay before retry number `retry` (0-based).
    ///
    /// Uses exponential backoff with jitter:
    /// delay = min(base_delay * 2^retry + jitter, max_delay)
    fn calculate_backoff_delay(&self, retry: u32) -> Duration {
        let base_delay = self.retry_base_delay.as_millis() as u64;
        if base_delay == 0 {
            return Duration::ZERO;
        }

        // Calculate exponential delay: base * 2^retry
        let exponential_delay = base_delay.saturating_mul(1 << retry.min(10));

        // Add jitter (up to 25% of the delay)
        let jitter = rand::random::<u64>() % (exponential_delay / 4 + 1);

        let total_delay = exponential_delay
            .saturating_add(jitter)
            .min(MAX_RETRY_DELAY_MS);

        Duration::from_millis(total_delay)
    }

    fn record(&self, update: impl FnOnce(&mut ClientStats)) {
        if let Ok(mut stats) = self.stats.write() {
            update(&mut stats);
        }
    }

    /// Get current client statistics.
    pub fn stats(&self) -> ClientStats {
        self.stats.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Total attempts made per reading.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn connection_mode(&self) -> ConnectionMode {
        self.connection_mode
    }
}

/// Write one frame and wait for the acknowledgement line.
async fn exchange(stream: &mut BufReader<TcpStream>, frame: &[u8]) -> Result<(), ClientError> {
    stream.get_mut().write_all(frame).await?;

    let mut response = String::new();
    if stream.read_line(&mut response).await? == 0 {
        return Err(ClientError::ConnectionClosed);
    }
    let response = response.trim_end();
    if response != ACK {
        return Err(ClientError::UnexpectedAck(response.to_string()));
    }
    Ok(())
}
