//! Sensor Node - simulated environmental sensors streaming to a collector
//!
//! This service samples four simulated sensors on a fixed interval and
//! delivers every reading to the collector, waiting for an acknowledgement
//! and retrying with backoff when none arrives.
//!
//! ## Features
//!
//! - One tokio task per sensor, feeding a bounded channel
//! - A single sender task draining the channel through the delivery client
//! - Per-message or persistent connections
//! - Graceful shutdown on Ctrl+C
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `SENSOR_TELEMETRY_SERVER_HOST`: Collector host (default: 127.0.0.1)
//! - `SENSOR_TELEMETRY_SERVER_PORT`: Collector port (default: 9000)
//! - `SENSOR_TELEMETRY_TIMEOUT_SECS`: Per-attempt timeout (default: 5)
//! - `SENSOR_TELEMETRY_RETRIES`: Attempts per reading (default: 3)
//! - `SENSOR_TELEMETRY_CONNECTION_MODE`: `per-message` or `persistent`
//! - `SENSOR_TELEMETRY_READ_INTERVAL_MS`: Sampling period (default: 1000)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sensor_telemetry::client::DeliveryClient;
use sensor_telemetry::config::Config;
use sensor_telemetry::reading::Reading;
use sensor_telemetry::sensor::{default_sensors, Sensor};

/// Channel capacity between the sensor tasks and the sender task
const CHANNEL_CAPACITY: usize = 256;

/// Time allowed for the sender task to drain queued readings on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between progress reports of the sender task
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting sensor node...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                target_addr = %config.client.target(),
                retries = config.client.retries,
                timeout_ms = config.client.timeout.as_millis() as u64,
                connection_mode = ?config.client.connection_mode,
                read_interval_ms = config.read_interval.as_millis() as u64,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let client = Arc::new(DeliveryClient::new(&config.client));

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let sender_handle = tokio::spawn(run_sender(client.clone(), rx));

    let mut sensor_handles: Vec<JoinHandle<()>> = Vec::new();
    for sensor in default_sensors() {
        info!(
            sensor_id = sensor.id(),
            name = sensor.name(),
            kind = %sensor.kind(),
            "Starting sensor"
        );
        sensor_handles.push(tokio::spawn(run_sensor(
            sensor,
            config.read_interval,
            tx.clone(),
        )));
    }
    drop(tx);

    info!("Sensor node running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    }

    // Stop sampling; the channel closes once every sensor task is gone
    for handle in &sensor_handles {
        handle.abort();
    }
    for handle in sensor_handles {
        let _ = handle.await;
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, sender_handle).await {
        Ok(Ok(())) => {
            info!("Sender task shut down gracefully");
        }
        Ok(Err(e)) => {
            warn!(error = %e, "Sender task panicked during shutdown");
        }
        Err(_) => {
            warn!("Sender task shutdown timed out after {:?}", SHUTDOWN_TIMEOUT);
        }
    }

    let stats = client.stats();
    info!(
        delivered = stats.delivered,
        failed = stats.failed,
        attempts = stats.attempts,
        failed_attempts = stats.failed_attempts,
        "Sensor node stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Sample `sensor` every `period` and queue the readings for delivery.
///
/// Runs until the sensor stops or the channel is closed.
async fn run_sensor(mut sensor: Sensor, period: Duration, tx: mpsc::Sender<Reading>) {
    let mut rng = StdRng::from_entropy();
    let mut ticker = interval(period);
    sensor.start();

    loop {
        ticker.tick().await;

        let reading = match sensor.read(&mut rng) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(sensor_id = sensor.id(), error = %e, "Sensor read failed, stopping");
                break;
            }
        };

        if tx.send(reading).await.is_err() {
            info!(sensor_id = sensor.id(), "Channel closed, sensor stopping");
            break;
        }
    }
}

/// Deliver queued readings one at a time until the channel is closed and
/// drained.
async fn run_sender(client: Arc<DeliveryClient>, mut rx: mpsc::Receiver<Reading>) {
    let mut last_report_time = Instant::now();

    while let Some(reading) = rx.recv().await {
        if !client.send(&reading).await {
            warn!(
                sensor_id = reading.sensor_id(),
                name = reading.name(),
                value = reading.value(),
                "Reading dropped after exhausting retries"
            );
        }

        // Periodic progress report
        if last_report_time.elapsed() >= REPORT_INTERVAL {
            let stats = client.stats();
            info!(
                delivered = stats.delivered,
                failed = stats.failed,
                failed_attempts = stats.failed_attempts,
                "Sender progress"
            );
            last_report_time = Instant::now();
        }
    }

    info!("Channel closed, sender stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensor_telemetry::sensor::SensorKind;

    #[test]
    fn test_channel_capacity() {
        assert!(CHANNEL_CAPACITY >= 16);
        assert!(CHANNEL_CAPACITY <= 10_000);
    }

    #[tokio::test]
    async fn test_sensor_task_stops_when_channel_closes() {
        let (tx, mut rx) = mpsc::channel(4);
        let sensor = Sensor::new("9", "Test Temp", SensorKind::Temperature);
        let handle = tokio::spawn(run_sensor(sensor, Duration::from_millis(5), tx));

        let reading = rx.recv().await.expect("sensor should produce a reading");
        assert_eq!(reading.sensor_id(), "9");
        assert_eq!(reading.unit(), "°C");

        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sensor task should stop")
            .unwrap();
    }
}
