//! Sensor Collector - acknowledging receiver and rotating log store
//!
//! Accepts readings from sensor nodes, acknowledges each one and appends it
//! to the log store, which rotates, archives and prunes its files.
//!
//! ## Usage
//!
//! ```text
//! sensor-collector [STORE_CONFIG.json]
//! ```
//!
//! Store settings come from the optional JSON file, otherwise from the
//! `SENSOR_TELEMETRY_*` environment variables (`LOG_DIR`, `BUFFER_SIZE`,
//! `ROTATE_EVERY_HOURS`, `MAX_SIZE_MB`, `RETENTION_DAYS`, ...). The listen
//! address is `SENSOR_TELEMETRY_LISTEN_ADDR` (default: 0.0.0.0:9000).
//! `RUST_LOG` sets the logging level filter (default: info).

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sensor_telemetry::config::{Config, StoreConfig};
use sensor_telemetry::server::DeliveryServer;
use sensor_telemetry::store::writer::{StoreHandle, DEFAULT_COMMAND_CAPACITY};
use sensor_telemetry::store::LogStore;

/// Time allowed for the store writer to finish after close
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting sensor collector...");

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    if let Some(path) = std::env::args().nth(1) {
        match StoreConfig::from_json_file(&path) {
            Ok(store) => {
                info!(path = %path, "Loaded store configuration file");
                config.store = store;
            }
            Err(e) => {
                error!(error = %e, "Failed to load store configuration file");
                std::process::exit(1);
            }
        }
    }

    info!(
        log_dir = %config.store.log_dir.display(),
        archive_dir = %config.store.archive_dir.display(),
        buffer_size = config.store.buffer_size,
        rotate_every_secs = config.store.rotate_every.as_secs(),
        max_size_bytes = config.store.max_size_bytes,
        retention_days = config.store.retention_days,
        "Configuration loaded"
    );

    let store = match LogStore::open(config.store.clone()) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Failed to open log store");
            std::process::exit(1);
        }
    };
    let (handle, writer) = StoreHandle::spawn(store, DEFAULT_COMMAND_CAPACITY);

    let server = match DeliveryServer::bind(&config.server).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start delivery server");
            std::process::exit(1);
        }
    };
    let stats = server.stats();

    info!("Sensor collector running. Press Ctrl+C to stop.");
    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    };
    if let Err(e) = server.run_until(Arc::new(handle.clone()), shutdown).await {
        error!(error = %e, "Delivery server failed");
    }

    match handle.close().await {
        Ok(Some(archive)) => info!(archive = %archive.display(), "Store closed, final file archived"),
        Ok(None) => info!("Store closed"),
        Err(e) => error!(error = %e, "Failed to close store cleanly"),
    }
    drop(handle);

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Store writer panicked during shutdown"),
        Err(_) => warn!("Store writer shutdown timed out after {:?}", SHUTDOWN_TIMEOUT),
    }

    let stats = stats.snapshot();
    info!(
        connections = stats.connections,
        acknowledged = stats.acknowledged,
        decode_errors = stats.decode_errors,
        ingest_errors = stats.ingest_errors,
        io_errors = stats.io_errors,
        "Sensor collector stopped"
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
