//! Sensor Telemetry Library
//!
//! Components for collecting readings from simulated environmental sensors
//! and persisting them on a collector:
//!
//! - **config**: Environment and file based configuration
//! - **sensor**: Simulated temperature, humidity, pressure and light sensors
//! - **reading**: Readings and their newline-delimited JSON wire format
//! - **client**: Delivery client with acknowledgements, retries and backoff
//! - **server**: Acknowledging TCP server feeding an ingest consumer
//! - **store**: Buffered log store with rotation, gzip archives, retention
//!   and replay
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sensor_telemetry::config::Config;
//! use sensor_telemetry::server::DeliveryServer;
//! use sensor_telemetry::store::writer::{StoreHandle, DEFAULT_COMMAND_CAPACITY};
//! use sensor_telemetry::store::LogStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     let store = LogStore::open(config.store.clone()).expect("Failed to open store");
//!     let (handle, _writer) = StoreHandle::spawn(store, DEFAULT_COMMAND_CAPACITY);
//!
//!     let server = DeliveryServer::bind(&config.server).await.expect("Failed to bind");
//!     server.run(Arc::new(handle)).await.ok();
//! }
//! ```

// Module declarations
pub mod client;
pub mod config;
pub mod reading;
pub mod sensor;
pub mod server;
pub mod store;

// Re-export commonly used types at crate root for convenience
pub use client::{ClientError, ClientStats, DeliveryClient};
pub use config::{ClientConfig, Config, ConfigError, ConnectionMode, ServerConfig, StoreConfig};
pub use reading::{Reading, ReadingError, WireMessage};
pub use sensor::{default_sensors, Sensor, SensorError, SensorKind};
pub use server::{DeliveryServer, Ingest, IngestError, ServerError, ServerStats};
pub use store::record::LogRecord;
pub use store::replay::{Replay, ReplayQuery};
pub use store::rotation::{RotationPolicy, RotationTrigger};
pub use store::writer::StoreHandle;
pub use store::{LogStore, StoreError, StoreState};
