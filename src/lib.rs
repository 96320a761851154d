//! BLE provisioning peripheral for Linux.
//!
//! Advertises a single GATT service through BlueZ over the system D-Bus
//! and turns characteristic writes into application events: WiFi
//! credentials on the setup characteristic, opaque commands on the
//! command characteristic, plus connection changes from the adapter.
//! Responses and telemetry flow back as notifications.
//!
//! ```no_run
//! use ble_provision::{Peripheral, PeripheralConfig, PeripheralEvent};
//!
//! let mut peripheral = Peripheral::new(PeripheralConfig::default())?;
//! let mut events = peripheral.start()?;
//! while let Some(event) = events.blocking_recv() {
//!     match event {
//!         PeripheralEvent::SetupReceived { ssid, .. } => {
//!             println!("credentials for {}", String::from_utf8_lossy(&ssid));
//!         }
//!         PeripheralEvent::CommandReceived(payload) => {
//!             println!("command: {payload:02X?}");
//!         }
//!         PeripheralEvent::Connection { device, connected } => {
//!             println!("{device} connected={connected}");
//!         }
//!     }
//! }
//! # Ok::<(), ble_provision::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod telemetry;

pub use config::{LogSettings, PeripheralConfig};
pub use error::Error;
pub use infrastructure::bluetooth::protocol::CharacteristicRole;
pub use infrastructure::bluetooth::{LifecycleState, Peripheral};
pub use models::PeripheralEvent;
pub use telemetry::{NoopTelemetry, TelemetrySink};
