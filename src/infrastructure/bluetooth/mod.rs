//! BlueZ-backed BLE provisioning peripheral.
//!
//! Split by concern: `protocol` holds the wire contract, `objects`,
//! `agent` and `advertising` are the exported D-Bus objects, `monitor`
//! interprets daemon signals, `lifecycle` drives registration and
//! recovery, and `peripheral` is the public handle.

mod advertising;
mod agent;
mod lifecycle;
mod monitor;
mod objects;
mod peripheral;
pub mod protocol;
mod proxies;

pub use lifecycle::LifecycleState;
pub use peripheral::Peripheral;
