//! Error taxonomy for the provisioning peripheral.
//!
//! The lifecycle engine only distinguishes two classes at runtime:
//! transient errors, which are retried under the configured bound, and
//! fatal errors, which abort the bring-up immediately because retrying a
//! static defect cannot succeed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The BlueZ daemon did not appear within the configured poll bound.
    #[error("bluetooth daemon is not available")]
    DaemonUnavailable,

    /// Connecting to the system bus failed.
    #[error("bus connection failed: {0}")]
    BusConnection(#[source] zbus::Error),

    /// Registering an object, the application, the agent or the
    /// advertisement with the daemon failed.
    #[error("registration of {what} failed: {source}")]
    Registration {
        what: &'static str,
        #[source]
        source: zbus::Error,
    },

    /// The daemon reported the advertisement as already registered.
    /// The orchestrator treats this as success.
    #[error("advertisement is already registered")]
    AdvertisementExists,

    /// No usable Bluetooth adapter was found on the bus. Never retried.
    #[error("no bluetooth adapter with GATT and advertising support found")]
    AdapterMissing,

    /// `start` was called while the dispatch thread is already running.
    #[error("peripheral is already running")]
    AlreadyRunning,

    /// A notification was requested for a characteristic that does not
    /// carry the notify flag.
    #[error("characteristic does not support notifications")]
    NotifyUnsupported,

    /// The dispatch thread could not be spawned.
    #[error("failed to spawn dispatch thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether the lifecycle engine must give up instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::AdapterMissing | Error::Config(_))
    }
}
