//! Events delivered to the application.
//!
//! All payloads are owned; once an event is on the channel the application
//! is the sole owner of its buffers.

/// Asynchronous event produced by the peripheral while the dispatch loop
/// runs. Delivered over the unbounded channel passed to
/// [`crate::Peripheral::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
    /// A valid setup payload was written: SSID and password split at the
    /// first newline, byte-for-byte.
    SetupReceived { ssid: Vec<u8>, password: Vec<u8> },

    /// An opaque payload was written to the command characteristic.
    /// Framing is application-defined above this layer.
    CommandReceived(Vec<u8>),

    /// A central connected to or disconnected from the adapter.
    /// `device` is the underscore-delimited address taken from the
    /// daemon's device object path ("AA_BB_CC_DD_EE_FF").
    Connection { device: String, connected: bool },
}
