//! Pairing agent.
//!
//! Registered with `NoInputNoOutput` capability so the daemon negotiates
//! "Just Works" pairing. Confirmation and authorization requests are
//! accepted unconditionally; anything that would require showing or
//! collecting a PIN or passkey is rejected because there is no user
//! interface behind this peripheral.

use tracing::{debug, info};
use zbus::interface;
use zbus::zvariant::OwnedObjectPath;

#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.bluez.Error")]
pub(crate) enum AgentError {
    #[zbus(error)]
    ZBus(zbus::Error),
    Rejected(String),
}

pub(crate) struct PairingAgent;

#[interface(name = "org.bluez.Agent1")]
impl PairingAgent {
    fn release(&self) {
        debug!("pairing agent released by daemon");
    }

    fn request_pin_code(&self, device: OwnedObjectPath) -> Result<String, AgentError> {
        info!(%device, "PIN code requested, rejecting (no input)");
        Err(AgentError::Rejected("no input available".into()))
    }

    fn display_pin_code(&self, device: OwnedObjectPath, pincode: String) {
        debug!(%device, pincode, "display PIN code ignored (no output)");
    }

    fn request_passkey(&self, device: OwnedObjectPath) -> Result<u32, AgentError> {
        info!(%device, "passkey requested, rejecting (no input)");
        Err(AgentError::Rejected("no input available".into()))
    }

    fn display_passkey(&self, device: OwnedObjectPath, passkey: u32, entered: u16) {
        debug!(%device, passkey, entered, "display passkey ignored (no output)");
    }

    fn request_confirmation(&self, device: OwnedObjectPath, passkey: u32) -> Result<(), AgentError> {
        info!(%device, passkey, "pairing confirmation accepted");
        Ok(())
    }

    fn request_authorization(&self, device: OwnedObjectPath) -> Result<(), AgentError> {
        info!(%device, "pairing authorization accepted");
        Ok(())
    }

    fn authorize_service(&self, device: OwnedObjectPath, uuid: String) -> Result<(), AgentError> {
        debug!(%device, uuid, "service authorization accepted");
        Ok(())
    }

    fn cancel(&self) {
        debug!("pairing request cancelled by daemon");
    }
}
