//! Exported GATT object tree.
//!
//! The tree is rooted at [`protocol::APP_PATH`] with a standard
//! ObjectManager so the daemon can walk it, one service object, and the
//! three characteristics. Writes are turned into [`PeripheralEvent`]s
//! before the D-Bus reply is sent, so a write-without-response payload is
//! queued even though the caller never sees an acknowledgement.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use zbus::interface;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue};
use zbus::Connection;

use crate::infrastructure::bluetooth::protocol::{self, CharacteristicRole};
use crate::models::PeripheralEvent;
use crate::telemetry::TelemetrySink;

#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.bluez.Error")]
pub(crate) enum GattError {
    #[zbus(error)]
    ZBus(zbus::Error),
    NotSupported(String),
}

pub(crate) struct GattServiceObj;

#[interface(name = "org.bluez.GattService1")]
impl GattServiceObj {
    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> &str {
        protocol::SERVICE_UUID
    }

    #[zbus(property)]
    fn primary(&self) -> bool {
        true
    }
}

pub(crate) struct CharacteristicObj {
    role: CharacteristicRole,
    events: UnboundedSender<PeripheralEvent>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl CharacteristicObj {
    pub(crate) fn new(
        role: CharacteristicRole,
        events: UnboundedSender<PeripheralEvent>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            role,
            events,
            telemetry,
        }
    }

    fn deliver(&self, event: PeripheralEvent) {
        if self.events.send(event).is_err() {
            warn!(
                characteristic = self.role.label(),
                "event receiver dropped, payload discarded"
            );
        }
    }
}

#[interface(name = "org.bluez.GattCharacteristic1")]
impl CharacteristicObj {
    fn write_value(
        &self,
        value: Vec<u8>,
        _options: HashMap<String, OwnedValue>,
    ) -> Result<(), GattError> {
        if !self.role.writable() {
            return Err(GattError::NotSupported(format!(
                "{} characteristic is not writable",
                self.role.label()
            )));
        }
        debug!(
            characteristic = self.role.label(),
            payload = %protocol::hex_preview(&value),
            "inbound write"
        );
        match self.role {
            CharacteristicRole::Setup => match protocol::parse_setup_payload(&value) {
                Some((ssid, password)) => {
                    self.telemetry.breadcrumb("setup payload received");
                    self.deliver(PeripheralEvent::SetupReceived { ssid, password });
                }
                None => {
                    // Malformed payloads are dropped, not surfaced to the
                    // central; the write itself still succeeds.
                    warn!("setup payload without newline separator, dropped");
                    self.telemetry.event("setup_malformed", "missing separator");
                }
            },
            CharacteristicRole::Command => {
                self.deliver(PeripheralEvent::CommandReceived(value));
            }
            CharacteristicRole::Engineering => unreachable!("engineering is not writable"),
        }
        Ok(())
    }

    fn start_notify(&self) -> Result<(), GattError> {
        if !self.role.notify_capable() {
            return Err(GattError::NotSupported(format!(
                "{} characteristic does not notify",
                self.role.label()
            )));
        }
        debug!(characteristic = self.role.label(), "notifications enabled");
        Ok(())
    }

    fn stop_notify(&self) -> Result<(), GattError> {
        debug!(characteristic = self.role.label(), "notifications disabled");
        Ok(())
    }

    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> &str {
        self.role.uuid()
    }

    #[zbus(property)]
    fn service(&self) -> OwnedObjectPath {
        ObjectPath::from_static_str_unchecked(protocol::SERVICE_PATH).into()
    }

    #[zbus(property)]
    fn flags(&self) -> Vec<String> {
        self.role.flags().iter().map(|f| f.to_string()).collect()
    }

    /// Values are never cached server-side; reads see an empty value and
    /// fresh payloads travel only in PropertiesChanged notifications.
    #[zbus(property)]
    fn value(&self) -> Vec<u8> {
        Vec::new()
    }

    /// No per-subscriber bookkeeping; the daemon tracks actual delivery.
    #[zbus(property)]
    fn notifying(&self) -> bool {
        false
    }
}

/// Export the full tree on the connection's object server.
pub(crate) async fn register_tree(
    conn: &Connection,
    events: &UnboundedSender<PeripheralEvent>,
    telemetry: &Arc<dyn TelemetrySink>,
) -> zbus::Result<()> {
    let server = conn.object_server();
    server
        .at(protocol::APP_PATH, zbus::fdo::ObjectManager)
        .await?;
    server.at(protocol::SERVICE_PATH, GattServiceObj).await?;
    for role in [
        CharacteristicRole::Setup,
        CharacteristicRole::Command,
        CharacteristicRole::Engineering,
    ] {
        server
            .at(
                role.path(),
                CharacteristicObj::new(role, events.clone(), telemetry.clone()),
            )
            .await?;
    }
    Ok(())
}

/// Best-effort removal of the tree, leaves first. Safe to call when the
/// tree was never (or only partially) exported.
pub(crate) async fn remove_tree(conn: &Connection) {
    let server = conn.object_server();
    for role in [
        CharacteristicRole::Engineering,
        CharacteristicRole::Command,
        CharacteristicRole::Setup,
    ] {
        let _ = server.remove::<CharacteristicObj, _>(role.path()).await;
    }
    let _ = server
        .remove::<GattServiceObj, _>(protocol::SERVICE_PATH)
        .await;
    let _ = server
        .remove::<zbus::fdo::ObjectManager, _>(protocol::APP_PATH)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::test_support::RecordingTelemetry;
    use tokio::sync::mpsc;

    fn characteristic(
        role: CharacteristicRole,
    ) -> (
        CharacteristicObj,
        mpsc::UnboundedReceiver<PeripheralEvent>,
        Arc<RecordingTelemetry>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let telemetry = Arc::new(RecordingTelemetry::default());
        (
            CharacteristicObj::new(role, tx, telemetry.clone()),
            rx,
            telemetry,
        )
    }

    #[test]
    fn setup_write_emits_credentials() {
        let (obj, mut rx, _) = characteristic(CharacteristicRole::Setup);
        obj.write_value(b"MyWifi\npassword123".to_vec(), HashMap::new())
            .unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            PeripheralEvent::SetupReceived {
                ssid: b"MyWifi".to_vec(),
                password: b"password123".to_vec(),
            }
        );
    }

    #[test]
    fn malformed_setup_write_is_dropped_but_succeeds() {
        let (obj, mut rx, telemetry) = characteristic(CharacteristicRole::Setup);
        obj.write_value(b"no-separator".to_vec(), HashMap::new())
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(telemetry.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn command_write_emits_opaque_payload() {
        let (obj, mut rx, _) = characteristic(CharacteristicRole::Command);
        obj.write_value(vec![0x01, 0x02, 0x03], HashMap::new())
            .unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            PeripheralEvent::CommandReceived(vec![0x01, 0x02, 0x03])
        );
    }

    #[test]
    fn engineering_write_is_rejected() {
        let (obj, mut rx, _) = characteristic(CharacteristicRole::Engineering);
        assert!(obj.write_value(vec![0xFF], HashMap::new()).is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn notify_subscription_follows_capability() {
        let (setup, _, _) = characteristic(CharacteristicRole::Setup);
        assert!(setup.start_notify().is_err());
        let (cmd, _, _) = characteristic(CharacteristicRole::Command);
        assert!(cmd.start_notify().is_ok());
        assert!(cmd.stop_notify().is_ok());
    }

    #[test]
    fn write_succeeds_even_without_receiver() {
        let (obj, rx, _) = characteristic(CharacteristicRole::Command);
        drop(rx);
        assert!(obj.write_value(vec![0x00], HashMap::new()).is_ok());
    }
}
