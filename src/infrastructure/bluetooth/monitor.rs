//! Connection monitoring.
//!
//! BlueZ flips the `Connected` property on `org.bluez.Device1` objects
//! when a central connects or disconnects. We subscribe to the matching
//! PropertiesChanged signals and translate them into connection events,
//! identifying the peer by the `dev_AA_BB_CC_DD_EE_FF` suffix of the
//! device object path.

use std::collections::HashMap;

use tracing::debug;
use zbus::message::Message;
use zbus::zvariant::OwnedValue;
use zbus::MatchRule;

/// Match rule for `Connected` changes on any device object.
pub(crate) fn device_properties_rule() -> zbus::Result<MatchRule<'static>> {
    Ok(MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .interface("org.freedesktop.DBus.Properties")?
        .member("PropertiesChanged")?
        .arg(0, "org.bluez.Device1")?
        .build())
}

/// Extract the address portion of a device object path.
///
/// BlueZ names device objects `.../hci0/dev_AA_BB_CC_DD_EE_FF`. Returns
/// the underscore-delimited address, or `None` when the final path
/// segment is not a well-formed device id.
pub(crate) fn device_id_from_path(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next()?;
    let id = segment.strip_prefix("dev_")?;
    let octets: Vec<&str> = id.split('_').collect();
    if octets.len() != 6 {
        return None;
    }
    for octet in &octets {
        if octet.len() != 2 || !octet.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
    }
    Some(id.to_string())
}

/// Interpret a PropertiesChanged message as a connection change.
///
/// Returns `(device_id, connected)` when the message is a `Connected`
/// flip on a well-formed device object; `None` for every other property
/// change that happens to match the subscription.
pub(crate) fn connection_change(msg: &Message) -> Option<(String, bool)> {
    let header = msg.header();
    let path = header.path()?;
    let device = match device_id_from_path(path.as_str()) {
        Some(device) => device,
        None => {
            debug!(path = %path, "ignoring property change on unrecognized object");
            return None;
        }
    };
    let body = msg.body();
    let (interface, changed, _invalidated): (String, HashMap<String, OwnedValue>, Vec<String>) =
        body.deserialize().ok()?;
    if interface != "org.bluez.Device1" {
        return None;
    }
    let connected = bool::try_from(changed.get("Connected")?).ok()?;
    Some((device, connected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use zbus::zvariant::Value;

    fn properties_changed(path: &str, props: HashMap<&str, Value<'_>>) -> Message {
        Message::signal(path, "org.freedesktop.DBus.Properties", "PropertiesChanged")
            .unwrap()
            .build(&("org.bluez.Device1", props, Vec::<String>::new()))
            .unwrap()
    }

    #[test]
    fn device_id_extraction() {
        assert_eq!(
            device_id_from_path("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF").as_deref(),
            Some("AA_BB_CC_DD_EE_FF")
        );
        assert!(device_id_from_path("/org/bluez/hci0").is_none());
        assert!(device_id_from_path("/org/bluez/hci0/dev_AA_BB").is_none());
        assert!(device_id_from_path("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_GG").is_none());
        assert!(device_id_from_path("/org/bluez/hci0/dev_AAA_BB_CC_DD_EE_F").is_none());
    }

    #[test]
    fn connected_flip_is_reported() {
        let mut props = HashMap::new();
        props.insert("Connected", Value::from(true));
        let msg = properties_changed("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF", props);
        assert_eq!(
            connection_change(&msg),
            Some(("AA_BB_CC_DD_EE_FF".to_string(), true))
        );
    }

    #[test]
    fn disconnect_is_reported() {
        let mut props = HashMap::new();
        props.insert("Connected", Value::from(false));
        let msg = properties_changed("/org/bluez/hci0/dev_11_22_33_44_55_66", props);
        assert_eq!(
            connection_change(&msg),
            Some(("11_22_33_44_55_66".to_string(), false))
        );
    }

    #[test]
    fn unrelated_property_changes_are_ignored() {
        let mut props = HashMap::new();
        props.insert("RSSI", Value::from(-40i16));
        let msg = properties_changed("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF", props);
        assert!(connection_change(&msg).is_none());
    }

    #[test]
    fn malformed_device_paths_are_ignored() {
        let mut props = HashMap::new();
        props.insert("Connected", Value::from(true));
        let msg = properties_changed("/org/bluez/hci0/dev_not_an_address", props);
        assert!(connection_change(&msg).is_none());
    }
}
