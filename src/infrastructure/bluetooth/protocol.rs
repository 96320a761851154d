//! Provisioning GATT protocol
//!
//! Wire contract shared with the companion app: service and characteristic
//! UUIDs, the fixed object paths exported on the bus, the capability flags
//! of each characteristic, and the setup payload format.

/// Provisioning service UUID.
pub const SERVICE_UUID: &str = "a5f9f4e2-8c10-4afd-9a4b-3e2c7f0d6b01";

/// Setup characteristic UUID (write) — receives `SSID\npassword`.
pub const SETUP_CHAR_UUID: &str = "a5f9f4e2-8c10-4afd-9a4b-3e2c7f0d6b02";

/// Command characteristic UUID (write, write-without-response, notify).
pub const CMD_CHAR_UUID: &str = "a5f9f4e2-8c10-4afd-9a4b-3e2c7f0d6b03";

/// Engineering/telemetry characteristic UUID (notify only).
pub const ENG_CHAR_UUID: &str = "a5f9f4e2-8c10-4afd-9a4b-3e2c7f0d6b04";

/// Root of the exported object tree; carries the ObjectManager.
pub const APP_PATH: &str = "/org/bleprovision/application";

/// GATT service object path.
pub const SERVICE_PATH: &str = "/org/bleprovision/application/service";

pub const SETUP_CHAR_PATH: &str = "/org/bleprovision/application/service/setup";
pub const CMD_CHAR_PATH: &str = "/org/bleprovision/application/service/cmd";
pub const ENG_CHAR_PATH: &str = "/org/bleprovision/application/service/eng";

/// Advertisement object path.
pub const ADVERTISEMENT_PATH: &str = "/org/bleprovision/advertisement";

/// Pairing agent object path.
pub const AGENT_PATH: &str = "/org/bleprovision/agent";

/// Agent capability announced to the daemon: we can neither display nor
/// collect a PIN/passkey, which selects "Just Works" pairing.
pub const AGENT_CAPABILITY: &str = "NoInputNoOutput";

/// Upper bound for the advertised device name, in bytes.
pub const MAX_DEVICE_NAME_LEN: usize = 32;

/// Bytes shown in hex previews of inbound write payloads.
const HEX_PREVIEW_LEN: usize = 16;

/// The role of a characteristic, fixed at registration time. Handlers
/// look the role up instead of matching path suffixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicRole {
    /// Receives WiFi credentials.
    Setup,
    /// Receives opaque commands, pushes responses via notification.
    Command,
    /// Pushes engineering/telemetry payloads via notification.
    Engineering,
}

impl CharacteristicRole {
    pub fn uuid(&self) -> &'static str {
        match self {
            Self::Setup => SETUP_CHAR_UUID,
            Self::Command => CMD_CHAR_UUID,
            Self::Engineering => ENG_CHAR_UUID,
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Self::Setup => SETUP_CHAR_PATH,
            Self::Command => CMD_CHAR_PATH,
            Self::Engineering => ENG_CHAR_PATH,
        }
    }

    /// Capability flags exposed in the GATT `Flags` property.
    pub fn flags(&self) -> &'static [&'static str] {
        match self {
            Self::Setup => &["write"],
            Self::Command => &["write", "write-without-response", "notify"],
            Self::Engineering => &["notify"],
        }
    }

    pub fn writable(&self) -> bool {
        matches!(self, Self::Setup | Self::Command)
    }

    pub fn notify_capable(&self) -> bool {
        matches!(self, Self::Command | Self::Engineering)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Command => "cmd",
            Self::Engineering => "eng",
        }
    }
}

/// Split a setup payload at the first newline into (ssid, password).
///
/// Returns `None` for payloads without a newline; such payloads are
/// malformed and must be dropped by the caller. Either side may be empty.
pub fn parse_setup_payload(payload: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let split = payload.iter().position(|&b| b == b'\n')?;
    Some((payload[..split].to_vec(), payload[split + 1..].to_vec()))
}

/// Bound a device name to [`MAX_DEVICE_NAME_LEN`] bytes without breaking
/// a UTF-8 character.
pub fn truncate_name(name: &str) -> String {
    if name.len() <= MAX_DEVICE_NAME_LEN {
        return name.to_string();
    }
    let mut end = MAX_DEVICE_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Short hex preview of a payload for logging.
pub fn hex_preview(payload: &[u8]) -> String {
    let shown = payload.len().min(HEX_PREVIEW_LEN);
    if payload.len() > shown {
        format!(
            "{}.. ({} bytes)",
            hex::encode(&payload[..shown]),
            payload.len()
        )
    } else {
        format!("{} ({} bytes)", hex::encode(payload), payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_payload_splits_at_first_newline() {
        let (ssid, password) = parse_setup_payload(b"MyWifi\npassword123").unwrap();
        assert_eq!(ssid, b"MyWifi");
        assert_eq!(password, b"password123");
    }

    #[test]
    fn setup_payload_keeps_later_newlines_in_password() {
        let (ssid, password) = parse_setup_payload(b"a\nb\nc").unwrap();
        assert_eq!(ssid, b"a");
        assert_eq!(password, b"b\nc");
    }

    #[test]
    fn setup_payload_without_newline_is_malformed() {
        assert!(parse_setup_payload(b"just-an-ssid").is_none());
        assert!(parse_setup_payload(b"").is_none());
    }

    #[test]
    fn setup_payload_allows_empty_sides() {
        let (ssid, password) = parse_setup_payload(b"\n").unwrap();
        assert!(ssid.is_empty());
        assert!(password.is_empty());
    }

    #[test]
    fn short_name_is_unchanged() {
        assert_eq!(truncate_name("Display-7"), "Display-7");
    }

    #[test]
    fn long_name_is_bounded() {
        let name = "n".repeat(100);
        assert_eq!(truncate_name(&name).len(), MAX_DEVICE_NAME_LEN);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let name = format!("{}é", "x".repeat(MAX_DEVICE_NAME_LEN - 1));
        let truncated = truncate_name(&name);
        assert!(truncated.len() <= MAX_DEVICE_NAME_LEN);
        assert!(truncated.is_char_boundary(truncated.len()));
    }

    #[test]
    fn hex_preview_is_bounded() {
        assert_eq!(hex_preview(&[0xAB, 0xCD]), "abcd (2 bytes)");
        let long = vec![0u8; 64];
        let preview = hex_preview(&long);
        assert!(preview.ends_with("(64 bytes)"));
        assert!(preview.contains(".."));
    }

    #[test]
    fn roles_declare_expected_flags() {
        use CharacteristicRole::*;
        assert_eq!(Setup.flags(), &["write"]);
        assert_eq!(
            Command.flags(),
            &["write", "write-without-response", "notify"]
        );
        assert_eq!(Engineering.flags(), &["notify"]);
        assert!(!Setup.notify_capable());
        assert!(!Engineering.writable());
    }
}
