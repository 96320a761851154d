//! LE advertisement object.
//!
//! One peripheral advertisement carrying the provisioning service UUID and
//! the configured local name. The daemon reads the properties when the
//! advertisement is registered, so name changes take effect on the next
//! registration, not retroactively.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;
use zbus::interface;

use crate::infrastructure::bluetooth::protocol;

/// Device name shared between the public API and the advertisement.
#[derive(Debug)]
pub(crate) struct SharedName(Mutex<String>);

impl SharedName {
    pub(crate) fn new(name: String) -> Arc<Self> {
        Arc::new(Self(Mutex::new(name)))
    }

    pub(crate) fn get(&self) -> String {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set(&self, name: &str) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = protocol::truncate_name(name);
    }
}

pub(crate) struct AdvertisementObj {
    name: Arc<SharedName>,
}

impl AdvertisementObj {
    pub(crate) fn new(name: Arc<SharedName>) -> Self {
        Self { name }
    }
}

#[interface(name = "org.bluez.LEAdvertisement1")]
impl AdvertisementObj {
    /// Called by the daemon when the advertisement is unregistered on its
    /// side, typically during daemon shutdown.
    fn release(&self) {
        debug!("advertisement released by daemon");
    }

    #[zbus(property)]
    fn r#type(&self) -> &str {
        "peripheral"
    }

    #[zbus(property, name = "ServiceUUIDs")]
    fn service_uuids(&self) -> Vec<String> {
        vec![protocol::SERVICE_UUID.to_string()]
    }

    #[zbus(property)]
    fn local_name(&self) -> String {
        self.name.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertisement_reflects_shared_name() {
        let name = SharedName::new("Display-7".to_string());
        let adv = AdvertisementObj::new(name.clone());
        assert_eq!(adv.local_name(), "Display-7");
        name.set("Display-8");
        assert_eq!(adv.local_name(), "Display-8");
    }

    #[test]
    fn shared_name_is_bounded() {
        let name = SharedName::new("x".to_string());
        name.set(&"y".repeat(200));
        assert_eq!(name.get().len(), protocol::MAX_DEVICE_NAME_LEN);
    }

    #[test]
    fn advertises_provisioning_service() {
        let adv = AdvertisementObj::new(SharedName::new("n".into()));
        assert_eq!(adv.service_uuids(), vec![protocol::SERVICE_UUID.to_string()]);
        assert_eq!(adv.r#type(), "peripheral");
    }
}
