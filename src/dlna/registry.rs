use crate::dlna::device::Device;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

/// Live devices of one process, keyed by device uuid.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds and starts `device`. A device already registered under the same
    /// uuid is kept and the new one is dropped.
    pub fn add(&self, device: Device) -> Device {
        let mut devices = self.devices.write();
        if let Some(existing) = devices.get(device.uuid()) {
            if !existing.is_disposed() {
                debug!("Device {} already registered", device.uuid());
                return existing.clone();
            }
        }
        device.start();
        devices.insert(device.uuid().to_string(), device.clone());
        info!("Registered device {}", device.name());
        device
    }

    pub fn get(&self, uuid: &str) -> Option<Device> {
        self.devices.read().get(uuid).cloned()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.read().values().cloned().collect()
    }

    pub async fn remove(&self, uuid: &str) -> Option<Device> {
        let removed = self.devices.write().remove(uuid);
        if let Some(device) = &removed {
            device.dispose().await;
        }
        removed
    }

    /// Hands an inbound event to the device owning `sid`. Returns false when
    /// no live device claims it.
    pub fn route_event(&self, sid: &str, body: &str) -> bool {
        let owner = self
            .devices
            .read()
            .values()
            .find(|d| d.owns_subscription(sid))
            .cloned();
        match owner {
            Some(device) => device.on_event(sid, body),
            None => {
                debug!("No device for subscription {}", sid);
                false
            }
        }
    }

    /// Drops devices that have been torn down. Returns their uuids.
    pub fn prune_unavailable(&self) -> Vec<String> {
        let mut devices = self.devices.write();
        let gone: Vec<String> = devices
            .iter()
            .filter(|(_, d)| d.is_disposed())
            .map(|(uuid, _)| uuid.clone())
            .collect();
        for uuid in &gone {
            devices.remove(uuid);
        }
        gone
    }

    pub async fn shutdown(&self) {
        let devices: Vec<Device> = self.devices.write().drain().map(|(_, d)| d).collect();
        for device in devices {
            device.dispose().await;
        }
    }
}
