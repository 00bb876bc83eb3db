//! Device registry
//!
//! Keeps exactly one [`Device`] per device id. Trusted devices are restored
//! from settings at startup; others appear when their first link connects.

use crate::identity::{DeviceType, LocalIdentity, PeerIdentity};
use crate::link::Link;
use crate::plugins::PluginRegistry;
use crate::settings::SettingsStore;
use crate::{Device, PeerConfig, ProtocolError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Owns every known device connection
pub struct DeviceManager {
    settings: Arc<dyn SettingsStore>,
    registry: Arc<PluginRegistry>,
    config: PeerConfig,
    devices: RwLock<HashMap<String, Arc<Device>>>,
}

impl DeviceManager {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        registry: Arc<PluginRegistry>,
        config: PeerConfig,
    ) -> Self {
        Self {
            settings,
            registry,
            config,
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Identity packet contents announcing every registered plugin
    pub fn local_identity(
        &self,
        device_name: impl Into<String>,
        device_type: DeviceType,
    ) -> LocalIdentity {
        LocalIdentity::new(device_name, device_type).with_capabilities(
            self.registry.all_incoming_capabilities(),
            self.registry.all_outgoing_capabilities(),
        )
    }

    /// Restore every trusted device from settings
    ///
    /// Returns the number of devices added.
    pub async fn load_trusted_devices(&self) -> usize {
        let mut devices = self.devices.write().await;
        let mut added = 0;

        for device_id in self.settings.trusted_devices() {
            if devices.contains_key(&device_id) {
                continue;
            }
            let device = Device::from_trusted(
                device_id.clone(),
                Arc::clone(&self.settings),
                Arc::clone(&self.registry),
                self.config.clone(),
            );
            debug!("Restored trusted device {} ({})", device.name(), device_id);
            devices.insert(device_id, device);
            added += 1;
        }

        info!("Loaded {} trusted device(s)", added);
        added
    }

    /// Attach a freshly connected link, creating the device if needed
    ///
    /// # Errors
    ///
    /// Propagates [`Device::attach_link`] errors.
    pub async fn on_link_connected(
        &self,
        identity: &PeerIdentity,
        link: Arc<dyn Link>,
    ) -> Result<Arc<Device>> {
        let device = {
            let mut devices = self.devices.write().await;
            let device = devices
                .entry(identity.device_id.clone())
                .or_insert_with(|| {
                    info!("New device {}", identity.device_id);
                    Device::new(
                        identity,
                        Arc::clone(&self.settings),
                        Arc::clone(&self.registry),
                        self.config.clone(),
                    )
                });
            Arc::clone(device)
        };

        device.attach_link(identity, link).await?;
        Ok(device)
    }

    /// Detach a closed link; returns false if the link was unknown
    ///
    /// Devices stay registered when their last link goes away.
    pub async fn on_link_disconnected(&self, device_id: &str, link: &Arc<dyn Link>) -> bool {
        match self.get(device_id).await {
            Some(device) => device.detach_link(link).await,
            None => false,
        }
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn paired_devices(&self) -> Vec<Arc<Device>> {
        self.devices
            .read()
            .await
            .values()
            .filter(|device| device.is_paired())
            .cloned()
            .collect()
    }

    pub async fn reachable_devices(&self) -> Vec<Arc<Device>> {
        self.devices
            .read()
            .await
            .values()
            .filter(|device| device.is_reachable())
            .cloned()
            .collect()
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Unpair and drop a device
    ///
    /// # Errors
    ///
    /// [`ProtocolError::DeviceNotFound`] if no device has this id.
    pub async fn forget(&self, device_id: &str) -> Result<Arc<Device>> {
        let device = self
            .devices
            .write()
            .await
            .remove(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        device.unpair().await;
        device.shutdown_plugins().await;
        device.disconnect();
        info!("Forgot device {}", device_id);
        Ok(device)
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}
