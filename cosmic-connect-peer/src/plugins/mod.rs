//! Plugin Architecture
//!
//! Plugins implement the features carried over a device connection (battery,
//! media control, notifications, ...). This crate only knows them through the
//! [`Plugin`] capability and the static [`PluginInfo`] each [`PluginFactory`]
//! declares.
//!
//! ## Capability Negotiation
//!
//! Devices announce the packet types they can receive (incoming) and send
//! (outgoing) in their identity packet. A plugin is supported for a device
//! when it can consume something the device sends or produce something the
//! device accepts:
//!
//! ```text
//! plugin.supported_packet_types ∩ peer.outgoing ≠ ∅
//!   or plugin.outgoing_packet_types ∩ peer.incoming ≠ ∅
//! ```
//!
//! Plugins declaring no packet types at all are always supported.
//!
//! ## Plugin Lifecycle
//!
//! ```text
//! create → is_compatible → check_required_permissions → on_create → active
//!                                   │ missing                         │
//!                                   ↓                                 ↓
//!                      present without permissions               on_destroy
//! ```
//!
//! Activation is recomputed by [`DevicePlugins::reload`] whenever pairing
//! state, reachability, settings or capabilities change.

pub mod device_plugins;

pub use device_plugins::{DevicePlugins, DispatchEntry, DispatchTable, PluginCandidate};

use crate::device::DeviceHandle;
use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::info;

/// Static description of a plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    /// Stable plugin key, also used as the settings key of its enabled flag
    pub key: String,

    /// Name shown to users
    pub display_name: String,

    /// Whether the plugin is enabled for devices that have no stored setting
    pub enabled_by_default: bool,

    /// Whether the plugin runs for reachable devices that are not paired
    pub listen_to_unpaired: bool,

    /// Packet types the plugin receives
    pub supported_packet_types: BTreeSet<String>,

    /// Packet types the plugin sends
    pub outgoing_packet_types: BTreeSet<String>,

    /// Permissions without which the plugin stays inert
    pub required_permissions: Vec<String>,

    /// Permissions that unlock optional behaviour
    pub optional_permissions: Vec<String>,
}

impl PluginInfo {
    /// Describe a plugin that is enabled by default and needs pairing
    pub fn new(key: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            display_name: display_name.into(),
            enabled_by_default: true,
            listen_to_unpaired: false,
            supported_packet_types: BTreeSet::new(),
            outgoing_packet_types: BTreeSet::new(),
            required_permissions: Vec::new(),
            optional_permissions: Vec::new(),
        }
    }

    pub fn with_supported_packet_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_packet_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outgoing_packet_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outgoing_packet_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_required_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_optional_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    /// Let the plugin run while the device is not paired
    pub fn listening_to_unpaired(mut self) -> Self {
        self.listen_to_unpaired = true;
        self
    }

    /// Require the user to enable the plugin explicitly
    pub fn disabled_by_default(mut self) -> Self {
        self.enabled_by_default = false;
        self
    }

    /// Whether the plugin is usable with a peer announcing these capabilities
    pub fn is_supported_by(
        &self,
        peer_incoming: &HashSet<String>,
        peer_outgoing: &HashSet<String>,
    ) -> bool {
        if self.supported_packet_types.is_empty() && self.outgoing_packet_types.is_empty() {
            return true;
        }

        self.supported_packet_types
            .iter()
            .any(|t| peer_outgoing.contains(t))
            || self
                .outgoing_packet_types
                .iter()
                .any(|t| peer_incoming.contains(t))
    }
}

/// Per-device plugin instance
///
/// Handlers return errors instead of panicking; the dispatcher logs them and
/// carries on with the next plugin.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Called once after creation, before any packet is delivered
    ///
    /// # Errors
    ///
    /// An error keeps the plugin from being activated.
    async fn on_create(&self) -> Result<()> {
        Ok(())
    }

    /// Called when the plugin is deactivated
    async fn on_destroy(&self) {}

    /// Handle a packet from a paired device
    async fn on_packet_received(&self, packet: &Packet) -> Result<()>;

    /// Handle a packet from a device that is not paired
    ///
    /// Only called for plugins that listen to unpaired devices.
    async fn on_unpaired_device_packet_received(&self, _packet: &Packet) -> Result<()> {
        Ok(())
    }

    /// Whether the local platform can run this plugin
    fn is_compatible(&self) -> bool {
        true
    }

    fn check_required_permissions(&self) -> bool {
        true
    }

    fn check_optional_permissions(&self) -> bool {
        true
    }
}

/// Creates plugin instances for devices
pub trait PluginFactory: Send + Sync {
    /// Static description of the plugins this factory creates
    fn info(&self) -> &PluginInfo;

    /// Create an instance bound to `device`
    fn create(&self, device: DeviceHandle) -> Result<Arc<dyn Plugin>>;
}

/// Observer of a device's active plugin set
pub trait PluginsChangedListener: Send + Sync {
    /// Fired after every plugin reload of the device
    fn on_plugins_changed(&self, device_id: &str);
}

/// Registry of available plugin factories
#[derive(Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, Arc<dyn PluginFactory>>,
}

impl PluginRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin factory
    ///
    /// # Errors
    ///
    /// Returns an error if a factory with the same key is already registered.
    pub fn register_factory(&mut self, factory: Arc<dyn PluginFactory>) -> Result<()> {
        let key = factory.info().key.clone();

        if self.factories.contains_key(&key) {
            return Err(ProtocolError::Plugin(format!(
                "Plugin factory '{}' is already registered",
                key
            )));
        }

        info!("Registered plugin factory: {}", key);
        self.factories.insert(key, factory);
        Ok(())
    }

    /// Unregister a plugin factory by key
    pub fn unregister_factory(&mut self, key: &str) -> Option<Arc<dyn PluginFactory>> {
        let factory = self.factories.remove(key);
        if factory.is_some() {
            info!("Unregistered plugin factory: {}", key);
        }
        factory
    }

    /// Keys of all registered plugins, sorted
    pub fn available_plugins(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn factory(&self, key: &str) -> Option<Arc<dyn PluginFactory>> {
        self.factories.get(key).cloned()
    }

    pub fn plugin_info(&self, key: &str) -> Option<&PluginInfo> {
        self.factories.get(key).map(|factory| factory.info())
    }

    /// Every packet type some plugin can receive
    pub fn all_incoming_capabilities(&self) -> BTreeSet<String> {
        self.factories
            .values()
            .flat_map(|factory| factory.info().supported_packet_types.iter().cloned())
            .collect()
    }

    /// Every packet type some plugin can send
    pub fn all_outgoing_capabilities(&self) -> BTreeSet<String> {
        self.factories
            .values()
            .flat_map(|factory| factory.info().outgoing_packet_types.iter().cloned())
            .collect()
    }

    /// Keys of the plugins usable with a peer announcing these capabilities
    pub fn plugins_for_capabilities(
        &self,
        peer_incoming: &HashSet<String>,
        peer_outgoing: &HashSet<String>,
    ) -> BTreeSet<String> {
        self.factories
            .iter()
            .filter(|(_, factory)| factory.info().is_supported_by(peer_incoming, peer_outgoing))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.available_plugins())
            .finish()
    }
}
