//! Per-device plugin activation and dispatch
//!
//! [`DevicePlugins`] owns the plugin instances of one device in three maps
//! (active, missing required permissions, missing optional permissions) and
//! the packet-type dispatch table built from the active set.
//!
//! Reloads are serialized by an async mutex over the three maps. The dispatch
//! table is an immutable snapshot replaced as a whole at the end of every
//! reload, so dispatch never sees a half-built table.

use super::{Plugin, PluginFactory};
use crate::device::DeviceHandle;
use crate::Packet;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// A plugin considered by a reload
pub struct PluginCandidate {
    pub factory: Arc<dyn PluginFactory>,
    /// Whether the plugin should be active (pairing, reachability and
    /// settings already accounted for)
    pub should_enable: bool,
}

/// One handler registered for a packet type
#[derive(Clone)]
pub struct DispatchEntry {
    pub key: String,
    pub plugin: Arc<dyn Plugin>,
    pub listen_to_unpaired: bool,
}

/// Packet type to handlers, rebuilt from scratch on every reload
#[derive(Clone, Default)]
pub struct DispatchTable {
    by_type: HashMap<String, Vec<DispatchEntry>>,
}

impl DispatchTable {
    /// Handlers registered for `packet_type`
    pub fn handlers(&self, packet_type: &str) -> &[DispatchEntry] {
        self.by_type
            .get(packet_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    /// Packet types with at least one handler
    pub fn packet_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.by_type.keys().cloned().collect();
        types.sort();
        types
    }

    /// Keys of the plugins registered for `packet_type`
    pub fn plugin_keys(&self, packet_type: &str) -> Vec<String> {
        self.handlers(packet_type)
            .iter()
            .map(|entry| entry.key.clone())
            .collect()
    }
}

#[derive(Default)]
struct PluginMaps {
    loaded: BTreeMap<String, Arc<dyn Plugin>>,
    without_permissions: BTreeMap<String, Arc<dyn Plugin>>,
    without_optional_permissions: BTreeMap<String, Arc<dyn Plugin>>,
}

/// Plugin instances and dispatch table of one device
pub struct DevicePlugins {
    device_id: String,
    maps: Mutex<PluginMaps>,
    table: RwLock<Arc<DispatchTable>>,
}

impl DevicePlugins {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            maps: Mutex::new(PluginMaps::default()),
            table: RwLock::new(Arc::new(DispatchTable::default())),
        }
    }

    /// Current dispatch table snapshot
    pub fn table(&self) -> Arc<DispatchTable> {
        match self.table.read() {
            Ok(table) => Arc::clone(&table),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn swap_table(&self, table: DispatchTable) {
        let mut guard = self.table.write().unwrap_or_else(|p| p.into_inner());
        *guard = Arc::new(table);
    }

    /// Recompute the active plugin set and rebuild the dispatch table
    ///
    /// Plugins not among `candidates` are torn down. Returns the number of
    /// active plugins.
    pub async fn reload(&self, candidates: Vec<PluginCandidate>, device: &DeviceHandle) -> usize {
        let mut maps = self.maps.lock().await;
        let mut by_type: HashMap<String, Vec<DispatchEntry>> = HashMap::new();
        let mut considered = HashSet::with_capacity(candidates.len());

        for candidate in candidates {
            let info = candidate.factory.info();
            let key = info.key.clone();
            considered.insert(key.clone());

            let active = candidate.should_enable
                && self
                    .add_plugin(&mut maps, candidate.factory.as_ref(), device)
                    .await;

            if active {
                if let Some(plugin) = maps.loaded.get(&key) {
                    for packet_type in &info.supported_packet_types {
                        by_type
                            .entry(packet_type.clone())
                            .or_default()
                            .push(DispatchEntry {
                                key: key.clone(),
                                plugin: Arc::clone(plugin),
                                listen_to_unpaired: info.listen_to_unpaired,
                            });
                    }
                }
            } else {
                self.remove_plugin(&mut maps, &key).await;
                if !candidate.should_enable {
                    maps.without_permissions.remove(&key);
                    maps.without_optional_permissions.remove(&key);
                }
            }
        }

        let stale: Vec<String> = maps
            .loaded
            .keys()
            .chain(maps.without_permissions.keys())
            .filter(|key| !considered.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            debug!("Plugin {} no longer supported by {}", key, self.device_id);
            self.remove_plugin(&mut maps, &key).await;
            maps.without_permissions.remove(&key);
            maps.without_optional_permissions.remove(&key);
        }

        let active = maps.loaded.len();
        self.swap_table(DispatchTable { by_type });
        debug!(
            "Reloaded plugins for {}: {} active, {} without permissions",
            self.device_id,
            active,
            maps.without_permissions.len()
        );
        active
    }

    async fn add_plugin(
        &self,
        maps: &mut PluginMaps,
        factory: &dyn PluginFactory,
        device: &DeviceHandle,
    ) -> bool {
        let key = factory.info().key.as_str();

        if let Some(existing) = maps.loaded.get(key).cloned() {
            if !existing.is_compatible() {
                info!("Plugin {} is no longer compatible", key);
                return false;
            }
            if !existing.check_required_permissions() {
                warn!("Plugin {} lost its required permissions", key);
                if let Some(plugin) = maps.loaded.remove(key) {
                    destroy(&self.device_id, key, &plugin).await;
                    maps.without_permissions.insert(key.to_string(), plugin);
                }
                return false;
            }
            update_optional(maps, key, &existing);
            return true;
        }

        let plugin = match factory.create(device.clone()) {
            Ok(plugin) => plugin,
            Err(e) => {
                error!(
                    "Could not instantiate plugin {} for {}: {}",
                    key, self.device_id, e
                );
                return false;
            }
        };

        if !plugin.is_compatible() {
            info!(
                "Minimum requirements not fulfilled for plugin {}, skipping",
                key
            );
            return false;
        }

        if !plugin.check_required_permissions() {
            warn!("No permission for plugin {} on {}", key, self.device_id);
            maps.without_permissions.insert(key.to_string(), plugin);
            return false;
        }
        maps.without_permissions.remove(key);
        update_optional(maps, key, &plugin);

        match AssertUnwindSafe(plugin.on_create()).catch_unwind().await {
            Ok(Ok(())) => {
                info!("Loaded plugin {} for {}", key, self.device_id);
                maps.loaded.insert(key.to_string(), plugin);
                true
            }
            Ok(Err(e)) => {
                error!("Plugin {} failed to load for {}: {}", key, self.device_id, e);
                destroy(&self.device_id, key, &plugin).await;
                maps.without_optional_permissions.remove(key);
                false
            }
            Err(_) => {
                error!("Plugin {} panicked while loading for {}", key, self.device_id);
                maps.without_optional_permissions.remove(key);
                false
            }
        }
    }

    async fn remove_plugin(&self, maps: &mut PluginMaps, key: &str) -> bool {
        match maps.loaded.remove(key) {
            Some(plugin) => {
                destroy(&self.device_id, key, &plugin).await;
                info!("Removed plugin {} from {}", key, self.device_id);
                true
            }
            None => false,
        }
    }

    /// Deliver `packet` to every plugin registered for its type
    ///
    /// When `paired` is false only plugins listening to unpaired devices are
    /// called. A failing or panicking plugin is logged and skipped. Returns the
    /// number of plugins the packet was delivered to.
    pub async fn dispatch(&self, packet: &Packet, paired: bool) -> usize {
        let table = self.table();
        let mut delivered = 0;

        for entry in table.handlers(&packet.packet_type) {
            if !paired && !entry.listen_to_unpaired {
                continue;
            }
            delivered += 1;

            let result = if paired {
                AssertUnwindSafe(entry.plugin.on_packet_received(packet))
                    .catch_unwind()
                    .await
            } else {
                AssertUnwindSafe(entry.plugin.on_unpaired_device_packet_received(packet))
                    .catch_unwind()
                    .await
            };

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(
                    "Plugin {} failed to handle {} from {}: {}",
                    entry.key, packet.packet_type, self.device_id, e
                ),
                Err(_) => error!(
                    "Plugin {} panicked handling {} from {}",
                    entry.key, packet.packet_type, self.device_id
                ),
            }
        }

        if delivered == 0 {
            debug!(
                "No plugin handled {} packet from {}",
                packet.packet_type, self.device_id
            );
        }
        delivered
    }

    /// Tear down every plugin and clear the dispatch table
    pub async fn clear(&self) {
        let mut maps = self.maps.lock().await;
        let keys: Vec<String> = maps.loaded.keys().cloned().collect();
        for key in keys {
            self.remove_plugin(&mut maps, &key).await;
        }
        maps.without_permissions.clear();
        maps.without_optional_permissions.clear();
        self.swap_table(DispatchTable::default());
    }

    /// Active plugin instance for `key`
    pub async fn plugin(&self, key: &str) -> Option<Arc<dyn Plugin>> {
        self.maps.lock().await.loaded.get(key).cloned()
    }

    /// Plugin instance for `key`, active or waiting for permissions
    pub async fn plugin_including_without_permissions(&self, key: &str) -> Option<Arc<dyn Plugin>> {
        let maps = self.maps.lock().await;
        maps.loaded
            .get(key)
            .or_else(|| maps.without_permissions.get(key))
            .cloned()
    }

    /// Keys of the active plugins
    pub async fn loaded_plugins(&self) -> Vec<String> {
        self.maps.lock().await.loaded.keys().cloned().collect()
    }

    /// Keys of the plugins missing required permissions
    pub async fn plugins_without_permissions(&self) -> Vec<String> {
        self.maps
            .lock()
            .await
            .without_permissions
            .keys()
            .cloned()
            .collect()
    }

    /// Keys of the active plugins missing optional permissions
    pub async fn plugins_without_optional_permissions(&self) -> Vec<String> {
        self.maps
            .lock()
            .await
            .without_optional_permissions
            .keys()
            .cloned()
            .collect()
    }
}

fn update_optional(maps: &mut PluginMaps, key: &str, plugin: &Arc<dyn Plugin>) {
    if plugin.check_optional_permissions() {
        maps.without_optional_permissions.remove(key);
    } else {
        debug!("No optional permission for plugin {}", key);
        maps.without_optional_permissions
            .insert(key.to_string(), Arc::clone(plugin));
    }
}

async fn destroy(device_id: &str, key: &str, plugin: &Arc<dyn Plugin>) {
    if AssertUnwindSafe(plugin.on_destroy())
        .catch_unwind()
        .await
        .is_err()
    {
        error!("Plugin {} panicked in on_destroy for {}", key, device_id);
    }
}

impl std::fmt::Debug for DevicePlugins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePlugins")
            .field("device_id", &self.device_id)
            .field("packet_types", &self.table().packet_types())
            .finish()
    }
}
