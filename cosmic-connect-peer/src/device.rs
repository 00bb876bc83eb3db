//! Peer Connection
//!
//! A [`Device`] is everything this process knows about one remote peer: its
//! identity, pairing state, active links, outgoing queue and plugins. One
//! instance lives per device id for as long as the device is known, whether
//! or not it is currently connected.
//!
//! ## Inbound packets
//!
//! Links call [`Device::on_packet_received`] from their own tasks:
//!
//! - `kdeconnect.pair` packets go to the pairing state machine.
//! - Other packets from a paired device go to every plugin registered for
//!   their type.
//! - Other packets from an unpaired device first force an unpair (the peer
//!   still believes we trust it) and are then offered to plugins that listen
//!   to unpaired devices.
//!
//! ## Outbound packets
//!
//! [`Device::send_packet_with`] hands packets to the outgoing queue, which
//! exists exactly while at least one link is attached.

use crate::identity::{DeviceType, PeerIdentity, PROTOCOL_VERSION};
use crate::link::{
    send_over_links, Link, LinkSet, LoggingCallback, PacketReceiver, SendPacketStatusCallback,
};
use crate::packet::PACKET_TYPE_PAIR;
use crate::pairing::{
    notify_pairing_callbacks, PairingCallback, PairingDelegate, PairingEvent, PairingHandler,
    PairingState,
};
use crate::plugins::{
    DevicePlugins, Plugin, PluginCandidate, PluginRegistry, PluginsChangedListener,
};
use crate::queue::DevicePacketQueue;
use crate::settings::{SettingsStore, KEY_CERTIFICATE, KEY_DEVICE_NAME, KEY_DEVICE_TYPE};
use crate::{Packet, PeerConfig, ProtocolError, Result};
use async_trait::async_trait;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

/// Name used until a device tells us its own
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown device";

#[derive(Debug, Clone)]
struct DeviceDetails {
    name: String,
    device_type: DeviceType,
    protocol_version: u32,
    certificate: Vec<u8>,
    incoming_capabilities: Option<HashSet<String>>,
    outgoing_capabilities: Option<HashSet<String>>,
}

/// Copy-on-write observer list, safe to iterate while others add or remove
struct ObserverList<T: ?Sized> {
    items: RwLock<Arc<Vec<Arc<T>>>>,
}

impl<T: ?Sized> ObserverList<T> {
    fn new() -> Self {
        Self {
            items: RwLock::new(Arc::new(Vec::new())),
        }
    }

    fn snapshot(&self) -> Arc<Vec<Arc<T>>> {
        match self.items.read() {
            Ok(items) => Arc::clone(&items),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn add(&self, item: Arc<T>) {
        let mut guard = self.items.write().unwrap_or_else(|p| p.into_inner());
        let mut items = Vec::clone(&guard);
        items.push(item);
        *guard = Arc::new(items);
    }

    fn remove(&self, item: &Arc<T>) {
        let mut guard = self.items.write().unwrap_or_else(|p| p.into_inner());
        let items: Vec<Arc<T>> = guard
            .iter()
            .filter(|existing| {
                !std::ptr::eq(
                    Arc::as_ptr(*existing) as *const (),
                    Arc::as_ptr(item) as *const (),
                )
            })
            .cloned()
            .collect();
        *guard = Arc::new(items);
    }
}

/// Connection state of one remote device
pub struct Device {
    device_id: String,
    details: RwLock<DeviceDetails>,
    settings: Arc<dyn SettingsStore>,
    registry: Arc<PluginRegistry>,
    config: PeerConfig,
    pairing: Arc<PairingHandler>,
    pairing_callbacks: ObserverList<dyn PairingCallback>,
    plugins_changed_listeners: ObserverList<dyn PluginsChangedListener>,
    links: Arc<LinkSet>,
    queue: Mutex<Option<Arc<DevicePacketQueue>>>,
    supported_plugins: RwLock<BTreeSet<String>>,
    plugins: DevicePlugins,
    /// Serializes plugin reloads, including the decision of what to enable
    reload_lock: AsyncMutex<()>,
    /// Set on reachability changes; lets dispatch reload once on an empty table
    reload_on_dispatch: AtomicBool,
    self_ref: Weak<Device>,
}

impl Device {
    fn build(
        device_id: String,
        details: DeviceDetails,
        initial: PairingState,
        supported_plugins: BTreeSet<String>,
        settings: Arc<dyn SettingsStore>,
        registry: Arc<PluginRegistry>,
        config: PeerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Device>| {
            let delegate: Weak<dyn PairingDelegate> = weak.clone();
            Device {
                pairing: PairingHandler::new(
                    device_id.clone(),
                    initial,
                    delegate,
                    config.pairing_timeout(),
                ),
                plugins: DevicePlugins::new(device_id.clone()),
                device_id,
                details: RwLock::new(details),
                settings,
                registry,
                config,
                pairing_callbacks: ObserverList::new(),
                plugins_changed_listeners: ObserverList::new(),
                links: Arc::new(LinkSet::new()),
                queue: Mutex::new(None),
                supported_plugins: RwLock::new(supported_plugins),
                reload_lock: AsyncMutex::new(()),
                reload_on_dispatch: AtomicBool::new(false),
                self_ref: weak.clone(),
            }
        })
    }

    /// Create a connection for a device seen for the first time
    ///
    /// The device starts unpaired; attach its first link with
    /// [`Device::attach_link`].
    pub fn new(
        identity: &PeerIdentity,
        settings: Arc<dyn SettingsStore>,
        registry: Arc<PluginRegistry>,
        config: PeerConfig,
    ) -> Arc<Self> {
        let details = DeviceDetails {
            name: identity
                .name
                .clone()
                .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string()),
            device_type: identity.device_type.unwrap_or_default(),
            protocol_version: identity.protocol_version.unwrap_or(0),
            certificate: identity.certificate.clone(),
            incoming_capabilities: identity.incoming_capabilities.clone(),
            outgoing_capabilities: identity.outgoing_capabilities.clone(),
        };

        Self::build(
            identity.device_id.clone(),
            details,
            PairingState::Unpaired,
            BTreeSet::new(),
            settings,
            registry,
            config,
        )
    }

    /// Restore a trusted device from settings
    ///
    /// Until a link tells us its capabilities every registered plugin is
    /// considered supported.
    pub fn from_trusted(
        device_id: impl Into<String>,
        settings: Arc<dyn SettingsStore>,
        registry: Arc<PluginRegistry>,
        config: PeerConfig,
    ) -> Arc<Self> {
        let device_id = device_id.into();

        let certificate = settings
            .get_string(&device_id, KEY_CERTIFICATE)
            .and_then(|encoded| {
                base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| warn!("Stored certificate of {} is corrupt: {}", device_id, e))
                    .ok()
            })
            .unwrap_or_default();

        let details = DeviceDetails {
            name: settings
                .get_string(&device_id, KEY_DEVICE_NAME)
                .unwrap_or_else(|| UNKNOWN_DEVICE_NAME.to_string()),
            device_type: settings
                .get_string(&device_id, KEY_DEVICE_TYPE)
                .map(|t| DeviceType::from_str_lossy(&t))
                .unwrap_or_default(),
            protocol_version: 0,
            certificate,
            incoming_capabilities: None,
            outgoing_capabilities: None,
        };

        let supported = registry.available_plugins().into_iter().collect();
        Self::build(
            device_id,
            details,
            PairingState::Paired,
            supported,
            settings,
            registry,
            config,
        )
    }

    /// Weak handle for plugins
    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle(self.self_ref.clone())
    }

    fn receiver(&self) -> Weak<dyn PacketReceiver> {
        self.self_ref.clone()
    }

    fn details(&self) -> DeviceDetails {
        match self.details.read() {
            Ok(details) => details.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn name(&self) -> String {
        self.details().name
    }

    pub fn device_type(&self) -> DeviceType {
        self.details().device_type
    }

    /// Protocol version announced by the peer, 0 until a link announced one
    pub fn protocol_version(&self) -> u32 {
        self.details().protocol_version
    }

    /// Compare the peer's protocol version against ours
    pub fn compare_protocol_version(&self) -> CmpOrdering {
        self.protocol_version().cmp(&PROTOCOL_VERSION)
    }

    pub fn certificate(&self) -> Vec<u8> {
        self.details().certificate
    }

    /// SHA-256 fingerprint of the peer certificate as colon separated hex
    pub fn certificate_fingerprint(&self) -> Option<String> {
        let certificate = self.certificate();
        if certificate.is_empty() {
            return None;
        }

        let hash = Sha256::digest(&certificate);
        Some(
            hash.iter()
                .map(|b| hex::encode_upper([*b]))
                .collect::<Vec<_>>()
                .join(":"),
        )
    }

    pub fn pairing_state(&self) -> PairingState {
        self.pairing.state()
    }

    pub fn is_paired(&self) -> bool {
        self.pairing.is_paired()
    }

    pub fn is_pair_requested(&self) -> bool {
        self.pairing_state() == PairingState::Requested
    }

    pub fn is_pair_requested_by_peer(&self) -> bool {
        self.pairing_state() == PairingState::RequestedByPeer
    }

    /// Whether at least one link is attached
    pub fn is_reachable(&self) -> bool {
        !self.links.is_empty()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Keys of the plugins usable with this peer
    pub fn supported_plugins(&self) -> BTreeSet<String> {
        match self.supported_plugins.read() {
            Ok(supported) => supported.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Whether the peer accepts packets of this type
    ///
    /// Peers that never announced capabilities accept everything.
    pub fn supports_packet_type(&self, packet_type: &str) -> bool {
        match self.details().incoming_capabilities {
            Some(incoming) => incoming.contains(packet_type),
            None => true,
        }
    }

    /// Attach a link that announced `identity`
    ///
    /// Fields missing from the identity keep their previous values. The
    /// outgoing queue is created with the first link.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPacket` when the identity belongs to another device.
    pub async fn attach_link(&self, identity: &PeerIdentity, link: Arc<dyn Link>) -> Result<()> {
        if identity.device_id != self.device_id {
            return Err(ProtocolError::InvalidPacket(format!(
                "Identity of {} offered to device {}",
                identity.device_id, self.device_id
            )));
        }

        self.apply_identity(identity);

        let Some(count) = self.links.add(Arc::clone(&link)) else {
            debug!(
                "{} link already attached to {}",
                link.provider_name(),
                self.device_id
            );
            return Ok(());
        };

        {
            let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
            if queue.is_none() && !self.links.is_empty() {
                *queue = Some(Arc::new(DevicePacketQueue::new(
                    self.device_id.clone(),
                    Arc::clone(&self.links),
                )));
            }
        }

        link.add_packet_receiver(self.receiver());
        info!(
            "Attached {} link to {} ({} active)",
            link.provider_name(),
            self.device_id,
            count
        );

        self.update_supported_plugins();
        if count == 1 {
            self.reload_on_dispatch.store(true, Ordering::SeqCst);
        }
        self.reload_plugins().await;
        Ok(())
    }

    /// Detach a link; with the last link gone the queue fails its pending
    /// packets and every plugin that needs reachability is torn down
    pub async fn detach_link(&self, link: &Arc<dyn Link>) -> bool {
        let Some(remaining) = self.links.remove(link) else {
            return false;
        };
        link.remove_packet_receiver(&self.receiver());
        info!(
            "Detached {} link from {} ({} remaining)",
            link.provider_name(),
            self.device_id,
            remaining
        );

        if remaining == 0 {
            let queue = {
                let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
                if self.links.is_empty() {
                    queue.take()
                } else {
                    None
                }
            };
            if let Some(queue) = queue {
                queue.disconnected();
            }
            self.reload_on_dispatch.store(true, Ordering::SeqCst);
        }

        self.reload_plugins().await;
        true
    }

    /// Ask every link to close; the transport detaches them afterwards
    pub fn disconnect(&self) {
        for link in self.links.snapshot().iter() {
            link.disconnect();
        }
    }

    fn apply_identity(&self, identity: &PeerIdentity) {
        let paired = self.is_paired();
        let mut details = self.details.write().unwrap_or_else(|p| p.into_inner());

        if let Some(name) = &identity.name {
            if paired && *name != details.name {
                self.persist(KEY_DEVICE_NAME, name);
            }
            details.name = name.clone();
        }
        if let Some(device_type) = identity.device_type {
            if paired && device_type != details.device_type {
                self.persist(KEY_DEVICE_TYPE, device_type.as_str());
            }
            details.device_type = device_type;
        }
        if let Some(version) = identity.protocol_version {
            details.protocol_version = version;
        }
        if !identity.certificate.is_empty() {
            details.certificate = identity.certificate.clone();
        }
        if identity.incoming_capabilities.is_some() {
            details.incoming_capabilities = identity.incoming_capabilities.clone();
        }
        if identity.outgoing_capabilities.is_some() {
            details.outgoing_capabilities = identity.outgoing_capabilities.clone();
        }
    }

    fn update_supported_plugins(&self) {
        let details = self.details();
        let supported = match (
            &details.incoming_capabilities,
            &details.outgoing_capabilities,
        ) {
            (Some(incoming), Some(outgoing)) => {
                self.registry.plugins_for_capabilities(incoming, outgoing)
            }
            _ => self.registry.available_plugins().into_iter().collect(),
        };

        debug!(
            "{} supports {} of {} plugins",
            self.device_id,
            supported.len(),
            self.registry.available_plugins().len()
        );
        let mut guard = self
            .supported_plugins
            .write()
            .unwrap_or_else(|p| p.into_inner());
        *guard = supported;
    }

    /// Entry point for every packet read from any link
    pub async fn on_packet_received(&self, packet: Packet) {
        if packet.is_type(PACKET_TYPE_PAIR) {
            self.pairing.packet_received(&packet).await;
            return;
        }

        if self.is_paired() {
            if self.plugins.table().is_empty()
                && self.reload_on_dispatch.swap(false, Ordering::SeqCst)
            {
                debug!(
                    "No plugins loaded for {} after reachability change, reloading",
                    self.device_id
                );
                self.reload_plugins().await;
            }
            self.plugins.dispatch(&packet, true).await;
        } else {
            warn!(
                "Received {} from unpaired device {}, unpairing",
                packet.packet_type, self.device_id
            );
            self.pairing.unpair().await;
            self.plugins.dispatch(&packet, false).await;
        }
    }

    /// Queue a packet for sending
    ///
    /// Fails immediately with `NotConnected` when no link is attached.
    pub fn send_packet_with(
        &self,
        packet: Packet,
        replace_id: Option<u32>,
        callback: Arc<dyn SendPacketStatusCallback>,
    ) {
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        match queue {
            Some(queue) => queue.add_packet(packet, replace_id, callback),
            None => {
                debug!(
                    "Dropping {} for {}: not connected",
                    packet.packet_type, self.device_id
                );
                callback.on_failure(&ProtocolError::NotConnected);
            }
        }
    }

    /// Queue a packet, logging the outcome
    pub fn send_packet(&self, packet: Packet) {
        let callback = Arc::new(LoggingCallback::new(packet.packet_type.clone()));
        self.send_packet_with(packet, None, callback);
    }

    /// Send a packet directly over the links and wait for the outcome
    ///
    /// Packets with a payload wait at most the configured confirmation
    /// timeout; the transfer itself keeps running and still reports to
    /// `callback` when it ends. Must not be awaited from a task that
    /// services this device's inbound packets.
    pub async fn send_packet_blocking(
        &self,
        packet: Packet,
        callback: Arc<dyn SendPacketStatusCallback>,
        send_payload_same_thread: bool,
    ) -> bool {
        let links = self.links.snapshot();

        if !packet.has_payload() {
            return send_over_links(&links, &packet, callback.as_ref(), send_payload_same_thread)
                .await;
        }

        let packet_type = packet.packet_type.clone();
        let transfer = tokio::spawn(async move {
            send_over_links(&links, &packet, callback.as_ref(), send_payload_same_thread).await
        });

        match tokio::time::timeout(self.config.payload_confirmation_timeout(), transfer).await {
            Ok(Ok(sent)) => sent,
            Ok(Err(e)) => {
                error!("Sending {} to {} aborted: {}", packet_type, self.device_id, e);
                false
            }
            Err(_) => {
                warn!(
                    "No payload confirmation for {} from {} within {:?}",
                    packet_type,
                    self.device_id,
                    self.config.payload_confirmation_timeout()
                );
                false
            }
        }
    }

    /// Reclaim an unsent packet queued under `replace_id`
    pub fn take_if_pending(&self, replace_id: u32) -> Option<Packet> {
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        queue.and_then(|queue| queue.take_if_pending(replace_id))
    }

    pub async fn request_pairing(&self) {
        self.pairing.request_pairing().await;
    }

    pub async fn accept_pairing(&self) {
        self.pairing.accept_pairing().await;
    }

    pub async fn cancel_pairing(&self) {
        self.pairing.cancel_pairing().await;
    }

    pub async fn unpair(&self) {
        self.pairing.unpair().await;
    }

    pub fn add_pairing_callback(&self, callback: Arc<dyn PairingCallback>) {
        self.pairing_callbacks.add(callback);
    }

    pub fn remove_pairing_callback(&self, callback: &Arc<dyn PairingCallback>) {
        self.pairing_callbacks.remove(callback);
    }

    pub fn add_plugins_changed_listener(&self, listener: Arc<dyn PluginsChangedListener>) {
        self.plugins_changed_listeners.add(listener);
    }

    pub fn remove_plugins_changed_listener(&self, listener: &Arc<dyn PluginsChangedListener>) {
        self.plugins_changed_listeners.remove(listener);
    }

    /// Whether the user enabled `key` for this device
    pub fn is_plugin_enabled(&self, key: &str) -> bool {
        self.settings
            .get_bool(&self.device_id, key)
            .or_else(|| {
                self.registry
                    .plugin_info(key)
                    .map(|info| info.enabled_by_default)
            })
            .unwrap_or(false)
    }

    /// Enable or disable a plugin for this device and reload
    pub async fn set_plugin_enabled(&self, key: &str, enabled: bool) -> Result<()> {
        self.settings.put_bool(&self.device_id, key, enabled)?;
        info!(
            "Plugin {} {} for {}",
            key,
            if enabled { "enabled" } else { "disabled" },
            self.device_id
        );
        self.reload_plugins().await;
        Ok(())
    }

    pub async fn plugin(&self, key: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.plugin(key).await
    }

    pub async fn plugin_including_without_permissions(&self, key: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.plugin_including_without_permissions(key).await
    }

    pub async fn loaded_plugins(&self) -> Vec<String> {
        self.plugins.loaded_plugins().await
    }

    pub async fn plugins_without_permissions(&self) -> Vec<String> {
        self.plugins.plugins_without_permissions().await
    }

    pub async fn plugins_without_optional_permissions(&self) -> Vec<String> {
        self.plugins.plugins_without_optional_permissions().await
    }

    /// Keys of the plugins registered for `packet_type` right now
    pub fn plugins_for_packet_type(&self, packet_type: &str) -> Vec<String> {
        self.plugins.table().plugin_keys(packet_type)
    }

    /// Recompute which plugins are active and rebuild the dispatch table
    pub async fn reload_plugins(&self) {
        {
            let _guard = self.reload_lock.lock().await;

            let paired = self.is_paired();
            let reachable = self.is_reachable();
            let candidates: Vec<PluginCandidate> = self
                .supported_plugins()
                .iter()
                .filter_map(|key| {
                    let Some(factory) = self.registry.factory(key) else {
                        warn!("Supported plugin {} is not registered", key);
                        return None;
                    };
                    let listen_to_unpaired = factory.info().listen_to_unpaired;
                    let should_enable = (paired || listen_to_unpaired)
                        && reachable
                        && self.is_plugin_enabled(key);
                    Some(PluginCandidate {
                        factory,
                        should_enable,
                    })
                })
                .collect();

            self.plugins.reload(candidates, &self.handle()).await;
        }

        for listener in self.plugins_changed_listeners.snapshot().iter() {
            if catch_unwind(AssertUnwindSafe(|| listener.on_plugins_changed(&self.device_id)))
                .is_err()
            {
                error!("Plugins changed listener panicked for {}", self.device_id);
            }
        }
    }

    /// Tear down every plugin regardless of pairing or reachability
    pub async fn shutdown_plugins(&self) {
        let _guard = self.reload_lock.lock().await;
        self.plugins.clear().await;
        debug!("Shut down plugins of {}", self.device_id);
    }

    fn persist(&self, key: &str, value: &str) {
        if let Err(e) = self.settings.put_string(&self.device_id, key, value) {
            warn!("Could not store {} for {}: {}", key, self.device_id, e);
        }
    }

    fn store_trust(&self) {
        let details = self.details();
        let certificate = base64::engine::general_purpose::STANDARD.encode(&details.certificate);

        self.persist(KEY_CERTIFICATE, &certificate);
        self.persist(KEY_DEVICE_NAME, &details.name);
        self.persist(KEY_DEVICE_TYPE, details.device_type.as_str());
        if let Err(e) = self.settings.set_trusted(&self.device_id, true) {
            error!("Could not mark {} as trusted: {}", self.device_id, e);
        }
        info!("Stored trust for {} ({})", details.name, self.device_id);
    }

    fn erase_trust(&self) {
        if let Err(e) = self.settings.set_trusted(&self.device_id, false) {
            error!("Could not remove trust for {}: {}", self.device_id, e);
        }
        if let Err(e) = self.settings.clear_scope(&self.device_id) {
            warn!("Could not clear settings of {}: {}", self.device_id, e);
        }
    }
}

#[async_trait]
impl PairingDelegate for Device {
    fn is_reachable(&self) -> bool {
        Device::is_reachable(self)
    }

    fn send_pairing_packet(&self, packet: Packet) {
        let callback = Arc::new(PairingSendCallback {
            pairing: Arc::downgrade(&self.pairing),
        });
        self.send_packet_with(packet, None, callback);
    }

    async fn on_pairing_event(&self, event: PairingEvent) {
        match event {
            PairingEvent::Successful => {
                self.store_trust();
                self.reload_plugins().await;
            }
            PairingEvent::Unpaired => {
                self.erase_trust();
                self.reload_plugins().await;
            }
            PairingEvent::IncomingRequest | PairingEvent::Failed(_) => {}
        }

        notify_pairing_callbacks(&self.device_id, &self.pairing_callbacks.snapshot(), &event);
    }
}

#[async_trait]
impl PacketReceiver for Device {
    async fn on_packet_received(&self, packet: Packet) {
        Device::on_packet_received(self, packet).await;
    }
}

/// Reports failed pairing packets back to the state machine
struct PairingSendCallback {
    pairing: Weak<PairingHandler>,
}

impl SendPacketStatusCallback for PairingSendCallback {
    fn on_success(&self) {}

    fn on_failure(&self, error: &ProtocolError) {
        let Some(pairing) = self.pairing.upgrade() else {
            return;
        };
        let reason = error.to_string();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    pairing.pairing_send_failed(reason).await;
                });
            }
            Err(_) => warn!("Pairing packet not delivered and no runtime to report it: {}", reason),
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("device_id", &self.device_id)
            .field("name", &self.name())
            .field("pairing_state", &self.pairing_state())
            .field("links", &self.links)
            .finish()
    }
}

/// Weak reference to a [`Device`] handed to plugins
///
/// Plugins keep this instead of the device itself so that dropping a device
/// is never blocked by its own plugins.
#[derive(Clone, Default)]
pub struct DeviceHandle(Weak<Device>);

impl DeviceHandle {
    /// A handle that never resolves, for plugins created outside a device
    pub fn detached() -> Self {
        Self(Weak::new())
    }

    pub fn upgrade(&self) -> Option<Arc<Device>> {
        self.0.upgrade()
    }

    pub fn device_id(&self) -> Option<String> {
        self.upgrade().map(|device| device.device_id().to_string())
    }

    pub fn is_paired(&self) -> bool {
        self.upgrade().is_some_and(|device| device.is_paired())
    }

    /// Queue a packet; returns false if the device is gone
    pub fn send_packet(&self, packet: Packet) -> bool {
        match self.upgrade() {
            Some(device) => {
                device.send_packet(packet);
                true
            }
            None => false,
        }
    }

    /// Queue a packet with a replace id and callback
    pub fn send_packet_with(
        &self,
        packet: Packet,
        replace_id: Option<u32>,
        callback: Arc<dyn SendPacketStatusCallback>,
    ) {
        match self.upgrade() {
            Some(device) => device.send_packet_with(packet, replace_id, callback),
            None => callback.on_failure(&ProtocolError::NotConnected),
        }
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DeviceHandle")
            .field(&self.device_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentity;
    use crate::pairing::PairingPacket;
    use crate::plugins::PluginInfo;
    use crate::settings::MemorySettings;
    use crate::test_utils::{wait_until, MockLink, RecordingCallback, TestPluginFactory};
    use serde_json::json;

    fn identity(device_id: &str) -> PeerIdentity {
        let packet = LocalIdentity::with_id(device_id, "Pixel", DeviceType::Phone)
            .with_capabilities(
                vec!["kdeconnect.ping".to_string()],
                vec!["kdeconnect.ping".to_string()],
            )
            .to_identity_packet();
        PeerIdentity::from_identity_packet(&packet, vec![0x30, 0x82, 0x01]).unwrap()
    }

    fn registry_with(factories: &[Arc<TestPluginFactory>]) -> Arc<PluginRegistry> {
        let mut registry = PluginRegistry::new();
        for factory in factories {
            registry
                .register_factory(Arc::clone(factory) as Arc<dyn crate::plugins::PluginFactory>)
                .unwrap();
        }
        Arc::new(registry)
    }

    fn ping_factory() -> Arc<TestPluginFactory> {
        TestPluginFactory::new(
            PluginInfo::new("ping", "Ping")
                .with_supported_packet_types(["kdeconnect.ping"])
                .with_outgoing_packet_types(["kdeconnect.ping"]),
        )
    }

    fn config() -> PeerConfig {
        PeerConfig {
            pairing_timeout_secs: 10,
            payload_confirmation_timeout_secs: 1,
            ..PeerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_new_device_from_identity() {
        let settings = Arc::new(MemorySettings::new());
        let device = Device::new(&identity("phone"), settings, registry_with(&[]), config());

        assert_eq!(device.device_id(), "phone");
        assert_eq!(device.name(), "Pixel");
        assert_eq!(device.device_type(), DeviceType::Phone);
        assert_eq!(device.compare_protocol_version(), CmpOrdering::Equal);
        assert_eq!(device.pairing_state(), PairingState::Unpaired);
        assert!(!device.is_reachable());
        assert!(device.supports_packet_type("kdeconnect.ping"));
        assert!(!device.supports_packet_type("kdeconnect.battery"));
    }

    #[tokio::test]
    async fn test_fingerprint_format() {
        let settings = Arc::new(MemorySettings::new());
        let device = Device::new(&identity("phone"), settings, registry_with(&[]), config());

        let fingerprint = device.certificate_fingerprint().unwrap();
        assert_eq!(fingerprint.len(), 32 * 3 - 1);
        assert!(fingerprint
            .split(':')
            .all(|b| b.len() == 2 && b.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase())));
    }

    #[tokio::test]
    async fn test_identity_fields_update_only_when_present() {
        let settings = Arc::new(MemorySettings::new());
        let device = Device::new(&identity("phone"), settings, registry_with(&[]), config());

        let sparse = PeerIdentity::from_identity_packet(
            &Packet::new(
                "kdeconnect.identity",
                json!({ "deviceId": "phone", "deviceName": "Renamed" }),
            ),
            Vec::new(),
        )
        .unwrap();
        let link = MockLink::succeeding("lan");
        device.attach_link(&sparse, link).await.unwrap();

        assert_eq!(device.name(), "Renamed");
        assert_eq!(device.device_type(), DeviceType::Phone);
        assert_eq!(device.protocol_version(), PROTOCOL_VERSION);
        assert!(!device.certificate().is_empty());
    }

    #[tokio::test]
    async fn test_attach_rejects_foreign_identity() {
        let settings = Arc::new(MemorySettings::new());
        let device = Device::new(&identity("phone"), settings, registry_with(&[]), config());

        let result = device
            .attach_link(&identity("tablet"), MockLink::succeeding("lan"))
            .await;
        assert!(matches!(result, Err(ProtocolError::InvalidPacket(_))));
        assert_eq!(device.link_count(), 0);
    }

    #[tokio::test]
    async fn test_send_without_links_fails_immediately() {
        let settings = Arc::new(MemorySettings::new());
        let device = Device::new(&identity("phone"), settings, registry_with(&[]), config());

        let callback = RecordingCallback::new();
        device.send_packet_with(Packet::empty("kdeconnect.ping"), None, callback.clone());
        assert_eq!(callback.failures(), 1);
        assert_eq!(callback.last_error().as_deref(), Some("Device not connected"));
        assert!(device.take_if_pending(1).is_none());
    }

    #[tokio::test]
    async fn test_pairing_persists_and_erases_trust() {
        let settings = Arc::new(MemorySettings::new());
        let ping = ping_factory();
        let device = Device::new(
            &identity("phone"),
            settings.clone(),
            registry_with(&[ping.clone()]),
            config(),
        );
        let link = MockLink::succeeding("lan");
        device.attach_link(&identity("phone"), link.clone()).await.unwrap();
        assert!(device.loaded_plugins().await.is_empty());

        device.request_pairing().await;
        wait_until("pair request", || link.sent().len() == 1).await;
        link.deliver(PairingPacket::accept()).await;

        assert!(device.is_paired());
        assert!(settings.is_trusted("phone"));
        assert!(settings.get_string("phone", KEY_CERTIFICATE).is_some());
        assert_eq!(device.loaded_plugins().await, vec!["ping".to_string()]);

        device.unpair().await;
        assert!(!settings.is_trusted("phone"));
        assert!(settings.get_string("phone", KEY_CERTIFICATE).is_none());
        assert!(device.loaded_plugins().await.is_empty());
        assert_eq!(ping.destroyed(), 1);
    }

    #[tokio::test]
    async fn test_trusted_device_restored_from_settings() {
        let settings = Arc::new(MemorySettings::new());
        settings.set_trusted("phone", true).unwrap();
        settings.put_string("phone", KEY_DEVICE_NAME, "Pixel").unwrap();
        settings.put_string("phone", KEY_DEVICE_TYPE, "tablet").unwrap();
        settings.put_string("phone", KEY_CERTIFICATE, "MIIB").unwrap();

        let ping = ping_factory();
        let device = Device::from_trusted(
            "phone",
            settings,
            registry_with(&[ping.clone()]),
            config(),
        );

        assert!(device.is_paired());
        assert_eq!(device.name(), "Pixel");
        assert_eq!(device.device_type(), DeviceType::Tablet);
        assert_eq!(device.certificate(), vec![0x30, 0x82, 0x01]);
        assert!(device.supported_plugins().contains("ping"));
        assert!(device.certificate_fingerprint().is_some());
    }

    #[tokio::test]
    async fn test_plugin_enable_setting() {
        let settings = Arc::new(MemorySettings::new());
        let ping = ping_factory();
        let optional = TestPluginFactory::new(
            PluginInfo::new("runcommand", "Run command")
                .with_supported_packet_types(["kdeconnect.ping"])
                .disabled_by_default(),
        );
        let device = Device::from_trusted(
            "phone",
            settings,
            registry_with(&[ping.clone(), optional.clone()]),
            config(),
        );
        device
            .attach_link(&identity("phone"), MockLink::succeeding("lan"))
            .await
            .unwrap();

        assert!(device.is_plugin_enabled("ping"));
        assert!(!device.is_plugin_enabled("runcommand"));
        assert!(!device.is_plugin_enabled("unknown"));
        assert_eq!(device.loaded_plugins().await, vec!["ping".to_string()]);

        device.set_plugin_enabled("runcommand", true).await.unwrap();
        device.set_plugin_enabled("ping", false).await.unwrap();
        assert_eq!(device.loaded_plugins().await, vec!["runcommand".to_string()]);
        assert_eq!(
            device.plugins_for_packet_type("kdeconnect.ping"),
            vec!["runcommand".to_string()]
        );
    }

    #[tokio::test]
    async fn test_detach_unknown_link() {
        let settings = Arc::new(MemorySettings::new());
        let device = Device::new(&identity("phone"), settings, registry_with(&[]), config());
        let link: Arc<dyn Link> = MockLink::succeeding("lan");

        assert!(!device.detach_link(&link).await);
    }

    #[tokio::test]
    async fn test_blocking_send_times_out_waiting_for_payload() {
        let settings = Arc::new(MemorySettings::new());
        let device = Device::from_trusted("phone", settings, registry_with(&[]), config());
        let link = MockLink::gated("lan");
        device
            .attach_link(&identity("phone"), link.clone())
            .await
            .unwrap();

        let callback = RecordingCallback::new();
        let packet = Packet::empty("kdeconnect.share.request").with_payload_size(4096);
        assert!(!device.send_packet_blocking(packet, callback.clone(), true).await);
        assert_eq!(callback.successes() + callback.failures(), 0);

        // The transfer was not aborted and still reports its outcome
        link.release(1);
        callback.wait_for_terminal(1).await;
        assert_eq!(callback.successes(), 1);
    }

    #[tokio::test]
    async fn test_blocking_send_without_payload() {
        let settings = Arc::new(MemorySettings::new());
        let device = Device::from_trusted("phone", settings, registry_with(&[]), config());
        let link = MockLink::succeeding("lan");
        device
            .attach_link(&identity("phone"), link.clone())
            .await
            .unwrap();

        let callback = RecordingCallback::new();
        assert!(
            device
                .send_packet_blocking(Packet::empty("kdeconnect.ping"), callback.clone(), false)
                .await
        );
        assert_eq!(callback.successes(), 1);
        assert_eq!(link.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_asks_links_to_close() {
        let settings = Arc::new(MemorySettings::new());
        let device = Device::new(&identity("phone"), settings, registry_with(&[]), config());
        let lan = MockLink::succeeding("lan");
        let bluetooth = MockLink::succeeding("bluetooth");
        device.attach_link(&identity("phone"), lan.clone()).await.unwrap();
        device
            .attach_link(&identity("phone"), bluetooth.clone())
            .await
            .unwrap();

        device.disconnect();
        assert_eq!(lan.disconnects(), 1);
        assert_eq!(bluetooth.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_handle_does_not_keep_device_alive() {
        let settings = Arc::new(MemorySettings::new());
        let device = Device::new(&identity("phone"), settings, registry_with(&[]), config());
        let handle = device.handle();

        assert_eq!(handle.device_id().as_deref(), Some("phone"));
        drop(device);

        assert!(handle.device_id().is_none());
        assert!(!handle.send_packet(Packet::empty("kdeconnect.ping")));

        let callback = RecordingCallback::new();
        handle.send_packet_with(Packet::empty("kdeconnect.ping"), Some(1), callback.clone());
        assert_eq!(callback.failures(), 1);
    }

    #[tokio::test]
    async fn test_empty_table_reloads_once_after_reachability_change() {
        let settings = Arc::new(MemorySettings::new());
        settings.put_bool("phone", "ping", false).unwrap();
        let ping = ping_factory();
        let device = Device::from_trusted(
            "phone",
            settings.clone(),
            registry_with(&[ping.clone()]),
            config(),
        );
        let link = MockLink::succeeding("lan");
        device
            .attach_link(&identity("phone"), link.clone())
            .await
            .unwrap();
        assert!(device.loaded_plugins().await.is_empty());

        // Enabled behind the device's back, so nothing reloads yet
        settings.put_bool("phone", "ping", true).unwrap();
        link.deliver(Packet::empty("kdeconnect.ping")).await;

        assert_eq!(device.loaded_plugins().await, vec!["ping".to_string()]);
        assert_eq!(ping.received().len(), 1);
        assert_eq!(ping.created(), 1);

        // An empty table without a reachability change stays empty
        device.set_plugin_enabled("ping", false).await.unwrap();
        settings.put_bool("phone", "ping", true).unwrap();
        link.deliver(Packet::empty("kdeconnect.ping")).await;

        assert!(device.loaded_plugins().await.is_empty());
        assert_eq!(ping.created(), 1);
        assert_eq!(ping.received().len(), 1);
    }
}
