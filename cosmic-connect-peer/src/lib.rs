//! Cosmic Connect Peer Connection Core
//!
//! Everything this process keeps per remote device once transports have
//! produced links to it: pairing, an outgoing queue that fails over between
//! links, and dispatch of inbound packets to the device's plugins.
//!
//! Transports (LAN, Bluetooth, ...) live elsewhere; they only need to
//! implement [`Link`] and report new and closed links to a [`DeviceManager`].

pub mod config;
pub mod device;
pub mod identity;
pub mod link;
pub mod manager;
pub mod packet;
pub mod pairing;
pub mod plugins;
pub mod queue;
pub mod settings;

mod error;

// Re-export local types
pub use config::PeerConfig;
pub use device::{Device, DeviceHandle};
pub use error::{ProtocolError, Result};
pub use identity::{DeviceType, LocalIdentity, PeerIdentity, PROTOCOL_VERSION};
pub use link::{
    Link, LinkSet, LoggingCallback, PacketReceiver, PayloadProgress, SendPacketStatusCallback,
};
pub use manager::DeviceManager;
pub use packet::{current_timestamp, Packet, PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR};
pub use pairing::{
    PairingCallback, PairingEvent, PairingFailure, PairingHandler, PairingPacket, PairingState,
    PAIRING_TIMEOUT,
};
pub use plugins::{Plugin, PluginFactory, PluginInfo, PluginRegistry, PluginsChangedListener};
pub use queue::DevicePacketQueue;
pub use settings::{JsonFileSettings, MemorySettings, SettingsStore};

#[cfg(test)]
pub mod test_utils;
