//! Device identity
//!
//! Every link starts with an identity packet (`kdeconnect.identity`) telling
//! the other side who is speaking: device id, display name, device class,
//! protocol version and the packet types the device can receive and send.
//!
//! [`PeerIdentity`] is the immutable snapshot parsed from a peer's identity
//! packet. A later identity packet on the same connection produces a new
//! snapshot; fields the peer left out stay `None` so the connection keeps
//! whatever it knew before. [`LocalIdentity`] builds the packet we announce.

use crate::packet::PACKET_TYPE_IDENTITY;
use crate::{Packet, ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::fmt;
use tracing::warn;
use uuid::Uuid;

/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: u32 = 8;

/// Device classes known to the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Phone,
    Tablet,
    #[default]
    Desktop,
    Tv,
}

impl DeviceType {
    /// Convert device type to its wire string
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Desktop => "desktop",
            DeviceType::Tv => "tv",
        }
    }

    /// Parse a wire string; unknown classes (including `laptop`) are desktops
    pub fn from_str_lossy(value: &str) -> Self {
        match value {
            "phone" => DeviceType::Phone,
            "tablet" => DeviceType::Tablet,
            "tv" => DeviceType::Tv,
            _ => DeviceType::Desktop,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a peer's identity packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Unique device identifier
    pub device_id: String,

    /// Human-readable device name
    pub name: Option<String>,

    /// Device class
    pub device_type: Option<DeviceType>,

    /// Protocol version announced by the peer
    pub protocol_version: Option<u32>,

    /// Certificate presented on the link carrying this identity
    pub certificate: Vec<u8>,

    /// Packet types the peer can receive
    pub incoming_capabilities: Option<HashSet<String>>,

    /// Packet types the peer can send
    pub outgoing_capabilities: Option<HashSet<String>>,
}

impl PeerIdentity {
    /// Parse a peer identity from an identity packet
    ///
    /// Only `deviceId` is required; every other field is optional.
    ///
    /// ```
    /// use cosmic_connect_peer::{DeviceType, Packet, PeerIdentity};
    /// use serde_json::json;
    ///
    /// let packet = Packet::new(
    ///     "kdeconnect.identity",
    ///     json!({ "deviceId": "phone_1", "deviceType": "phone" }),
    /// );
    /// let identity = PeerIdentity::from_identity_packet(&packet, Vec::new()).unwrap();
    ///
    /// assert_eq!(identity.device_type, Some(DeviceType::Phone));
    /// assert!(identity.name.is_none());
    /// ```
    pub fn from_identity_packet(packet: &Packet, certificate: Vec<u8>) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_IDENTITY) {
            return Err(ProtocolError::InvalidPacket(format!(
                "Not an identity packet: {}",
                packet.packet_type
            )));
        }

        let device_id = packet
            .get_body_field::<String>("deviceId")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProtocolError::InvalidPacket("Missing deviceId".to_string()))?;

        let protocol_version = packet.get_body_field::<u32>("protocolVersion");
        if protocol_version.is_none() && packet.has("protocolVersion") {
            warn!("Ignoring invalid protocolVersion from {}", device_id);
        }

        Ok(Self {
            name: packet.get_body_field::<String>("deviceName"),
            device_type: packet
                .get_body_field::<String>("deviceType")
                .map(|t| DeviceType::from_str_lossy(&t)),
            protocol_version,
            certificate,
            incoming_capabilities: packet.get_string_set("incomingCapabilities"),
            outgoing_capabilities: packet.get_string_set("outgoingCapabilities"),
            device_id,
        })
    }
}

/// Identity this process announces to peers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalIdentity {
    /// Unique device identifier (UUIDv4 with underscores)
    pub device_id: String,

    /// Human-readable device name
    pub device_name: String,

    /// Type of this device
    pub device_type: DeviceType,

    /// Packet types we can receive
    pub incoming_capabilities: Vec<String>,

    /// Packet types we can send
    pub outgoing_capabilities: Vec<String>,
}

impl LocalIdentity {
    /// Create an identity with a freshly generated device id
    pub fn new(device_name: impl Into<String>, device_type: DeviceType) -> Self {
        Self::with_id(Self::generate_device_id(), device_name, device_type)
    }

    /// Create an identity with an explicit device id
    pub fn with_id(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
        }
    }

    /// Generate a UUIDv4 device ID with underscores
    pub fn generate_device_id() -> String {
        Uuid::new_v4().to_string().replace('-', "_")
    }

    /// Set the capability lists, usually from the plugin registry
    pub fn with_capabilities(
        mut self,
        incoming: impl IntoIterator<Item = String>,
        outgoing: impl IntoIterator<Item = String>,
    ) -> Self {
        self.incoming_capabilities = incoming.into_iter().collect();
        self.outgoing_capabilities = outgoing.into_iter().collect();
        self.incoming_capabilities.sort();
        self.outgoing_capabilities.sort();
        self
    }

    /// Build the identity packet sent at the start of every link
    pub fn to_identity_packet(&self) -> Packet {
        Packet::new(
            PACKET_TYPE_IDENTITY,
            json!({
                "deviceId": self.device_id,
                "deviceName": self.device_name,
                "protocolVersion": PROTOCOL_VERSION,
                "deviceType": self.device_type.as_str(),
                "incomingCapabilities": self.incoming_capabilities,
                "outgoingCapabilities": self.outgoing_capabilities,
            }),
        )
    }
}
