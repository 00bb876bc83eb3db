//! Network Packet
//!
//! This module implements the packet value exchanged with peers.
//! Packets are JSON objects terminated by a newline on the wire.
//!
//! ## Packet Structure
//!
//! Each packet contains:
//! - `id`: UNIX epoch timestamp in milliseconds, strictly increasing per process
//! - `type`: Packet type in format `kdeconnect.<plugin>[.<action>]`
//! - `body`: JSON object of plugin-specific fields (may be empty, never absent)
//! - `payloadSize`: (optional) Size of payload data in bytes
//! - `payloadTransferInfo`: (optional) Transfer negotiation parameters
//!
//! Any other top-level field is kept as-is so packets from newer peers survive
//! a parse/serialize cycle.
//!
//! ## References
//! - [Valent Protocol Reference](https://valent.andyholmes.ca/documentation/protocol.html)

use crate::{ProtocolError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

/// Identity packet type, sent once per link before anything else
pub const PACKET_TYPE_IDENTITY: &str = "kdeconnect.identity";

/// Pairing packet type, always routed to the pairing handler
pub const PACKET_TYPE_PAIR: &str = "kdeconnect.pair";

/// Last id handed out by [`next_packet_id`]
static LAST_PACKET_ID: AtomicI64 = AtomicI64::new(0);

/// Represents a network packet
///
/// # Examples
///
/// ```
/// use cosmic_connect_peer::Packet;
/// use serde_json::json;
///
/// let packet = Packet::new("kdeconnect.battery", json!({ "currentCharge": 85 }));
///
/// let bytes = packet.to_bytes().unwrap();
/// let parsed = Packet::from_bytes(&bytes).unwrap();
///
/// assert_eq!(parsed, packet);
/// assert_eq!(parsed.get_int("currentCharge", -1), 85);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    /// UNIX timestamp in milliseconds
    /// Note: Some clients send this as a string
    #[serde(deserialize_with = "deserialize_id", serialize_with = "serialize_id")]
    pub id: i64,

    /// Packet type in format: kdeconnect.<plugin>[.<action>]
    #[serde(rename = "type")]
    pub packet_type: String,

    /// Plugin-specific fields
    #[serde(default)]
    pub body: Map<String, Value>,

    /// Optional payload size in bytes (-1 for indefinite streams)
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    /// Optional payload transfer negotiation info
    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<HashMap<String, Value>>,

    /// Top-level fields this implementation does not know about
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Packet {
    /// Creates a new packet with the specified type and body
    ///
    /// The id is taken from the current time. A body that is not a JSON
    /// object yields an empty body.
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self::with_id(next_packet_id(), packet_type, body)
    }

    /// Creates a packet with an empty body
    pub fn empty(packet_type: impl Into<String>) -> Self {
        Self::new(packet_type, Value::Object(Map::new()))
    }

    /// Create a new packet with an explicit id
    ///
    /// Useful for testing or when you need specific timestamp control
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        let packet_type = packet_type.into();
        let body = match body {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                debug!(
                    "Discarding non-object body for packet '{}': {}",
                    packet_type, other
                );
                Map::new()
            }
        };

        Self {
            id,
            packet_type,
            body,
            payload_size: None,
            payload_transfer_info: None,
            extra: Map::new(),
        }
    }

    /// Serialize packet to bytes with newline terminator
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Json` if serialization fails
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Serialize packet to its newline-terminated text form
    pub fn serialize(&self) -> Result<String> {
        let mut text = serde_json::to_string(self)?;
        text.push('\n');
        Ok(text)
    }

    /// Deserialize a packet from bytes
    ///
    /// Accepts both newline-terminated (`\n` or `\r\n`) and bare JSON.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidPacket` if the data is not valid JSON,
    /// lacks `id` or `type`, or carries a body that is not an object.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let trimmed = data
            .strip_suffix(b"\r\n")
            .or_else(|| data.strip_suffix(b"\n"))
            .unwrap_or(data);

        serde_json::from_slice(trimmed).map_err(|e| {
            ProtocolError::InvalidPacket(format!("Failed to deserialize packet: {}", e))
        })
    }

    /// Parse the text form produced by [`Packet::serialize`]
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_bytes(text.as_bytes())
    }

    /// Builder pattern: Set payload size
    pub fn with_payload_size(mut self, size: i64) -> Self {
        self.payload_size = Some(size);
        self
    }

    /// Builder pattern: Set payload transfer info
    pub fn with_payload_transfer_info(mut self, info: HashMap<String, Value>) -> Self {
        self.payload_transfer_info = Some(info);
        self
    }

    /// Builder pattern: Add a key-value pair to the body
    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Whether this packet announces a binary payload
    pub fn has_payload(&self) -> bool {
        matches!(self.payload_size, Some(size) if size != 0)
    }

    /// Check if packet is of a specific type
    ///
    /// The `cconnect.` and `kdeconnect.` prefixes are interchangeable.
    pub fn is_type(&self, packet_type: &str) -> bool {
        if self.packet_type == packet_type {
            return true;
        }

        if let Some(rest) = packet_type.strip_prefix("cconnect.") {
            return self.packet_type.strip_prefix("kdeconnect.") == Some(rest);
        }
        if let Some(rest) = packet_type.strip_prefix("kdeconnect.") {
            return self.packet_type.strip_prefix("cconnect.") == Some(rest);
        }

        false
    }

    /// Whether the body contains `key`
    pub fn has(&self, key: &str) -> bool {
        self.body.contains_key(key)
    }

    /// Set a body field, replacing any previous value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.body.insert(key.into(), value.into());
    }

    /// Remove a body field
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.body.remove(key)
    }

    /// Get a field from the body as a specific type
    pub fn get_body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Get a string field, or `default` when absent or not a string
    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.body.get(key) {
            Some(Value::String(s)) => s.clone(),
            _ => default.to_string(),
        }
    }

    /// Get a boolean field, or `default` when absent or not a boolean
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.body
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    /// Get a 32-bit integer field, or `default` when absent, not an integer
    /// or out of range
    pub fn get_int(&self, key: &str, default: i32) -> i32 {
        self.body
            .get(key)
            .and_then(Value::as_i64)
            .and_then(|v| i32::try_from(v).ok())
            .unwrap_or(default)
    }

    /// Get a 64-bit integer field, or `default` when absent or not an integer
    pub fn get_long(&self, key: &str, default: i64) -> i64 {
        self.body
            .get(key)
            .and_then(Value::as_i64)
            .unwrap_or(default)
    }

    /// Get a floating point field, or `default` when absent or not a number
    pub fn get_double(&self, key: &str, default: f64) -> f64 {
        self.body
            .get(key)
            .and_then(Value::as_f64)
            .unwrap_or(default)
    }

    /// Get an array of strings as a list
    ///
    /// Returns `None` when absent, not an array, or when any element is not
    /// a string.
    pub fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        match self.body.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => None,
        }
    }

    /// Get an array of strings as a set
    pub fn get_string_set(&self, key: &str) -> Option<HashSet<String>> {
        self.get_string_list(key)
            .map(|items| items.into_iter().collect())
    }

    /// Get a raw JSON array field
    pub fn get_json_array(&self, key: &str) -> Option<&Vec<Value>> {
        self.body.get(key).and_then(Value::as_array)
    }
}

/// Custom deserializer for the `id` field to handle both string and number formats
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::custom("Invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("Invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

/// Custom serializer for the `id` field - always serialize as a number
fn serialize_id<S>(id: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(*id)
}

/// Generate current UNIX timestamp in milliseconds
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

/// Next packet id: the current timestamp, bumped past the last id handed out
fn next_packet_id() -> i64 {
    let now = current_timestamp();
    let mut last = LAST_PACKET_ID.load(Ordering::Relaxed);
    loop {
        let next = if now > last { now } else { last + 1 };
        match LAST_PACKET_ID.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}
