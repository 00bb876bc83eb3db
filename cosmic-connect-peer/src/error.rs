//! Error handling for the peer connection core
//!
//! Every fallible operation in this crate returns [`Result`], an alias over
//! [`ProtocolError`]. Errors from underlying libraries convert automatically
//! through `thiserror`'s `#[from]`, so `?` works across I/O, JSON and TOML.
//!
//! ## Error Categories
//!
//! - **Transport**: a single link failed to deliver a packet. The outgoing
//!   queue recovers locally by trying the next link; the error only reaches a
//!   caller once every link has been exhausted.
//! - **NotConnected**: a send was attempted while the device has no links.
//!   Surfaced immediately, never queued.
//! - **Plugin**: a plugin handler failed. Logged and isolated by the dispatcher.
//! - **InvalidPacket**: a packet could not be parsed. Returned to the caller
//!   doing the parsing, never replaced by a default packet.
//! - **Timeout**: a link's I/O timed out (see [`ProtocolError::from_io_error`]).
//!
//! Pairing failures are not errors of this type; they are reported to pairing
//! observers as a [`crate::pairing::PairingFailure`].
//!
//! ```rust
//! use cosmic_connect_peer::{ProtocolError, Result};
//!
//! fn parse_body(data: &[u8]) -> Result<serde_json::Value> {
//!     let value: serde_json::Value = serde_json::from_slice(data)?;
//!     Ok(value)
//! }
//!
//! assert!(matches!(parse_body(b"{"), Err(ProtocolError::Json(_))));
//! ```

use thiserror::Error;

/// Result type for peer connection operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur while talking to a peer
///
/// # Examples
///
/// ```rust
/// use cosmic_connect_peer::ProtocolError;
///
/// let error = ProtocolError::NotConnected;
/// assert_eq!(error.to_string(), "Device not connected");
///
/// let error = ProtocolError::InvalidPacket("missing type field".to_string());
/// assert_eq!(error.to_string(), "Invalid packet: missing type field");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (settings file, link socket, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration could not be parsed
    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A single link failed to transmit a packet
    #[error("Transport error: {0}")]
    Transport(String),

    /// The device has no active link
    #[error("Device not connected")]
    NotConnected,

    /// Device not found in the device repository
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Invalid or malformed packet
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Plugin-specific error (creation, packet handling)
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// A bounded wait elapsed
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProtocolError {
    /// Convert an I/O error raised by a link into a transport failure
    ///
    /// Meant for [`crate::Link`] implementations. Interrupted connections are
    /// reported as transport errors so the queue treats them like any other
    /// failed link; everything else stays `Io`.
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => ProtocolError::Transport(format!(
                "{}: connection interrupted ({})",
                context, error
            )),
            _ => ProtocolError::Io(error),
        }
    }

    /// Check if this error might succeed on a later attempt
    ///
    /// ```rust
    /// use cosmic_connect_peer::ProtocolError;
    ///
    /// assert!(ProtocolError::Transport("reset".to_string()).is_recoverable());
    /// assert!(!ProtocolError::InvalidPacket("bad".to_string()).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Transport(_)
                | ProtocolError::Timeout(_)
                | ProtocolError::NotConnected
                | ProtocolError::Io(_)
        )
    }
}
