//! Link Abstraction
//!
//! A [`Link`] is one concrete transport connection to a peer (a TLS socket over
//! LAN, a Bluetooth channel, ...). A device can hold several links at once;
//! outgoing packets go out over the first link that accepts them.
//!
//! Links only report payload progress while sending. The terminal
//! success/failure callback of a send is fired by [`send_over_links`] once the
//! outcome over the whole link set is known, so a failing link never reports
//! failure for a packet a later link delivers.

use crate::{Packet, ProtocolError};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, error, warn};

/// Receiver of packets read from a link
#[async_trait]
pub trait PacketReceiver: Send + Sync {
    /// Called by a link for every packet it reads
    async fn on_packet_received(&self, packet: Packet);
}

/// Progress sink handed to a link while it transfers a payload
pub trait PayloadProgress: Send + Sync {
    /// Payload transfer progress, 0-100
    fn on_payload_progress_changed(&self, percent: u8);
}

/// Completion callback of an outgoing packet
pub trait SendPacketStatusCallback: Send + Sync {
    /// The packet was delivered over one of the links
    fn on_success(&self);

    /// Every link failed, or the device was not connected
    fn on_failure(&self, error: &ProtocolError);

    /// Payload transfer progress, 0-100
    fn on_payload_progress_changed(&self, _percent: u8) {}
}

/// Callback that only logs the outcome
#[derive(Debug, Default, Clone)]
pub struct LoggingCallback {
    packet_type: String,
}

impl LoggingCallback {
    pub fn new(packet_type: impl Into<String>) -> Self {
        Self {
            packet_type: packet_type.into(),
        }
    }
}

impl SendPacketStatusCallback for LoggingCallback {
    fn on_success(&self) {
        debug!("Sent {} packet", self.packet_type);
    }

    fn on_failure(&self, error: &ProtocolError) {
        if error.is_recoverable() {
            warn!("Failed to send {} packet: {}", self.packet_type, error);
        } else {
            error!("Could not send {} packet: {}", self.packet_type, error);
        }
    }
}

/// Transport connection to a single peer
#[async_trait]
pub trait Link: Send + Sync + Debug {
    /// Name of the transport provider, used for logging
    fn provider_name(&self) -> &str;

    /// Send a packet and its payload, if any
    ///
    /// Returns `Ok(true)` when the peer received the packet and `Ok(false)` when
    /// the link declined to send it.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure while writing.
    async fn send_packet(
        &self,
        packet: &Packet,
        progress: &dyn PayloadProgress,
        send_payload_same_thread: bool,
    ) -> crate::Result<bool>;

    /// Register a receiver for packets read from this link
    fn add_packet_receiver(&self, receiver: Weak<dyn PacketReceiver>);

    /// Unregister a receiver previously added
    fn remove_packet_receiver(&self, receiver: &Weak<dyn PacketReceiver>);

    /// Close the underlying connection
    fn disconnect(&self) {}
}

/// Whether two handles point at the same link instance
pub fn same_link(a: &Arc<dyn Link>, b: &Arc<dyn Link>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Copy-on-write list of the active links of a device
///
/// Senders iterate over a snapshot, so a link dropped mid-send does not
/// disturb the iteration.
#[derive(Default)]
pub struct LinkSet {
    links: RwLock<Arc<Vec<Arc<dyn Link>>>>,
}

impl LinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current links, in attach order
    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn Link>>> {
        match self.links.read() {
            Ok(links) => Arc::clone(&links),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Add a link; returns the link count after the change, or `None` if the
    /// link was already present
    pub fn add(&self, link: Arc<dyn Link>) -> Option<usize> {
        let mut guard = self.links.write().unwrap_or_else(|p| p.into_inner());
        if guard.iter().any(|existing| same_link(existing, &link)) {
            return None;
        }

        let mut links = Vec::clone(&guard);
        links.push(link);
        let count = links.len();
        *guard = Arc::new(links);
        Some(count)
    }

    /// Remove a link; returns the remaining link count, or `None` if the link
    /// was not present
    pub fn remove(&self, link: &Arc<dyn Link>) -> Option<usize> {
        let mut guard = self.links.write().unwrap_or_else(|p| p.into_inner());
        if !guard.iter().any(|existing| same_link(existing, link)) {
            return None;
        }

        let links: Vec<_> = guard
            .iter()
            .filter(|existing| !same_link(existing, link))
            .cloned()
            .collect();
        let count = links.len();
        *guard = Arc::new(links);
        Some(count)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

impl Debug for LinkSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let links = self.snapshot();
        f.debug_list()
            .entries(links.iter().map(|link| link.provider_name()))
            .finish()
    }
}

struct ProgressForwarder<'a>(&'a dyn SendPacketStatusCallback);

impl PayloadProgress for ProgressForwarder<'_> {
    fn on_payload_progress_changed(&self, percent: u8) {
        self.0.on_payload_progress_changed(percent.min(100));
    }
}

/// Send `packet` over `links` in order until one succeeds
///
/// Fires exactly one terminal callback: `on_success` for the first link that
/// delivers, or `on_failure` once every link has failed. A link that fails is
/// not retried.
pub async fn send_over_links(
    links: &[Arc<dyn Link>],
    packet: &Packet,
    callback: &dyn SendPacketStatusCallback,
    send_payload_same_thread: bool,
) -> bool {
    if links.is_empty() {
        callback.on_failure(&ProtocolError::NotConnected);
        return false;
    }

    let progress = ProgressForwarder(callback);
    let mut failures = Vec::with_capacity(links.len());

    for link in links {
        match link
            .send_packet(packet, &progress, send_payload_same_thread)
            .await
        {
            Ok(true) => {
                debug!(
                    "Sent {} packet (id {}) over {}",
                    packet.packet_type,
                    packet.id,
                    link.provider_name()
                );
                callback.on_success();
                return true;
            }
            Ok(false) => {
                warn!(
                    "{} link refused {} packet, trying next link",
                    link.provider_name(),
                    packet.packet_type
                );
                failures.push(format!("{}: refused", link.provider_name()));
            }
            Err(e) => {
                warn!(
                    "{} link failed to send {} packet: {}",
                    link.provider_name(),
                    packet.packet_type,
                    e
                );
                failures.push(format!("{}: {}", link.provider_name(), e));
            }
        }
    }

    callback.on_failure(&ProtocolError::Transport(format!(
        "{} packet not delivered over any of {} link(s) ({})",
        packet.packet_type,
        links.len(),
        failures.join("; ")
    )));
    false
}
