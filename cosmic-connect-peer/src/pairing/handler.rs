//! Pairing state machine
//!
//! Pairing is symmetric: both the request and the accept are a
//! `kdeconnect.pair` packet with `pair: true`, and a reject or unpair is the
//! same packet with `pair: false`. What a packet means depends on the state
//! it arrives in.
//!
//! ```text
//! Unpaired --request()--------> Requested --peer pair:true--> Paired
//! Unpaired --peer pair:true---> RequestedByPeer --accept()--> Paired
//! Requested / RequestedByPeer --reject, cancel or timeout--> Unpaired
//! Paired --unpair() or peer pair:false--> Unpaired
//! ```
//!
//! Trust is only persisted by the delegate when it receives
//! [`PairingEvent::Successful`] and erased on [`PairingEvent::Unpaired`].

use super::events::{PairingEvent, PairingFailure};
use crate::packet::PACKET_TYPE_PAIR;
use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Reference timeout for an unanswered pairing request
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(10);

/// Pairing state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    /// Not paired
    Unpaired,
    /// We sent a pairing request and await the answer
    Requested,
    /// The peer sent a pairing request and awaits our answer
    RequestedByPeer,
    /// Successfully paired
    Paired,
}

/// Pairing packet body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingPacket {
    /// Whether pairing is requested/accepted (true) or rejected/unpaired (false)
    pub pair: bool,
}

impl PairingPacket {
    /// Create a pairing request packet
    pub fn request() -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": true }))
    }

    /// Create a pairing accept packet
    pub fn accept() -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": true }))
    }

    /// Create a pairing reject (or unpair) packet
    pub fn reject() -> Packet {
        Packet::new(PACKET_TYPE_PAIR, json!({ "pair": false }))
    }

    /// Parse a pairing packet
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PACKET_TYPE_PAIR) {
            return Err(ProtocolError::InvalidPacket(format!(
                "Not a pairing packet: {}",
                packet.packet_type
            )));
        }

        let pair = packet
            .get_body_field::<bool>("pair")
            .ok_or_else(|| ProtocolError::InvalidPacket("Missing pair field".to_string()))?;

        Ok(Self { pair })
    }
}

/// What the pairing state machine needs from its device
#[async_trait]
pub trait PairingDelegate: Send + Sync {
    /// Whether the device currently has at least one link
    fn is_reachable(&self) -> bool;

    /// Queue a pairing packet for sending
    ///
    /// A failed delivery must be reported back through
    /// [`PairingHandler::pairing_send_failed`].
    fn send_pairing_packet(&self, packet: Packet);

    /// React to a state change (persist or erase trust, notify observers)
    async fn on_pairing_event(&self, event: PairingEvent);
}

/// Pairing state machine of a single device
pub struct PairingHandler {
    device_id: String,
    state: RwLock<PairingState>,
    /// Serializes transitions, including event delivery
    transition: Mutex<()>,
    delegate: Weak<dyn PairingDelegate>,
    timeout: Duration,
    timer_generation: AtomicU64,
}

impl PairingHandler {
    /// Create a handler starting in `initial`
    pub fn new(
        device_id: impl Into<String>,
        initial: PairingState,
        delegate: Weak<dyn PairingDelegate>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            device_id: device_id.into(),
            state: RwLock::new(initial),
            transition: Mutex::new(()),
            delegate,
            timeout,
            timer_generation: AtomicU64::new(0),
        })
    }

    /// Current pairing state
    pub fn state(&self) -> PairingState {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, state: PairingState) {
        let mut guard = self.state.write().unwrap_or_else(|p| p.into_inner());
        if *guard != state {
            debug!(
                "Pairing state of {}: {:?} -> {:?}",
                self.device_id, *guard, state
            );
        }
        *guard = state;
    }

    pub fn is_paired(&self) -> bool {
        self.state() == PairingState::Paired
    }

    /// Handle an inbound `kdeconnect.pair` packet
    pub async fn packet_received(self: &Arc<Self>, packet: &Packet) {
        let _guard = self.transition.lock().await;

        let wants_pair = match PairingPacket::from_packet(packet) {
            Ok(pairing) => pairing.pair,
            Err(e) => {
                warn!("Ignoring pairing packet from {}: {}", self.device_id, e);
                return;
            }
        };

        let state = self.state();
        if wants_pair {
            match state {
                PairingState::Requested => {
                    self.cancel_timer();
                    self.set_state(PairingState::Paired);
                    info!("Pairing accepted by device {}", self.device_id);
                    self.emit(PairingEvent::Successful).await;
                }
                PairingState::RequestedByPeer => {
                    debug!(
                        "Ignoring duplicate pairing request from {}",
                        self.device_id
                    );
                }
                PairingState::Paired => {
                    // The peer forgot us. Accepting automatically could loop
                    // since request and accept are the same packet.
                    info!(
                        "Paired device {} requested pairing again, resetting trust",
                        self.device_id
                    );
                    self.set_state(PairingState::Unpaired);
                    self.emit(PairingEvent::Unpaired).await;
                    self.incoming_request().await;
                }
                PairingState::Unpaired => {
                    info!("Received pairing request from device {}", self.device_id);
                    self.incoming_request().await;
                }
            }
        } else {
            match state {
                PairingState::Requested | PairingState::RequestedByPeer => {
                    self.cancel_timer();
                    self.set_state(PairingState::Unpaired);
                    info!("Pairing rejected by device {}", self.device_id);
                    self.emit(PairingEvent::Failed(PairingFailure::RejectedByPeer))
                        .await;
                }
                PairingState::Paired => {
                    self.set_state(PairingState::Unpaired);
                    info!("Unpaired by device {}", self.device_id);
                    self.emit(PairingEvent::Unpaired).await;
                }
                PairingState::Unpaired => {
                    debug!("Ignoring unpair from unpaired device {}", self.device_id);
                }
            }
        }
    }

    async fn incoming_request(self: &Arc<Self>) {
        self.set_state(PairingState::RequestedByPeer);
        self.start_timer();
        self.emit(PairingEvent::IncomingRequest).await;
    }

    /// Ask the peer to pair
    ///
    /// Outcome is reported through the delegate's pairing events.
    pub async fn request_pairing(self: &Arc<Self>) {
        let _guard = self.transition.lock().await;

        match self.state() {
            PairingState::Paired => {
                warn!("Pairing requested for already paired {}", self.device_id);
                self.emit(PairingEvent::Failed(PairingFailure::AlreadyPaired))
                    .await;
            }
            PairingState::Requested => {
                debug!("Pairing with {} already requested", self.device_id);
            }
            PairingState::RequestedByPeer => {
                info!(
                    "Pairing requested while {} awaits our answer, accepting",
                    self.device_id
                );
                self.accept_locked().await;
            }
            PairingState::Unpaired => {
                let Some(delegate) = self.delegate.upgrade() else {
                    return;
                };
                if !delegate.is_reachable() {
                    warn!("Cannot request pairing, {} is not reachable", self.device_id);
                    self.emit(PairingEvent::Failed(PairingFailure::NotReachable))
                        .await;
                    return;
                }

                info!("Requesting pairing with {}", self.device_id);
                self.set_state(PairingState::Requested);
                self.start_timer();
                delegate.send_pairing_packet(PairingPacket::request());
            }
        }
    }

    /// Accept the peer's pending pairing request
    pub async fn accept_pairing(self: &Arc<Self>) {
        let _guard = self.transition.lock().await;
        self.accept_locked().await;
    }

    async fn accept_locked(self: &Arc<Self>) {
        if self.state() != PairingState::RequestedByPeer {
            warn!(
                "No pairing request from {} to accept (state {:?})",
                self.device_id,
                self.state()
            );
            return;
        }

        self.cancel_timer();
        self.set_state(PairingState::Paired);
        info!("Accepted pairing with device {}", self.device_id);
        self.send(PairingPacket::accept());
        self.emit(PairingEvent::Successful).await;
    }

    /// Withdraw our request or decline the peer's
    pub async fn cancel_pairing(self: &Arc<Self>) {
        let _guard = self.transition.lock().await;

        match self.state() {
            PairingState::Requested | PairingState::RequestedByPeer => {
                self.cancel_timer();
                self.set_state(PairingState::Unpaired);
                info!("Cancelled pairing with device {}", self.device_id);
                self.send(PairingPacket::reject());
                self.emit(PairingEvent::Failed(PairingFailure::CancelledByUser))
                    .await;
            }
            state => debug!(
                "Nothing to cancel for {} in state {:?}",
                self.device_id, state
            ),
        }
    }

    /// Drop trust with the peer
    ///
    /// Works from any state: the peer is told (when reachable) and observers
    /// always receive [`PairingEvent::Unpaired`].
    pub async fn unpair(self: &Arc<Self>) {
        let _guard = self.transition.lock().await;

        self.cancel_timer();
        self.set_state(PairingState::Unpaired);
        info!("Unpairing device {}", self.device_id);

        if self
            .delegate
            .upgrade()
            .is_some_and(|delegate| delegate.is_reachable())
        {
            self.send(PairingPacket::reject());
        }
        self.emit(PairingEvent::Unpaired).await;
    }

    /// Report that a pairing packet could not be delivered
    pub async fn pairing_send_failed(self: &Arc<Self>, reason: String) {
        let _guard = self.transition.lock().await;

        match self.state() {
            PairingState::Unpaired => return,
            PairingState::Paired => {
                self.set_state(PairingState::Unpaired);
                self.emit(PairingEvent::Unpaired).await;
            }
            PairingState::Requested | PairingState::RequestedByPeer => {
                self.cancel_timer();
                self.set_state(PairingState::Unpaired);
            }
        }

        warn!(
            "Pairing packet to {} was not delivered: {}",
            self.device_id, reason
        );
        self.emit(PairingEvent::Failed(PairingFailure::SendFailed(reason)))
            .await;
    }

    fn start_timer(self: &Arc<Self>) {
        let generation = self.timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handler = Arc::downgrade(self);
        let timeout = self.timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(handler) = handler.upgrade() {
                handler.on_timeout(generation).await;
            }
        });
    }

    fn cancel_timer(&self) {
        self.timer_generation.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_timeout(self: &Arc<Self>, generation: u64) {
        let _guard = self.transition.lock().await;
        if self.timer_generation.load(Ordering::SeqCst) != generation {
            return;
        }

        match self.state() {
            PairingState::Requested => {
                info!("Pairing request to {} timed out", self.device_id);
                self.set_state(PairingState::Unpaired);
                self.emit(PairingEvent::Failed(PairingFailure::Timeout)).await;
            }
            PairingState::RequestedByPeer => {
                info!("Pairing request from {} expired", self.device_id);
                self.set_state(PairingState::Unpaired);
                self.send(PairingPacket::reject());
                self.emit(PairingEvent::Failed(PairingFailure::Timeout)).await;
            }
            _ => {}
        }
    }

    fn send(&self, packet: Packet) {
        if let Some(delegate) = self.delegate.upgrade() {
            delegate.send_pairing_packet(packet);
        }
    }

    async fn emit(&self, event: PairingEvent) {
        if let Some(delegate) = self.delegate.upgrade() {
            delegate.on_pairing_event(event).await;
        }
    }
}

impl std::fmt::Debug for PairingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingHandler")
            .field("device_id", &self.device_id)
            .field("state", &self.state())
            .field("timeout", &self.timeout)
            .finish()
    }
}
