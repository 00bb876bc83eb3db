//! Pairing Event System
//!
//! Events produced by the pairing state machine and the observer interface
//! that receives them.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Why a pairing attempt ended without success
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingFailure {
    /// The peer did not answer in time
    Timeout,
    /// The peer rejected the request
    RejectedByPeer,
    /// We cancelled the request
    CancelledByUser,
    /// A request was made while the peer had no link
    NotReachable,
    /// A request was made while already paired
    AlreadyPaired,
    /// The pairing packet could not be delivered
    SendFailed(String),
}

impl fmt::Display for PairingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingFailure::Timeout => write!(f, "Timed out"),
            PairingFailure::RejectedByPeer => write!(f, "Canceled by other peer"),
            PairingFailure::CancelledByUser => write!(f, "Canceled by user"),
            PairingFailure::NotReachable => write!(f, "Device not reachable"),
            PairingFailure::AlreadyPaired => write!(f, "Already paired"),
            PairingFailure::SendFailed(reason) => write!(f, "Could not send package: {}", reason),
        }
    }
}

/// Events emitted by the pairing state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// The peer asked to pair and awaits our answer
    IncomingRequest,
    /// Both sides agreed; the peer is now trusted
    Successful,
    /// A pairing attempt ended without success
    Failed(PairingFailure),
    /// Trust was revoked, locally or by the peer
    Unpaired,
}

impl PairingEvent {
    /// Check if this event ends in the paired state
    pub fn is_successful(&self) -> bool {
        matches!(self, PairingEvent::Successful)
    }

    /// Check if this event is a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, PairingEvent::Failed(_))
    }
}

/// Observer of a device's pairing state
///
/// Every method has an empty default so observers implement only what they
/// care about.
pub trait PairingCallback: Send + Sync {
    fn incoming_pair_request(&self) {}

    fn pairing_successful(&self) {}

    fn pairing_failed(&self, _reason: &PairingFailure) {}

    fn unpaired(&self) {}
}

/// Deliver `event` to every observer
///
/// A panicking observer is logged and skipped; the others still receive the
/// event.
pub fn notify_pairing_callbacks(
    device_id: &str,
    callbacks: &[Arc<dyn PairingCallback>],
    event: &PairingEvent,
) {
    for callback in callbacks {
        let result = catch_unwind(AssertUnwindSafe(|| match event {
            PairingEvent::IncomingRequest => callback.incoming_pair_request(),
            PairingEvent::Successful => callback.pairing_successful(),
            PairingEvent::Failed(reason) => callback.pairing_failed(reason),
            PairingEvent::Unpaired => callback.unpaired(),
        }));

        if result.is_err() {
            error!(
                "Pairing observer panicked while handling {:?} for {}",
                event, device_id
            );
        }
    }
}
