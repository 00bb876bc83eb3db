//! Device Pairing
//!
//! Trust-on-first-use pairing between two devices.
//!
//! ## Pairing Protocol
//!
//! 1. **Pairing Request**: Device A sends `kdeconnect.pair` with `pair: true`
//! 2. **User Verification**: Users compare the certificate fingerprints
//! 3. **Pairing Response**: Device B answers `pair: true` (accept) or `pair: false` (reject)
//! 4. **Certificate Storage**: The certificate seen at that moment is stored as trusted
//!
//! An unanswered request fails after [`PAIRING_TIMEOUT`]. Checking the stored
//! certificate on later connections is the transport's job.

pub mod events;
pub mod handler;

// Re-export main types
pub use events::{notify_pairing_callbacks, PairingCallback, PairingEvent, PairingFailure};
pub use handler::{PairingDelegate, PairingHandler, PairingPacket, PairingState, PAIRING_TIMEOUT};
