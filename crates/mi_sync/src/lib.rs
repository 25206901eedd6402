//! mi_sync — multi-device synchronization
//!
//! Every device of one user shares a 32-byte device-sync key. The primary
//! device mints it; linked devices receive it through the pairing handshake
//! (a short code typed across devices, never through the relay in the
//! clear). Events sealed under the key fan out through the relay as opaque
//! ciphertexts addressed by device id.
//!
//! - `key`     — the sync key itself: generation, validation, rotation
//! - `pairing` — pairing code, id/key derivation, both role state machines

pub mod error;
pub mod key;
pub mod pairing;

pub use error::SyncError;
pub use key::DeviceSyncKey;
pub use pairing::PairingState;
