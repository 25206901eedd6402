//! mi_e2ee — end-to-end encryption engines
//!
//! Pairwise: hybrid X3DH (X25519 + ML-KEM-768) session setup feeding a
//! Double Ratchet with skipped-message-key handling. Group: per-sender
//! symmetric chains distributed over the pairwise channel and rotated on
//! membership change, message count, or age.
//!
//! # Modules
//! - `prekeys` — local prekey material, published bundle, rotation policy
//! - `x3dh`    — hybrid session initiation
//! - `ratchet` — Double Ratchet session state
//! - `message` — pairwise wire format (init header + ratchet header + cipher)
//! - `engine`  — pairwise engine: trust gate, seal/open, session table
//! - `trust`   — peer fingerprint store with key-change blocking
//! - `group`   — sender-key chains, distribution tracking, call keys

pub mod engine;
pub mod error;
pub mod group;
pub mod message;
pub mod prekeys;
pub mod ratchet;
pub mod trust;
pub mod x3dh;

pub use engine::PairwiseEngine;
pub use error::E2eeError;
