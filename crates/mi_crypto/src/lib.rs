//! mi_crypto — Michat client core cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Detached AEAD layouts so the wire formats control byte placement.
//!
//! # Module layout
//! - `identity` — long-term Ed25519 signing + X25519 DH keyset, fingerprints, SAS
//! - `kem`      — ML-KEM-768 facade (hybrid post-quantum leg)
//! - `aead`     — XChaCha20-Poly1305 seal/open helpers
//! - `kdf`      — HKDF-SHA256 / Argon2id key derivation
//! - `hash`     — SHA-256 utilities with domain tags
//! - `ct`       — constant-time comparison
//! - `error`    — unified error type

pub mod aead;
pub mod ct;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;
pub mod kem;

pub use error::CryptoError;
