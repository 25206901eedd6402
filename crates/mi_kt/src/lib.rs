//! mi_kt — key-transparency client
//!
//! Verifies that every peer identity the engine encrypts to is committed to
//! an append-only verifiable log, and that the log never forks or rolls back
//! from this client's point of view.
//!
//! # Modules
//! - `merkle` — leaf hashing, audit-path replay, consistency-proof replay
//! - `sth`    — signed-tree-head signature check
//! - `client` — snapshot state machine, gossip cross-checking, alert latch

pub mod client;
pub mod error;
pub mod merkle;
pub mod sth;

pub use client::{GossipOutcome, KtClient, KtPolicy, KtSnapshot};
pub use error::KtError;
