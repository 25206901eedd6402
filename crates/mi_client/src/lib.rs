//! mi_client — the Michat client core
//!
//! Ties the engines together behind one blocking, single-threaded
//! request/response surface (`ClientCore`): authenticated session channel
//! to the relay, pairwise and group E2EE, key transparency enforcement,
//! multi-device sync, resumable encrypted file transfer, and the
//! `poll_chat` sweep that drains everything inbound.
//!
//! # Module layout
//! - `config`    — embedder-supplied configuration struct
//! - `error`     — `ClientError` with the protocol's error-kind taxonomy
//! - `channel`   — per-frame AEAD session channel with monotonic counters
//! - `handshake` — legacy Argon2id/KEM handshake and the OPAQUE wrapper
//! - `store`     — persisted state: atomic writes, platform wrapping,
//!                 trust store, state directory
//! - `cover`     — cover-traffic scheduler
//! - `dedup`     — inbound message de-duplication
//! - `events`    — `poll_chat` event surface
//! - `core`      — the orchestrator and its operation groups

pub mod channel;
pub mod config;
pub mod core;
pub mod cover;
pub mod dedup;
pub mod error;
pub mod events;
pub mod handshake;
pub mod store;

pub use config::{AuthMode, ClientConfig, CoverTrafficMode, TransportChoice};
pub use core::{confirm_server_pin, probe_server_sas, ClientCore};
pub use error::{ClientError, ErrorKind};
pub use events::{ChatEvent, ChatPollResult};
