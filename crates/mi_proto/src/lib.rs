//! mi_proto — wire types, envelopes, and serialisation for the Michat core
//!
//! Everything that crosses the network is hand-framed little-endian binary;
//! no self-describing serialisation on the wire. Decoders are strict: bad
//! magic, bad version, truncation, and trailing bytes are all errors.
//!
//! # Modules
//! - `wire`       — primitive little-endian codec (u8/u16/u32/u64/string/bytes)
//! - `frame`      — 12-byte framed message header + frame-type table
//! - `envelope`   — typed chat envelope (`MICH`) carried inside the ratchet
//! - `padding`    — length-hiding bucket padding
//! - `gossip`     — KT root gossip wrapper (`MIKTGSP1`)
//! - `pairing`    — device-pairing payloads (`MIPY`/`MIPR`/`MIPS`)
//! - `sync_event` — device-sync sealed events (`MISY`)
//! - `kt_wire`    — KT proof extension appended to prekey-fetch responses

pub mod envelope;
pub mod error;
pub mod frame;
pub mod gossip;
pub mod kt_wire;
pub mod padding;
pub mod pairing;
mod sealed;
pub mod sync_event;
pub mod wire;

pub use error::ProtoError;
