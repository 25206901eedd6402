//! Device-pairing payload formats.
//!
//! Outer (relay-visible): `MIPY ∥ ver=1 ∥ nonce(24) ∥ mac(16) ∥ cipher`,
//! sealed under the pairing key; AD = magic+ver.
//!
//! Inner request  (linked → primary): `MIPR ∥ ver=1 ∥ request_id(16) ∥ string device_id`
//! Inner response (primary → linked): `MIPS ∥ ver=1 ∥ request_id(16) ∥ 32B device_sync_key`

use zeroize::Zeroizing;

use crate::error::ProtoError;
use crate::sealed;
use crate::wire::{self, Reader};

pub const PAIRING_OUTER_MAGIC: [u8; 4] = *b"MIPY";
const REQUEST_MAGIC: [u8; 4] = *b"MIPR";
const RESPONSE_MAGIC: [u8; 4] = *b"MIPS";
const VER: u8 = 1;

pub fn encrypt_payload(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, ProtoError> {
    sealed::seal(&PAIRING_OUTER_MAGIC, key, plaintext)
}

pub fn decrypt_payload(key: &[u8; 32], data: &[u8]) -> Result<Zeroizing<Vec<u8>>, ProtoError> {
    sealed::open(&PAIRING_OUTER_MAGIC, key, data)
}

pub fn encode_request(device_id: &str, request_id: &[u8; 16]) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::with_capacity(5 + 16 + 2 + device_id.len());
    out.extend_from_slice(&REQUEST_MAGIC);
    out.push(VER);
    wire::write_id16(request_id, &mut out);
    wire::write_string(device_id, &mut out)?;
    Ok(out)
}

pub fn decode_request(plain: &[u8]) -> Result<(String, [u8; 16]), ProtoError> {
    let mut r = Reader::new(plain);
    r.expect_magic(&REQUEST_MAGIC)?;
    let ver = r.read_u8()?;
    if ver != VER {
        return Err(ProtoError::BadVersion(ver));
    }
    let request_id = r.read_id16()?;
    let device_id = r.read_string()?;
    r.finish()?;
    Ok((device_id, request_id))
}

pub fn encode_response(
    request_id: &[u8; 16],
    device_sync_key: &[u8; 32],
) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::with_capacity(5 + 16 + 32);
    out.extend_from_slice(&RESPONSE_MAGIC);
    out.push(VER);
    wire::write_id16(request_id, &mut out);
    wire::write_arr32(device_sync_key, &mut out);
    Ok(out)
}

pub fn decode_response(plain: &[u8]) -> Result<([u8; 16], [u8; 32]), ProtoError> {
    let mut r = Reader::new(plain);
    r.expect_magic(&RESPONSE_MAGIC)?;
    let ver = r.read_u8()?;
    if ver != VER {
        return Err(ProtoError::BadVersion(ver));
    }
    let request_id = r.read_id16()?;
    let key = r.read_arr32()?;
    r.finish()?;
    Ok((request_id, key))
}
