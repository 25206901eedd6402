//! Framed message boundary for the session channel.
//!
//! On wire: `[ magic:4 | version:1 | type:1 | reserved:2 | payload_len:4 LE |
//! payload ]` — 12-byte header. The reserved bytes must be zero.
//!
//! After login every operation frame is sealed: the outer frame keeps the
//! type byte (the relay routes on it) and the payload becomes
//! `(session_token: string, cipher: bytes)`; the AEAD AD binds the channel
//! counter and the type byte, so the relay can neither swap types nor replay.

use crate::error::ProtoError;
use crate::wire::{self, Reader};

pub const FRAME_MAGIC: [u8; 4] = *b"MIC1";
pub const FRAME_VERSION: u8 = 1;
pub const FRAME_HEADER_LEN: usize = 12;

/// Hard cap on a single frame payload: the largest legal single-shot blob
/// (8 MiB plaintext, possibly deflate-expanded) plus sealing overhead.
pub const MAX_FRAME_PAYLOAD: usize = 9 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    // Handshake (pre-session, never sealed)
    HelloLegacy = 0x10,
    ProofLegacy = 0x11,
    OpaqueStart = 0x12,
    OpaqueFinish = 0x13,

    // Session
    Register = 0x01,
    Login = 0x02,
    Relogin = 0x03,
    Logout = 0x04,
    Heartbeat = 0x05,
    ListDevices = 0x06,
    KickDevice = 0x07,

    // Friends
    ListFriends = 0x20,
    SyncFriends = 0x21,
    AddFriend = 0x22,
    SendFriendRequest = 0x23,
    RespondFriendRequest = 0x24,
    DeleteFriend = 0x25,

    // Groups
    CreateGroup = 0x28,
    JoinGroup = 0x29,
    LeaveGroup = 0x2A,
    ListGroupMembers = 0x2B,
    SetGroupMemberRole = 0x2C,
    KickGroupMember = 0x2D,
    PullGroupNotices = 0x2E,

    // Prekeys / key transparency
    PublishPreKeys = 0x30,
    FetchPreKeyBundle = 0x31,
    FetchKtConsistency = 0x32,

    // E2EE messaging
    SendE2ee = 0x38,
    PullE2ee = 0x39,
    SendGroupE2ee = 0x3A,
    PullGroupE2ee = 0x3B,

    // Device sync / pairing
    DeviceSyncPush = 0x40,
    DeviceSyncPull = 0x41,
    DevicePairingPublish = 0x42,
    DevicePairingRequest = 0x43,
    DevicePairingPull = 0x44,
    DevicePairingRespond = 0x45,

    // Media relay / group calls
    StartGroupCall = 0x48,
    JoinGroupCall = 0x49,
    LeaveGroupCall = 0x4A,
    PullGroupCallEvents = 0x4B,
    PushMedia = 0x4C,
    PullMedia = 0x4D,
    PushGroupMedia = 0x4E,
    PullGroupMedia = 0x4F,

    // File blobs
    BlobUpload = 0x50,
    BlobUploadStart = 0x51,
    BlobUploadChunk = 0x52,
    BlobUploadFinish = 0x53,
    BlobDownload = 0x54,
    BlobDownloadStart = 0x55,
    BlobDownloadChunk = 0x56,
}

impl FrameType {
    pub fn from_u8(v: u8) -> Result<Self, ProtoError> {
        use FrameType::*;
        Ok(match v {
            0x10 => HelloLegacy,
            0x11 => ProofLegacy,
            0x12 => OpaqueStart,
            0x13 => OpaqueFinish,
            0x01 => Register,
            0x02 => Login,
            0x03 => Relogin,
            0x04 => Logout,
            0x05 => Heartbeat,
            0x06 => ListDevices,
            0x07 => KickDevice,
            0x20 => ListFriends,
            0x21 => SyncFriends,
            0x22 => AddFriend,
            0x23 => SendFriendRequest,
            0x24 => RespondFriendRequest,
            0x25 => DeleteFriend,
            0x28 => CreateGroup,
            0x29 => JoinGroup,
            0x2A => LeaveGroup,
            0x2B => ListGroupMembers,
            0x2C => SetGroupMemberRole,
            0x2D => KickGroupMember,
            0x2E => PullGroupNotices,
            0x30 => PublishPreKeys,
            0x31 => FetchPreKeyBundle,
            0x32 => FetchKtConsistency,
            0x38 => SendE2ee,
            0x39 => PullE2ee,
            0x3A => SendGroupE2ee,
            0x3B => PullGroupE2ee,
            0x40 => DeviceSyncPush,
            0x41 => DeviceSyncPull,
            0x42 => DevicePairingPublish,
            0x43 => DevicePairingRequest,
            0x44 => DevicePairingPull,
            0x45 => DevicePairingRespond,
            0x48 => StartGroupCall,
            0x49 => JoinGroupCall,
            0x4A => LeaveGroupCall,
            0x4B => PullGroupCallEvents,
            0x4C => PushMedia,
            0x4D => PullMedia,
            0x4E => PushGroupMedia,
            0x4F => PullGroupMedia,
            0x50 => BlobUpload,
            0x51 => BlobUploadStart,
            0x52 => BlobUploadChunk,
            0x53 => BlobUploadFinish,
            0x54 => BlobDownload,
            0x55 => BlobDownloadStart,
            0x56 => BlobDownloadChunk,
            other => return Err(ProtoError::UnknownTag(other)),
        })
    }
}

pub fn encode_frame(ftype: FrameType, payload: &[u8]) -> Result<Vec<u8>, ProtoError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(ProtoError::FieldTooLong("frame payload"));
    }
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&FRAME_MAGIC);
    out.push(FRAME_VERSION);
    out.push(ftype as u8);
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn decode_frame(data: &[u8]) -> Result<(FrameType, &[u8]), ProtoError> {
    if data.len() < FRAME_HEADER_LEN {
        return Err(ProtoError::Truncated);
    }
    if data[..4] != FRAME_MAGIC {
        return Err(ProtoError::BadMagic);
    }
    if data[4] != FRAME_VERSION {
        return Err(ProtoError::BadVersion(data[4]));
    }
    let ftype = FrameType::from_u8(data[5])?;
    if data[6] != 0 || data[7] != 0 {
        return Err(ProtoError::BadMagic);
    }
    let len = u32::from_le_bytes(data[8..12].try_into().expect("len")) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(ProtoError::FieldTooLong("frame payload"));
    }
    if data.len() != FRAME_HEADER_LEN + len {
        return Err(ProtoError::Truncated);
    }
    Ok((ftype, &data[FRAME_HEADER_LEN..]))
}

/// Sealed payload carried after login: `(session_token, cipher)`.
pub fn encode_sealed_payload(session_token: &str, cipher: &[u8]) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::with_capacity(2 + session_token.len() + 4 + cipher.len());
    wire::write_string(session_token, &mut out)?;
    wire::write_bytes(cipher, &mut out)?;
    Ok(out)
}

pub fn decode_sealed_payload(payload: &[u8]) -> Result<(String, Vec<u8>), ProtoError> {
    let mut r = Reader::new(payload);
    let token = r.read_string()?;
    let cipher = r.read_bytes()?;
    r.finish()?;
    Ok((token, cipher))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let frame = encode_frame(FrameType::Heartbeat, b"payload").unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_LEN + 7);
        let (ftype, payload) = decode_frame(&frame).unwrap();
        assert_eq!(ftype, FrameType::Heartbeat);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut frame = encode_frame(FrameType::Login, b"x").unwrap();
        frame[0] = b'X';
        assert!(matches!(decode_frame(&frame), Err(ProtoError::BadMagic)));

        let mut frame = encode_frame(FrameType::Login, b"x").unwrap();
        frame[4] = 9;
        assert!(matches!(decode_frame(&frame), Err(ProtoError::BadVersion(9))));
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut frame = encode_frame(FrameType::Login, b"abcd").unwrap();
        frame.truncate(frame.len() - 1);
        assert!(matches!(decode_frame(&frame), Err(ProtoError::Truncated)));
    }

    #[test]
    fn sealed_payload_roundtrip() {
        let payload = encode_sealed_payload("tok", &[1, 2, 3]).unwrap();
        let (token, cipher) = decode_sealed_payload(&payload).unwrap();
        assert_eq!(token, "tok");
        assert_eq!(cipher, vec![1, 2, 3]);
    }

    #[test]
    fn every_type_byte_roundtrips() {
        for v in 0u8..=0xFF {
            if let Ok(t) = FrameType::from_u8(v) {
                assert_eq!(t as u8, v);
            }
        }
    }
}
