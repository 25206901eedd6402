//! Events surfaced from `poll_chat`.
//!
//! One sweep drains pairwise, sender-key, group-notice, and device-sync
//! inputs; everything user-visible comes out as a `ChatEvent`, everything
//! diagnostic (KT alerts and the like) as a string on the side.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Text {
        from: String,
        /// Empty for private chats.
        group_id: String,
        msg_id: [u8; 16],
        text: String,
    },
    Rich {
        from: String,
        msg_id: [u8; 16],
        kind: u8,
        flags: u8,
        reply_to: Option<[u8; 16]>,
        body: Vec<u8>,
    },
    File {
        from: String,
        group_id: String,
        msg_id: [u8; 16],
        size: u64,
        name: String,
        file_id: String,
        key: [u8; 32],
    },
    Sticker {
        from: String,
        msg_id: [u8; 16],
        sticker_id: String,
    },
    /// Peer acknowledged delivery of our message.
    Delivered {
        from: String,
        msg_id: [u8; 16],
    },
    ReadReceipt {
        from: String,
        msg_id: [u8; 16],
    },
    Typing {
        from: String,
        on: bool,
    },
    Presence {
        from: String,
        online: bool,
    },
    GroupInvite {
        from: String,
        group_id: String,
    },
    /// Membership change observed on the notice channel.
    GroupNotice {
        group_id: String,
        kind: u8,
        member: String,
        actor: String,
        role: u8,
    },
    /// A sibling device mirrored a message (echo of ours or copy of theirs).
    MessageMirror {
        peer: String,
        group_id: String,
        outgoing: bool,
        timestamp: u64,
        envelope: Vec<u8>,
    },
    /// A sibling device mirrored a delivery/read state change.
    DeliveryMirror {
        peer: String,
        msg_id: [u8; 16],
        state: u8,
    },
    /// History restored from the primary after pairing.
    HistoryRestored {
        entries: usize,
    },
    /// A fresh media key for an active group call arrived.
    GroupCallKey {
        group_id: String,
        call_id: [u8; 16],
        key_id: u32,
    },
}

#[derive(Debug, Default)]
pub struct ChatPollResult {
    pub events: Vec<ChatEvent>,
    /// Latched conditions the caller should show ("kt gossip alert", …).
    pub diagnostics: Vec<String>,
}
