//! Friend and group management (relay-side rosters).

use mi_proto::frame::FrameType;
use mi_proto::wire::{self, Reader};

use crate::core::ClientCore;
use crate::error::ClientError;

pub const ROLE_MEMBER: u8 = 0;
pub const ROLE_ADMIN: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendDelta {
    pub username: String,
    /// 1 added, 2 removed, 3 updated.
    pub change: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMemberInfo {
    pub username: String,
    pub role: u8,
}

impl ClientCore {
    pub fn list_friends(&mut self) -> Result<Vec<String>, ClientError> {
        let response = self.process_encrypted(FrameType::ListFriends, &[])?;
        let mut r = Reader::new(&response);
        let count = r.read_u32()? as usize;
        let mut friends = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            friends.push(r.read_string()?);
        }
        r.finish()?;
        Ok(friends)
    }

    /// Incremental roster sync from a version cursor; returns the new
    /// cursor and the changes since the old one.
    pub fn sync_friends(&mut self, version: u64) -> Result<(u64, Vec<FriendDelta>), ClientError> {
        let mut payload = Vec::new();
        wire::write_u64(version, &mut payload);
        let response = self.process_encrypted(FrameType::SyncFriends, &payload)?;
        let mut r = Reader::new(&response);
        let new_version = r.read_u64()?;
        let count = r.read_u32()? as usize;
        let mut deltas = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            deltas.push(FriendDelta {
                username: r.read_string()?,
                change: r.read_u8()?,
            });
        }
        r.finish()?;
        Ok((new_version, deltas))
    }

    pub fn add_friend(&mut self, username: &str) -> Result<(), ClientError> {
        self.simple_user_op(FrameType::AddFriend, username)
    }

    pub fn send_friend_request(&mut self, username: &str, message: &str) -> Result<(), ClientError> {
        if username.is_empty() {
            return Err(ClientError::InvalidInput("username empty".into()));
        }
        let mut payload = Vec::new();
        wire::write_string(username, &mut payload)?;
        wire::write_string(message, &mut payload)?;
        self.process_encrypted(FrameType::SendFriendRequest, &payload)?;
        Ok(())
    }

    pub fn respond_friend_request(
        &mut self,
        username: &str,
        accept: bool,
    ) -> Result<(), ClientError> {
        if username.is_empty() {
            return Err(ClientError::InvalidInput("username empty".into()));
        }
        let mut payload = Vec::new();
        wire::write_string(username, &mut payload)?;
        wire::write_u8(u8::from(accept), &mut payload);
        self.process_encrypted(FrameType::RespondFriendRequest, &payload)?;
        Ok(())
    }

    pub fn delete_friend(&mut self, username: &str) -> Result<(), ClientError> {
        self.simple_user_op(FrameType::DeleteFriend, username)
    }

    fn simple_user_op(&mut self, ftype: FrameType, username: &str) -> Result<(), ClientError> {
        if username.is_empty() {
            return Err(ClientError::InvalidInput("username empty".into()));
        }
        let mut payload = Vec::new();
        wire::write_string(username, &mut payload)?;
        self.process_encrypted(ftype, &payload)?;
        Ok(())
    }

    // ── Groups ───────────────────────────────────────────────────────────

    pub fn create_group(&mut self, name: &str) -> Result<String, ClientError> {
        if name.is_empty() {
            return Err(ClientError::InvalidInput("group name empty".into()));
        }
        let mut payload = Vec::new();
        wire::write_string(name, &mut payload)?;
        let response = self.process_encrypted(FrameType::CreateGroup, &payload)?;
        let mut r = Reader::new(&response);
        let group_id = r.read_string()?;
        r.finish()?;
        Ok(group_id)
    }

    pub fn join_group(&mut self, group_id: &str) -> Result<(), ClientError> {
        self.simple_group_op(FrameType::JoinGroup, group_id)
    }

    pub fn leave_group(&mut self, group_id: &str) -> Result<(), ClientError> {
        self.simple_group_op(FrameType::LeaveGroup, group_id)?;
        self.groups.mark_dirty(group_id);
        Ok(())
    }

    pub fn list_group_members(
        &mut self,
        group_id: &str,
    ) -> Result<Vec<GroupMemberInfo>, ClientError> {
        if group_id.is_empty() {
            return Err(ClientError::InvalidInput("group id empty".into()));
        }
        let mut payload = Vec::new();
        wire::write_string(group_id, &mut payload)?;
        let response = self.process_encrypted(FrameType::ListGroupMembers, &payload)?;
        let mut r = Reader::new(&response);
        let count = r.read_u32()? as usize;
        let mut members = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            members.push(GroupMemberInfo {
                username: r.read_string()?,
                role: r.read_u8()?,
            });
        }
        r.finish()?;
        Ok(members)
    }

    pub fn set_group_member_role(
        &mut self,
        group_id: &str,
        member: &str,
        role: u8,
    ) -> Result<(), ClientError> {
        if group_id.is_empty() || member.is_empty() {
            return Err(ClientError::InvalidInput("group id or member empty".into()));
        }
        let mut payload = Vec::new();
        wire::write_string(group_id, &mut payload)?;
        wire::write_string(member, &mut payload)?;
        wire::write_u8(role, &mut payload);
        self.process_encrypted(FrameType::SetGroupMemberRole, &payload)?;
        Ok(())
    }

    /// Kick a member; the local sender key is marked dirty so the next send
    /// rotates away from the departed member.
    pub fn kick_group_member(&mut self, group_id: &str, member: &str) -> Result<(), ClientError> {
        if group_id.is_empty() || member.is_empty() {
            return Err(ClientError::InvalidInput("group id or member empty".into()));
        }
        let mut payload = Vec::new();
        wire::write_string(group_id, &mut payload)?;
        wire::write_string(member, &mut payload)?;
        self.process_encrypted(FrameType::KickGroupMember, &payload)?;
        self.groups.mark_dirty(group_id);
        self.groups.member_left(group_id, member);
        Ok(())
    }

    fn simple_group_op(&mut self, ftype: FrameType, group_id: &str) -> Result<(), ClientError> {
        if group_id.is_empty() {
            return Err(ClientError::InvalidInput("group id empty".into()));
        }
        let mut payload = Vec::new();
        wire::write_string(group_id, &mut payload)?;
        self.process_encrypted(ftype, &payload)?;
        Ok(())
    }
}
