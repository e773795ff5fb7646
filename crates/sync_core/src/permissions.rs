//! Pure role checks used to gate actions before they reach the backend.

use shared::domain::{Channel, Member, MemberRole, ProfileId};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    ManageServer,
    DeleteServer,
    CreateChannel,
    EditChannel,
    DeleteChannel,
    ManageMembers,
    KickMembers,
    SendMessages,
    EditMessages,
    DeleteMessages,
}

const ADMIN: &[Permission] = &[
    Permission::ManageServer,
    Permission::DeleteServer,
    Permission::CreateChannel,
    Permission::EditChannel,
    Permission::DeleteChannel,
    Permission::ManageMembers,
    Permission::KickMembers,
    Permission::SendMessages,
    Permission::EditMessages,
    Permission::DeleteMessages,
];

const MODERATOR: &[Permission] = &[
    Permission::CreateChannel,
    Permission::EditChannel,
    Permission::DeleteChannel,
    Permission::KickMembers,
    Permission::SendMessages,
    Permission::EditMessages,
    Permission::DeleteMessages,
];

const GUEST: &[Permission] = &[
    Permission::SendMessages,
    Permission::EditMessages,
    Permission::DeleteMessages,
];

pub fn role_permissions(role: MemberRole) -> &'static [Permission] {
    match role {
        MemberRole::Admin => ADMIN,
        MemberRole::Moderator => MODERATOR,
        MemberRole::Guest => GUEST,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PermissionDenied {
    #[error("you don't have permission to delete the server")]
    DeleteServer,
    #[error("you don't have permission to modify channels")]
    ModifyChannels,
    #[error("you don't have permission to kick members")]
    KickMembers,
    #[error("you cannot kick members with equal or higher role")]
    KickRank,
    #[error("you don't have permission to perform this action")]
    Other,
}

/// Checks `permission` for `member`; `target` is the member acted upon, when
/// there is one. Soft-deleted members hold no permissions.
pub fn check_permission(
    member: &Member,
    permission: Permission,
    target: Option<&Member>,
) -> Result<(), PermissionDenied> {
    let granted = !member.deleted && role_permissions(member.role).contains(&permission);
    match permission {
        Permission::KickMembers => {
            if target.is_some_and(|target| !member.role.outranks(target.role)) {
                return Err(PermissionDenied::KickRank);
            }
            granted.then_some(()).ok_or(PermissionDenied::KickMembers)
        }
        Permission::DeleteServer => granted.then_some(()).ok_or(PermissionDenied::DeleteServer),
        Permission::EditChannel | Permission::DeleteChannel => {
            granted.then_some(()).ok_or(PermissionDenied::ModifyChannels)
        }
        _ => granted.then_some(()).ok_or(PermissionDenied::Other),
    }
}

/// First failing check wins.
pub fn check_all(
    member: &Member,
    permissions: &[Permission],
    target: Option<&Member>,
) -> Result<(), PermissionDenied> {
    permissions
        .iter()
        .try_for_each(|permission| check_permission(member, *permission, target))
}

// Moderators may only touch channels created by `profile_id`.
fn may_touch_channel(
    member: &Member,
    channel: &Channel,
    profile_id: ProfileId,
    permission: Permission,
) -> bool {
    match member.role {
        MemberRole::Admin => !member.deleted,
        MemberRole::Moderator => {
            channel.profile_id == profile_id && check_permission(member, permission, None).is_ok()
        }
        MemberRole::Guest => false,
    }
}

pub fn can_edit_channel(member: &Member, channel: &Channel, profile_id: ProfileId) -> bool {
    may_touch_channel(member, channel, profile_id, Permission::EditChannel)
}

pub fn can_delete_channel(member: &Member, channel: &Channel, profile_id: ProfileId) -> bool {
    may_touch_channel(member, channel, profile_id, Permission::DeleteChannel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{channel, member};
    use shared::domain::ServerId;

    #[test]
    fn guests_only_handle_messages() {
        let guest = member(ServerId::random(), ProfileId::random(), MemberRole::Guest);
        assert_eq!(check_permission(&guest, Permission::SendMessages, None), Ok(()));
        assert_eq!(
            check_permission(&guest, Permission::CreateChannel, None),
            Err(PermissionDenied::Other)
        );
        assert_eq!(
            check_all(
                &guest,
                &[Permission::EditMessages, Permission::DeleteServer],
                None
            ),
            Err(PermissionDenied::DeleteServer)
        );
    }

    #[test]
    fn kicking_requires_a_strictly_higher_role() {
        let server_id = ServerId::random();
        let admin = member(server_id, ProfileId::random(), MemberRole::Admin);
        let moderator = member(server_id, ProfileId::random(), MemberRole::Moderator);
        let other_moderator = member(server_id, ProfileId::random(), MemberRole::Moderator);
        let guest = member(server_id, ProfileId::random(), MemberRole::Guest);

        assert!(check_permission(&moderator, Permission::KickMembers, Some(&guest)).is_ok());
        assert_eq!(
            check_permission(&moderator, Permission::KickMembers, Some(&other_moderator)),
            Err(PermissionDenied::KickRank)
        );
        assert_eq!(
            check_permission(&moderator, Permission::KickMembers, Some(&admin)),
            Err(PermissionDenied::KickRank)
        );
        assert_eq!(
            check_permission(&guest, Permission::KickMembers, None),
            Err(PermissionDenied::KickMembers)
        );
    }

    #[test]
    fn moderators_edit_only_their_own_channels() {
        let server_id = ServerId::random();
        let me = ProfileId::random();
        let moderator = member(server_id, me, MemberRole::Moderator);
        let admin = member(server_id, ProfileId::random(), MemberRole::Admin);
        let mine = channel(server_id, "mine", me);
        let theirs = channel(server_id, "theirs", ProfileId::random());

        assert!(can_edit_channel(&moderator, &mine, me));
        assert!(!can_delete_channel(&moderator, &theirs, me));
        assert!(can_delete_channel(&admin, &theirs, admin.profile_id));
    }

    #[test]
    fn soft_deleted_members_hold_nothing() {
        let mut gone = member(ServerId::random(), ProfileId::random(), MemberRole::Admin);
        gone.deleted = true;
        assert!(check_permission(&gone, Permission::SendMessages, None).is_err());
    }
}
