//! Closed event sets pushed by each hub, decoded from the invocation target
//! name and its first argument.

use std::{fmt::Debug, hash::Hash};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{
        null_as_default, Channel, ChannelId, ConversationId, DirectMessage, Member, Message,
        MessageId, ProfileId, ServerId,
    },
    error::ProtocolError,
};

/// One hub's event vocabulary.
pub trait HubEvent: Sized + Send + 'static {
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// Path segment of the hub endpoint, e.g. `serverHub`.
    const HUB: &'static str;

    fn kinds() -> &'static [Self::Kind];

    fn target(kind: Self::Kind) -> &'static str;

    fn kind_of(target: &str) -> Option<Self::Kind> {
        Self::kinds()
            .iter()
            .copied()
            .find(|kind| Self::target(*kind) == target)
    }

    fn decode(kind: Self::Kind, arguments: Vec<Value>) -> Result<Self, ProtocolError>;

    fn kind(&self) -> Self::Kind;
}

fn first_argument<T: DeserializeOwned>(
    target: &'static str,
    arguments: Vec<Value>,
) -> Result<T, ProtocolError> {
    let value = arguments
        .into_iter()
        .next()
        .ok_or(ProtocolError::MissingArguments { target })?;
    serde_json::from_value(value).map_err(|source| ProtocolError::BadPayload { target, source })
}

macro_rules! hub_events {
    (
        $(#[$meta:meta])*
        $event:ident, $kind:ident, $hub:literal {
            $($variant:ident($payload:ty) => $target:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub enum $event {
            $($variant($payload),)+
        }

        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $kind {
            $($variant,)+
        }

        impl HubEvent for $event {
            type Kind = $kind;

            const HUB: &'static str = $hub;

            fn kinds() -> &'static [$kind] {
                &[$($kind::$variant,)+]
            }

            fn target(kind: $kind) -> &'static str {
                match kind {
                    $($kind::$variant => $target,)+
                }
            }

            fn decode(kind: $kind, arguments: Vec<Value>) -> Result<Self, ProtocolError> {
                match kind {
                    $($kind::$variant => first_argument($target, arguments).map(Self::$variant),)+
                }
            }

            fn kind(&self) -> $kind {
                match self {
                    $(Self::$variant(_) => $kind::$variant,)+
                }
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAdded {
    pub server_id: ServerId,
    pub added_channel: Channel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDeleted {
    pub server_id: ServerId,
    pub deleted_channel_id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelUpdated {
    pub server_id: ServerId,
    pub updated_channel: Channel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberAdded {
    pub server_id: ServerId,
    pub added_member: Member,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberSoftDeleted {
    pub server_id: ServerId,
    pub soft_deleted_member: Member,
    /// Profile of whoever performed the removal, when the backend sends it.
    #[serde(default)]
    pub profile_id: Option<ProfileId>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_kicked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleUpdated {
    pub server_id: ServerId,
    pub updated_member: Member,
}

/// Payload of both `ReceiveMessageAdded` and `ReceiveMessageUpdated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessageRef {
    pub server_id: ServerId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessageAdded {
    pub conversation_id: ConversationId,
    pub message: DirectMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessageUpdated {
    pub conversation_id: ConversationId,
    pub updated_message: DirectMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessageRef {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
}

hub_events! {
    ServerHubEvent, ServerHubEventKind, "serverHub" {
        ServerDeleted(ServerId) => "ReceiveServerDeleted",
    }
}

hub_events! {
    ChannelHubEvent, ChannelHubEventKind, "channelHub" {
        ChannelAdded(ChannelAdded) => "ReceiveChannelAdded",
        ChannelDeleted(ChannelDeleted) => "ReceiveChannelDeleted",
        ChannelUpdated(ChannelUpdated) => "ReceiveChannelUpdated",
    }
}

hub_events! {
    MemberHubEvent, MemberHubEventKind, "memberHub" {
        MemberAdded(MemberAdded) => "ReceiveMemberAdded",
        MemberSoftDeleted(MemberSoftDeleted) => "ReceiveMemberSoftDeleted",
        RoleUpdated(RoleUpdated) => "ReceiveRoleUpdated",
    }
}

hub_events! {
    MessageHubEvent, MessageHubEventKind, "messageHub" {
        MessageAdded(ChannelMessage) => "ReceiveMessageAdded",
        MessageUpdated(ChannelMessage) => "ReceiveMessageUpdated",
        MessageDeleted(ChannelMessageRef) => "ReceiveMessageDeleted",
        MessageSoftDeleted(ChannelMessageRef) => "ReceiveMessageSoftDeleted",
    }
}

hub_events! {
    DirectMessageHubEvent, DirectMessageHubEventKind, "directMessageHub" {
        DirectMessageAdded(DirectMessageAdded) => "ReceiveDirectMessageAdded",
        DirectMessageUpdated(DirectMessageUpdated) => "ReceiveDirectMessageUpdated",
        DirectMessageDeleted(DirectMessageRef) => "ReceiveDirectMessageDeleted",
        DirectMessageSoftDeleted(DirectMessageRef) => "ReceiveDirectMessageSoftDeleted",
    }
}
