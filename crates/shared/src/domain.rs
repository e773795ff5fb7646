use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

/// Parses a backend timestamp: RFC 3339, or an ISO date-time without offset
/// which the backend means as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

mod wire_time {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        value.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw)
            .ok_or_else(|| de::Error::custom(format!("invalid timestamp {raw:?}")))
    }
}

/// `null` reads as the type's default, like a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

id_newtype!(ServerId);
id_newtype!(ChannelId);
id_newtype!(MemberId);
id_newtype!(ProfileId);
id_newtype!(MessageId);
id_newtype!(ConversationId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ChannelType {
    Text,
    Audio,
    Video,
}

impl From<ChannelType> for u8 {
    fn from(value: ChannelType) -> Self {
        match value {
            ChannelType::Text => 0,
            ChannelType::Audio => 1,
            ChannelType::Video => 2,
        }
    }
}

impl TryFrom<u8> for ChannelType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Text),
            1 => Ok(Self::Audio),
            2 => Ok(Self::Video),
            other => Err(format!("unknown channel type {other}")),
        }
    }
}

/// Member role; the ordinal is the privilege rank, lower is more privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MemberRole {
    Admin,
    Moderator,
    Guest,
}

impl MemberRole {
    pub fn outranks(self, other: MemberRole) -> bool {
        self < other
    }
}

impl From<MemberRole> for u8 {
    fn from(value: MemberRole) -> Self {
        match value {
            MemberRole::Admin => 0,
            MemberRole::Moderator => 1,
            MemberRole::Guest => 2,
        }
    }
}

impl TryFrom<u8> for MemberRole {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Admin),
            1 => Ok(Self::Moderator),
            2 => Ok(Self::Guest),
            other => Err(format!("unknown member role {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub invite_code: String,
    pub profile_id: ProfileId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub profile_user_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub channels: Vec<Channel>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub members: Vec<Member>,
    #[serde(with = "wire_time")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "wire_time")]
    pub updated_at: DateTime<Utc>,
}

impl Server {
    pub fn channel(&self, channel_id: ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|channel| channel.id == channel_id)
    }

    pub fn channel_mut(&mut self, channel_id: ChannelId) -> Option<&mut Channel> {
        self.channels
            .iter_mut()
            .find(|channel| channel.id == channel_id)
    }

    /// The channel named "general", compared case-insensitively.
    pub fn general_channel(&self) -> Option<&Channel> {
        self.channels
            .iter()
            .find(|channel| channel.name.trim().to_lowercase() == "general")
    }

    pub fn member_for_profile(&self, profile_id: ProfileId) -> Option<&Member> {
        self.members
            .iter()
            .find(|member| member.profile_id == profile_id)
    }

    pub fn active_members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|member| !member.deleted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: ChannelId,
    pub server_id: ServerId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelType,
    pub profile_id: ProfileId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub profile_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub server_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub messages: Vec<Message>,
    #[serde(with = "wire_time")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "wire_time")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: MemberId,
    pub server_id: ServerId,
    pub profile_id: ProfileId,
    pub role: MemberRole,
    #[serde(default, deserialize_with = "null_as_default")]
    pub deleted: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub profile_name: String,
    #[serde(default)]
    pub profile_image_url: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub profile_email: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub server_name: String,
    #[serde(with = "wire_time")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "wire_time")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub member_id: MemberId,
    pub content: String,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub member_profile_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub channel_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub deleted: bool,
    #[serde(with = "wire_time")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "wire_time")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_member_id: MemberId,
    pub receiver_member_id: MemberId,
    pub content: String,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sender_member_profile_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub receiver_member_profile_name: String,
    #[serde(default)]
    pub sender_member_profile_image_url: Option<String>,
    #[serde(default)]
    pub receiver_member_profile_image_url: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub deleted: bool,
    #[serde(with = "wire_time")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "wire_time")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub member_one_id: MemberId,
    pub member_two_id: MemberId,
    #[serde(with = "wire_time")]
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub direct_messages: Vec<DirectMessage>,
}

impl Conversation {
    /// Whether this conversation is the one between `a` and `b`, in either order.
    pub fn is_between(&self, a: MemberId, b: MemberId) -> bool {
        (self.member_one_id == a && self.member_two_id == b)
            || (self.member_one_id == b && self.member_two_id == a)
    }
}

/// Shared view over channel messages and direct messages so that the
/// timeline merges are written once.
pub trait TimelineEntry: Clone {
    fn entry_id(&self) -> MessageId;
    fn created_at(&self) -> DateTime<Utc>;
    fn updated_at(&self) -> DateTime<Utc>;
    fn is_deleted(&self) -> bool;
    fn mark_deleted(&mut self);
    fn raw_content(&self) -> &str;

    fn is_edited(&self) -> bool {
        self.updated_at() > self.created_at()
    }

    /// Content to render; soft-deleted entries keep their text in memory but
    /// never show it.
    fn display_content(&self) -> Option<&str> {
        if self.is_deleted() {
            None
        } else {
            Some(self.raw_content())
        }
    }
}

impl TimelineEntry for Message {
    fn entry_id(&self) -> MessageId {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    fn raw_content(&self) -> &str {
        &self.content
    }
}

impl TimelineEntry for DirectMessage {
    fn entry_id(&self) -> MessageId {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn mark_deleted(&mut self) {
        self.deleted = true;
    }

    fn raw_content(&self) -> &str {
        &self.content
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordinals_rank_privilege() {
        assert!(MemberRole::Admin.outranks(MemberRole::Moderator));
        assert!(MemberRole::Moderator.outranks(MemberRole::Guest));
        assert!(!MemberRole::Guest.outranks(MemberRole::Guest));
        assert_eq!(serde_json::to_string(&MemberRole::Guest).expect("json"), "2");
    }

    #[test]
    fn channel_type_rejects_unknown_ordinal() {
        let parsed: ChannelType = serde_json::from_str("1").expect("audio");
        assert_eq!(parsed, ChannelType::Audio);
        assert!(serde_json::from_str::<ChannelType>("7").is_err());
    }

    #[test]
    fn message_decodes_from_camel_case_payload() {
        let id = MessageId::random();
        let raw = serde_json::json!({
            "id": id.to_string(),
            "channelId": ChannelId::random().to_string(),
            "memberId": MemberId::random().to_string(),
            "content": "hello",
            "fileUrl": null,
            "memberProfileName": "ada",
            "channelName": "general",
            "deleted": false,
            "createdAt": "2024-03-01T10:00:00Z",
            "updatedAt": "2024-03-01T10:05:00Z"
        });
        let message: Message = serde_json::from_value(raw).expect("message");
        assert_eq!(message.id, id);
        assert!(message.is_edited());
        assert_eq!(message.display_content(), Some("hello"));
    }

    #[test]
    fn message_tolerates_offsetless_timestamps_and_null_display_fields() {
        let raw = serde_json::json!({
            "id": MessageId::random().to_string(),
            "channelId": ChannelId::random().to_string(),
            "memberId": MemberId::random().to_string(),
            "content": "hi",
            "memberProfileName": null,
            "channelName": null,
            "deleted": null,
            "createdAt": "2024-03-01T10:00:00.1234567",
            "updatedAt": "2024-03-01 10:00:00"
        });
        let message: Message = serde_json::from_value(raw).expect("message");
        assert_eq!(message.member_profile_name, "");
        assert!(!message.deleted);
        assert_eq!(
            message.created_at.timestamp_subsec_nanos(),
            123_456_700,
            "fractional seconds kept"
        );
        assert_eq!(message.created_at.timestamp(), message.updated_at.timestamp());
    }

    #[test]
    fn parse_timestamp_reads_offset_and_naive_forms() {
        let offset = parse_timestamp("2024-03-01T12:00:00+02:00").expect("offset");
        let naive = parse_timestamp("2024-03-01T10:00:00").expect("naive");
        assert_eq!(offset, naive);
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn general_channel_matches_any_case() {
        let server_id = ServerId::random();
        let owner = ProfileId::random();
        let channel = |name: &str| Channel {
            id: ChannelId::random(),
            server_id,
            name: name.into(),
            kind: ChannelType::Text,
            profile_id: owner,
            profile_name: String::new(),
            server_name: String::new(),
            messages: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let server = Server {
            id: server_id,
            name: "crew".into(),
            image_url: None,
            invite_code: String::new(),
            profile_id: owner,
            profile_user_name: String::new(),
            channels: vec![channel("Équipe"), channel(" GENERAL ")],
            members: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(
            server.general_channel().map(|c| c.name.as_str()),
            Some(" GENERAL ")
        );
    }
}
