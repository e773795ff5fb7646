//! JSON hub protocol spoken on every push-notification endpoint, plus the
//! REST envelopes used by the paginated history endpoints.
//!
//! Frames are JSON objects terminated by the ASCII record separator (0x1E).
//! One WebSocket text message may carry several frames.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{ChannelId, ConversationId, DirectMessage, Message, ServerId},
    error::ProtocolError,
};

pub const RECORD_SEPARATOR: char = '\u{1e}';
pub const HUB_PROTOCOL: &str = "json";
pub const HUB_PROTOCOL_VERSION: u32 = 1;

pub const JOIN_GROUP: &str = "JoinGroup";
pub const LEAVE_GROUP: &str = "LeaveGroup";

const INVOCATION: u8 = 1;
const COMPLETION: u8 = 3;
const PING: u8 = 6;
const CLOSE: u8 = 7;

/// Transport-level subscription key a hub scopes its pushes by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// `"{serverId}"` used by the server, channel and member hubs.
    pub fn server(server_id: ServerId) -> Self {
        Self(server_id.to_string())
    }

    /// `"{serverId},{channelId}"` used by the message hub.
    pub fn channel(server_id: ServerId, channel_id: ChannelId) -> Self {
        Self(format!("{server_id},{channel_id}"))
    }

    /// `"{conversationId}"` used by the direct-message hub.
    pub fn conversation(conversation_id: ConversationId) -> Self {
        Self(conversation_id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Stream frames and anything newer than this client understands.
    Unsupported(u8),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHubMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

impl HubMessage {
    pub fn invocation(
        invocation_id: impl Into<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        Self::Invocation {
            invocation_id: Some(invocation_id.into()),
            target: target.into(),
            arguments,
        }
    }

    /// Server push: an invocation without an id expects no completion.
    pub fn event(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self::Invocation {
            invocation_id: None,
            target: target.into(),
            arguments,
        }
    }

    /// Encodes the frame including its trailing record separator.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let raw = match self {
            Self::Invocation {
                invocation_id,
                target,
                arguments,
            } => RawHubMessage {
                kind: INVOCATION,
                invocation_id: invocation_id.clone(),
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                ..RawHubMessage::default()
            },
            Self::Completion {
                invocation_id,
                result,
                error,
            } => RawHubMessage {
                kind: COMPLETION,
                invocation_id: Some(invocation_id.clone()),
                result: result.clone(),
                error: error.clone(),
                ..RawHubMessage::default()
            },
            Self::Ping => RawHubMessage {
                kind: PING,
                ..RawHubMessage::default()
            },
            Self::Close {
                error,
                allow_reconnect,
            } => RawHubMessage {
                kind: CLOSE,
                error: error.clone(),
                allow_reconnect: Some(*allow_reconnect),
                ..RawHubMessage::default()
            },
            Self::Unsupported(kind) => RawHubMessage {
                kind: *kind,
                ..RawHubMessage::default()
            },
        };
        let mut text = serde_json::to_string(&raw)?;
        text.push(RECORD_SEPARATOR);
        Ok(text)
    }

    pub fn decode(record: &str) -> Result<Self, ProtocolError> {
        let raw: RawHubMessage = serde_json::from_str(record)?;
        match raw.kind {
            INVOCATION => Ok(Self::Invocation {
                invocation_id: raw.invocation_id,
                target: raw.target.ok_or(ProtocolError::MissingField {
                    kind: INVOCATION,
                    field: "target",
                })?,
                arguments: raw.arguments.unwrap_or_default(),
            }),
            COMPLETION => Ok(Self::Completion {
                invocation_id: raw.invocation_id.ok_or(ProtocolError::MissingField {
                    kind: COMPLETION,
                    field: "invocationId",
                })?,
                result: raw.result,
                error: raw.error,
            }),
            PING => Ok(Self::Ping),
            CLOSE => Ok(Self::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect.unwrap_or(false),
            }),
            other => Ok(Self::Unsupported(other)),
        }
    }
}

/// Splits one transport message into its records and decodes each.
pub fn decode_frames(text: &str) -> Vec<Result<HubMessage, ProtocolError>> {
    text.split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
        .map(HubMessage::decode)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

impl HandshakeRequest {
    pub fn json() -> Self {
        Self {
            protocol: HUB_PROTOCOL.to_string(),
            version: HUB_PROTOCOL_VERSION,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let mut text = serde_json::to_string(self)?;
        text.push(RECORD_SEPARATOR);
        Ok(text)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    /// Parses the first record of the first server message. Whatever follows
    /// the handshake record is returned so that early pushes are not lost.
    pub fn split(text: &str) -> Result<(Self, &str), ProtocolError> {
        let (record, rest) = text.split_once(RECORD_SEPARATOR).unwrap_or((text, ""));
        let response: HandshakeResponse = serde_json::from_str(record)?;
        if let Some(error) = response.error {
            return Err(ProtocolError::HandshakeRejected(error));
        }
        Ok((response, rest))
    }
}

/// `{ "message": ..., "result": ... }` wrapper around every REST success body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub message: Option<String>,
    pub result: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    #[serde(default)]
    pub messages: Vec<Message>,
    pub page: u32,
    pub page_size: u32,
    pub total_count: u64,
}

/// Direct-message pages use the same `messages` key as channel pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessagePage {
    #[serde(default)]
    pub messages: Vec<DirectMessage>,
    pub page: u32,
    pub page_size: u32,
    pub total_count: u64,
}
