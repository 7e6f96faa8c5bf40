use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub const PROTOCOL_VERSION: u16 = 1;
pub const MAX_EVENT_LEN: usize = 64 * 1024;

#[derive(Debug)]
pub enum CodecError {
    EventTooLarge,
    InvalidEventJson,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EventTooLarge => write!(f, "event exceeds limits"),
            Self::InvalidEventJson => write!(f, "invalid event payload"),
        }
    }
}

impl Error for CodecError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = CodecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "read" => Ok(Self::Read),
            _ => Err(CodecError::InvalidEventJson),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Active,
    Rejected,
    Missed,
    Ended,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Active => "active",
            Self::Rejected => "rejected",
            Self::Missed => "missed",
            Self::Ended => "ended",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Missed | Self::Ended)
    }
}

impl FromStr for CallStatus {
    type Err = CodecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ringing" => Ok(Self::Ringing),
            "active" => Ok(Self::Active),
            "rejected" => Ok(Self::Rejected),
            "missed" => Ok(Self::Missed),
            "ended" => Ok(Self::Ended),
            _ => Err(CodecError::InvalidEventJson),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Audio,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Audio => "audio",
        }
    }
}

impl FromStr for MessageKind {
    type Err = CodecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "audio" => Ok(Self::Audio),
            _ => Err(CodecError::InvalidEventJson),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Video => "video",
        }
    }
}

impl FromStr for CallKind {
    type Err = CodecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "voice" => Ok(Self::Voice),
            "video" => Ok(Self::Video),
            _ => Err(CodecError::InvalidEventJson),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

impl FromStr for ConversationKind {
    type Err = CodecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "direct" => Ok(Self::Direct),
            "group" => Ok(Self::Group),
            _ => Err(CodecError::InvalidEventJson),
        }
    }
}

/// Public profile fields attached to relayed messages and incoming calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// A persisted message as it travels to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageWire {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub sender: UserSummary,
}

/// A call record as it travels to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallWire {
    pub id: String,
    pub caller_id: String,
    pub receiver_id: String,
    #[serde(rename = "type")]
    pub kind: CallKind,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<UserSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineStatus {
    pub user_id: String,
    pub is_online: bool,
}

/// Events a client may submit over an established connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "message:send")]
    MessageSend {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        content: String,
        #[serde(rename = "type", default)]
        kind: MessageKind,
    },
    #[serde(rename = "message:delivered")]
    MessageDelivered {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    #[serde(rename = "message:read")]
    MessageRead {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    #[serde(rename = "message:edit")]
    MessageEdit {
        #[serde(rename = "messageId")]
        message_id: String,
        #[serde(rename = "newContent")]
        new_content: String,
    },
    #[serde(rename = "message:delete")]
    MessageDelete {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    #[serde(rename = "typing:start")]
    TypingStart {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    #[serde(rename = "typing:stop")]
    TypingStop {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    #[serde(rename = "conversation:join")]
    ConversationJoin {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    #[serde(rename = "conversation:leave")]
    ConversationLeave {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    #[serde(rename = "call:initiate")]
    CallInitiate {
        #[serde(rename = "receiverId")]
        receiver_id: String,
        #[serde(rename = "type")]
        kind: CallKind,
    },
    #[serde(rename = "call:accept")]
    CallAccept {
        #[serde(rename = "callId")]
        call_id: String,
    },
    #[serde(rename = "call:reject")]
    CallReject {
        #[serde(rename = "callId")]
        call_id: String,
    },
    #[serde(rename = "call:end")]
    CallEnd {
        #[serde(rename = "callId")]
        call_id: String,
    },
    #[serde(rename = "call:offer")]
    CallOffer {
        #[serde(rename = "receiverId")]
        receiver_id: String,
        sdp: Value,
    },
    #[serde(rename = "call:answer")]
    CallAnswer {
        #[serde(rename = "callerId")]
        caller_id: String,
        sdp: Value,
    },
    #[serde(rename = "call:ice-candidate")]
    CallIceCandidate {
        #[serde(rename = "receiverId")]
        receiver_id: String,
        candidate: Value,
    },
    #[serde(rename = "user:status-update")]
    StatusUpdate { status: String },
    #[serde(rename = "user:check-online")]
    CheckOnline {
        #[serde(rename = "userIds")]
        user_ids: Vec<String>,
    },
}

impl ClientEvent {
    /// Decodes a client event from one text frame.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        if text.len() > MAX_EVENT_LEN {
            return Err(CodecError::EventTooLarge);
        }
        serde_json::from_str(text).map_err(|_| CodecError::InvalidEventJson)
    }
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew(MessageWire),
    #[serde(rename = "message:sent")]
    MessageSent(MessageWire),
    #[serde(rename = "message:delivered")]
    MessageDelivered {
        #[serde(rename = "messageId")]
        message_id: String,
        status: MessageStatus,
    },
    #[serde(rename = "message:read")]
    MessageRead {
        #[serde(rename = "messageId")]
        message_id: String,
        status: MessageStatus,
        #[serde(rename = "readBy")]
        read_by: String,
    },
    #[serde(rename = "message:edited")]
    MessageEdited(MessageWire),
    #[serde(rename = "message:deleted")]
    MessageDeleted {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    #[serde(rename = "typing:start")]
    TypingStart {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "typing:stop")]
    TypingStop {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "user:online")]
    UserOnline {
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "user:offline")]
    UserOffline {
        #[serde(rename = "userId")]
        user_id: String,
    },
    #[serde(rename = "user:status-changed")]
    StatusChanged {
        #[serde(rename = "userId")]
        user_id: String,
        status: String,
    },
    #[serde(rename = "user:online-status")]
    OnlineStatusReport(Vec<OnlineStatus>),
    #[serde(rename = "call:incoming")]
    CallIncoming(CallWire),
    #[serde(rename = "call:initiated")]
    CallInitiated(CallWire),
    #[serde(rename = "call:unavailable")]
    CallUnavailable {
        #[serde(rename = "callId")]
        call_id: String,
        message: String,
    },
    #[serde(rename = "call:accepted")]
    CallAccepted {
        #[serde(rename = "callId")]
        call_id: String,
    },
    #[serde(rename = "call:rejected")]
    CallRejected {
        #[serde(rename = "callId")]
        call_id: String,
    },
    #[serde(rename = "call:ended")]
    CallEnded {
        #[serde(rename = "callId")]
        call_id: String,
        duration: i64,
    },
    #[serde(rename = "call:missed")]
    CallMissed {
        #[serde(rename = "callId")]
        call_id: String,
    },
    #[serde(rename = "call:offer")]
    CallOffer {
        #[serde(rename = "senderId")]
        sender_id: String,
        sdp: Value,
    },
    #[serde(rename = "call:answer")]
    CallAnswer {
        #[serde(rename = "senderId")]
        sender_id: String,
        sdp: Value,
    },
    #[serde(rename = "call:ice-candidate")]
    CallIceCandidate {
        #[serde(rename = "senderId")]
        sender_id: String,
        candidate: Value,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

/// A server push tagged with the per-connection sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub seq: u64,
    #[serde(flatten)]
    pub event: ServerEvent,
}

impl OutboundFrame {
    pub fn new(seq: u64, event: ServerEvent) -> Self {
        OutboundFrame { seq, event }
    }

    /// Serializes the frame into one text payload, enforcing size limits.
    pub fn encode(&self) -> Result<String, CodecError> {
        let encoded = serde_json::to_string(self).map_err(|_| CodecError::InvalidEventJson)?;
        if encoded.len() > MAX_EVENT_LEN {
            return Err(CodecError::EventTooLarge);
        }
        Ok(encoded)
    }
}
