use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse availability state tracked by the service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Active,
    Away,
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Presence::Active => f.write_str("active"),
            Presence::Away => f.write_str("away"),
        }
    }
}

/// Server-assigned message timestamp.
///
/// Kept as the exact string the service produced. The same value must be
/// echoed back to reference the message later, so it is never parsed into a
/// float or a date.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageTs(String);

impl MessageTs {
    pub fn new(ts: impl Into<String>) -> Self {
        Self(ts.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageTs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageTs {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageTs {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelfMsg {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserMsg {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_name: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Presence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeRequest {
    pub batch_presence_aware: bool,
}

/// Body returned by the session-start endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "self", default, skip_serializing_if = "Option::is_none")]
    pub myself: Option<SelfMsg>,
    #[serde(default)]
    pub users: Vec<UserMsg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Message {
        id: u64,
        channel: String,
        text: String,
    },
    MessageDelete {
        id: u64,
        channel: String,
        ts: MessageTs,
    },
    PresenceSub {
        ids: Vec<String>,
    },
    SetPresence {
        id: u64,
        presence: Presence,
    },
    Ping {
        id: u64,
    },
}

impl ClientMessage {
    /// Correlation identifier carried by this frame, if it expects a reply.
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            ClientMessage::Message { id, .. }
            | ClientMessage::MessageDelete { id, .. }
            | ClientMessage::SetPresence { id, .. }
            | ClientMessage::Ping { id } => Some(*id),
            ClientMessage::PresenceSub { .. } => None,
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorMsg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default)]
    pub msg: String,
}

/// Reply to a correlated request, matched by `reply_to`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyFrame {
    pub reply_to: u64,
    #[serde(default = "default_ok")]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<MessageTs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Presence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMsg>,
}

fn default_ok() -> bool {
    true
}

/// Server-initiated frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Hello {},
    Goodbye {},
    Message {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<MessageTs>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtype: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deleted_ts: Option<MessageTs>,
    },
    PresenceChange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        users: Option<Vec<String>>,
        presence: Presence,
    },
    ManualPresenceChange {
        presence: Presence,
    },
    Error {
        error: ErrorMsg,
    },
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Reply(ReplyFrame),
    Event(ServerEvent),
    Unrecognized { kind: String },
}

impl InboundFrame {
    /// Decodes a text frame and classifies it as a correlated reply or a push
    /// event. Frames carrying `reply_to` are always replies.
    pub fn classify(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;

        if value.get("reply_to").is_some() {
            return serde_json::from_value(value).map(InboundFrame::Reply);
        }

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match serde_json::from_value::<ServerEvent>(value)? {
            ServerEvent::Unknown => Ok(InboundFrame::Unrecognized { kind }),
            event => Ok(InboundFrame::Event(event)),
        }
    }
}
