use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a persisted message. Only ever moves forward.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "read" => Some(DeliveryStatus::Read),
            _ => None,
        }
    }
}

/// Machine readable error codes returned to callers.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    NotParticipant,
    NotFound,
    MessageLimitReached,
    StorageUnavailable,
    Unauthorized,
}

impl ErrorCode {
    /// Whether a client may retry the same request later without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::StorageUnavailable)
    }
}

/// Error body shared by REST responses and websocket `error` frames.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<String>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.is_retryable(),
            client_temp_id: None,
        }
    }

    pub fn with_temp_id(mut self, client_temp_id: Option<String>) -> Self {
        self.client_temp_id = client_temp_id;
        self
    }
}

/// Canonical server-side message record.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: String,
    pub text: String,
    /// Server timestamp in unix milliseconds; total order key within a conversation.
    pub created_at: i64,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<String>,
}

/// A conversation between exactly two participants.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: Uuid,
    pub user_a: String,
    pub user_b: String,
    pub created_at: i64,
}

impl Conversation {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.user_a == user_id || self.user_b == user_id
    }

    /// The participant that is not `user_id`, if `user_id` takes part at all.
    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        if self.user_a == user_id {
            Some(&self.user_b)
        } else if self.user_b == user_id {
            Some(&self.user_a)
        } else {
            None
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub peer_id: String,
    pub unread_count: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CreateConversationRequest {
    pub peer_id: String,
}

/// Send request. The sender is always the verified caller.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub conversation_id: Uuid,
    pub text: String,
    #[serde(default)]
    pub client_temp_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SendResponse {
    pub message_id: Uuid,
    pub server_timestamp: i64,
    #[serde(default)]
    pub client_temp_id: Option<String>,
    pub message: MessageRecord,
}

impl From<MessageRecord> for SendResponse {
    fn from(message: MessageRecord) -> Self {
        Self {
            message_id: message.id,
            server_timestamp: message.created_at,
            client_temp_id: message.client_temp_id.clone(),
            message,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MarkReadRequest {
    pub conversation_id: Uuid,
    /// Explicit messages to mark; `None` marks everything unread from the peer.
    #[serde(default)]
    pub message_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MarkReadResponse {
    /// Number of receipts newly written by this call.
    pub count: usize,
    pub message_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UnreadCount {
    pub conversation_id: Uuid,
    pub unread: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Web => "web",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ios" => Some(Platform::Ios),
            "android" => Some(Platform::Android),
            "web" => Some(Platform::Web),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RegisterDeviceRequest {
    pub address: String,
    pub platform: Platform,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeregisterDeviceRequest {
    pub address: String,
}

/// Frames a client may send over the live channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientFrame {
    Send(SendRequest),
    MarkRead(MarkReadRequest),
    Ping,
}

/// Frames the server pushes over the live channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerFrame {
    Hello {
        user_id: String,
    },
    Message(MessageRecord),
    Read {
        conversation_id: Uuid,
        reader_id: String,
        message_ids: Vec<Uuid>,
    },
    ConversationDeleted {
        conversation_id: Uuid,
    },
    Ack(SendResponse),
    ReadAck(MarkReadResponse),
    Error(ErrorBody),
    Superseded,
    Pong,
}
