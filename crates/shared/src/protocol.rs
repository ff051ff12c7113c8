use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ClientKey, MessageId, MessageKind, ProductId, UserId},
    error::ApiError,
};

/// Response body shared by every chat HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }

    /// Unwraps the payload or returns the server-provided failure message.
    pub fn into_result(self) -> Result<T, String> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err(self
                .message
                .unwrap_or_else(|| "response carried no data".to_string())),
            (false, _) => Err(self
                .message
                .unwrap_or_else(|| "request was not successful".to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub message: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar: Option<String>,
    pub product_id: ProductId,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<ClientKey>,
}

impl ChatMessage {
    pub fn is_optimistic(&self) -> bool {
        self.id.is_temporary()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub receiver_id: UserId,
    pub product_id: ProductId,
    pub message: String,
    pub client_key: ClientKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TransportRequest {
    JoinRoom {
        product_id: ProductId,
    },
    LeaveRoom {
        product_id: ProductId,
    },
    SendMessage {
        receiver_id: UserId,
        product_id: ProductId,
        message: String,
        client_key: ClientKey,
    },
    Typing {
        receiver_id: UserId,
        product_id: ProductId,
        is_typing: bool,
    },
    SubscribePresence {
        user_id: UserId,
    },
    UnsubscribePresence {
        user_id: UserId,
    },
    RequestPresence {
        user_id: UserId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TransportEvent {
    NewMessage {
        message: ChatMessage,
    },
    MessageSent {
        message_id: MessageId,
        #[serde(default)]
        client_key: Option<ClientKey>,
    },
    Typing {
        user_id: UserId,
        product_id: ProductId,
        is_typing: bool,
    },
    UserStatus {
        user_id: UserId,
        is_online: bool,
    },
    UserStatusResponse {
        user_id: UserId,
        is_online: bool,
    },
    Error(ApiError),
}
