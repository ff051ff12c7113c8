//! Error types for the chat client and their user-facing classification.

use std::fmt;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("chat service unavailable (HTTP {status})")]
    Unavailable { status: u16 },
    #[error("network error: {0}")]
    Network(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("unexpected HTTP status {status}")]
    Status { status: u16 },
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => Self::Unavailable {
                status: status.as_u16(),
            },
            other => Self::Status {
                status: other.as_u16(),
            },
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status);
        }
        if err.is_decode() {
            return Self::Decode(err.to_string());
        }
        // No response at all: refused, reset, DNS or timeout.
        Self::Network(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("failed to connect transport: {0}")]
    Connect(String),
    #[error("failed to encode transport frame: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ServiceUnavailable,
    Network,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureContext {
    LoadConversation,
    SendMessage,
}

/// A failure caught at the session boundary and shown as a dismissible banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatFailure {
    kind: FailureKind,
    context: FailureContext,
    message: String,
}

impl ChatFailure {
    pub fn from_api(context: FailureContext, err: &ApiError) -> Self {
        let kind = match err {
            ApiError::Unavailable { .. } => FailureKind::ServiceUnavailable,
            ApiError::Network(_) => FailureKind::Network,
            ApiError::Rejected(_) | ApiError::Status { .. } | ApiError::Decode(_) => {
                FailureKind::Generic
            }
        };
        Self {
            kind,
            context,
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn context(&self) -> FailureContext {
        self.context
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn banner(&self) -> String {
        let subject = match self.context {
            FailureContext::LoadConversation => "Could not load the conversation",
            FailureContext::SendMessage => "Your message was not sent",
        };
        match self.kind {
            FailureKind::ServiceUnavailable => {
                format!("{subject}: the chat service is temporarily unavailable. Please try again shortly.")
            }
            FailureKind::Network => {
                format!("{subject}: check your network connection and try again.")
            }
            FailureKind::Generic => format!("{subject}: {}", self.message),
        }
    }
}

impl fmt::Display for ChatFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.banner())
    }
}

impl std::error::Error for ChatFailure {}
