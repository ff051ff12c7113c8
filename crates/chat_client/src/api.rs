//! HTTP side of the chat: partner lookup, history and message persistence.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ChatPartner, ProductId},
    protocol::{ChatMessage, Envelope, SendMessageRequest},
};
use tracing::{debug, warn};

use crate::error::ApiError;

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_partner(&self, product_id: &ProductId) -> Result<ChatPartner, ApiError>;
    async fn fetch_history(
        &self,
        product_id: &ProductId,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, ApiError>;
    async fn persist_message(&self, request: &SendMessageRequest)
        -> Result<ChatMessage, ApiError>;
}

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Serialize)]
struct HistoryQuery {
    limit: u32,
}

pub struct HttpChatApi {
    http: Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Every request gives up after `timeout` and surfaces as a network error.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let http = Client::builder().timeout(timeout).build().unwrap_or_else(|err| {
            warn!(%err, "falling back to a default http client");
            Client::new()
        });
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
        }
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token.filter(|token| !token.trim().is_empty());
        self
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_envelope<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ApiError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            // Error bodies still follow the envelope shape when the backend is up.
            if let Ok(envelope) = response.json::<Envelope<serde_json::Value>>().await {
                if let (Some(message), false) = (envelope.message, status.is_server_error()) {
                    return Err(ApiError::Rejected(message));
                }
            }
            return Err(ApiError::from_status(status));
        }
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|err| ApiError::Decode(err.to_string()))?;
        envelope.into_result().map_err(ApiError::Rejected)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_partner(&self, product_id: &ProductId) -> Result<ChatPartner, ApiError> {
        debug!(product_id = %product_id, "fetching chat partner");
        let request = self.authorize(self.http.get(format!(
            "{}/chat/products/{}/partner",
            self.base_url, product_id
        )));
        Self::read_envelope(request).await
    }

    async fn fetch_history(
        &self,
        product_id: &ProductId,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        debug!(product_id = %product_id, limit, "fetching chat history");
        let request = self
            .authorize(self.http.get(format!(
                "{}/chat/products/{}/messages",
                self.base_url, product_id
            )))
            .query(&HistoryQuery {
                limit: limit.clamp(1, 500),
            });
        Self::read_envelope(request).await
    }

    async fn persist_message(
        &self,
        request: &SendMessageRequest,
    ) -> Result<ChatMessage, ApiError> {
        let builder = self
            .authorize(self.http.post(format!("{}/chat/messages", self.base_url)))
            .json(request);
        Self::read_envelope(builder).await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
