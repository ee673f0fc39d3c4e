//! REST collaborators consumed by the realtime core: the conversation and
//! message persistence API and the socket-token endpoint. This crate only
//! consumes these interfaces; it implements none of them.

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::{Conversation, Message};

/// Interface the chat engine depends on. [`ApiClient`] is the production
/// implementation; tests substitute a fake.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn list_conversations(&self) -> EngineResult<Vec<Conversation>>;
    async fn create_conversation(&self, counterpart_id: Uuid) -> EngineResult<Conversation>;
    async fn list_messages(&self, conversation_id: Uuid) -> EngineResult<Vec<Message>>;
    /// Short-lived token required before `TransportConnection::connect`.
    async fn socket_token(&self) -> EngineResult<String>;
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: std::sync::RwLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct SocketTokenResponse {
    token: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            auth_token: std::sync::RwLock::new(None),
        }
    }

    pub fn set_auth_token(&self, token: impl Into<String>) {
        *self
            .auth_token
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token.into());
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        let token = self
            .auth_token
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl ConversationApi for ApiClient {
    async fn list_conversations(&self) -> EngineResult<Vec<Conversation>> {
        let response = self
            .request(reqwest::Method::GET, "/conversations")
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn create_conversation(&self, counterpart_id: Uuid) -> EngineResult<Conversation> {
        let response = self
            .request(reqwest::Method::POST, "/conversations")
            .json(&serde_json::json!({ "counterpartId": counterpart_id }))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn list_messages(&self, conversation_id: Uuid) -> EngineResult<Vec<Message>> {
        let response = self
            .request(reqwest::Method::GET, "/messages")
            .query(&[("conversationId", conversation_id.to_string())])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn socket_token(&self) -> EngineResult<String> {
        let response = self
            .request(reqwest::Method::GET, "/auth/socket-token")
            .send()
            .await?
            .error_for_status()?;
        let body: SocketTokenResponse = response.json().await?;
        if body.token.is_empty() {
            return Err(EngineError::Api("empty socket token".into()));
        }
        Ok(body.token)
    }
}
