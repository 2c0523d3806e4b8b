use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::auth::AuthProvider;
use crate::model::{Conversation, ConversationId, FileArtifact, InterruptRequest, TodoItem};
use crate::protocol::WireMessage;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// No bearer token yet
    #[error("Not ready: no auth token")]
    NotReady,
}

/// One page of stored conversation history, oldest message first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub todos: Option<Vec<TodoItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileArtifact>>,
    /// Interrupt the conversation is currently suspended on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<InterruptRequest>,
    /// Cursor for the following page; `None` on the last one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Conversation CRUD and history pagination.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn create_conversation(&self, title: Option<String>) -> Result<Conversation, ApiError>;

    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), ApiError>;

    async fn fetch_history(
        &self,
        id: &ConversationId,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<HistoryPage, ApiError>;
}

#[derive(Serialize)]
struct CreateConversationRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
}

pub struct HttpConversationApi {
    client: Client,
    base_url: String,
    auth: Arc<dyn AuthProvider>,
}

impl HttpConversationApi {
    pub fn new(base_url: impl Into<String>, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let token = self.auth.token().ok_or(ApiError::NotReady)?;
        let url = format!("{}{}", self.base_url, path);
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    async fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let text = Self::check(response).await?.text().await?;
        serde_json::from_str(&text).map_err(|e| ApiError::Decode(format!("{e} - {text}")))
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn create_conversation(&self, title: Option<String>) -> Result<Conversation, ApiError> {
        let response = self
            .request(Method::POST, "/conversations")?
            .json(&CreateConversationRequest { title })
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), ApiError> {
        let response = self
            .request(Method::DELETE, &format!("/conversations/{id}"))?
            .send()
            .await?;
        match response.status() {
            // Already gone is as good as deleted.
            StatusCode::NOT_FOUND => Ok(()),
            _ => Self::check(response).await.map(|_| ()),
        }
    }

    async fn fetch_history(
        &self,
        id: &ConversationId,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<HistoryPage, ApiError> {
        let mut request = self
            .request(Method::GET, &format!("/conversations/{id}/messages"))?
            .query(&[("limit", limit.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        let response = request.send().await?;
        Self::decode(response).await
    }
}
