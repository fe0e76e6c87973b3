use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::RoomId,
    protocol::{CreateThreadRequest, MessageRecord, OutgoingMessage, Participant, ThreadRecord},
};
use tracing::debug;

use crate::{
    error::{ChatError, Result},
    types::Credential,
};

/// REST side of the chat service.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn fetch_threads(&self) -> Result<Vec<ThreadRecord>>;
    async fn fetch_thread(&self, room_id: &RoomId) -> Result<ThreadRecord>;
    /// Oldest first.
    async fn fetch_history(&self, room_id: &RoomId) -> Result<Vec<MessageRecord>>;
    async fn fetch_directory(&self) -> Result<Vec<Participant>>;
    async fn post_message(&self, message: &OutgoingMessage) -> Result<MessageRecord>;
    async fn create_thread(&self, request: &CreateThreadRequest) -> Result<ThreadRecord>;
}

pub struct HttpChatBackend {
    http: Client,
    base_url: String,
    credential: Credential,
    history_limit: u32,
}

impl HttpChatBackend {
    pub fn new(base_url: impl Into<String>, credential: Credential, history_limit: u32) -> Self {
        Self::with_client(Client::new(), base_url, credential, history_limit)
    }

    pub fn with_client(
        http: Client,
        base_url: impl Into<String>,
        credential: Credential,
        history_limit: u32,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            credential,
            history_limit,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(self.credential.expose())
    }

    async fn get_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|err| ChatError::Fetch(err.to_string()))?;
        let response = check_status(response, ChatError::Fetch).await?;
        response
            .json()
            .await
            .map_err(|err| ChatError::Fetch(format!("invalid response body: {err}")))
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn fetch_threads(&self) -> Result<Vec<ThreadRecord>> {
        self.get_json(self.http.get(self.url("/chats"))).await
    }

    async fn fetch_thread(&self, room_id: &RoomId) -> Result<ThreadRecord> {
        self.get_json(self.http.get(self.url(&format!("/chats/{room_id}"))))
            .await
    }

    async fn fetch_history(&self, room_id: &RoomId) -> Result<Vec<MessageRecord>> {
        debug!(%room_id, limit = self.history_limit, "chat: fetching history");
        self.get_json(
            self.http
                .get(self.url(&format!("/chats/{room_id}/messages")))
                .query(&[("limit", self.history_limit)]),
        )
        .await
    }

    async fn fetch_directory(&self) -> Result<Vec<Participant>> {
        self.get_json(self.http.get(self.url("/users"))).await
    }

    async fn post_message(&self, message: &OutgoingMessage) -> Result<MessageRecord> {
        let response = self
            .authorized(
                self.http
                    .post(self.url(&format!("/chats/{}/messages", message.room_id)))
                    .json(message),
            )
            .send()
            .await
            .map_err(|err| ChatError::Send(err.to_string()))?;
        let response = check_status(response, ChatError::Send).await?;
        response
            .json()
            .await
            .map_err(|err| ChatError::Send(format!("invalid acknowledgement: {err}")))
    }

    async fn create_thread(&self, request: &CreateThreadRequest) -> Result<ThreadRecord> {
        let response = self
            .authorized(self.http.post(self.url("/chats")).json(request))
            .send()
            .await
            .map_err(|err| ChatError::Fetch(err.to_string()))?;
        let response = check_status(response, ChatError::Fetch).await?;
        response
            .json()
            .await
            .map_err(|err| ChatError::Fetch(format!("invalid response body: {err}")))
    }
}

async fn check_status(
    response: Response,
    kind: fn(String) -> ChatError,
) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<shared::error::ApiError>(&body)
        .map(|err| err.message)
        .unwrap_or(body);
    let detail = if detail.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {detail}")
    };

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(ChatError::Auth(detail))
    } else {
        Err(kind(detail))
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
