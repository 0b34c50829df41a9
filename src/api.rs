use crate::error::ChatError;
use crate::models::{Attachments, ChatMode, ConversationTurn, Role};
use crate::stream::{self, DeltaStream};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;

// Trait defining the interface to the model proxy
#[async_trait]
pub trait ModelProxy: Send + Sync {
    /// Sends one conversation turn and returns a stream of content deltas.
    ///
    /// Status failures are reported here, before any frame is parsed.
    async fn send_chat_stream_request(
        &self,
        request: &ChatRequest,
        access_token: Option<&str>,
    ) -> Result<DeltaStream, ChatError>;
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ApiMessage {
    pub role: Role,
    pub content: String,
}

impl From<&ConversationTurn> for ApiMessage {
    fn from(turn: &ConversationTurn) -> Self {
        Self {
            role: turn.role,
            content: turn.content.clone(),
        }
    }
}

// Request body for the proxy's chat endpoint
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<ApiMessage>,
    pub mode: ChatMode,
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Attachments>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_guest: bool,
}

pub struct HttpModelProxy {
    client: Client,
    endpoint: String,
    // Public key used when the caller has no session token (guests)
    anon_key: Option<String>,
}

impl HttpModelProxy {
    pub fn new(endpoint: impl Into<String>, anon_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            anon_key,
        }
    }
}

#[async_trait]
impl ModelProxy for HttpModelProxy {
    async fn send_chat_stream_request(
        &self,
        request: &ChatRequest,
        access_token: Option<&str>,
    ) -> Result<DeltaStream, ChatError> {
        log::info!(
            "Sending STREAM request to model proxy: {} (mode: {}, {} messages)",
            self.endpoint,
            request.mode,
            request.messages.len()
        );

        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(token) = access_token.or(self.anon_key.as_deref()) {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<Failed to read error body>".to_string());
            log::error!("Model proxy stream request failed with status {}: {}", status, error_body);
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => ChatError::RateLimited,
                StatusCode::PAYMENT_REQUIRED => ChatError::CreditsExhausted,
                _ => ChatError::Http {
                    status: status.as_u16(),
                    body: error_body,
                },
            });
        }

        if response.content_length() == Some(0) {
            log::error!("Model proxy answered {} with an empty body", status);
            return Err(ChatError::MissingBody);
        }

        Ok(stream::deltas(response.bytes_stream()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileAttachment;

    fn request(is_guest: bool) -> ChatRequest {
        ChatRequest {
            messages: vec![ApiMessage::from(&ConversationTurn::new(Role::User, "hi"))],
            mode: ChatMode::Examiner,
            level: "university".to_string(),
            subject: None,
            language: Some("en".to_string()),
            attachments: None,
            is_guest,
        }
    }

    #[test]
    fn request_body_uses_wire_names() {
        let body = serde_json::to_value(request(true)).unwrap();
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["mode"], "examiner");
        assert_eq!(body["isGuest"], true);
        assert!(body.get("subject").is_none());
        assert!(body.get("attachments").is_none());
    }

    #[test]
    fn signed_in_requests_omit_guest_flag() {
        let mut req = request(false);
        req.attachments = Some(Attachments {
            files: vec![FileAttachment {
                name: "notes.pdf".to_string(),
                url: "https://files.example/notes.pdf".to_string(),
                mime_type: "application/pdf".to_string(),
            }],
            links: vec![],
        });
        let body = serde_json::to_value(req).unwrap();
        assert!(body.get("isGuest").is_none());
        assert_eq!(body["attachments"]["files"][0]["type"], "application/pdf");
        assert!(body["attachments"].get("links").is_none());
    }
}
