// Message Dispatch - outbound conversation messages via the transport sink
//
// The transport sink is an opaque HTTP service that actually delivers
// conversation messages over the connected channel (WhatsApp etc). Delivery is
// at-least-once: every dispatch carries a stable idempotency key so the sink
// can drop replays of the same automation invocation.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::TransportConfig;

#[derive(Debug, Clone)]
pub struct MessageDispatcher {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("transport request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("transport rejected message: status {status}")]
    Rejected { status: u16 },
}

#[derive(Debug, Serialize)]
struct OutboundMessage<'a> {
    conversation_id: Uuid,
    connection_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_name: Option<&'a str>,
    message_type: &'a str,
    sender_type: &'a str,
    idempotency_key: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct DispatchReceipt {
    pub message_id: String,
}

impl MessageDispatcher {
    pub fn new(config: &TransportConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        }
    }

    /// Dispatch a plain text message into a conversation.
    pub async fn send_text(
        &self,
        conversation_id: Uuid,
        connection_id: Uuid,
        content: &str,
        idempotency_key: &str,
    ) -> Result<DispatchReceipt, DispatchError> {
        self.post(OutboundMessage {
            conversation_id,
            connection_id,
            content: Some(content),
            file_url: None,
            file_name: None,
            message_type: "text",
            sender_type: "system",
            idempotency_key,
        })
        .await
    }

    /// Dispatch a file-backed message (audio, media, document).
    pub async fn send_media(
        &self,
        conversation_id: Uuid,
        connection_id: Uuid,
        message_type: &str,
        file_url: &str,
        file_name: &str,
        idempotency_key: &str,
    ) -> Result<DispatchReceipt, DispatchError> {
        self.post(OutboundMessage {
            conversation_id,
            connection_id,
            content: None,
            file_url: Some(file_url),
            file_name: Some(file_name),
            message_type,
            sender_type: "system",
            idempotency_key,
        })
        .await
    }

    async fn post(&self, message: OutboundMessage<'_>) -> Result<DispatchReceipt, DispatchError> {
        let url = format!("{}/messages", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&message)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DispatchError::Rejected {
                status: response.status().as_u16(),
            });
        }

        let receipt: DispatchReceipt = response.json().await?;
        info!(
            "Dispatched {} message {} to conversation {}",
            message.message_type, receipt.message_id, message.conversation_id
        );

        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dispatcher_for(server: &MockServer) -> MessageDispatcher {
        MessageDispatcher::new(&TransportConfig {
            base_url: server.uri(),
            api_token: "test-token".to_string(),
            timeout_secs: 5,
        })
    }

    #[tokio::test]
    async fn test_send_text_returns_receipt() {
        let server = MockServer::start().await;
        let conversation_id = Uuid::new_v4();

        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(body_partial_json(serde_json::json!({
                "conversation_id": conversation_id,
                "message_type": "text",
                "sender_type": "system",
                "idempotency_key": "auto:1",
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "message_id": "msg-42" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = dispatcher_for(&server);
        let receipt = dispatcher
            .send_text(conversation_id, Uuid::new_v4(), "Olá", "auto:1")
            .await
            .unwrap();

        assert_eq!(receipt.message_id, "msg-42");
    }

    #[tokio::test]
    async fn test_rejected_status_is_reported() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let dispatcher = dispatcher_for(&server);
        let result = dispatcher
            .send_media(
                Uuid::new_v4(),
                Uuid::new_v4(),
                "document",
                "https://files.example/contract.pdf",
                "contract.pdf",
                "auto:2",
            )
            .await;

        match result {
            Err(DispatchError::Rejected { status }) => assert_eq!(status, 502),
            other => panic!("expected rejected dispatch, got {:?}", other),
        }
    }
}
