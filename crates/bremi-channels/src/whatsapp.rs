//! WhatsApp Cloud API client
//!
//! Sends text replies and read receipts through the Graph API messages endpoint.
//! `MockWhatsApp` logs instead of calling the network.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::{ChannelError, CONNECT_TIMEOUT, REQUEST_TIMEOUT};

const GRAPH_API_BASE: &str = "https://graph.facebook.com";

/// Trait for chat-message transports
#[async_trait]
pub trait MessageChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send_message(&self, to: &str, text: &str) -> Result<(), ChannelError>;

    async fn mark_as_read(&self, message_id: &str) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub access_token: String,
    pub phone_number_id: String,
    /// Graph API version, e.g. "v17.0"
    pub api_version: String,
    /// Overridable for tests and proxies
    pub base_url: String,
}

impl WhatsAppConfig {
    pub fn new(access_token: String, phone_number_id: String, api_version: String) -> Self {
        Self {
            access_token,
            phone_number_id,
            api_version,
            base_url: GRAPH_API_BASE.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct WhatsAppClient {
    client: reqwest::Client,
    config: Arc<WhatsAppConfig>,
}

impl WhatsAppClient {
    pub fn new(config: WhatsAppConfig) -> Result<Self, ChannelError> {
        if config.access_token.is_empty() || config.phone_number_id.is_empty() {
            return Err(ChannelError::NotConfigured(
                "WHATSAPP_ACCESS_TOKEN and PHONE_NUMBER_ID are required".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/{}/{}/messages",
            self.config.base_url.trim_end_matches('/'),
            self.config.api_version,
            self.config.phone_number_id
        )
    }

    async fn post(&self, body: &Value) -> Result<(), ChannelError> {
        let response = self
            .client
            .post(self.messages_url())
            .bearer_auth(&self.config.access_token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ChannelError::Api {
                status: status.as_u16(),
                message: error_text,
            });
        }

        Ok(())
    }
}

/// Request body for a plain text message
pub fn text_message_body(to: &str, text: &str) -> Value {
    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "text",
        "text": {
            "preview_url": false,
            "body": text
        }
    })
}

/// Request body for a read receipt
pub fn read_receipt_body(message_id: &str) -> Value {
    json!({
        "messaging_product": "whatsapp",
        "status": "read",
        "message_id": message_id
    })
}

#[async_trait]
impl MessageChannel for WhatsAppClient {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send_message(&self, to: &str, text: &str) -> Result<(), ChannelError> {
        match self.post(&text_message_body(to, text)).await {
            Ok(()) => {
                info!("WhatsApp message sent to {}", to);
                Ok(())
            }
            Err(e) => {
                error!("Error sending WhatsApp message to {}: {}", to, e);
                Err(e)
            }
        }
    }

    async fn mark_as_read(&self, message_id: &str) -> Result<(), ChannelError> {
        self.post(&read_receipt_body(message_id)).await.map_err(|e| {
            error!("Error marking message {} as read: {}", message_id, e);
            e
        })
    }
}

/// Mock transport: logs sends, treats read receipts as no-ops
#[derive(Debug, Default)]
pub struct MockWhatsApp;

#[async_trait]
impl MessageChannel for MockWhatsApp {
    fn name(&self) -> &str {
        "whatsapp-mock"
    }

    async fn send_message(&self, to: &str, text: &str) -> Result<(), ChannelError> {
        info!("[MOCK SEND] To: {}, Message: {}", to, text);
        Ok(())
    }

    async fn mark_as_read(&self, message_id: &str) -> Result<(), ChannelError> {
        debug!("[MOCK READ] {}", message_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WhatsAppConfig {
        WhatsAppConfig::new(
            "token".to_string(),
            "1234567890".to_string(),
            "v17.0".to_string(),
        )
    }

    #[test]
    fn test_messages_url() {
        let client = WhatsAppClient::new(config()).unwrap();
        assert_eq!(
            client.messages_url(),
            "https://graph.facebook.com/v17.0/1234567890/messages"
        );

        let mut custom = config();
        custom.base_url = "http://localhost:9000/".to_string();
        let client = WhatsAppClient::new(custom).unwrap();
        assert_eq!(
            client.messages_url(),
            "http://localhost:9000/v17.0/1234567890/messages"
        );
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let mut cfg = config();
        cfg.access_token = String::new();
        assert!(matches!(
            WhatsAppClient::new(cfg),
            Err(ChannelError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_text_message_body_shape() {
        let body = text_message_body("2348000000000", "Hello");
        assert_eq!(body["messaging_product"], "whatsapp");
        assert_eq!(body["recipient_type"], "individual");
        assert_eq!(body["to"], "2348000000000");
        assert_eq!(body["type"], "text");
        assert_eq!(body["text"]["body"], "Hello");
        assert_eq!(body["text"]["preview_url"], false);
    }

    #[test]
    fn test_read_receipt_body_shape() {
        let body = read_receipt_body("wamid.abc");
        assert_eq!(body["status"], "read");
        assert_eq!(body["message_id"], "wamid.abc");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let mut cfg = config();
        // Port 9 (discard) on localhost is not listening in test environments
        cfg.base_url = "http://127.0.0.1:9".to_string();
        let client = WhatsAppClient::new(cfg).unwrap();
        tokio_test::assert_err!(client.send_message("123", "hi").await);
    }

    #[tokio::test]
    async fn test_mock_always_succeeds() {
        let mock = MockWhatsApp;
        tokio_test::assert_ok!(mock.send_message("123", "hi").await);
        tokio_test::assert_ok!(mock.mark_as_read("wamid.abc").await);
    }
}
