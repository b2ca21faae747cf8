//! WhatsApp Cloud API webhook handling
//!
//! Meta verifies the endpoint with a GET handshake, then POSTs message
//! notifications. Each text message gets a companion reply sent back over
//! the `MessageChannel`, with the user's recent chat history as context.

use anyhow::{Context, Result};
use bremi_channels::MessageChannel;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::analysis::{ChatTurn, ConversationAnalyzer};
use crate::storage::{ChatHistoryStore, ChatRole, HISTORY_LIMIT};

/// Replies are generated in this language; WhatsApp carries no preference
pub const DEFAULT_LANGUAGE: &str = "en";

/// A text message pulled out of a webhook notification
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingText {
    pub from: String,
    pub text: String,
    pub message_id: String,
}

/// First text message of the first change of the first entry.
///
/// Status updates, media messages and malformed payloads yield `None`.
pub fn extract_text_message(payload: &Value) -> Option<IncomingText> {
    let messages = payload["entry"][0]["changes"][0]["value"]["messages"].as_array()?;

    messages.iter().find_map(|msg| {
        if msg["type"].as_str() != Some("text") {
            return None;
        }
        let from = msg["from"].as_str()?.trim();
        let text = msg["text"]["body"].as_str()?;
        if from.is_empty() || text.trim().is_empty() {
            return None;
        }
        Some(IncomingText {
            from: from.to_string(),
            text: text.to_string(),
            message_id: msg["id"].as_str().unwrap_or_default().to_string(),
        })
    })
}

/// Subscription handshake: the challenge to echo, or `None` to reject.
///
/// Requests are rejected when no verify token is configured.
pub fn verify_subscription<'a>(
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&'a str>,
    expected_token: Option<&str>,
) -> Option<&'a str> {
    let expected = expected_token?;
    if mode == Some("subscribe") && token == Some(expected) {
        Some(challenge.unwrap_or_default())
    } else {
        None
    }
}

/// Answers incoming WhatsApp messages
pub struct WhatsAppResponder {
    history: Arc<dyn ChatHistoryStore>,
    analyzer: Arc<dyn ConversationAnalyzer>,
    messenger: Arc<dyn MessageChannel>,
}

impl WhatsAppResponder {
    pub fn new(
        history: Arc<dyn ChatHistoryStore>,
        analyzer: Arc<dyn ConversationAnalyzer>,
        messenger: Arc<dyn MessageChannel>,
    ) -> Self {
        Self {
            history,
            analyzer,
            messenger,
        }
    }

    /// Reply to one message and return the reply text.
    ///
    /// The model sees the `HISTORY_LIMIT` messages that precede this one.
    /// History failures are logged and the reply goes out with whatever context
    /// was available. Only a failed send is an error.
    pub async fn handle_incoming(&self, message: &IncomingText) -> Result<String> {
        info!("💬 WhatsApp message from {}", message.from);

        if !message.message_id.is_empty() {
            if let Err(e) = self.messenger.mark_as_read(&message.message_id).await {
                warn!("Failed to mark message {} as read: {}", message.message_id, e);
            }
        }

        let stored = match self
            .history
            .append(&message.from, ChatRole::User, &message.text)
        {
            Ok(m) => Some(m.id),
            Err(e) => {
                warn!("Failed to store message from {}: {:#}", message.from, e);
                None
            }
        };

        let context = match self.history.recent(&message.from, HISTORY_LIMIT + 1) {
            Ok(mut recent) => {
                // The message being answered is passed separately as the input
                if stored.is_some() && recent.last().map(|m| m.id) == stored {
                    recent.pop();
                }
                let excess = recent.len().saturating_sub(HISTORY_LIMIT as usize);
                recent.drain(..excess);
                recent
                    .into_iter()
                    .map(|m| ChatTurn::new(m.role.as_str(), m.content))
                    .collect()
            }
            Err(e) => {
                warn!("Failed to load history for {}: {:#}", message.from, e);
                Vec::new()
            }
        };
        debug!("Replying with {} prior message(s) as context", context.len());

        let reply = self
            .analyzer
            .generate_response(&context, &message.text, DEFAULT_LANGUAGE)
            .await;

        if let Err(e) = self.history.append(&message.from, ChatRole::Model, &reply) {
            warn!("Failed to store reply to {}: {:#}", message.from, e);
        }

        self.messenger
            .send_message(&message.from, &reply)
            .await
            .with_context(|| format!("Failed to send reply to {}", message.from))?;

        Ok(reply)
    }
}
