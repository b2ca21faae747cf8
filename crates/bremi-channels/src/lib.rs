//! Bremi Channels - outbound delivery transports
//!
//! Channels are organized by transport:
//! - email: SMTP check-in mail (lettre) and a logging mock
//! - whatsapp: WhatsApp Cloud API client and a logging mock
//!
//! Real and mock variants implement the same trait so callers pick one at startup.

pub mod email;
pub mod whatsapp;

use std::time::Duration;

pub use email::{CheckupEmail, EmailChannel, LogMailer, SmtpConfig, SmtpMailer};
pub use whatsapp::{MessageChannel, MockWhatsApp, WhatsAppClient, WhatsAppConfig};

/// Total budget for a single outbound network call
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Connection-establishment budget for outbound HTTP calls
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Invalid address '{address}': {reason}")]
    Address { address: String, reason: String },
    #[error("Failed to build email: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("Channel not configured: {0}")]
    NotConfigured(String),
}
