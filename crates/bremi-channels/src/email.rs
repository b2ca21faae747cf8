//! Check-in email delivery
//!
//! `SmtpMailer` submits a multipart HTML message over SMTP with STARTTLS and login.
//! `LogMailer` logs the message instead, for development and mock mode.

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{error, info};

use crate::{ChannelError, REQUEST_TIMEOUT};

/// A check-in email addressed to one recipient
#[derive(Debug, Clone, PartialEq)]
pub struct CheckupEmail {
    pub to: String,
    /// Greeting name used in the salutation and the `To` header
    pub name: String,
    pub topic: String,
    pub content: String,
}

impl CheckupEmail {
    pub fn subject(&self) -> String {
        format!("Checking in: {}", self.topic)
    }

    pub fn html_body(&self) -> String {
        format!(
            "<html>\n  <body>\n    <p>Hi {},</p>\n    <p>{}</p>\n    <br>\n    <p>Warmly,</p>\n    <p>Bremi</p>\n  </body>\n</html>\n",
            escape_html(&self.name),
            escape_html(&self.content).replace('\n', "<br>")
        )
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Trait for channels that can deliver check-in emails
#[async_trait]
pub trait EmailChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send_checkup(&self, email: &CheckupEmail) -> Result<(), ChannelError>;
}

/// SMTP submission settings
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
    pub sender_email: String,
    pub sender_name: String,
}

/// Real SMTP transport
pub struct SmtpMailer {
    sender: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, ChannelError> {
        let sender = mailbox(&config.sender_name, &config.sender_email)?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            .port(config.port)
            .credentials(Credentials::new(
                config.login.clone(),
                config.password.clone(),
            ))
            .timeout(Some(REQUEST_TIMEOUT))
            .build();

        Ok(Self { sender, transport })
    }

    fn build_message(&self, email: &CheckupEmail) -> Result<Message, ChannelError> {
        let recipient = mailbox(&email.name, &email.to)?;

        let message = Message::builder()
            .from(self.sender.clone())
            .to(recipient)
            .subject(email.subject())
            .multipart(MultiPart::mixed().singlepart(SinglePart::html(email.html_body())))?;

        Ok(message)
    }
}

fn mailbox(name: &str, address: &str) -> Result<Mailbox, ChannelError> {
    let parsed: Address = address.trim().parse().map_err(|e| ChannelError::Address {
        address: address.to_string(),
        reason: format!("{}", e),
    })?;
    Ok(Mailbox::new(Some(name.to_string()), parsed))
}

#[async_trait]
impl EmailChannel for SmtpMailer {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send_checkup(&self, email: &CheckupEmail) -> Result<(), ChannelError> {
        let message = self.build_message(email)?;

        match self.transport.send(message).await {
            Ok(_) => {
                info!("Email sent to {}", email.to);
                Ok(())
            }
            Err(e) => {
                error!("Error sending email to {}: {}", email.to, e);
                Err(e.into())
            }
        }
    }
}

/// Mock transport: logs the email and reports success
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl EmailChannel for LogMailer {
    fn name(&self) -> &str {
        "log"
    }

    async fn send_checkup(&self, email: &CheckupEmail) -> Result<(), ChannelError> {
        info!(
            to = %email.to,
            subject = %email.subject(),
            "[MOCK EMAIL] {}",
            email.content
        );
        Ok(())
    }
}
