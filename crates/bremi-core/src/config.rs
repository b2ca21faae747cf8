use anyhow::{Context, Result};
use bremi_channels::{
    EmailChannel, LogMailer, MessageChannel, MockWhatsApp, SmtpConfig, SmtpMailer,
    WhatsAppClient, WhatsAppConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Gemini's OpenAI-compatible endpoint
pub const DEFAULT_LLM_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai/";

#[derive(Debug, Clone)]
pub struct Config {
    /// Deployment environment name, lowercased
    pub environment: String,

    /// Unset outside production means in-memory stores
    pub database_url: Option<String>,

    pub llm_api_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,

    // SMTP
    pub smtp_server: String,
    pub smtp_port: u16,
    pub smtp_login: Option<String>,
    pub smtp_password: Option<String>,
    pub sender_email: Option<String>,
    pub sender_name: String,
    pub email_mock_mode: bool,

    // WhatsApp Cloud API
    pub whatsapp_access_token: Option<String>,
    pub phone_number_id: Option<String>,
    pub whatsapp_api_version: String,
    pub whatsapp_verify_token: Option<String>,
    pub whatsapp_mock_mode: bool,

    pub http_port: u16,
    pub sweep_interval: Duration,
    pub followup_dedupe: bool,
    /// CORS origins for the web frontend
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Blank values count as unset.
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let flag = |key: &str| {
            get(key)
                .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(false)
        };

        let environment = get("ENVIRONMENT")
            .or_else(|| get("APP_ENV"))
            .unwrap_or_else(|| "development".to_string())
            .to_lowercase();

        let config = Self {
            environment,

            database_url: get("DATABASE_URL"),

            llm_api_url: get("LLM_API_URL").unwrap_or_else(|| DEFAULT_LLM_API_URL.to_string()),
            llm_api_key: get("GEMINI_API_KEY"),
            llm_model: get("LLM_MODEL").unwrap_or_else(|| "gemini-2.5-flash".to_string()),

            smtp_server: get("SMTP_SERVER").unwrap_or_else(|| "smtp-relay.brevo.com".to_string()),
            smtp_port: get("SMTP_PORT")
                .unwrap_or_else(|| "587".to_string())
                .parse()
                .context("SMTP_PORT must be a valid port number")?,
            smtp_login: get("SMTP_LOGIN"),
            smtp_password: get("SMTP_PASSWORD"),
            sender_email: get("SENDER_EMAIL"),
            sender_name: get("SENDER_NAME").unwrap_or_else(|| "Bremi.Ai".to_string()),
            email_mock_mode: flag("EMAIL_MOCK_MODE"),

            whatsapp_access_token: get("WHATSAPP_ACCESS_TOKEN"),
            phone_number_id: get("PHONE_NUMBER_ID"),
            whatsapp_api_version: get("WHATSAPP_API_VERSION")
                .unwrap_or_else(|| "v17.0".to_string()),
            whatsapp_verify_token: get("WHATSAPP_VERIFY_TOKEN"),
            whatsapp_mock_mode: flag("WHATSAPP_MOCK_MODE"),

            http_port: get("HTTP_PORT")
                .unwrap_or_else(|| "8000".to_string())
                .parse()
                .context("HTTP_PORT must be a valid port number")?,
            sweep_interval: Duration::from_secs(
                get("SWEEP_INTERVAL_SECS")
                    .unwrap_or_else(|| "30".to_string())
                    .parse::<u64>()
                    .context("SWEEP_INTERVAL_SECS must be a whole number of seconds")?
                    .max(1),
            ),
            followup_dedupe: flag("FOLLOWUP_DEDUPE"),
            allowed_origins: get("ALLOWED_ORIGINS")
                .map(|s| {
                    s.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| {
                    vec![
                        "http://localhost:3000".to_string(),
                        "http://127.0.0.1:3000".to_string(),
                    ]
                }),
        };

        if config.is_production() && config.database_url.is_none() {
            anyhow::bail!("DATABASE_URL must be set in {}", config.environment);
        }

        Ok(config)
    }

    /// Production-like environments fail fast on missing credentials
    pub fn is_production(&self) -> bool {
        matches!(self.environment.as_str(), "production" | "staging")
    }

    /// SMTP settings, if login and password are both present.
    /// The sender address defaults to the SMTP login.
    pub fn smtp_config(&self) -> Option<SmtpConfig> {
        let login = self.smtp_login.clone()?;
        let password = self.smtp_password.clone()?;
        Some(SmtpConfig {
            host: self.smtp_server.clone(),
            port: self.smtp_port,
            sender_email: self.sender_email.clone().unwrap_or_else(|| login.clone()),
            sender_name: self.sender_name.clone(),
            login,
            password,
        })
    }

    /// WhatsApp settings, if token and phone number id are both present
    pub fn whatsapp_config(&self) -> Option<WhatsAppConfig> {
        Some(WhatsAppConfig::new(
            self.whatsapp_access_token.clone()?,
            self.phone_number_id.clone()?,
            self.whatsapp_api_version.clone(),
        ))
    }

    /// Select the follow-up email transport
    pub fn email_channel(&self) -> Result<Arc<dyn EmailChannel>> {
        let Some(smtp) = self.smtp_config() else {
            if self.is_production() {
                anyhow::bail!(
                    "SMTP_LOGIN and SMTP_PASSWORD are required in {}",
                    self.environment
                );
            }
            warn!("SMTP credentials not set - follow-up emails will be logged, not sent");
            return Ok(Arc::new(LogMailer));
        };

        if self.email_mock_mode {
            info!("EMAIL_MOCK_MODE enabled - follow-up emails will be logged, not sent");
            return Ok(Arc::new(LogMailer));
        }

        let mailer = SmtpMailer::new(&smtp).context("Failed to configure SMTP transport")?;
        info!("SMTP delivery via {}:{}", smtp.host, smtp.port);
        Ok(Arc::new(mailer))
    }

    /// Select the WhatsApp transport
    pub fn message_channel(&self) -> Result<Arc<dyn MessageChannel>> {
        let Some(whatsapp) = self.whatsapp_config() else {
            if self.is_production() {
                anyhow::bail!(
                    "WHATSAPP_ACCESS_TOKEN and PHONE_NUMBER_ID are required in {}",
                    self.environment
                );
            }
            warn!("WhatsApp credentials not set - replies will be logged, not sent");
            return Ok(Arc::new(MockWhatsApp));
        };

        if self.whatsapp_mock_mode {
            info!("WHATSAPP_MOCK_MODE enabled - replies will be logged, not sent");
            return Ok(Arc::new(MockWhatsApp));
        }

        let client = WhatsAppClient::new(whatsapp).context("Failed to configure WhatsApp client")?;
        Ok(Arc::new(client))
    }
}
