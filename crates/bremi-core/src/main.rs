use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bremi_core::api::{self, AppState};
use bremi_core::dispatch::{DeliveryDispatcher, SEND_TIMEOUT};
use bremi_core::webhook::WhatsAppResponder;
use bremi_core::{spawn_sweeper, Config, DspyAnalyzer, FollowUpScheduler, Stores, Sweeper};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "bremi=debug,bremi_core=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🌱 Bremi starting up...");

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    info!("Configuration loaded ({})", config.environment);
    info!("  LLM API: {}", config.llm_api_url);
    info!("  Model: {}", config.llm_model);

    // Stores (migrations run on connect)
    let stores = match &config.database_url {
        Some(url) => Stores::postgres(url)?,
        None => {
            warn!("DATABASE_URL not set - using in-memory stores, follow-ups will not survive a restart");
            Stores::in_memory()
        }
    };

    // Configure DSRs LM globally (required before any analysis)
    let api_key = match &config.llm_api_key {
        Some(key) => key.clone(),
        None if config.is_production() => {
            anyhow::bail!("GEMINI_API_KEY must be set in {}", config.environment)
        }
        None => {
            warn!("GEMINI_API_KEY not set - analysis will return fallback results");
            String::new()
        }
    };
    DspyAnalyzer::configure_lm(&config.llm_api_url, &api_key, &config.llm_model).await?;
    info!("DSRs LM configured");

    // Outbound channels
    let email = config.email_channel()?;
    let messenger = config.message_channel()?;
    info!("Email channel: {}, WhatsApp channel: {}", email.name(), messenger.name());

    let analyzer = Arc::new(DspyAnalyzer::new());
    let scheduler = Arc::new(FollowUpScheduler::new(
        stores.followups.clone(),
        config.followup_dedupe,
    ));
    if config.followup_dedupe {
        info!("Follow-up deduplication enabled");
    }

    // Background sweeper
    let sweeper = Arc::new(Sweeper::new(
        stores.followups.clone(),
        DeliveryDispatcher::new(email, SEND_TIMEOUT),
    ));
    let sweeper_handle = spawn_sweeper(sweeper, config.sweep_interval);
    info!(
        "Follow-up sweeper started (every {}s)",
        config.sweep_interval.as_secs()
    );

    if config.whatsapp_verify_token.is_none() {
        warn!("WHATSAPP_VERIFY_TOKEN not set - webhook verification will be rejected");
    }

    let state = AppState {
        scheduler,
        analyzer: analyzer.clone(),
        responder: Arc::new(WhatsAppResponder::new(
            stores.history.clone(),
            analyzer,
            messenger,
        )),
        verify_token: config.whatsapp_verify_token.clone(),
    };
    let app = api::router(state, &config.allowed_origins);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    info!("🌱 Bremi listening on port {}", config.http_port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutting down...");
        })
        .await?;

    sweeper_handle.shutdown().await;
    info!("🌱 Bremi has shut down.");

    Ok(())
}
