//! Bremi Core Library
//!
//! Follow-up scheduling and delivery for the Bremi companion service, plus the
//! HTTP API and WhatsApp webhook that feed it.

pub mod analysis;
pub mod api;
pub mod config;
pub mod dispatch;
pub mod followup;
pub mod scheduler;
pub mod schema;
pub mod storage;
pub mod sweeper;
pub mod webhook;

use anyhow::{Context, Result};
use diesel::prelude::*;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::sync::{Arc, Mutex};

// Re-export key types for convenience
pub use analysis::{ChatTurn, ConversationAnalyzer, DspyAnalyzer, RiskAssessment, RiskLevel};
pub use config::Config;
pub use dispatch::DeliveryDispatcher;
pub use followup::{FollowUpPlan, FollowUpStatus, FollowUpStore, ScheduledFollowUp};
pub use scheduler::{FollowUpScheduler, ScheduleOutcome};
pub use storage::{ChatHistoryStore, ChatRole};
pub use sweeper::{spawn_sweeper, SweepReport, Sweeper, SweeperHandle};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Persistence handles shared by the API and the sweeper
pub struct Stores {
    pub followups: Arc<dyn FollowUpStore>,
    pub history: Arc<dyn ChatHistoryStore>,
}

impl Stores {
    /// Connect to PostgreSQL and apply pending migrations
    pub fn postgres(database_url: &str) -> Result<Self> {
        let mut conn =
            PgConnection::establish(database_url).context("Failed to connect to database")?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("Migration failed: {}", e))?;
        tracing::info!("Database migrations applied");

        let conn = Arc::new(Mutex::new(conn));
        Ok(Self {
            followups: Arc::new(followup::PgFollowUpStore::new(conn.clone())),
            history: Arc::new(storage::PgChatHistoryStore::new(conn)),
        })
    }

    /// Process-local stores; nothing survives a restart
    pub fn in_memory() -> Self {
        Self {
            followups: Arc::new(followup::InMemoryFollowUpStore::new()),
            history: Arc::new(storage::InMemoryChatHistoryStore::new()),
        }
    }
}
