//! Follow-up Scheduler
//!
//! Turns a `FollowUpPlan` into a durable pending record due at
//! `created_at + suggested_delay_hours`.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::followup::{
    FollowUpPlan, FollowUpStatus, FollowUpStore, InsertOutcome, NewFollowUp, ScheduledFollowUp,
};

/// Upper bound on a plan's delay (one year)
pub const MAX_DELAY_HOURS: u32 = 24 * 365;

/// What a scheduling call did
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    /// The plan did not ask for a follow-up
    NoAction,
    Scheduled(ScheduledFollowUp),
    /// Deduplication found an open record for the same user and topic
    Duplicate(ScheduledFollowUp),
}

impl ScheduleOutcome {
    pub fn record(&self) -> Option<&ScheduledFollowUp> {
        match self {
            ScheduleOutcome::NoAction => None,
            ScheduleOutcome::Scheduled(r) | ScheduleOutcome::Duplicate(r) => Some(r),
        }
    }

    pub fn handle(&self) -> Option<ScheduledHandle> {
        self.record().map(|r| ScheduledHandle {
            id: r.id,
            topic: r.topic.clone(),
            time: r.scheduled_time,
            duplicate: matches!(self, ScheduleOutcome::Duplicate(_)),
        })
    }
}

/// Summary of a scheduled record returned to API callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledHandle {
    pub id: Uuid,
    pub topic: String,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

/// Due time for a plan analysed at `now`
pub fn trigger_time(now: DateTime<Utc>, delay_hours: u32) -> DateTime<Utc> {
    now + Duration::hours(i64::from(delay_hours.min(MAX_DELAY_HOURS)))
}

/// Dedup key for a user's check-in about a topic.
///
/// Case and runs of whitespace are ignored.
pub fn fingerprint(user_id: &str, topic: &str) -> String {
    let topic = topic
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    format!("{}|{}", user_id.trim().to_lowercase(), topic)
}

pub struct FollowUpScheduler {
    store: Arc<dyn FollowUpStore>,
    dedupe: bool,
}

impl FollowUpScheduler {
    pub fn new(store: Arc<dyn FollowUpStore>, dedupe: bool) -> Self {
        Self { store, dedupe }
    }

    pub fn store(&self) -> &Arc<dyn FollowUpStore> {
        &self.store
    }

    /// Schedule a follow-up for a plan produced just now
    pub fn schedule(
        &self,
        plan: &FollowUpPlan,
        user_id: &str,
        user_email: Option<&str>,
    ) -> Result<ScheduleOutcome> {
        self.schedule_at(plan, user_id, user_email, Utc::now())
    }

    /// Schedule a follow-up as if the plan was produced at `now`
    pub fn schedule_at(
        &self,
        plan: &FollowUpPlan,
        user_id: &str,
        user_email: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome> {
        if !plan.needs_followup {
            return Ok(ScheduleOutcome::NoAction);
        }

        if plan.suggested_delay_hours > MAX_DELAY_HOURS {
            tracing::warn!(
                "Follow-up delay of {}h for '{}' capped at {}h",
                plan.suggested_delay_hours,
                plan.topic,
                MAX_DELAY_HOURS
            );
        }

        let new = NewFollowUp {
            user_id: user_id.to_string(),
            user_email: user_email
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string),
            topic: plan.topic.clone(),
            context_summary: plan.context_summary.clone(),
            email_content: plan.email_draft.clone(),
            fingerprint: fingerprint(user_id, &plan.topic),
            created_at: now,
            scheduled_time: trigger_time(now, plan.suggested_delay_hours),
        };

        let outcome = if self.dedupe {
            match self.store.insert_unless_open(new)? {
                InsertOutcome::Created(record) => ScheduleOutcome::Scheduled(record),
                InsertOutcome::Duplicate(record) => {
                    tracing::info!(
                        "Follow-up '{}' for {} already pending ({}), not scheduling again",
                        record.topic,
                        record.user_id,
                        record.id
                    );
                    return Ok(ScheduleOutcome::Duplicate(record));
                }
            }
        } else {
            ScheduleOutcome::Scheduled(self.store.insert(new)?)
        };

        if let Some(record) = outcome.record() {
            tracing::info!(
                "📅 Scheduled follow-up '{}' for {} at {}",
                record.topic,
                record.user_id,
                record.scheduled_time.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }

        Ok(outcome)
    }

    /// Cancel a pending follow-up. Returns false if it was not pending.
    pub fn cancel(&self, id: Uuid) -> Result<bool> {
        let cancelled = self
            .store
            .finish(id, FollowUpStatus::Cancelled, Utc::now())?;
        if cancelled {
            tracing::info!("Cancelled follow-up {}", id);
        }
        Ok(cancelled)
    }
}
