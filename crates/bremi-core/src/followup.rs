//! Follow-up records and their persistence
//!
//! A `ScheduledFollowUp` is created `pending` and moves to exactly one terminal
//! status. Two stores implement `FollowUpStore`:
//! - `PgFollowUpStore`: PostgreSQL via Diesel
//! - `InMemoryFollowUpStore`: process-local, for development without a database

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::Text;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::schema::scheduled_followups;

// ============================================================================
// Types
// ============================================================================

/// Follow-up status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpStatus {
    Pending,
    Sent,
    Failed,
    FailedNoEmail,
    Cancelled,
}

impl FollowUpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FollowUpStatus::Pending => "pending",
            FollowUpStatus::Sent => "sent",
            FollowUpStatus::Failed => "failed",
            FollowUpStatus::FailedNoEmail => "failed_no_email",
            FollowUpStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, FollowUpStatus::Pending)
    }
}

impl FromStr for FollowUpStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(FollowUpStatus::Pending),
            "sent" => Ok(FollowUpStatus::Sent),
            "failed" => Ok(FollowUpStatus::Failed),
            "failed_no_email" => Ok(FollowUpStatus::FailedNoEmail),
            "cancelled" => Ok(FollowUpStatus::Cancelled),
            _ => Err(anyhow::anyhow!("Invalid follow-up status: {}", s)),
        }
    }
}

/// A judgement that a later check-in is warranted.
///
/// When `needs_followup` is false the other fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FollowUpPlan {
    pub needs_followup: bool,
    pub topic: String,
    pub context_summary: String,
    pub suggested_delay_hours: u32,
    pub email_draft: String,
}

impl FollowUpPlan {
    /// Plan returned when nothing warrants a check-in
    pub fn none() -> Self {
        Self::default()
    }

    /// Plan returned when the analysis itself failed
    pub fn analysis_failed(error: impl std::fmt::Display) -> Self {
        Self {
            needs_followup: false,
            topic: "Error".to_string(),
            context_summary: error.to_string(),
            suggested_delay_hours: 0,
            email_draft: String::new(),
        }
    }
}

/// A durable, time-triggered check-in
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledFollowUp {
    pub id: Uuid,
    pub user_id: String,
    pub user_email: Option<String>,
    pub topic: String,
    pub context_summary: String,
    pub email_content: String,
    pub fingerprint: String,
    pub status: FollowUpStatus,
    pub created_at: DateTime<Utc>,
    pub scheduled_time: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl ScheduledFollowUp {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == FollowUpStatus::Pending && self.scheduled_time <= now
    }

    /// The email to deliver to; blank addresses count as missing
    pub fn delivery_address(&self) -> Option<&str> {
        self.user_email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }
}

/// Values for a record about to be inserted
#[derive(Debug, Clone)]
pub struct NewFollowUp {
    pub user_id: String,
    pub user_email: Option<String>,
    pub topic: String,
    pub context_summary: String,
    pub email_content: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub scheduled_time: DateTime<Utc>,
}

impl NewFollowUp {
    fn into_record(self, id: Uuid) -> ScheduledFollowUp {
        ScheduledFollowUp {
            id,
            user_id: self.user_id,
            user_email: self.user_email,
            topic: self.topic,
            context_summary: self.context_summary,
            email_content: self.email_content,
            fingerprint: self.fingerprint,
            status: FollowUpStatus::Pending,
            created_at: self.created_at,
            scheduled_time: self.scheduled_time,
            processed_at: None,
        }
    }
}

/// Result of a conditional insert
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Created(ScheduledFollowUp),
    /// An open record with the same fingerprint already exists
    Duplicate(ScheduledFollowUp),
}

/// Durable storage for follow-up records
pub trait FollowUpStore: Send + Sync {
    /// Insert a new pending record
    fn insert(&self, new: NewFollowUp) -> Result<ScheduledFollowUp>;

    /// Insert unless a pending record with the same fingerprint exists
    fn insert_unless_open(&self, new: NewFollowUp) -> Result<InsertOutcome>;

    fn get(&self, id: Uuid) -> Result<Option<ScheduledFollowUp>>;

    /// Pending records with `scheduled_time <= now`, earliest first
    fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledFollowUp>>;

    /// All pending records, earliest first
    fn pending(&self) -> Result<Vec<ScheduledFollowUp>>;

    /// Move a record out of `pending`.
    ///
    /// Returns false (and changes nothing) if the record is missing or no longer pending.
    fn finish(&self, id: Uuid, status: FollowUpStatus, at: DateTime<Utc>) -> Result<bool>;
}

// ============================================================================
// PostgreSQL Store
// ============================================================================

/// Diesel model for inserting a record
#[derive(Insertable)]
#[diesel(table_name = scheduled_followups)]
struct NewFollowUpRow<'a> {
    id: Uuid,
    user_id: &'a str,
    user_email: Option<&'a str>,
    topic: &'a str,
    context_summary: &'a str,
    email_content: &'a str,
    fingerprint: &'a str,
    status: &'a str,
    created_at: DateTime<Utc>,
    scheduled_time: DateTime<Utc>,
}

/// Diesel model for querying records
#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = scheduled_followups)]
struct FollowUpRow {
    id: Uuid,
    user_id: String,
    user_email: Option<String>,
    topic: String,
    context_summary: String,
    email_content: String,
    fingerprint: String,
    status: String,
    created_at: DateTime<Utc>,
    scheduled_time: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<FollowUpRow> for ScheduledFollowUp {
    type Error = anyhow::Error;

    fn try_from(row: FollowUpRow) -> Result<Self> {
        Ok(ScheduledFollowUp {
            id: row.id,
            user_id: row.user_id,
            user_email: row.user_email,
            topic: row.topic,
            context_summary: row.context_summary,
            email_content: row.email_content,
            fingerprint: row.fingerprint,
            status: FollowUpStatus::from_str(&row.status)?,
            created_at: row.created_at,
            scheduled_time: row.scheduled_time,
            processed_at: row.processed_at,
        })
    }
}

pub struct PgFollowUpStore {
    conn: Arc<Mutex<PgConnection>>,
}

impl PgFollowUpStore {
    /// Create a store with a shared connection
    pub fn new(conn: Arc<Mutex<PgConnection>>) -> Self {
        Self { conn }
    }
}

fn insert_row(conn: &mut PgConnection, new: &NewFollowUp) -> Result<ScheduledFollowUp> {
    let row = NewFollowUpRow {
        id: Uuid::new_v4(),
        user_id: &new.user_id,
        user_email: new.user_email.as_deref(),
        topic: &new.topic,
        context_summary: &new.context_summary,
        email_content: &new.email_content,
        fingerprint: &new.fingerprint,
        status: FollowUpStatus::Pending.as_str(),
        created_at: new.created_at,
        scheduled_time: new.scheduled_time,
    };

    let inserted: FollowUpRow = diesel::insert_into(scheduled_followups::table)
        .values(&row)
        .returning(FollowUpRow::as_returning())
        .get_result(conn)
        .context("Failed to insert scheduled follow-up")?;

    ScheduledFollowUp::try_from(inserted)
}

impl FollowUpStore for PgFollowUpStore {
    fn insert(&self, new: NewFollowUp) -> Result<ScheduledFollowUp> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        insert_row(&mut *conn, &new)
    }

    fn insert_unless_open(&self, new: NewFollowUp) -> Result<InsertOutcome> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            // Serialize inserts per fingerprint for the rest of the transaction
            diesel::sql_query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind::<Text, _>(new.fingerprint.as_str())
                .execute(conn)
                .context("Failed to take fingerprint lock")?;

            let existing: Option<FollowUpRow> = scheduled_followups::table
                .filter(scheduled_followups::fingerprint.eq(&new.fingerprint))
                .filter(scheduled_followups::status.eq(FollowUpStatus::Pending.as_str()))
                .order(scheduled_followups::scheduled_time.asc())
                .select(FollowUpRow::as_select())
                .first(conn)
                .optional()
                .context("Failed to query open follow-ups")?;

            match existing {
                Some(row) => Ok(InsertOutcome::Duplicate(ScheduledFollowUp::try_from(row)?)),
                None => Ok(InsertOutcome::Created(insert_row(conn, &new)?)),
            }
        })
    }

    fn get(&self, id: Uuid) -> Result<Option<ScheduledFollowUp>> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let row: Option<FollowUpRow> = scheduled_followups::table
            .filter(scheduled_followups::id.eq(id))
            .select(FollowUpRow::as_select())
            .first(&mut *conn)
            .optional()
            .context("Failed to query follow-up")?;

        row.map(ScheduledFollowUp::try_from).transpose()
    }

    fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledFollowUp>> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let rows: Vec<FollowUpRow> = scheduled_followups::table
            .filter(scheduled_followups::status.eq(FollowUpStatus::Pending.as_str()))
            .filter(scheduled_followups::scheduled_time.le(now))
            .order(scheduled_followups::scheduled_time.asc())
            .select(FollowUpRow::as_select())
            .load(&mut *conn)
            .context("Failed to query due follow-ups")?;

        rows.into_iter().map(ScheduledFollowUp::try_from).collect()
    }

    fn pending(&self) -> Result<Vec<ScheduledFollowUp>> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let rows: Vec<FollowUpRow> = scheduled_followups::table
            .filter(scheduled_followups::status.eq(FollowUpStatus::Pending.as_str()))
            .order(scheduled_followups::scheduled_time.asc())
            .select(FollowUpRow::as_select())
            .load(&mut *conn)
            .context("Failed to query pending follow-ups")?;

        rows.into_iter().map(ScheduledFollowUp::try_from).collect()
    }

    fn finish(&self, id: Uuid, status: FollowUpStatus, at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let updated = diesel::update(
            scheduled_followups::table
                .filter(scheduled_followups::id.eq(id))
                .filter(scheduled_followups::status.eq(FollowUpStatus::Pending.as_str())),
        )
        .set((
            scheduled_followups::status.eq(status.as_str()),
            scheduled_followups::processed_at.eq(Some(at)),
        ))
        .execute(&mut *conn)
        .with_context(|| format!("Failed to mark follow-up {} as {}", id, status.as_str()))?;

        Ok(updated > 0)
    }
}

// ============================================================================
// In-Memory Store
// ============================================================================

#[derive(Default)]
pub struct InMemoryFollowUpStore {
    records: Mutex<Vec<ScheduledFollowUp>>,
}

impl InMemoryFollowUpStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record regardless of status, in insertion order
    pub fn all(&self) -> Result<Vec<ScheduledFollowUp>> {
        let records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        Ok(records.clone())
    }
}

impl FollowUpStore for InMemoryFollowUpStore {
    fn insert(&self, new: NewFollowUp) -> Result<ScheduledFollowUp> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let record = new.into_record(Uuid::new_v4());
        records.push(record.clone());
        Ok(record)
    }

    fn insert_unless_open(&self, new: NewFollowUp) -> Result<InsertOutcome> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        if let Some(existing) = records
            .iter()
            .filter(|r| r.status == FollowUpStatus::Pending && r.fingerprint == new.fingerprint)
            .min_by_key(|r| r.scheduled_time)
        {
            return Ok(InsertOutcome::Duplicate(existing.clone()));
        }

        let record = new.into_record(Uuid::new_v4());
        records.push(record.clone());
        Ok(InsertOutcome::Created(record))
    }

    fn get(&self, id: Uuid) -> Result<Option<ScheduledFollowUp>> {
        let records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledFollowUp>> {
        let records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut due: Vec<ScheduledFollowUp> =
            records.iter().filter(|r| r.is_due(now)).cloned().collect();
        due.sort_by_key(|r| r.scheduled_time);
        Ok(due)
    }

    fn pending(&self) -> Result<Vec<ScheduledFollowUp>> {
        let records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut pending: Vec<ScheduledFollowUp> = records
            .iter()
            .filter(|r| r.status == FollowUpStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.scheduled_time);
        Ok(pending)
    }

    fn finish(&self, id: Uuid, status: FollowUpStatus, at: DateTime<Utc>) -> Result<bool> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        match records
            .iter_mut()
            .find(|r| r.id == id && r.status == FollowUpStatus::Pending)
        {
            Some(record) => {
                record.status = status;
                record.processed_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
    }

    fn new_followup(fingerprint: &str, scheduled_time: DateTime<Utc>) -> NewFollowUp {
        NewFollowUp {
            user_id: "user-1".to_string(),
            user_email: Some("ada@example.com".to_string()),
            topic: "Job Interview".to_string(),
            context_summary: "Interview tomorrow".to_string(),
            email_content: "How did it go?".to_string(),
            fingerprint: fingerprint.to_string(),
            created_at: at(0),
            scheduled_time,
        }
    }

    #[test]
    fn test_status_round_trip_and_terminality() {
        for status in [
            FollowUpStatus::Pending,
            FollowUpStatus::Sent,
            FollowUpStatus::Failed,
            FollowUpStatus::FailedNoEmail,
            FollowUpStatus::Cancelled,
        ] {
            assert_eq!(FollowUpStatus::from_str(status.as_str()).unwrap(), status);
            assert_eq!(status.is_terminal(), status != FollowUpStatus::Pending);
        }
        assert!(FollowUpStatus::from_str("running").is_err());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(FollowUpStatus::FailedNoEmail).unwrap(),
            "failed_no_email"
        );
    }

    #[test]
    fn test_delivery_address_ignores_blank() {
        let store = InMemoryFollowUpStore::new();
        let mut new = new_followup("fp", at(1));
        new.user_email = Some("   ".to_string());
        let record = store.insert(new).unwrap();
        assert_eq!(record.delivery_address(), None);

        let record = store.insert(new_followup("fp", at(1))).unwrap();
        assert_eq!(record.delivery_address(), Some("ada@example.com"));
    }

    #[test]
    fn test_due_filters_by_time_and_status() {
        let store = InMemoryFollowUpStore::new();
        let late = store.insert(new_followup("a", at(5))).unwrap();
        let early = store.insert(new_followup("b", at(2))).unwrap();
        let future = store.insert(new_followup("c", at(9))).unwrap();

        let due = store.due(at(5)).unwrap();
        assert_eq!(
            due.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![early.id, late.id]
        );

        assert!(store.finish(early.id, FollowUpStatus::Sent, at(5)).unwrap());
        let due = store.due(at(5)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, late.id);

        let pending = store.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().any(|r| r.id == future.id));
    }

    #[test]
    fn test_finish_only_from_pending() {
        let store = InMemoryFollowUpStore::new();
        let record = store.insert(new_followup("a", at(1))).unwrap();

        assert!(store.finish(record.id, FollowUpStatus::Failed, at(2)).unwrap());
        assert!(!store.finish(record.id, FollowUpStatus::Sent, at(3)).unwrap());
        assert!(!store.finish(Uuid::new_v4(), FollowUpStatus::Sent, at(3)).unwrap());

        let stored = store.get(record.id).unwrap().unwrap();
        assert_eq!(stored.status, FollowUpStatus::Failed);
        assert_eq!(stored.processed_at, Some(at(2)));
    }

    #[test]
    fn test_insert_unless_open() {
        let store = InMemoryFollowUpStore::new();
        let first = match store.insert_unless_open(new_followup("fp", at(3))).unwrap() {
            InsertOutcome::Created(r) => r,
            other => panic!("expected Created, got {:?}", other),
        };

        match store.insert_unless_open(new_followup("fp", at(4))).unwrap() {
            InsertOutcome::Duplicate(r) => assert_eq!(r.id, first.id),
            other => panic!("expected Duplicate, got {:?}", other),
        }

        // Once the open record is processed a new one may be created
        store.finish(first.id, FollowUpStatus::Sent, at(3)).unwrap();
        assert!(matches!(
            store.insert_unless_open(new_followup("fp", at(3) + Duration::hours(24))).unwrap(),
            InsertOutcome::Created(_)
        ));
        assert_eq!(store.all().unwrap().len(), 2);
    }
}
