//! Per-user chat history used as context for WhatsApp replies
//!
//! Messages are ordered by a monotonically increasing `sequence_id`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::Serialize;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::schema::chat_history;

/// Number of prior messages loaded as reply context
pub const HISTORY_LIMIT: i64 = 20;

/// Who wrote a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Model => "model",
        }
    }
}

impl FromStr for ChatRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(ChatRole::User),
            "model" | "assistant" => Ok(ChatRole::Model),
            _ => Err(anyhow::anyhow!("Invalid chat role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub user_id: String,
    pub role: ChatRole,
    pub content: String,
    pub sequence_id: i64,
    pub created_at: DateTime<Utc>,
}

pub trait ChatHistoryStore: Send + Sync {
    fn append(&self, user_id: &str, role: ChatRole, content: &str) -> Result<ChatMessage>;

    /// The latest `limit` messages for a user, oldest first
    fn recent(&self, user_id: &str, limit: i64) -> Result<Vec<ChatMessage>>;
}

/// Message row from the database
#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = chat_history)]
struct ChatRow {
    id: Uuid,
    user_id: String,
    role: String,
    content: String,
    sequence_id: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<ChatRow> for ChatMessage {
    type Error = anyhow::Error;

    fn try_from(row: ChatRow) -> Result<Self> {
        Ok(ChatMessage {
            id: row.id,
            user_id: row.user_id,
            role: ChatRole::from_str(&row.role)?,
            content: row.content,
            sequence_id: row.sequence_id,
            created_at: row.created_at,
        })
    }
}

/// New message to insert; `sequence_id` is assigned by the database
#[derive(Insertable)]
#[diesel(table_name = chat_history)]
struct NewChatRow<'a> {
    id: Uuid,
    user_id: &'a str,
    role: &'a str,
    content: &'a str,
}

pub struct PgChatHistoryStore {
    conn: Arc<Mutex<PgConnection>>,
}

impl PgChatHistoryStore {
    pub fn new(conn: Arc<Mutex<PgConnection>>) -> Self {
        Self { conn }
    }
}

impl ChatHistoryStore for PgChatHistoryStore {
    fn append(&self, user_id: &str, role: ChatRole, content: &str) -> Result<ChatMessage> {
        let row = NewChatRow {
            id: Uuid::new_v4(),
            user_id,
            role: role.as_str(),
            content,
        };

        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let inserted: ChatRow = diesel::insert_into(chat_history::table)
            .values(&row)
            .returning(ChatRow::as_returning())
            .get_result(&mut *conn)
            .context("Failed to store chat message")?;

        ChatMessage::try_from(inserted)
    }

    fn recent(&self, user_id: &str, limit: i64) -> Result<Vec<ChatMessage>> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let rows: Vec<ChatRow> = chat_history::table
            .filter(chat_history::user_id.eq(user_id))
            .order(chat_history::sequence_id.desc())
            .limit(limit)
            .select(ChatRow::as_select())
            .load(&mut *conn)
            .context("Failed to load chat history")?;

        // Reverse to get chronological order
        rows.into_iter()
            .rev()
            .map(ChatMessage::try_from)
            .collect()
    }
}

#[derive(Default)]
pub struct InMemoryChatHistoryStore {
    messages: Mutex<Vec<ChatMessage>>,
}

impl InMemoryChatHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChatHistoryStore for InMemoryChatHistoryStore {
    fn append(&self, user_id: &str, role: ChatRole, content: &str) -> Result<ChatMessage> {
        let mut messages = self
            .messages
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let message = ChatMessage {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            role,
            content: content.to_string(),
            sequence_id: messages.len() as i64 + 1,
            created_at: Utc::now(),
        };
        messages.push(message.clone());
        Ok(message)
    }

    fn recent(&self, user_id: &str, limit: i64) -> Result<Vec<ChatMessage>> {
        let messages = self
            .messages
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut recent: Vec<ChatMessage> = messages
            .iter()
            .rev()
            .filter(|m| m.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }
}
