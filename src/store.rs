use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

pub const DEFAULT_AGENT_NAME: &str = "default";

/// One part of a stored chat message. Tool calls are kept in the record but
/// excluded from summarization input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    ToolCall { name: String, arguments: serde_json::Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_db_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "assistant" => MessageRole::Assistant,
            _ => MessageRole::User,
        }
    }

    pub fn display_label(self) -> &'static str {
        match self {
            MessageRole::User => "User",
            MessageRole::Assistant => "Assistant",
        }
    }
}

/// A full conversation turn as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub agent_name: String,
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
    pub is_summary: bool,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Join the text-bearing parts; `None` when the message carries no text.
    pub fn text(&self) -> Option<String> {
        let texts: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::ToolCall { .. } => None,
            })
            .collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n"))
        }
    }
}

/// A text-only turn as exposed to the summary workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryTurn {
    pub role: MessageRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of one agent's conversation, filtered to text-bearing
/// turns. Computed fresh on every fetch, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSnapshot {
    pub message_count: usize,
    pub messages: Vec<SummaryTurn>,
    pub last_summarized: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    fn as_db_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => RunStatus::Running,
            "succeeded" => RunStatus::Succeeded,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub agent_name: String,
    pub status: RunStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
}

impl StepStatus {
    fn as_db_str(self) -> &'static str {
        match self {
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
        }
    }

    fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "succeeded" => StepStatus::Succeeded,
            _ => StepStatus::Failed,
        }
    }
}

/// Durable record of one named workflow step, keyed by (run id, step name).
/// A succeeded outcome is immutable and short-circuits re-execution on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub run_id: String,
    pub step_name: String,
    pub attempts: u32,
    pub status: StepStatus,
    pub result_json: Option<String>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

pub struct ConversationStore {
    conn: Mutex<Connection>,
    summary_history_cap: usize,
}

impl ConversationStore {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P, summary_history_cap: usize) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            summary_history_cap: summary_history_cap.max(1),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Create the database schema
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS agents (
                name TEXT PRIMARY KEY,
                last_summarized TEXT,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                agent_name TEXT NOT NULL,
                role TEXT NOT NULL,
                parts_json TEXT NOT NULL,
                is_summary INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_agent_created ON messages(agent_name, created_at)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS summaries (
                id TEXT PRIMARY KEY,
                agent_name TEXT NOT NULL,
                summary_text TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_summaries_agent_created ON summaries(agent_name, created_at)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS workflow_runs (
                id TEXT PRIMARY KEY,
                agent_name TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS workflow_steps (
                run_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                status TEXT NOT NULL,
                result_json TEXT,
                error TEXT,
                completed_at TEXT NOT NULL,
                PRIMARY KEY (run_id, step_name)
            )"#,
            [],
        )?;

        Ok(())
    }

    fn ensure_agent(conn: &Connection, agent_name: &str) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO agents (name, last_summarized, created_at)
             VALUES (?1, NULL, ?2)",
            params![agent_name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn normalize_agent(agent_name: &str) -> &str {
        let trimmed = agent_name.trim();
        if trimmed.is_empty() {
            DEFAULT_AGENT_NAME
        } else {
            trimmed
        }
    }

    // ==================== Messages ====================

    /// Append a conversation turn. Positional append: concurrent writers never
    /// clobber each other; ordering is decided here, not by the caller.
    pub fn append_message(
        &self,
        agent_name: &str,
        role: MessageRole,
        parts: &[MessagePart],
        is_summary: bool,
    ) -> Result<String> {
        let agent_name = Self::normalize_agent(agent_name);
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let parts_json =
            serde_json::to_string(parts).context("Failed to serialize message parts")?;

        let conn = self.lock_conn()?;
        Self::ensure_agent(&conn, agent_name)?;
        conn.execute(
            "INSERT INTO messages (id, agent_name, role, parts_json, is_summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                agent_name,
                role.as_db_str(),
                parts_json,
                is_summary as i64,
                now
            ],
        )?;
        Ok(id)
    }

    /// Append a plain text turn.
    pub fn append_text_message(
        &self,
        agent_name: &str,
        role: MessageRole,
        text: &str,
    ) -> Result<String> {
        self.append_message(
            agent_name,
            role,
            &[MessagePart::Text {
                text: text.to_string(),
            }],
            false,
        )
    }

    /// Surface a generated summary as a visible assistant turn, tagged so
    /// clients can style it differently.
    pub fn append_visible_summary(&self, agent_name: &str, summary_text: &str) -> Result<String> {
        let body = format!(
            "**Conversation Summary**\n\n{}\n\n_Generated automatically_",
            summary_text
        );
        self.append_message(
            agent_name,
            MessageRole::Assistant,
            &[MessagePart::Text { text: body }],
            true,
        )
    }

    /// Full message history for one agent, oldest first.
    pub fn get_messages(&self, agent_name: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let agent_name = Self::normalize_agent(agent_name);

        let conn = self.lock_conn()?;
        // rowid tie-break keeps insertion order for same-timestamp appends
        let mut stmt = conn.prepare(
            "SELECT id, agent_name, role, parts_json, is_summary, created_at FROM messages
             WHERE agent_name = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2",
        )?;

        let messages = stmt
            .query_map(params![agent_name, limit as i64], Self::map_message_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(messages.into_iter().rev().collect())
    }

    fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
        let role_raw: String = row.get(2)?;
        let parts_json: String = row.get(3)?;
        let parts: Vec<MessagePart> = serde_json::from_str(&parts_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(StoredMessage {
            id: row.get(0)?,
            agent_name: row.get(1)?,
            role: MessageRole::from_db(&role_raw),
            parts,
            is_summary: row.get::<_, i64>(4)? != 0,
            created_at: row.get::<_, String>(5)?.parse().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    5,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
        })
    }

    /// Count all messages recorded for one agent.
    pub fn count_messages(&self, agent_name: &str) -> Result<usize> {
        let agent_name = Self::normalize_agent(agent_name);
        let conn = self.lock_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(1) FROM messages WHERE agent_name = ?1",
            [agent_name],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count.max(0) as usize)
    }

    // ==================== Summary view ====================

    /// The workflow's read side: text-bearing turns in original order, plus
    /// the last-summarized marker. Turns with no text part (pure tool calls)
    /// are excluded from the view but never deleted.
    pub fn summary_view(&self, agent_name: &str) -> Result<ConversationSnapshot> {
        let agent_name = Self::normalize_agent(agent_name);

        let (messages, last_summarized) = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, agent_name, role, parts_json, is_summary, created_at FROM messages
                 WHERE agent_name = ?1
                 ORDER BY created_at ASC, rowid ASC",
            )?;
            let messages = stmt
                .query_map([agent_name], Self::map_message_row)?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);

            let last_summarized = Self::read_last_summarized(&conn, agent_name)?;
            (messages, last_summarized)
        };

        let turns: Vec<SummaryTurn> = messages
            .iter()
            .filter_map(|msg| {
                msg.text().map(|text| SummaryTurn {
                    role: msg.role,
                    text,
                    timestamp: msg.created_at,
                })
            })
            .collect();

        Ok(ConversationSnapshot {
            message_count: turns.len(),
            messages: turns,
            last_summarized,
        })
    }

    fn read_last_summarized(
        conn: &Connection,
        agent_name: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT last_summarized FROM agents WHERE name = ?1",
                [agent_name],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match raw.flatten() {
            Some(value) => Ok(Some(
                value
                    .parse()
                    .with_context(|| format!("Invalid last_summarized timestamp: {}", value))?,
            )),
            None => Ok(None),
        }
    }

    pub fn last_summarized(&self, agent_name: &str) -> Result<Option<DateTime<Utc>>> {
        let agent_name = Self::normalize_agent(agent_name);
        let conn = self.lock_conn()?;
        Self::read_last_summarized(&conn, agent_name)
    }

    // ==================== Summary records ====================

    /// Push a summary into the bounded history (newest kept, oldest evicted
    /// past the cap) and advance the last-summarized marker.
    pub fn append_summary_record(&self, agent_name: &str, summary_text: &str) -> Result<()> {
        let agent_name = Self::normalize_agent(agent_name);
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let conn = self.lock_conn()?;
        Self::ensure_agent(&conn, agent_name)?;
        conn.execute(
            "INSERT INTO summaries (id, agent_name, summary_text, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, agent_name, summary_text, now],
        )?;
        conn.execute(
            "DELETE FROM summaries
             WHERE agent_name = ?1
               AND id NOT IN (
                   SELECT id FROM summaries
                   WHERE agent_name = ?1
                   ORDER BY created_at DESC, rowid DESC
                   LIMIT ?2
               )",
            params![agent_name, self.summary_history_cap as i64],
        )?;
        conn.execute(
            "UPDATE agents SET last_summarized = ?2 WHERE name = ?1",
            params![agent_name, now],
        )?;
        Ok(())
    }

    /// Summary history for one agent, oldest first (newest last).
    pub fn list_summaries(&self, agent_name: &str) -> Result<Vec<SummaryRecord>> {
        let agent_name = Self::normalize_agent(agent_name);
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT summary_text, created_at FROM summaries
             WHERE agent_name = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let records = stmt
            .query_map([agent_name], |row| {
                Ok(SummaryRecord {
                    text: row.get(0)?,
                    created_at: row.get::<_, String>(1)?.parse().map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            1,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    // ==================== Workflow runs ====================

    pub fn create_run(&self, run_id: &str, agent_name: &str) -> Result<()> {
        let agent_name = Self::normalize_agent(agent_name);
        let now = Utc::now().to_rfc3339();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO workflow_runs (id, agent_name, status, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
            params![
                run_id,
                agent_name,
                RunStatus::Pending.as_db_str(),
                now.clone(),
                now
            ],
        )?;
        Ok(())
    }

    pub fn mark_run(&self, run_id: &str, status: RunStatus, error: Option<&str>) -> Result<()> {
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE workflow_runs SET status = ?2, error = ?3, updated_at = ?4 WHERE id = ?1",
            params![run_id, status.as_db_str(), error, Utc::now().to_rfc3339()],
        )?;
        if updated == 0 {
            anyhow::bail!("Workflow run '{}' not found", run_id);
        }
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, agent_name, status, error, created_at, updated_at
             FROM workflow_runs WHERE id = ?1",
        )?;
        let mut rows = stmt.query([run_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let status_raw: String = row.get(2)?;
        Ok(Some(WorkflowRun {
            id: row.get(0)?,
            agent_name: row.get(1)?,
            status: RunStatus::from_db(&status_raw),
            error: row.get(3)?,
            created_at: row.get::<_, String>(4)?.parse().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
            updated_at: row.get::<_, String>(5)?.parse().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    5,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
        }))
    }

    // ==================== Step outcomes ====================

    pub fn get_step_outcome(&self, run_id: &str, step_name: &str) -> Result<Option<StepOutcome>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, step_name, attempts, status, result_json, error, completed_at
             FROM workflow_steps WHERE run_id = ?1 AND step_name = ?2",
        )?;
        let mut rows = stmt.query(params![run_id, step_name])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(Self::map_step_row(row)?))
    }

    pub fn list_step_outcomes(&self, run_id: &str) -> Result<Vec<StepOutcome>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, step_name, attempts, status, result_json, error, completed_at
             FROM workflow_steps WHERE run_id = ?1
             ORDER BY completed_at ASC, rowid ASC",
        )?;
        let outcomes = stmt
            .query_map([run_id], |row| Self::map_step_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(outcomes)
    }

    fn map_step_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepOutcome> {
        let status_raw: String = row.get(3)?;
        Ok(StepOutcome {
            run_id: row.get(0)?,
            step_name: row.get(1)?,
            attempts: row.get::<_, i64>(2)?.max(0) as u32,
            status: StepStatus::from_db(&status_raw),
            result_json: row.get(4)?,
            error: row.get(5)?,
            completed_at: row.get::<_, String>(6)?.parse().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    6,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
        })
    }

    /// Record a completed step. A succeeded record is never overwritten; a
    /// failed record may be replaced by a later re-attempt of the step.
    pub fn record_step_success(
        &self,
        run_id: &str,
        step_name: &str,
        attempts: u32,
        result_json: &str,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO workflow_steps (run_id, step_name, attempts, status, result_json, error, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6)
             ON CONFLICT(run_id, step_name) DO UPDATE SET
                attempts = excluded.attempts,
                status = excluded.status,
                result_json = excluded.result_json,
                error = NULL,
                completed_at = excluded.completed_at
             WHERE workflow_steps.status != 'succeeded'",
            params![
                run_id,
                step_name,
                attempts as i64,
                StepStatus::Succeeded.as_db_str(),
                result_json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn record_step_failure(
        &self,
        run_id: &str,
        step_name: &str,
        attempts: u32,
        error: &str,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO workflow_steps (run_id, step_name, attempts, status, result_json, error, completed_at)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6)
             ON CONFLICT(run_id, step_name) DO UPDATE SET
                attempts = excluded.attempts,
                status = excluded.status,
                result_json = NULL,
                error = excluded.error,
                completed_at = excluded.completed_at
             WHERE workflow_steps.status != 'succeeded'",
            params![
                run_id,
                step_name,
                attempts as i64,
                StepStatus::Failed.as_db_str(),
                error,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}
