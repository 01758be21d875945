//! Durable CRUD over the `threads` and `messages` tables.
//!
//! No business logic lives here — callers own logging and recovery policy.
//! Every mutation is a single-statement transaction; there is deliberately no
//! cross-table transaction, so a message insert and its parent thread's
//! `updated_at` bump commit independently.

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};
use tracing::info;

use crate::model::{ActionState, ActionStatus, Message, ResultKind, Role, Thread};

/// Default timeout for individual SQLite queries.
/// Prevents a hung query from blocking the host application indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

// ─── Rows ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
struct ThreadRow {
    id: String,
    title: String,
    kind: String,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct MessageRow {
    thread_id: String,
    message_id: String,
    role: String,
    kind: String,
    content: String,
    timestamp: String,
    result_kind: String,
    /// Serialized ActionState JSON; NULL unless `result_kind = 'action'`.
    action_state: Option<String>,
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp: {s}"))?
        .with_timezone(&Utc))
}

fn thread_from_row(row: ThreadRow) -> Result<Thread> {
    Ok(Thread {
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
        id: row.id,
        title: row.title,
        kind: row.kind,
    })
}

fn message_from_row(row: MessageRow) -> Result<Message> {
    let role = Role::parse(&row.role)
        .ok_or_else(|| anyhow::anyhow!("unknown role in messages.role: {}", row.role))?;
    let result_kind = ResultKind::parse(&row.result_kind).ok_or_else(|| {
        anyhow::anyhow!("unknown kind in messages.result_kind: {}", row.result_kind)
    })?;
    let action_state = row
        .action_state
        .as_deref()
        .map(serde_json::from_str::<ActionState>)
        .transpose()
        .context("bad action_state JSON")?;
    Ok(Message {
        timestamp: parse_ts(&row.timestamp)?,
        thread_id: row.thread_id,
        message_id: row.message_id,
        role,
        kind: row.kind,
        content: row.content,
        result_kind,
        action_state,
    })
}

// ─── Patches ──────────────────────────────────────────────────────────────────

/// Partial update for a thread row. `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct ThreadPatch {
    pub title: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ThreadPatch {
    /// Patch that only bumps `updated_at` to `at`.
    pub fn touched(at: DateTime<Utc>) -> Self {
        Self {
            title: None,
            updated_at: Some(at),
        }
    }
}

/// Partial update for a message row. `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub result_kind: Option<ResultKind>,
    pub action_state: Option<ActionState>,
}

// ─── Storage ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open (creating if missing) the SQLite database at
    /// `{data_dir}/parley.db` and run pending migrations.
    pub async fn new(data_dir: &Path) -> Result<Self> {
        Self::new_with_slow_query(data_dir, 0).await
    }

    /// Create storage with slow-query logging enabled.
    ///
    /// `slow_query_ms` is the threshold in milliseconds — queries exceeding
    /// it are logged at WARN level. Set to 0 to disable slow-query logging.
    pub async fn new_with_slow_query(data_dir: &Path, slow_query_ms: u64) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("parley.db");
        let mut opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        if slow_query_ms > 0 {
            opts = opts.log_slow_statements(
                log::LevelFilter::Warn,
                std::time::Duration::from_millis(slow_query_ms),
            );
        }

        let pool = SqlitePool::connect_with(opts).await?;
        sqlx::migrate!("src/storage/migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Close the pool, flushing WAL state. Idempotent.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ─── Threads ────────────────────────────────────────────────────────────

    /// Insert a thread. Idempotent — a no-op if a thread with the same id
    /// already exists.
    pub async fn create_thread(&self, thread: &Thread) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO threads (id, title, kind, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&thread.id)
        .bind(&thread.title)
        .bind(&thread.kind)
        .bind(thread.created_at.to_rfc3339())
        .bind(thread.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All threads, newest first.
    pub async fn list_threads(&self) -> Result<Vec<Thread>> {
        with_timeout(async {
            let rows: Vec<ThreadRow> =
                sqlx::query_as("SELECT * FROM threads ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?;
            rows.into_iter().map(thread_from_row).collect()
        })
        .await
    }

    pub async fn find_thread(&self, id: &str) -> Result<Option<Thread>> {
        let row: Option<ThreadRow> = sqlx::query_as("SELECT * FROM threads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(thread_from_row).transpose()
    }

    /// Apply a partial update. Returns `false` when no thread has this id.
    pub async fn update_thread(&self, id: &str, patch: &ThreadPatch) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE threads SET title = COALESCE(?, title),
                                updated_at = COALESCE(?, updated_at)
             WHERE id = ?",
        )
        .bind(&patch.title)
        .bind(patch.updated_at.map(|t| t.to_rfc3339()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a thread row. Returns `false` when no thread has this id.
    ///
    /// Does NOT cascade — the registry deletes the thread's messages first so
    /// a crash in between leaves an empty thread rather than orphans.
    pub async fn delete_thread(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM threads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_threads(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM threads")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    // ─── Messages ───────────────────────────────────────────────────────────

    /// Insert a message. Idempotent on `(thread_id, message_id)`.
    pub async fn create_message(&self, message: &Message) -> Result<()> {
        let action_state = message
            .action_state
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT OR IGNORE INTO messages
             (thread_id, message_id, role, kind, content, timestamp, result_kind, action_state)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.thread_id)
        .bind(&message.message_id)
        .bind(message.role.as_str())
        .bind(&message.kind)
        .bind(&message.content)
        .bind(message.timestamp.to_rfc3339())
        .bind(message.result_kind.as_str())
        .bind(action_state)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_message(
        &self,
        thread_id: &str,
        message_id: &str,
    ) -> Result<Option<Message>> {
        let row: Option<MessageRow> =
            sqlx::query_as("SELECT * FROM messages WHERE thread_id = ? AND message_id = ?")
                .bind(thread_id)
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(message_from_row).transpose()
    }

    /// Messages of one thread in timestamp order, or every message across
    /// threads when `thread_id` is `None`. Ties are broken by message id so
    /// the ordering is stable.
    pub async fn list_messages(&self, thread_id: Option<&str>) -> Result<Vec<Message>> {
        with_timeout(async {
            let rows: Vec<MessageRow> = if let Some(tid) = thread_id {
                sqlx::query_as(
                    "SELECT * FROM messages WHERE thread_id = ?
                     ORDER BY timestamp ASC, message_id ASC",
                )
                .bind(tid)
                .fetch_all(&self.pool)
                .await?
            } else {
                sqlx::query_as("SELECT * FROM messages ORDER BY timestamp ASC, message_id ASC")
                    .fetch_all(&self.pool)
                    .await?
            };
            rows.into_iter().map(message_from_row).collect()
        })
        .await
    }

    /// Apply a partial update. Returns `false` when the message is missing.
    pub async fn update_message(
        &self,
        thread_id: &str,
        message_id: &str,
        patch: &MessagePatch,
    ) -> Result<bool> {
        let action_state = patch
            .action_state
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(
            "UPDATE messages SET content = COALESCE(?, content),
                                 result_kind = COALESCE(?, result_kind),
                                 action_state = COALESCE(?, action_state)
             WHERE thread_id = ? AND message_id = ?",
        )
        .bind(&patch.content)
        .bind(patch.result_kind.map(|k| k.as_str()))
        .bind(action_state)
        .bind(thread_id)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete one message. Returns `false` when it was already gone.
    pub async fn delete_message(&self, thread_id: &str, message_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE thread_id = ? AND message_id = ?")
            .bind(thread_id)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every message of a thread. Returns the number removed.
    pub async fn delete_messages(&self, thread_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_messages(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    // ─── Startup recovery ───────────────────────────────────────────────────

    /// On startup, any action message left in `running` state by a previous
    /// (crashed/killed) process is flipped to `failed` — the workflow driving
    /// it is gone. Returns the number of messages recovered.
    pub async fn recover_stale_actions(&self) -> Result<u64> {
        with_timeout(async {
            let rows: Vec<MessageRow> =
                sqlx::query_as("SELECT * FROM messages WHERE result_kind = 'action'")
                    .fetch_all(&self.pool)
                    .await?;

            let mut recovered = 0u64;
            for row in rows {
                let message = message_from_row(row)?;
                let Some(mut state) = message.action_state else {
                    continue;
                };
                if state.status != ActionStatus::Running {
                    continue;
                }
                state.status = ActionStatus::Failed;
                state.error = Some("interrupted by restart".to_string());
                state.end_time = Some(Utc::now());
                let patch = MessagePatch {
                    action_state: Some(state),
                    ..Default::default()
                };
                if self
                    .update_message(&message.thread_id, &message.message_id, &patch)
                    .await?
                {
                    recovered += 1;
                }
            }
            if recovered > 0 {
                info!(count = recovered, "recovered stale running actions");
            }
            Ok(recovered)
        })
        .await
    }

    // ─── Maintenance ────────────────────────────────────────────────────────

    /// Delete threads (and their messages) not updated in `days` days and
    /// return the number of threads removed. Pass `0` to skip pruning.
    pub async fn prune_threads(&self, days: u32) -> Result<u64> {
        if days == 0 {
            return Ok(0);
        }
        with_timeout(async {
            // `days` is u32, so the i64 conversion cannot overflow.
            let cutoff = (Utc::now() - chrono::Duration::days(days as i64)).to_rfc3339();
            // Messages first, so a crash in between leaves empty threads
            // rather than orphaned messages.
            sqlx::query(
                "DELETE FROM messages WHERE thread_id IN
                 (SELECT id FROM threads WHERE updated_at < ?)",
            )
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
            let n = sqlx::query("DELETE FROM threads WHERE updated_at < ?")
                .bind(&cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
            Ok(n)
        })
        .await
    }

    /// Run SQLite VACUUM to reclaim disk space after pruning.
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }
}
