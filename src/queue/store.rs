//! libSQL-backed command queue.
//!
//! Every state change is a single SQL statement, so SQLite's own write lock
//! makes it atomic across tasks and processes. `dequeue` claims with
//! `UPDATE ... RETURNING` and never hands one row to two callers.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::queue::lock::QueueLock;
use crate::queue::migrations;
use crate::queue::model::{Command, CommandStatus, QueueStats};

const COMMAND_COLUMNS: &str = "id, sender, command, message_id, subject, status, result, error, retry_count, created_at, updated_at";

/// Durable FIFO of commands awaiting execution.
pub struct CommandQueue {
    #[allow(dead_code)]
    db: LibSqlDatabase,
    conn: Connection,
    lock: Option<QueueLock>,
    path: Option<PathBuf>,
}

impl CommandQueue {
    /// Open (or create) the queue database described by `config`.
    ///
    /// With `use_lock` the cross-process lock is taken first; if anything
    /// after that fails the lock is dropped with the partially built queue.
    pub async fn open(config: &QueueConfig) -> Result<Self, QueueError> {
        let lock = if config.use_lock {
            Some(QueueLock::acquire(&config.lock_path())?)
        } else {
            None
        };

        let path = config.db_path.as_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                QueueError::Open(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| QueueError::Open(format!("Failed to open libSQL database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| QueueError::Open(format!("Failed to create connection: {e}")))?;

        pragma(&conn, &format!("PRAGMA busy_timeout = {}", config.busy_timeout.as_millis())).await?;
        pragma(&conn, "PRAGMA journal_mode = WAL").await?;
        pragma(&conn, "PRAGMA synchronous = FULL").await?;
        migrations::run_migrations(&conn).await?;

        info!(
            path = %path.display(),
            locked = lock.is_some(),
            "Command queue opened"
        );
        Ok(Self {
            db,
            conn,
            lock,
            path: Some(path.to_path_buf()),
        })
    }

    /// Create an in-memory queue (for tests).
    pub async fn open_in_memory() -> Result<Self, QueueError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| QueueError::Open(format!("Failed to create in-memory database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| QueueError::Open(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db,
            conn,
            lock: None,
            path: None,
        })
    }

    /// Database file, or `None` for in-memory queues.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.as_ref().is_some_and(QueueLock::is_held)
    }

    /// Release the cross-process lock, if held.
    pub fn close(&mut self) -> Result<(), QueueError> {
        if let Some(mut lock) = self.lock.take() {
            lock.release()?;
            info!(path = %lock.path().display(), "Command queue closed");
        }
        Ok(())
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Insert a new pending command and return its id.
    pub async fn enqueue(
        &self,
        sender: &str,
        command: &str,
        message_id: Option<&str>,
        subject: Option<&str>,
    ) -> Result<i64, QueueError> {
        let now = now_text();
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO commands (sender, command, message_id, subject, status, retry_count,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)
                 RETURNING id",
                params![sender, command, opt_text(message_id), opt_text(subject), now],
            )
            .await
            .map_err(|e| enqueue_error(e, message_id))?;

        let id = match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| QueueError::Query(format!("enqueue id: {e}")))?,
            Ok(None) => return Err(QueueError::Query("enqueue: no id returned".into())),
            Err(e) => return Err(enqueue_error(e, message_id)),
        };

        debug!(id, sender, "Command enqueued");
        Ok(id)
    }

    /// Claim the oldest pending command, moving it to `processing`.
    pub async fn dequeue(&self) -> Result<Option<Command>, QueueError> {
        let now = now_text();
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE commands SET status = 'processing', updated_at = ?1
                     WHERE id = (
                        SELECT id FROM commands WHERE status = 'pending' ORDER BY id ASC LIMIT 1
                     ) AND status = 'pending'
                     RETURNING {COMMAND_COLUMNS}"
                ),
                params![now],
            )
            .await
            .map_err(|e| QueueError::Query(format!("dequeue: {e}")))?;

        let command = next_command(&mut rows, "dequeue").await?;
        if let Some(ref cmd) = command {
            debug!(id = cmd.id, sender = %cmd.sender, "Command claimed");
        }
        Ok(command)
    }

    /// Set a command's status plus its result or error text.
    ///
    /// Returns `false` for an unknown id. A move the lifecycle does not allow
    /// is [`QueueError::InvalidTransition`].
    pub async fn update_status(
        &self,
        id: i64,
        status: CommandStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, QueueError> {
        let allowed = CommandStatus::predecessors(status);
        if !allowed.is_empty() {
            let placeholders = allowed
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            let now = now_text();
            let changed = self
                .conn()
                .execute(
                    &format!(
                        "UPDATE commands
                         SET status = ?1, result = COALESCE(?2, result), error = COALESCE(?3, error),
                             updated_at = ?4
                         WHERE id = ?5 AND status IN ({placeholders})"
                    ),
                    params![status.as_str(), opt_text(result), opt_text(error), now, id],
                )
                .await
                .map_err(|e| QueueError::Query(format!("update_status: {e}")))?;

            if changed > 0 {
                info!(id, status = %status, "Command status updated");
                return Ok(true);
            }
        }

        match self.get_by_id(id).await? {
            None => {
                debug!(id, "update_status on unknown command");
                Ok(false)
            }
            Some(current) => {
                warn!(id, from = %current.status, to = %status, "Rejected status transition");
                Err(QueueError::InvalidTransition {
                    id,
                    from: current.status,
                    to: status,
                })
            }
        }
    }

    /// Put a `processing` or `failed` command back to `pending` for another
    /// attempt. It keeps its id and so its place in line.
    pub async fn requeue(&self, id: i64) -> Result<bool, QueueError> {
        let now = now_text();
        let changed = self
            .conn()
            .execute(
                "UPDATE commands SET status = 'pending', updated_at = ?1
                 WHERE id = ?2 AND status IN ('processing', 'failed')",
                params![now, id],
            )
            .await
            .map_err(|e| QueueError::Query(format!("requeue: {e}")))?;

        if changed > 0 {
            info!(id, "Command requeued");
        }
        Ok(changed > 0)
    }

    /// Bump the retry counter. Returns the new count, or `None` for an unknown id.
    pub async fn increment_retry(&self, id: i64) -> Result<Option<u32>, QueueError> {
        let now = now_text();
        let mut rows = self
            .conn()
            .query(
                "UPDATE commands SET retry_count = retry_count + 1, updated_at = ?1
                 WHERE id = ?2
                 RETURNING retry_count",
                params![now, id],
            )
            .await
            .map_err(|e| QueueError::Query(format!("increment_retry: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count = row
                    .get::<i64>(0)
                    .map_err(|e| QueueError::Query(format!("increment_retry: {e}")))?;
                debug!(id, retry_count = count, "Retry count incremented");
                Ok(Some(count.max(0) as u32))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(QueueError::Query(format!("increment_retry: {e}"))),
        }
    }

    /// Record a failed attempt on a `processing` command in one statement.
    ///
    /// The retry count goes up and the error is stored. The command returns
    /// to `pending` while the new count is below `max_retries`, otherwise it
    /// becomes `failed`. Returns the updated command, `None` for an unknown
    /// id, and [`QueueError::InvalidTransition`] (with nothing written) when
    /// the command is not `processing`.
    pub async fn record_failure(
        &self,
        id: i64,
        error: &str,
        max_retries: u32,
    ) -> Result<Option<Command>, QueueError> {
        let now = now_text();
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE commands
                     SET retry_count = retry_count + 1,
                         status = CASE WHEN retry_count + 1 < ?1 THEN 'pending' ELSE 'failed' END,
                         error = ?2,
                         updated_at = ?3
                     WHERE id = ?4 AND status = 'processing'
                     RETURNING {COMMAND_COLUMNS}"
                ),
                params![i64::from(max_retries), error, now, id],
            )
            .await
            .map_err(|e| QueueError::Query(format!("record_failure: {e}")))?;

        if let Some(cmd) = next_command(&mut rows, "record_failure").await? {
            info!(
                id,
                retry_count = cmd.retry_count,
                status = %cmd.status,
                "Command failure recorded"
            );
            return Ok(Some(cmd));
        }
        drop(rows);

        match self.get_by_id(id).await? {
            None => Ok(None),
            Some(current) => {
                warn!(id, from = %current.status, "Failure reported for command not in processing");
                Err(QueueError::InvalidTransition {
                    id,
                    from: current.status,
                    to: CommandStatus::Failed,
                })
            }
        }
    }

    /// True iff the command exists and has been retried fewer than `max_retries` times.
    pub async fn should_retry(&self, id: i64, max_retries: u32) -> Result<bool, QueueError> {
        Ok(self
            .get_by_id(id)
            .await?
            .is_some_and(|cmd| cmd.retry_count < max_retries))
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Command>, QueueError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {COMMAND_COLUMNS} FROM commands WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| QueueError::Query(format!("get_by_id: {e}")))?;

        next_command(&mut rows, "get_by_id").await
    }

    /// Most recent command carrying this `Message-ID`.
    pub async fn find_by_message_id(&self, message_id: &str) -> Result<Option<Command>, QueueError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {COMMAND_COLUMNS} FROM commands WHERE message_id = ?1
                     ORDER BY id DESC LIMIT 1"
                ),
                params![message_id],
            )
            .await
            .map_err(|e| QueueError::Query(format!("find_by_message_id: {e}")))?;

        next_command(&mut rows, "find_by_message_id").await
    }

    /// `(sender, created_at)` of every command accepted after `since`,
    /// oldest first.
    pub async fn accepted_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>, QueueError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT sender, created_at FROM commands WHERE created_at > ?1 ORDER BY id ASC",
                params![timestamp_text(since)],
            )
            .await
            .map_err(|e| QueueError::Query(format!("accepted_since: {e}")))?;

        let mut accepted = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let sender: String = row
                        .get(0)
                        .map_err(|e| QueueError::Query(format!("accepted_since: {e}")))?;
                    let created: String = row
                        .get(1)
                        .map_err(|e| QueueError::Query(format!("accepted_since: {e}")))?;
                    accepted.push((sender, parse_datetime(&created)));
                }
                Ok(None) => break,
                Err(e) => return Err(QueueError::Query(format!("accepted_since: {e}"))),
            }
        }
        Ok(accepted)
    }

    /// Pending commands, oldest first, at most `limit`.
    pub async fn get_pending_commands(&self, limit: usize) -> Result<Vec<Command>, QueueError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {COMMAND_COLUMNS} FROM commands WHERE status = 'pending'
                     ORDER BY id ASC LIMIT ?1"
                ),
                params![i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await
            .map_err(|e| QueueError::Query(format!("get_pending_commands: {e}")))?;

        let mut commands = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => commands.push(row_to_command(&row)?),
                Ok(None) => break,
                Err(e) => return Err(QueueError::Query(format!("get_pending_commands: {e}"))),
            }
        }
        Ok(commands)
    }

    /// Count commands per status.
    pub async fn get_stats(&self) -> Result<QueueStats, QueueError> {
        let mut rows = self
            .conn()
            .query("SELECT status, COUNT(*) FROM commands GROUP BY status", ())
            .await
            .map_err(|e| QueueError::Query(format!("get_stats: {e}")))?;

        let mut stats = QueueStats::default();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let status_str: String = row
                        .get(0)
                        .map_err(|e| QueueError::Query(format!("get_stats: {e}")))?;
                    let count: i64 = row
                        .get(1)
                        .map_err(|e| QueueError::Query(format!("get_stats: {e}")))?;
                    match status_str.parse::<CommandStatus>() {
                        Ok(status) => stats.set(status, count.max(0) as u64),
                        Err(e) => warn!("Ignoring rows with {e}"),
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(QueueError::Query(format!("get_stats: {e}"))),
            }
        }
        Ok(stats)
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close command queue: {e}");
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Run a PRAGMA, discarding any row it reports back.
async fn pragma(conn: &Connection, sql: &str) -> Result<(), QueueError> {
    let mut rows = conn
        .query(sql, ())
        .await
        .map_err(|e| QueueError::Open(format!("{sql}: {e}")))?;
    while let Some(_row) = rows
        .next()
        .await
        .map_err(|e| QueueError::Open(format!("{sql}: {e}")))?
    {}
    Ok(())
}

/// Fixed-width UTC timestamp, so stored values also sort as text.
fn timestamp_text(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_text() -> String {
    timestamp_text(Utc::now())
}

/// Map an insert failure, reporting a reused `Message-ID` as its own error.
fn enqueue_error(e: libsql::Error, message_id: Option<&str>) -> QueueError {
    match message_id {
        Some(message_id) if is_unique_violation(&e) => QueueError::DuplicateMessage {
            message_id: message_id.to_string(),
        },
        _ => QueueError::Query(format!("enqueue: {e}")),
    }
}

fn is_unique_violation(e: &libsql::Error) -> bool {
    match e {
        // SQLITE_CONSTRAINT, possibly as an extended code.
        libsql::Error::SqliteFailure(code, msg) => {
            code & 0xff == 19 && msg.contains("UNIQUE")
                || msg.contains("UNIQUE constraint failed")
        }
        other => other.to_string().contains("UNIQUE constraint failed"),
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Read at most one command from a result set.
async fn next_command(rows: &mut libsql::Rows, op: &str) -> Result<Option<Command>, QueueError> {
    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_command(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(QueueError::Query(format!("{op}: {e}"))),
    }
}

/// Map a libsql Row (in `COMMAND_COLUMNS` order) to a Command.
fn row_to_command(row: &libsql::Row) -> Result<Command, QueueError> {
    let parse = |e: libsql::Error| QueueError::Query(format!("row parse: {e}"));

    let status_str: String = row.get(5).map_err(parse)?;
    let status = status_str
        .parse::<CommandStatus>()
        .map_err(QueueError::Query)?;
    let retry_count: i64 = row.get(8).map_err(parse)?;
    let created_str: String = row.get(9).map_err(parse)?;
    let updated_str: String = row.get(10).map_err(parse)?;

    Ok(Command {
        id: row.get(0).map_err(parse)?,
        sender: row.get(1).map_err(parse)?,
        command: row.get(2).map_err(parse)?,
        message_id: row.get(3).ok(),
        subject: row.get(4).ok(),
        status,
        result: row.get(6).ok(),
        error: row.get(7).ok(),
        retry_count: retry_count.max(0) as u32,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}
