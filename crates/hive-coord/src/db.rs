// Store layer: one SQLite file shared by every coordination component.
//
// Concurrency contract: readers go through the engine's WAL MVCC; every
// mutation runs in a BEGIN IMMEDIATE transaction so the writer lock is held
// from the first read, making check-then-write sequences race-free.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use hive_guard::{CircuitBreaker, CircuitBreakerConfig};
use hive_types::{
    parse_ts, AgentRecord, AgentState, AuditEvent, Ballot, DeadLetter, Message, MessageKind,
    MessageStatus, Task, TaskEvent, TaskStatus, Vote, VoteMechanism, VoteResult, VoteStatus,
};

use crate::error::{CoordError, CoordResult};
use crate::paths::CoordPaths;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded retry for write transactions that lose the race for the writer
/// lock despite the busy timeout.
const WRITE_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_MS: f64 = 50.0;

pub(crate) const MESSAGE_COLUMNS: &str = "id, kind, version, correlation_id, from_agent, \
     to_agent, channel, priority, payload, status, artifact_path, created_at, expires_at, \
     delivery_count, last_delivered_at, error";

pub(crate) const TASK_COLUMNS: &str = "task_id, title, description, priority, status, assignee, \
     created_at, started_at, completed_at, depends_on, history, result, error";

pub(crate) const VOTE_COLUMNS: &str = "vote_id, topic, options, mechanism, proposer, eligible, \
     weights, deadline, status, ballots, result, created_at";

/// Row counts per table plus the database file size, for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub messages: i64,
    pub broadcast_deliveries: i64,
    pub channel_subscriptions: i64,
    pub agents: i64,
    pub tasks: i64,
    pub votes: i64,
    pub dead_letters: i64,
    pub audit_events: i64,
    pub file_size: i64,
}

/// Connection manager for the coordination database.
pub struct CoordStore {
    conn: Arc<Mutex<Connection>>,
    breaker: CircuitBreaker,
    paths: CoordPaths,
}

impl CoordStore {
    /// Open (or create) the store under `root`, enabling WAL and creating
    /// the schema idempotently.
    pub async fn open(root: impl AsRef<Path>) -> CoordResult<Self> {
        let paths = CoordPaths::new(root);
        paths.ensure()?;

        let conn = Connection::open(paths.db_file())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // PRAGMA journal_mode returns a row, so query_row and ignore it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute_batch(
            "PRAGMA synchronous  = NORMAL;
             PRAGMA temp_store   = MEMORY;
             PRAGMA foreign_keys = OFF;",
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
            paths,
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn paths(&self) -> &CoordPaths {
        &self.paths
    }

    async fn init_schema(&self) -> CoordResult<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id                TEXT PRIMARY KEY,
                kind              TEXT NOT NULL,
                version           TEXT NOT NULL,
                correlation_id    TEXT,
                from_agent        TEXT NOT NULL,
                to_agent          TEXT,
                channel           TEXT NOT NULL,
                priority          INTEGER NOT NULL,
                payload           TEXT NOT NULL,
                status            TEXT NOT NULL DEFAULT 'pending',
                artifact_path     TEXT,
                created_at        TEXT NOT NULL,
                expires_at        TEXT,
                delivery_count    INTEGER NOT NULL DEFAULT 0,
                last_delivered_at TEXT,
                error             TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_pending
                ON messages(channel, status, priority DESC, created_at)
                WHERE status = 'pending';
            CREATE INDEX IF NOT EXISTS idx_messages_correlation
                ON messages(correlation_id)
                WHERE correlation_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_messages_expires
                ON messages(expires_at)
                WHERE expires_at IS NOT NULL;

            CREATE TABLE IF NOT EXISTS broadcast_deliveries (
                message_id TEXT NOT NULL,
                agent_id   TEXT NOT NULL,
                state      TEXT NOT NULL DEFAULT 'delivered',
                updated_at TEXT NOT NULL,
                PRIMARY KEY (message_id, agent_id)
            );

            CREATE TABLE IF NOT EXISTS channel_subscriptions (
                channel       TEXT NOT NULL,
                agent_id      TEXT NOT NULL,
                subscribed_at TEXT NOT NULL,
                PRIMARY KEY (channel, agent_id)
            );

            CREATE TABLE IF NOT EXISTS agent_status (
                agent_id        TEXT PRIMARY KEY,
                state           TEXT NOT NULL,
                current_task    TEXT,
                last_heartbeat  TEXT NOT NULL,
                heartbeat_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS tasks (
                task_id      TEXT PRIMARY KEY,
                title        TEXT NOT NULL,
                description  TEXT NOT NULL,
                priority     INTEGER NOT NULL DEFAULT 5,
                status       TEXT NOT NULL DEFAULT 'open',
                assignee     TEXT,
                created_at   TEXT NOT NULL,
                started_at   TEXT,
                completed_at TEXT,
                depends_on   TEXT NOT NULL DEFAULT '[]',
                history      TEXT NOT NULL DEFAULT '[]',
                result       TEXT,
                error        TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(task_id, status);

            CREATE TABLE IF NOT EXISTS votes (
                vote_id    TEXT PRIMARY KEY,
                topic      TEXT NOT NULL,
                options    TEXT NOT NULL,
                mechanism  TEXT NOT NULL,
                proposer   TEXT NOT NULL,
                eligible   TEXT NOT NULL,
                weights    TEXT,
                deadline   TEXT NOT NULL,
                status     TEXT NOT NULL DEFAULT 'open',
                ballots    TEXT NOT NULL DEFAULT '{}',
                result     TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS dead_letter (
                message_id  TEXT PRIMARY KEY,
                envelope    TEXT NOT NULL,
                error       TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                archived_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit (
                seq     INTEGER PRIMARY KEY AUTOINCREMENT,
                at      TEXT NOT NULL,
                actor   TEXT NOT NULL,
                kind    TEXT NOT NULL,
                summary TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Run a read-only closure against the connection.
    pub(crate) async fn read<T, F>(&self, f: F) -> CoordResult<T>
    where
        F: FnOnce(&Connection) -> CoordResult<T>,
    {
        let conn = self.conn.lock().await;
        f(&conn)
    }

    /// Run a mutating closure inside a BEGIN IMMEDIATE transaction, retrying
    /// bounded times on writer-lock contention. Domain errors returned by the
    /// closure roll the transaction back and surface verbatim.
    pub(crate) async fn with_write<T, F>(&self, f: F) -> CoordResult<T>
    where
        F: FnMut(&Transaction<'_>) -> CoordResult<T>,
    {
        if !self.breaker.try_acquire() {
            return Err(CoordError::CircuitOpen("store write path".to_string()));
        }

        let mut f = f;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = {
                let mut conn = self.conn.lock().await;
                let outcome = match conn.transaction_with_behavior(TransactionBehavior::Immediate)
                {
                    Ok(tx) => match f(&tx) {
                        Ok(value) => tx.commit().map(|_| value).map_err(CoordError::Database),
                        Err(err) => Err(err),
                    },
                    Err(err) => Err(CoordError::Database(err)),
                };
                outcome
            };

            match result {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(CoordError::Database(err)) if is_busy(&err) => {
                    if attempt >= WRITE_ATTEMPTS {
                        self.breaker.record_failure();
                        return Err(CoordError::StoreUnavailable {
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                    let delay = backoff_delay(attempt);
                    tracing::debug!(attempt, ?delay, "store busy, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(CoordError::Database(err)) => {
                    self.breaker.record_failure();
                    return Err(CoordError::Database(err));
                }
                Err(domain) => {
                    // The store itself worked; the operation was refused.
                    self.breaker.record_success();
                    return Err(domain);
                }
            }
        }
    }

    /// Truncate the WAL and reclaim free pages when enough have accumulated.
    /// Runs outside any transaction; VACUUM cannot run inside one.
    pub(crate) async fn checkpoint(&self, vacuum_page_threshold: i64) -> CoordResult<(bool, bool)> {
        let conn = self.conn.lock().await;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        let freelist: i64 = conn.query_row("PRAGMA freelist_count", [], |row| row.get(0))?;
        if freelist > vacuum_page_threshold {
            conn.execute_batch("VACUUM")?;
            return Ok((true, true));
        }
        Ok((true, false))
    }

    pub async fn stats(&self) -> CoordResult<StoreStats> {
        let count = |conn: &Connection, table: &str| -> CoordResult<i64> {
            let sql = format!("SELECT COUNT(*) FROM {table}");
            Ok(conn.query_row(&sql, [], |row| row.get(0))?)
        };
        let file_size = std::fs::metadata(self.paths.db_file())
            .map(|m| m.len() as i64)
            .unwrap_or(0);
        self.read(|conn| {
            Ok(StoreStats {
                messages: count(conn, "messages")?,
                broadcast_deliveries: count(conn, "broadcast_deliveries")?,
                channel_subscriptions: count(conn, "channel_subscriptions")?,
                agents: count(conn, "agent_status")?,
                tasks: count(conn, "tasks")?,
                votes: count(conn, "votes")?,
                dead_letters: count(conn, "dead_letter")?,
                audit_events: count(conn, "audit")?,
                file_size,
            })
        })
        .await
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn backoff_delay(attempt: u32) -> Duration {
    use rand::Rng;
    let base = BACKOFF_BASE_MS * f64::powi(2.0, attempt.saturating_sub(1) as i32);
    let jitter = rand::thread_rng().gen_range(0.5..=1.5);
    Duration::from_millis((base * jitter) as u64)
}

// --- row mapping helpers -------------------------------------------------

pub(crate) fn ts_col(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn opt_ts_col(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(raw) => parse_ts(&raw).map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        }),
        None => Ok(None),
    }
}

fn conversion_err(idx: usize, detail: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, detail.into())
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Map a row selected with [`MESSAGE_COLUMNS`].
pub(crate) fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let kind: String = row.get(1)?;
    let priority: i64 = row.get(7)?;
    let status_raw: String = row.get(9)?;
    let status = MessageStatus::parse(&status_raw)
        .ok_or_else(|| conversion_err(9, format!("unknown message status {status_raw}")))?;

    Ok(Message {
        id: row.get(0)?,
        kind: MessageKind::from(kind),
        version: row.get(2)?,
        correlation_id: row.get(3)?,
        from_agent: row.get(4)?,
        to_agent: row.get(5)?,
        channel: row.get(6)?,
        priority: priority as u8,
        payload: json_col(row, 8)?,
        status,
        artifact_path: row.get(10)?,
        created_at: ts_col(row, 11)?,
        expires_at: opt_ts_col(row, 12)?,
        delivery_count: row.get(13)?,
        last_delivered_at: opt_ts_col(row, 14)?,
        error: row.get(15)?,
    })
}

/// Map a row selected with [`TASK_COLUMNS`].
pub(crate) fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
    let status_raw: String = row.get(4)?;
    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| conversion_err(4, format!("unknown task status {status_raw}")))?;
    let depends_on: Vec<String> = json_col(row, 9)?;
    let history: Vec<TaskEvent> = json_col(row, 10)?;

    Ok(Task {
        task_id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        priority: row.get(3)?,
        status,
        assignee: row.get(5)?,
        created_at: ts_col(row, 6)?,
        started_at: opt_ts_col(row, 7)?,
        completed_at: opt_ts_col(row, 8)?,
        depends_on,
        history,
        result: row.get(11)?,
        error: row.get(12)?,
    })
}

/// Map a row selected with [`VOTE_COLUMNS`].
pub(crate) fn row_to_vote(row: &Row) -> rusqlite::Result<Vote> {
    let mechanism_raw: String = row.get(3)?;
    let mechanism = VoteMechanism::parse(&mechanism_raw)
        .ok_or_else(|| conversion_err(3, format!("unknown vote mechanism {mechanism_raw}")))?;
    let status_raw: String = row.get(8)?;
    let status = VoteStatus::parse(&status_raw)
        .ok_or_else(|| conversion_err(8, format!("unknown vote status {status_raw}")))?;

    let weights_raw: Option<String> = row.get(6)?;
    let weights: Option<BTreeMap<String, i64>> = match weights_raw {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };
    let result_raw: Option<String> = row.get(10)?;
    let result: Option<VoteResult> = match result_raw {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };
    let ballots: BTreeMap<String, Ballot> = json_col(row, 9)?;

    Ok(Vote {
        vote_id: row.get(0)?,
        topic: row.get(1)?,
        options: json_col(row, 2)?,
        mechanism,
        proposer: row.get(4)?,
        eligible: json_col(row, 5)?,
        weights,
        deadline: ts_col(row, 7)?,
        status,
        ballots,
        result,
        created_at: ts_col(row, 11)?,
    })
}

/// Map an `agent_status` row.
pub(crate) fn row_to_agent(row: &Row) -> rusqlite::Result<AgentRecord> {
    let state_raw: String = row.get(1)?;
    let state = AgentState::parse(&state_raw)
        .ok_or_else(|| conversion_err(1, format!("unknown agent state {state_raw}")))?;
    Ok(AgentRecord {
        agent_id: row.get(0)?,
        state,
        current_task: row.get(2)?,
        last_heartbeat: ts_col(row, 3)?,
        heartbeat_count: row.get(4)?,
    })
}

/// Map a `dead_letter` row.
pub(crate) fn row_to_dead_letter(row: &Row) -> rusqlite::Result<DeadLetter> {
    Ok(DeadLetter {
        message: json_col(row, 1)?,
        error: row.get(2)?,
        retry_count: row.get(3)?,
        archived_at: ts_col(row, 4)?,
    })
}

/// Map an `audit` row.
pub(crate) fn row_to_audit(row: &Row) -> rusqlite::Result<AuditEvent> {
    Ok(AuditEvent {
        seq: row.get(0)?,
        at: ts_col(row, 1)?,
        actor: row.get(2)?,
        kind: row.get(3)?,
        summary: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (CoordStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = CoordStore::open(temp.path()).await.unwrap();
        (store, temp)
    }

    #[tokio::test]
    async fn open_creates_schema_and_layout() {
        let (store, _temp) = setup().await;
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.messages, 0);
        assert_eq!(stats.tasks, 0);
        assert!(store.paths().db_file().exists());
        assert!(store.paths().artifacts_dir().is_dir());
    }

    #[tokio::test]
    async fn open_is_idempotent_across_restarts() {
        let temp = TempDir::new().unwrap();
        {
            let store = CoordStore::open(temp.path()).await.unwrap();
            store
                .with_write(|tx| {
                    tx.execute(
                        "INSERT INTO audit (at, actor, kind, summary)
                         VALUES ('2026-01-01T00:00:00.000Z', 'a', 'test', 's')",
                        [],
                    )?;
                    Ok(())
                })
                .await
                .unwrap();
        }
        let store = CoordStore::open(temp.path()).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.audit_events, 1);
    }

    #[tokio::test]
    async fn domain_errors_roll_back_the_transaction() {
        let (store, _temp) = setup().await;
        let result: CoordResult<()> = store
            .with_write(|tx| {
                tx.execute(
                    "INSERT INTO audit (at, actor, kind, summary)
                     VALUES ('2026-01-01T00:00:00.000Z', 'a', 'test', 's')",
                    [],
                )?;
                Err(CoordError::NotFound("nope".to_string()))
            })
            .await;
        assert!(matches!(result, Err(CoordError::NotFound(_))));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.audit_events, 0, "rolled-back write must not persist");
    }
}
