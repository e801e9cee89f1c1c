// Append-only audit stream. Every state-changing operation appends one row
// inside its own transaction, so audit order matches commit order under the
// single-writer lock.

use std::sync::Arc;

use rusqlite::{params, Transaction};

use hive_types::{format_ts, now, AuditEvent};

use crate::db::{row_to_audit, CoordStore};
use crate::error::CoordResult;

/// Append an audit record within the caller's transaction.
pub(crate) fn append(
    tx: &Transaction<'_>,
    actor: &str,
    kind: &str,
    summary: &str,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO audit (at, actor, kind, summary) VALUES (?1, ?2, ?3, ?4)",
        params![format_ts(&now()), actor, kind, summary],
    )?;
    Ok(())
}

/// Read side of the audit stream. Consumers must treat it as append-only.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<CoordStore>,
}

impl AuditLog {
    pub fn new(store: Arc<CoordStore>) -> Self {
        Self { store }
    }

    /// The most recent `limit` events, newest first.
    pub async fn tail(&self, limit: usize) -> CoordResult<Vec<AuditEvent>> {
        self.store
            .read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT seq, at, actor, kind, summary FROM audit
                     ORDER BY seq DESC LIMIT ?1",
                )?;
                let events = stmt
                    .query_map(params![limit as i64], row_to_audit)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(events)
            })
            .await
    }

    /// Events with a sequence number greater than `after_seq`, oldest first.
    /// Lets a monitor poll the stream incrementally.
    pub async fn since(&self, after_seq: i64, limit: usize) -> CoordResult<Vec<AuditEvent>> {
        self.store
            .read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT seq, at, actor, kind, summary FROM audit
                     WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
                )?;
                let events = stmt
                    .query_map(params![after_seq, limit as i64], row_to_audit)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(events)
            })
            .await
    }
}
