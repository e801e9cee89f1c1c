// Broadcast delivery tracking: who a fan-out reached and where each
// recipient stands. The voting engine uses this to find missing voters;
// monitoring uses it to diagnose coverage.

use std::sync::Arc;

use rusqlite::params;

use hive_types::{BroadcastRecipient, BroadcastStatus, DeliveryState};

use crate::db::{ts_col, CoordStore};
use crate::error::{CoordError, CoordResult};

#[derive(Clone)]
pub struct BroadcastTracker {
    store: Arc<CoordStore>,
}

impl BroadcastTracker {
    pub fn new(store: Arc<CoordStore>) -> Self {
        Self { store }
    }

    /// Delivery counts by state for one broadcast.
    pub async fn status(&self, message_id: &str) -> CoordResult<BroadcastStatus> {
        let message_id = message_id.to_string();
        self.store
            .read(move |conn| {
                ensure_message_exists(conn, &message_id)?;
                let mut stmt = conn.prepare(
                    "SELECT state, COUNT(*) FROM broadcast_deliveries
                     WHERE message_id = ?1 GROUP BY state",
                )?;
                let rows = stmt
                    .query_map(params![message_id], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let mut status = BroadcastStatus::default();
                for (state, count) in rows {
                    match DeliveryState::parse(&state) {
                        Some(DeliveryState::Delivered) => status.delivered = count,
                        Some(DeliveryState::Acknowledged) => status.acknowledged = count,
                        Some(DeliveryState::Skipped) => status.skipped = count,
                        None => {}
                    }
                }
                Ok(status)
            })
            .await
    }

    /// Per-recipient delivery rows for one broadcast.
    pub async fn recipients(&self, message_id: &str) -> CoordResult<Vec<BroadcastRecipient>> {
        let message_id = message_id.to_string();
        self.store
            .read(move |conn| {
                ensure_message_exists(conn, &message_id)?;
                let mut stmt = conn.prepare(
                    "SELECT agent_id, state, updated_at FROM broadcast_deliveries
                     WHERE message_id = ?1 ORDER BY agent_id",
                )?;
                let recipients = stmt
                    .query_map(params![message_id], |row| {
                        let state_raw: String = row.get(1)?;
                        let state = DeliveryState::parse(&state_raw).ok_or_else(|| {
                            rusqlite::Error::FromSqlConversionFailure(
                                1,
                                rusqlite::types::Type::Text,
                                format!("unknown delivery state {state_raw}").into(),
                            )
                        })?;
                        Ok(BroadcastRecipient {
                            agent_id: row.get(0)?,
                            state,
                            updated_at: ts_col(row, 2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(recipients)
            })
            .await
    }

    /// Recipients who have neither acknowledged nor dismissed the broadcast.
    pub async fn pending_recipients(&self, message_id: &str) -> CoordResult<Vec<String>> {
        let recipients = self.recipients(message_id).await?;
        Ok(recipients
            .into_iter()
            .filter(|r| r.state == DeliveryState::Delivered)
            .map(|r| r.agent_id)
            .collect())
    }
}

fn ensure_message_exists(conn: &rusqlite::Connection, message_id: &str) -> CoordResult<()> {
    let exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE id = ?1",
        params![message_id],
        |row| row.get(0),
    )?;
    if exists == 0 {
        return Err(CoordError::NotFound(message_id.to_string()));
    }
    Ok(())
}
