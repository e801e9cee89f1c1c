// Background maintenance: TTL expiry, dead-letter sweep, checkpoint/vacuum.
// One loop per process; each pass is a single small write transaction
// followed by an out-of-transaction checkpoint.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use serde::Serialize;
use tokio::task::JoinHandle;

use hive_types::{format_ts, now, DeadLetter, MessageStatus};

use crate::audit;
use crate::broker::MAX_DELIVERY_ATTEMPTS;
use crate::db::{row_to_dead_letter, row_to_message, CoordStore, MESSAGE_COLUMNS};
use crate::error::CoordResult;

pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Free pages tolerated before the sweep runs VACUUM.
const VACUUM_PAGE_THRESHOLD: i64 = 100;

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub expired_messages: usize,
    pub expired_deliveries: usize,
    pub dead_lettered: usize,
    pub checkpointed: bool,
    pub vacuumed: bool,
}

#[derive(Clone)]
pub struct Maintenance {
    store: Arc<CoordStore>,
}

impl Maintenance {
    pub fn new(store: Arc<CoordStore>) -> Self {
        Self { store }
    }

    /// One maintenance pass: drop expired messages (with their delivery
    /// rows), archive exhausted failures, then checkpoint.
    pub async fn run_once(&self) -> CoordResult<MaintenanceReport> {
        let (expired_messages, expired_deliveries, dead_lettered) = self
            .store
            .with_write(|tx| {
                let now_s = format_ts(&now());

                let expired_deliveries = tx.execute(
                    "DELETE FROM broadcast_deliveries WHERE message_id IN (
                         SELECT id FROM messages
                         WHERE expires_at IS NOT NULL AND expires_at < ?1)",
                    params![now_s],
                )?;
                let expired_messages = tx.execute(
                    "DELETE FROM messages WHERE expires_at IS NOT NULL AND expires_at < ?1",
                    params![now_s],
                )?;

                // Failed rows the completion path did not archive itself
                // (e.g. a crash between fail and sweep).
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE status = 'failed' AND delivery_count >= ?1"
                );
                let exhausted = {
                    let mut stmt = tx.prepare(&sql)?;
                    let rows = stmt
                        .query_map(params![MAX_DELIVERY_ATTEMPTS], row_to_message)?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };
                let dead_lettered = exhausted.len();
                for mut message in exhausted {
                    message.status = MessageStatus::Failed;
                    let error = message
                        .error
                        .clone()
                        .unwrap_or_else(|| "delivery attempts exhausted".to_string());
                    tx.execute(
                        "INSERT OR REPLACE INTO dead_letter
                             (message_id, envelope, error, retry_count, archived_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            message.id,
                            serde_json::to_string(&message)?,
                            error,
                            message.delivery_count,
                            now_s,
                        ],
                    )?;
                    tx.execute("DELETE FROM messages WHERE id = ?1", params![message.id])?;
                }

                if expired_messages + expired_deliveries + dead_lettered > 0 {
                    audit::append(
                        tx,
                        "maintenance",
                        "maintenance.sweep",
                        &format!(
                            "expired {expired_messages} messages, {expired_deliveries} deliveries, archived {dead_lettered}"
                        ),
                    )?;
                }
                Ok((expired_messages, expired_deliveries, dead_lettered))
            })
            .await?;

        let (checkpointed, vacuumed) = self.store.checkpoint(VACUUM_PAGE_THRESHOLD).await?;

        let report = MaintenanceReport {
            expired_messages,
            expired_deliveries,
            dead_lettered,
            checkpointed,
            vacuumed,
        };
        if report.expired_messages + report.dead_lettered > 0 {
            tracing::info!(
                expired = report.expired_messages,
                dead_lettered = report.dead_lettered,
                "maintenance sweep"
            );
        }
        Ok(report)
    }

    /// Run the sweep on a fixed interval until the handle is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.run_once().await {
                    tracing::warn!(%err, "maintenance sweep failed");
                }
            }
        })
    }

    /// Inspect the archive, newest first.
    pub async fn dead_letters(&self, limit: usize) -> CoordResult<Vec<DeadLetter>> {
        self.store
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT message_id, envelope, error, retry_count, archived_at
                     FROM dead_letter ORDER BY archived_at DESC LIMIT ?1",
                )?;
                let letters = stmt
                    .query_map(params![limit as i64], row_to_dead_letter)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(letters)
            })
            .await
    }
}
