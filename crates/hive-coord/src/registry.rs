// Agent registry: heartbeats, derived liveness, channel subscriptions.

use std::sync::Arc;

use chrono::Duration;
use rusqlite::{params, OptionalExtension};

use hive_types::{
    format_ts, now, AgentHealth, AgentRecord, AgentState, Liveness, GENERAL_CHANNEL,
};

use crate::audit;
use crate::db::{row_to_agent, CoordStore};
use crate::error::{CoordError, CoordResult};

/// Heartbeat age bounds for the liveness classification.
pub const ACTIVE_WITHIN_SECS: i64 = 60;
pub const DEGRADED_WITHIN_SECS: i64 = 300;

const AGENT_COLUMNS: &str = "agent_id, state, current_task, last_heartbeat, heartbeat_count";

#[derive(Clone)]
pub struct AgentRegistry {
    store: Arc<CoordStore>,
}

impl AgentRegistry {
    pub fn new(store: Arc<CoordStore>) -> Self {
        Self { store }
    }

    /// Upsert this agent's status row. Repeating a heartbeat only moves the
    /// timestamp and counter; the first one makes the agent known to the
    /// implicit `general` subscription.
    pub async fn heartbeat(
        &self,
        agent: &str,
        state: AgentState,
        current_task: Option<&str>,
    ) -> CoordResult<AgentRecord> {
        let agent = agent.to_string();
        let current_task = current_task.map(|t| t.to_string());
        self.store
            .with_write(move |tx| {
                tx.execute(
                    "INSERT INTO agent_status (agent_id, state, current_task, last_heartbeat, heartbeat_count)
                     VALUES (?1, ?2, ?3, ?4, 1)
                     ON CONFLICT(agent_id) DO UPDATE SET
                         state = excluded.state,
                         current_task = excluded.current_task,
                         last_heartbeat = excluded.last_heartbeat,
                         heartbeat_count = agent_status.heartbeat_count + 1",
                    params![agent, state.as_str(), current_task, format_ts(&now())],
                )?;
                audit::append(tx, &agent, "agent.heartbeat", state.as_str())?;
                let sql = format!("SELECT {AGENT_COLUMNS} FROM agent_status WHERE agent_id = ?1");
                let record = tx.query_row(&sql, params![agent], row_to_agent)?;
                Ok(record)
            })
            .await
    }

    /// One agent's row with derived liveness.
    pub async fn health(&self, agent: &str) -> CoordResult<AgentHealth> {
        let agent = agent.to_string();
        self.store
            .read(move |conn| {
                let sql = format!("SELECT {AGENT_COLUMNS} FROM agent_status WHERE agent_id = ?1");
                let record = conn
                    .query_row(&sql, params![agent], row_to_agent)
                    .optional()?
                    .ok_or_else(|| CoordError::NotFound(agent.clone()))?;
                Ok(augment(record))
            })
            .await
    }

    /// Every known agent with derived liveness.
    pub async fn roster(&self) -> CoordResult<Vec<AgentHealth>> {
        self.store
            .read(|conn| {
                let sql = format!("SELECT {AGENT_COLUMNS} FROM agent_status ORDER BY agent_id");
                let mut stmt = conn.prepare(&sql)?;
                let records = stmt
                    .query_map([], row_to_agent)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(records.into_iter().map(augment).collect())
            })
            .await
    }

    /// Remove an agent's status row entirely.
    pub async fn deregister(&self, agent: &str) -> CoordResult<()> {
        let agent = agent.to_string();
        self.store
            .with_write(move |tx| {
                let removed = tx.execute(
                    "DELETE FROM agent_status WHERE agent_id = ?1",
                    params![agent],
                )?;
                if removed == 0 {
                    return Err(CoordError::NotFound(agent.clone()));
                }
                tx.execute(
                    "DELETE FROM channel_subscriptions WHERE agent_id = ?1",
                    params![agent],
                )?;
                audit::append(tx, &agent, "agent.deregister", &agent)?;
                Ok(())
            })
            .await
    }

    /// Idempotent channel subscription. Subscribing after a broadcast went
    /// out does not create delivery rows retroactively.
    pub async fn subscribe(&self, agent: &str, channel: &str) -> CoordResult<()> {
        let agent = agent.to_string();
        let channel = channel.to_string();
        self.store
            .with_write(move |tx| {
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO channel_subscriptions (channel, agent_id, subscribed_at)
                     VALUES (?1, ?2, ?3)",
                    params![channel, agent, format_ts(&now())],
                )?;
                if inserted > 0 {
                    audit::append(tx, &agent, "channel.subscribe", &channel)?;
                }
                Ok(())
            })
            .await
    }

    /// Idempotent unsubscribe.
    pub async fn unsubscribe(&self, agent: &str, channel: &str) -> CoordResult<()> {
        let agent = agent.to_string();
        let channel = channel.to_string();
        self.store
            .with_write(move |tx| {
                let removed = tx.execute(
                    "DELETE FROM channel_subscriptions WHERE channel = ?1 AND agent_id = ?2",
                    params![channel, agent],
                )?;
                if removed > 0 {
                    audit::append(tx, &agent, "channel.unsubscribe", &channel)?;
                }
                Ok(())
            })
            .await
    }

    /// Channels this agent receives broadcasts on. The implicit `general`
    /// subscription is always present.
    pub async fn channels(&self, agent: &str) -> CoordResult<Vec<String>> {
        let agent = agent.to_string();
        self.store
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT channel FROM channel_subscriptions WHERE agent_id = ?1 ORDER BY channel",
                )?;
                let mut channels: Vec<String> = stmt
                    .query_map(params![agent], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                if !channels.iter().any(|c| c == GENERAL_CHANNEL) {
                    channels.insert(0, GENERAL_CHANNEL.to_string());
                }
                Ok(channels)
            })
            .await
    }
}

fn augment(record: AgentRecord) -> AgentHealth {
    let liveness = classify(now().signed_duration_since(record.last_heartbeat));
    AgentHealth { record, liveness }
}

fn classify(age: Duration) -> Liveness {
    if age <= Duration::seconds(ACTIVE_WITHIN_SECS) {
        Liveness::Active
    } else if age <= Duration::seconds(DEGRADED_WITHIN_SECS) {
        Liveness::Degraded
    } else {
        Liveness::Stale
    }
}
