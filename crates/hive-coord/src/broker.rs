// Message broker: submit, peek, claim, complete, reply, ask.
//
// Claim is the exactly-once pivot: it re-reads the row inside a BEGIN
// IMMEDIATE transaction, so among N concurrent claimants exactly one sees
// `pending` and commits the transition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, OptionalExtension, Transaction};
use serde_json::Value;

use hive_guard::RateLimiter;
use hive_types::{
    format_ts, new_id, now, Message, MessageKind, MessageStatus, NewMessage, DEFAULT_PRIORITY,
    GENERAL_CHANNEL, MAX_PRIORITY, MIN_PRIORITY, PROTOCOL_VERSION,
};

use crate::audit;
use crate::db::{row_to_message, CoordStore, MESSAGE_COLUMNS};
use crate::error::{CoordError, CoordResult};

/// Overall timeout for `ask` when the caller does not supply one.
pub const DEFAULT_ASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Failed deliveries tolerated before a direct message is dead-lettered.
pub const MAX_DELIVERY_ATTEMPTS: i64 = 3;

const ASK_POLL_INITIAL: Duration = Duration::from_millis(50);
const ASK_POLL_CAP: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct MessageBroker {
    store: Arc<CoordStore>,
    limiter: Arc<RateLimiter>,
}

impl MessageBroker {
    pub fn new(store: Arc<CoordStore>, limiter: Arc<RateLimiter>) -> Self {
        Self { store, limiter }
    }

    /// Validate and persist a new message. Broadcasts additionally fan out
    /// one delivery row per current subscriber of the channel.
    pub async fn submit(&self, req: NewMessage) -> CoordResult<String> {
        let priority = req.priority.unwrap_or(DEFAULT_PRIORITY);
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(CoordError::InvalidMessage(format!(
                "priority {priority} outside {MIN_PRIORITY}..={MAX_PRIORITY}"
            )));
        }
        if !req.payload.is_object() {
            return Err(CoordError::InvalidMessage(
                "payload must be a JSON object".to_string(),
            ));
        }
        let version = req
            .version
            .clone()
            .unwrap_or_else(|| PROTOCOL_VERSION.to_string());
        if version != PROTOCOL_VERSION {
            return Err(CoordError::InvalidMessage(format!(
                "unsupported protocol version {version}"
            )));
        }
        if !self.limiter.allow(&req.from_agent) {
            return Err(CoordError::RateLimited(req.from_agent.clone()));
        }

        let id = new_id();
        let created = now();
        let created_s = format_ts(&created);
        let expires_s = req
            .ttl_secs
            .map(|ttl| format_ts(&(created + chrono::Duration::seconds(ttl))));
        let channel = req
            .channel
            .clone()
            .unwrap_or_else(|| GENERAL_CHANNEL.to_string());
        let payload_json = req.payload.to_string();
        let kind = req.kind.as_str().to_string();
        let message_id = id.clone();

        self.store
            .with_write(move |tx| {
                let recipients = if req.to_agent.is_none() {
                    let recipients = subscribers_of(tx, &channel)?;
                    if recipients.is_empty() && channel != GENERAL_CHANNEL {
                        return Err(CoordError::UnknownChannel(channel.clone()));
                    }
                    recipients
                } else {
                    Vec::new()
                };

                tx.execute(
                    "INSERT INTO messages (
                        id, kind, version, correlation_id, from_agent, to_agent, channel,
                        priority, payload, status, artifact_path, created_at, expires_at,
                        delivery_count, last_delivered_at, error
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10, ?11, ?12, 0, NULL, NULL)",
                    params![
                        message_id,
                        kind,
                        version,
                        req.correlation_id,
                        req.from_agent,
                        req.to_agent,
                        channel,
                        priority as i64,
                        payload_json,
                        req.artifact_path,
                        created_s,
                        expires_s,
                    ],
                )?;

                for recipient in &recipients {
                    tx.execute(
                        "INSERT OR IGNORE INTO broadcast_deliveries (message_id, agent_id, state, updated_at)
                         VALUES (?1, ?2, 'delivered', ?3)",
                        params![message_id, recipient, created_s],
                    )?;
                }

                let target = req
                    .to_agent
                    .clone()
                    .unwrap_or_else(|| format!("{channel} ({} recipients)", recipients.len()));
                audit::append(
                    tx,
                    &req.from_agent,
                    "message.submit",
                    &format!("{kind} {message_id} -> {target}"),
                )?;
                Ok(())
            })
            .await?;

        tracing::debug!(id = %id, "message submitted");
        Ok(id)
    }

    /// Read-only view of this agent's pending messages across `channels`,
    /// ordered by priority descending then age. Never mutates state.
    pub async fn peek(
        &self,
        agent: &str,
        channels: &[&str],
        limit: usize,
    ) -> CoordResult<Vec<Message>> {
        if channels.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (2..2 + channels.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let expiry_idx = 2 + channels.len();
        let limit_idx = expiry_idx + 1;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE status = 'pending'
               AND channel IN ({placeholders})
               AND (expires_at IS NULL OR expires_at > ?{expiry_idx})
               AND (to_agent = ?1
                    OR (to_agent IS NULL AND EXISTS (
                        SELECT 1 FROM broadcast_deliveries d
                        WHERE d.message_id = messages.id
                          AND d.agent_id = ?1
                          AND d.state = 'delivered')))
             ORDER BY priority DESC, created_at ASC
             LIMIT ?{limit_idx}"
        );

        let mut values: Vec<SqlValue> = Vec::with_capacity(channels.len() + 3);
        values.push(SqlValue::Text(agent.to_string()));
        for channel in channels {
            values.push(SqlValue::Text((*channel).to_string()));
        }
        values.push(SqlValue::Text(format_ts(&now())));
        values.push(SqlValue::Integer(limit as i64));

        self.store
            .read(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let messages = stmt
                    .query_map(rusqlite::params_from_iter(values.iter()), row_to_message)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(messages)
            })
            .await
    }

    /// Fetch one message by ID.
    pub async fn get(&self, message_id: &str) -> CoordResult<Message> {
        let message_id = message_id.to_string();
        self.store
            .read(move |conn| {
                fetch_message(conn, &message_id)?
                    .ok_or_else(|| CoordError::NotFound(message_id.clone()))
            })
            .await
    }

    /// Atomically take a pending message. For a direct message this is the
    /// `pending -> processing` transition; for a broadcast only the caller's
    /// delivery row moves to `acknowledged`. Returns false when someone else
    /// got there first (or the message is gone / not addressed to the caller).
    pub async fn claim(&self, agent: &str, message_id: &str) -> CoordResult<bool> {
        let agent = agent.to_string();
        let message_id = message_id.to_string();
        self.store
            .with_write(move |tx| {
                let row = tx
                    .query_row(
                        "SELECT status, to_agent FROM messages WHERE id = ?1",
                        params![message_id],
                        |r| Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?)),
                    )
                    .optional()?;
                let Some((status, to_agent)) = row else {
                    return Ok(false);
                };
                if status != MessageStatus::Pending.as_str() {
                    return Ok(false);
                }

                let claimed = match to_agent {
                    Some(recipient) => {
                        if recipient != agent {
                            return Ok(false);
                        }
                        tx.execute(
                            "UPDATE messages
                             SET status = 'processing',
                                 delivery_count = delivery_count + 1,
                                 last_delivered_at = ?2
                             WHERE id = ?1 AND status = 'pending'",
                            params![message_id, format_ts(&now())],
                        )? == 1
                    }
                    None => {
                        tx.execute(
                            "UPDATE broadcast_deliveries
                             SET state = 'acknowledged', updated_at = ?3
                             WHERE message_id = ?1 AND agent_id = ?2 AND state = 'delivered'",
                            params![message_id, agent, format_ts(&now())],
                        )? == 1
                    }
                };

                if claimed {
                    audit::append(tx, &agent, "message.claim", &message_id)?;
                }
                Ok(claimed)
            })
            .await
    }

    /// Finish a claimed direct message. Without an error the message is done;
    /// with one it goes back to `pending` for another attempt, or to the
    /// dead-letter archive once `MAX_DELIVERY_ATTEMPTS` deliveries have
    /// failed. Per-recipient completion of a broadcast leaves the message row
    /// untouched (it ages out at TTL).
    pub async fn complete(&self, message_id: &str, error: Option<&str>) -> CoordResult<()> {
        let message_id = message_id.to_string();
        let error = error.map(|e| e.to_string());
        self.store
            .with_write(move |tx| {
                let message = fetch_message(tx, &message_id)?
                    .ok_or_else(|| CoordError::NotFound(message_id.clone()))?;
                let actor = message
                    .to_agent
                    .clone()
                    .unwrap_or_else(|| message.from_agent.clone());

                if message.is_broadcast() {
                    audit::append(tx, &actor, "message.complete", &message_id)?;
                    return Ok(());
                }

                if message.status.is_terminal() {
                    return Err(CoordError::InvalidTransition {
                        from: message.status.as_str().to_string(),
                        to: match error {
                            Some(_) => "failed".to_string(),
                            None => "done".to_string(),
                        },
                    });
                }

                match &error {
                    None => {
                        tx.execute(
                            "UPDATE messages SET status = 'done', error = NULL WHERE id = ?1",
                            params![message_id],
                        )?;
                        audit::append(tx, &actor, "message.complete", &message_id)?;
                    }
                    Some(err) if message.delivery_count >= MAX_DELIVERY_ATTEMPTS => {
                        let mut envelope = message.clone();
                        envelope.status = MessageStatus::Failed;
                        envelope.error = Some(err.clone());
                        tx.execute(
                            "INSERT OR REPLACE INTO dead_letter
                                 (message_id, envelope, error, retry_count, archived_at)
                             VALUES (?1, ?2, ?3, ?4, ?5)",
                            params![
                                message_id,
                                serde_json::to_string(&envelope)?,
                                err,
                                message.delivery_count,
                                format_ts(&now()),
                            ],
                        )?;
                        tx.execute("DELETE FROM messages WHERE id = ?1", params![message_id])?;
                        audit::append(
                            tx,
                            &actor,
                            "message.dead_letter",
                            &format!("{message_id} after {} deliveries", message.delivery_count),
                        )?;
                    }
                    Some(err) => {
                        // Requeue for another delivery attempt.
                        tx.execute(
                            "UPDATE messages SET status = 'pending', error = ?2 WHERE id = ?1",
                            params![message_id, err],
                        )?;
                        audit::append(
                            tx,
                            &actor,
                            "message.failed",
                            &format!("{message_id}: {err}"),
                        )?;
                    }
                }
                Ok(())
            })
            .await
    }

    /// Explicitly dismiss a broadcast this agent does not intend to act on.
    pub async fn dismiss(&self, agent: &str, message_id: &str) -> CoordResult<()> {
        let agent = agent.to_string();
        let message_id = message_id.to_string();
        self.store
            .with_write(move |tx| {
                let updated = tx.execute(
                    "UPDATE broadcast_deliveries
                     SET state = 'skipped', updated_at = ?3
                     WHERE message_id = ?1 AND agent_id = ?2 AND state = 'delivered'",
                    params![message_id, agent, format_ts(&now())],
                )?;
                if updated == 0 {
                    return Err(CoordError::NotFound(format!(
                        "no pending delivery of {message_id} for {agent}"
                    )));
                }
                audit::append(tx, &agent, "message.dismiss", &message_id)?;
                Ok(())
            })
            .await
    }

    /// Reply to an inbound request: same channel and priority, swapped
    /// sender/recipient, correlation preserved, then the inbound completes
    /// as done.
    pub async fn reply(&self, inbound: &Message, payload: Value) -> CoordResult<String> {
        self.reply_with_kind(inbound, inbound.kind.response_kind(), payload)
            .await
    }

    pub async fn reply_with_kind(
        &self,
        inbound: &Message,
        kind: MessageKind,
        payload: Value,
    ) -> CoordResult<String> {
        let sender = inbound.to_agent.clone().ok_or_else(|| {
            CoordError::InvalidMessage("cannot reply to a broadcast".to_string())
        })?;
        let correlation_id = inbound.correlation_id.clone().unwrap_or_else(new_id);

        let reply_id = self
            .submit(NewMessage {
                from_agent: sender,
                kind,
                payload,
                to_agent: Some(inbound.from_agent.clone()),
                channel: Some(inbound.channel.clone()),
                priority: Some(inbound.priority),
                correlation_id: Some(correlation_id),
                ttl_secs: None,
                version: None,
                artifact_path: None,
            })
            .await?;
        self.complete(&inbound.id, None).await?;
        Ok(reply_id)
    }

    /// Submit a request and wait for the correlated response, polling with
    /// exponential backoff. The response is claimed and completed before its
    /// payload is returned. On timeout the request stays in flight; a late
    /// response is garbage-collected at TTL.
    pub async fn ask(
        &self,
        agent: &str,
        recipient: &str,
        kind: MessageKind,
        payload: Value,
        timeout: Duration,
    ) -> CoordResult<Value> {
        let correlation_id = new_id();
        let request_id = self
            .submit(
                NewMessage::direct(agent, recipient, kind, payload)
                    .with_correlation_id(correlation_id.clone()),
            )
            .await?;

        let deadline = Instant::now() + timeout;
        let mut delay = ASK_POLL_INITIAL;
        loop {
            if let Some(response) = self
                .find_response(agent, &correlation_id, &request_id)
                .await?
            {
                if self.claim(agent, &response.id).await? {
                    self.complete(&response.id, None).await?;
                    return Ok(response.payload);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(CoordError::Timeout(timeout));
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(ASK_POLL_CAP);
        }
    }

    async fn find_response(
        &self,
        agent: &str,
        correlation_id: &str,
        request_id: &str,
    ) -> CoordResult<Option<Message>> {
        let agent = agent.to_string();
        let correlation_id = correlation_id.to_string();
        let request_id = request_id.to_string();
        self.store
            .read(move |conn| {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE correlation_id = ?1 AND to_agent = ?2
                       AND status = 'pending' AND id != ?3
                     ORDER BY created_at ASC LIMIT 1"
                );
                let message = conn
                    .query_row(&sql, params![correlation_id, agent, request_id], row_to_message)
                    .optional()?;
                Ok(message)
            })
            .await
    }
}

/// Current recipients of a broadcast on `channel`: explicit subscribers,
/// plus every known agent for the implicit `general` subscription.
fn subscribers_of(tx: &Transaction<'_>, channel: &str) -> CoordResult<Vec<String>> {
    let sql = if channel == GENERAL_CHANNEL {
        "SELECT agent_id FROM channel_subscriptions WHERE channel = ?1
         UNION SELECT agent_id FROM agent_status ORDER BY 1"
    } else {
        "SELECT agent_id FROM channel_subscriptions WHERE channel = ?1 ORDER BY agent_id"
    };
    let mut stmt = tx.prepare(sql)?;
    let recipients = stmt
        .query_map(params![channel], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(recipients)
}

pub(crate) fn fetch_message(
    conn: &rusqlite::Connection,
    message_id: &str,
) -> CoordResult<Option<Message>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![message_id], row_to_message)
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentRegistry;
    use hive_types::AgentState;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (MessageBroker, AgentRegistry, Arc<CoordStore>, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(CoordStore::open(temp.path()).await.unwrap());
        let limiter = Arc::new(RateLimiter::default());
        let broker = MessageBroker::new(store.clone(), limiter);
        let registry = AgentRegistry::new(store.clone());
        (broker, registry, store, temp)
    }

    #[tokio::test]
    async fn submit_rejects_bad_priority_and_payload() {
        let (broker, _registry, _store, _temp) = setup().await;

        let req = NewMessage::direct("a", "b", MessageKind::Broadcast, json!({})).with_priority(11);
        assert!(matches!(
            broker.submit(req).await,
            Err(CoordError::InvalidMessage(_))
        ));

        let req = NewMessage::direct("a", "b", MessageKind::Broadcast, json!("not an object"));
        assert!(matches!(
            broker.submit(req).await,
            Err(CoordError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn direct_message_round_trip() {
        let (broker, _registry, _store, _temp) = setup().await;

        let id = broker
            .submit(NewMessage::direct(
                "alice",
                "bob",
                MessageKind::ContextQuery,
                json!({"query": "ui"}),
            ))
            .await
            .unwrap();

        let inbox = broker.peek("bob", &[GENERAL_CHANNEL], 10).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].id, id);

        // Nothing for a third party.
        assert!(broker
            .peek("carol", &[GENERAL_CHANNEL], 10)
            .await
            .unwrap()
            .is_empty());

        assert!(broker.claim("bob", &id).await.unwrap());
        let claimed = broker.get(&id).await.unwrap();
        assert_eq!(claimed.status, MessageStatus::Processing);
        assert_eq!(claimed.delivery_count, 1);

        // Second claim observes the row no longer pending.
        assert!(!broker.claim("bob", &id).await.unwrap());

        broker.complete(&id, None).await.unwrap();
        assert_eq!(
            broker.get(&id).await.unwrap().status,
            MessageStatus::Done
        );
    }

    #[tokio::test]
    async fn peek_orders_by_priority_then_age() {
        let (broker, _registry, _store, _temp) = setup().await;

        let low = broker
            .submit(
                NewMessage::direct("a", "w", MessageKind::from("job.low"), json!({}))
                    .with_priority(2),
            )
            .await
            .unwrap();
        let urgent = broker
            .submit(
                NewMessage::direct("a", "w", MessageKind::from("job.urgent"), json!({}))
                    .with_priority(9),
            )
            .await
            .unwrap();
        let normal = broker
            .submit(NewMessage::direct("a", "w", MessageKind::from("job.norm"), json!({})))
            .await
            .unwrap();

        let inbox = broker.peek("w", &[GENERAL_CHANNEL], 10).await.unwrap();
        let ids: Vec<_> = inbox.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![urgent.as_str(), normal.as_str(), low.as_str()]);
    }

    #[tokio::test]
    async fn broadcast_fans_out_to_current_subscribers_only() {
        let (broker, registry, _store, _temp) = setup().await;
        registry.heartbeat("a", AgentState::Active, None).await.unwrap();
        registry.heartbeat("b", AgentState::Active, None).await.unwrap();

        let id = broker
            .submit(NewMessage::broadcast(
                "a",
                GENERAL_CHANNEL,
                MessageKind::Broadcast,
                json!({"note": "hello"}),
            ))
            .await
            .unwrap();

        // Late subscriber gets no delivery row.
        registry.heartbeat("late", AgentState::Active, None).await.unwrap();
        assert!(broker.peek("late", &[GENERAL_CHANNEL], 10).await.unwrap().is_empty());

        // Both original subscribers see it; acknowledging is per-recipient.
        assert_eq!(broker.peek("a", &[GENERAL_CHANNEL], 10).await.unwrap().len(), 1);
        assert!(broker.claim("a", &id).await.unwrap());
        assert!(!broker.claim("a", &id).await.unwrap());
        assert_eq!(broker.peek("a", &[GENERAL_CHANNEL], 10).await.unwrap().len(), 0);
        assert_eq!(broker.peek("b", &[GENERAL_CHANNEL], 10).await.unwrap().len(), 1);
        assert!(broker.claim("b", &id).await.unwrap());
    }

    #[tokio::test]
    async fn broadcast_to_unknown_channel_is_rejected() {
        let (broker, _registry, _store, _temp) = setup().await;
        let result = broker
            .submit(NewMessage::broadcast(
                "a",
                "nobody-listens-here",
                MessageKind::Broadcast,
                json!({}),
            ))
            .await;
        assert!(matches!(result, Err(CoordError::UnknownChannel(_))));
    }

    #[tokio::test]
    async fn failed_completion_requeues_then_dead_letters() {
        let (broker, _registry, store, _temp) = setup().await;

        let id = broker
            .submit(NewMessage::direct("a", "w", MessageKind::from("job.run"), json!({})))
            .await
            .unwrap();

        for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
            assert!(broker.claim("w", &id).await.unwrap(), "attempt {attempt}");
            broker.complete(&id, Some("boom")).await.unwrap();
        }

        // Third failure moved it to the archive.
        assert!(matches!(
            broker.get(&id).await,
            Err(CoordError::NotFound(_))
        ));
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.dead_letters, 1);
        assert_eq!(stats.messages, 0);
    }

    #[tokio::test]
    async fn reply_preserves_correlation_and_completes_inbound() {
        let (broker, _registry, _store, _temp) = setup().await;

        let id = broker
            .submit(
                NewMessage::direct("alice", "bob", MessageKind::ContextQuery, json!({"q": 1}))
                    .with_correlation_id("corr-1"),
            )
            .await
            .unwrap();

        let inbound = broker.get(&id).await.unwrap();
        assert!(broker.claim("bob", &id).await.unwrap());
        let reply_id = broker
            .reply(&inbound, json!({"answer": 42}))
            .await
            .unwrap();

        let reply = broker.get(&reply_id).await.unwrap();
        assert_eq!(reply.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(reply.kind, MessageKind::ContextResponse);
        assert_eq!(reply.to_agent.as_deref(), Some("alice"));
        assert_eq!(reply.from_agent, "bob");

        assert_eq!(
            broker.get(&id).await.unwrap().status,
            MessageStatus::Done
        );
    }

    #[tokio::test]
    async fn ask_times_out_when_nobody_answers() {
        let (broker, _registry, _store, _temp) = setup().await;
        let result = broker
            .ask(
                "alice",
                "ghost",
                MessageKind::ContextQuery,
                json!({"q": "anyone?"}),
                Duration::from_millis(150),
            )
            .await;
        assert!(matches!(result, Err(CoordError::Timeout(_))));
    }

    #[tokio::test]
    async fn rate_limiter_guards_submit() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(CoordStore::open(temp.path()).await.unwrap());
        let limiter = Arc::new(RateLimiter::new(hive_guard::RateLimiterConfig {
            capacity: 2.0,
            refill_per_sec: 0.0,
        }));
        let broker = MessageBroker::new(store, limiter);

        for _ in 0..2 {
            broker
                .submit(NewMessage::direct("spammer", "w", MessageKind::Heartbeat, json!({})))
                .await
                .unwrap();
        }
        assert!(matches!(
            broker
                .submit(NewMessage::direct("spammer", "w", MessageKind::Heartbeat, json!({})))
                .await,
            Err(CoordError::RateLimited(_))
        ));
    }
}
