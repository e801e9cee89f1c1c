// Message envelope types.
// The envelope is a tagged union over the standard routing types with an
// open `Other` variant so unknown types flow through opaquely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Semantic message type. Standard kinds are routing labels, not enforced
/// schemas; anything else is carried verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    ContextQuery,
    ContextResponse,
    TaskClaim,
    TaskUpdate,
    VoteInitiate,
    VoteCast,
    VoteResult,
    Heartbeat,
    Broadcast,
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::ContextQuery => "context.query",
            MessageKind::ContextResponse => "context.response",
            MessageKind::TaskClaim => "task.claim",
            MessageKind::TaskUpdate => "task.update",
            MessageKind::VoteInitiate => "vote.initiate",
            MessageKind::VoteCast => "vote.cast",
            MessageKind::VoteResult => "vote.result",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Broadcast => "broadcast",
            MessageKind::Other(s) => s.as_str(),
        }
    }

    /// The kind a reply to this message carries by default: the paired
    /// standard kind where one exists, otherwise the type with `.response`
    /// appended.
    pub fn response_kind(&self) -> MessageKind {
        match self {
            MessageKind::ContextQuery => MessageKind::ContextResponse,
            other => MessageKind::from(format!("{}.response", other.as_str())),
        }
    }
}

impl From<String> for MessageKind {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "context.query" => MessageKind::ContextQuery,
            "context.response" => MessageKind::ContextResponse,
            "task.claim" => MessageKind::TaskClaim,
            "task.update" => MessageKind::TaskUpdate,
            "vote.initiate" => MessageKind::VoteInitiate,
            "vote.cast" => MessageKind::VoteCast,
            "vote.result" => MessageKind::VoteResult,
            "heartbeat" => MessageKind::Heartbeat,
            "broadcast" => MessageKind::Broadcast,
            _ => MessageKind::Other(raw),
        }
    }
}

impl From<&str> for MessageKind {
    fn from(raw: &str) -> Self {
        MessageKind::from(raw.to_string())
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a direct message. Broadcasts stay `pending` until TTL and
/// track progress per recipient instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Done => "done",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(MessageStatus::Pending),
            "processing" => Some(MessageStatus::Processing),
            "done" => Some(MessageStatus::Done),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Done | MessageStatus::Failed)
    }
}

/// Per-recipient delivery state for a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Delivered,
    Acknowledged,
    Skipped,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Delivered => "delivered",
            DeliveryState::Acknowledged => "acknowledged",
            DeliveryState::Skipped => "skipped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "delivered" => Some(DeliveryState::Delivered),
            "acknowledged" => Some(DeliveryState::Acknowledged),
            "skipped" => Some(DeliveryState::Skipped),
            _ => None,
        }
    }
}

/// A persisted message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    pub version: String,
    pub correlation_id: Option<String>,
    pub from_agent: String,
    /// `None` marks a broadcast fanned out to channel subscribers.
    pub to_agent: Option<String>,
    pub channel: String,
    pub priority: u8,
    pub payload: Value,
    pub status: MessageStatus,
    /// Out-of-band payload reference under the artifacts directory.
    pub artifact_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub delivery_count: i64,
    pub last_delivered_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Message {
    pub fn is_broadcast(&self) -> bool {
        self.to_agent.is_none()
    }
}

/// Submission request for a new message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub from_agent: String,
    pub kind: MessageKind,
    pub payload: Value,
    #[serde(default)]
    pub to_agent: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub ttl_secs: Option<i64>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub artifact_path: Option<String>,
}

impl NewMessage {
    /// A direct message to one recipient on the default channel.
    pub fn direct(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        kind: MessageKind,
        payload: Value,
    ) -> Self {
        Self {
            from_agent: from_agent.into(),
            kind,
            payload,
            to_agent: Some(to_agent.into()),
            channel: None,
            priority: None,
            correlation_id: None,
            ttl_secs: None,
            version: None,
            artifact_path: None,
        }
    }

    /// A broadcast fanned out to the channel's current subscribers.
    pub fn broadcast(
        from_agent: impl Into<String>,
        channel: impl Into<String>,
        kind: MessageKind,
        payload: Value,
    ) -> Self {
        Self {
            from_agent: from_agent.into(),
            kind,
            payload,
            to_agent: None,
            channel: Some(channel.into()),
            priority: None,
            correlation_id: None,
            ttl_secs: None,
            version: None,
            artifact_path: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_ttl_secs(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }
}

/// Aggregated fan-out coverage for one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastStatus {
    pub delivered: i64,
    pub acknowledged: i64,
    pub skipped: i64,
}

/// One recipient's delivery row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastRecipient {
    pub agent_id: String,
    pub state: DeliveryState,
    pub updated_at: DateTime<Utc>,
}

/// A failed message archived out of the live queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: Message,
    pub error: String,
    pub retry_count: i64,
    pub archived_at: DateTime<Utc>,
}

/// Append-only audit record written with every state-changing operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: i64,
    pub at: DateTime<Utc>,
    pub actor: String,
    pub kind: String,
    pub summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_standard_and_open_types() {
        assert_eq!(MessageKind::from("context.query"), MessageKind::ContextQuery);
        assert_eq!(MessageKind::ContextQuery.as_str(), "context.query");

        let custom = MessageKind::from("deploy.request");
        assert_eq!(custom, MessageKind::Other("deploy.request".to_string()));
        assert_eq!(custom.as_str(), "deploy.request");
    }

    #[test]
    fn response_kind_pairs_context_query() {
        assert_eq!(
            MessageKind::ContextQuery.response_kind(),
            MessageKind::ContextResponse
        );
        assert_eq!(
            MessageKind::from("deploy.request").response_kind().as_str(),
            "deploy.request.response"
        );
    }

    #[test]
    fn kind_serializes_as_plain_string() {
        let raw = serde_json::to_string(&MessageKind::VoteInitiate).unwrap();
        assert_eq!(raw, "\"vote.initiate\"");
        let back: MessageKind = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, MessageKind::VoteInitiate);
    }
}
