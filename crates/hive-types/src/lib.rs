pub mod agent;
pub mod id;
pub mod message;
pub mod task;
pub mod vote;

pub use agent::{AgentHealth, AgentRecord, AgentState, Liveness};
pub use id::{format_ts, new_id, now, parse_ts};
pub use message::{
    AuditEvent, BroadcastRecipient, BroadcastStatus, DeadLetter, DeliveryState, Message,
    MessageKind, MessageStatus, NewMessage,
};
pub use task::{NewTask, Task, TaskEvent, TaskOutcome, TaskStatus};
pub use vote::{
    Ballot, Blocker, NewVote, Stance, Vote, VoteMechanism, VoteOutcome, VoteResult, VoteStatus,
};

/// Protocol version stamped on every message and on the on-disk layout.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Channel every known agent is implicitly subscribed to.
pub const GENERAL_CHANNEL: &str = "general";

/// Channel used for vote initiations and results.
pub const URGENT_CHANNEL: &str = "urgent";

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;
