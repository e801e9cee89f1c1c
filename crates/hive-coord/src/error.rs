// Error taxonomy for the coordination core.
// Validation and conflict errors surface to the caller verbatim; only the
// store's write path retries, and only on transient contention.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("invalid vote: {0}")]
    InvalidVote(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("already claimed: {0}")]
    AlreadyClaimed(String),

    #[error("voter {0} already cast a ballot")]
    AlreadyVoted(String),

    #[error("vote {0} is closed")]
    VoteClosed(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("dependencies unmet: {0:?}")]
    DependenciesUnmet(Vec<String>),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("agent {0} is not eligible")]
    NotEligible(String),

    #[error("insufficient voters: {got} provided, {need} required")]
    InsufficientVoters { got: usize, need: usize },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("circuit open: {0}")]
    CircuitOpen(String),

    #[error("store unavailable after {attempts} attempts: {last}")]
    StoreUnavailable { attempts: u32, last: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CoordResult<T> = Result<T, CoordError>;
