// Voting types: vote records, ballots, and tally results.
// BTreeMap keeps ballot and tally serialization deterministic so a stored
// result re-serializes byte-identically.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteMechanism {
    SimpleMajority,
    Weighted,
    Consensus,
}

impl VoteMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteMechanism::SimpleMajority => "simple_majority",
            VoteMechanism::Weighted => "weighted",
            VoteMechanism::Consensus => "consensus",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "simple_majority" => Some(VoteMechanism::SimpleMajority),
            "weighted" => Some(VoteMechanism::Weighted),
            "consensus" => Some(VoteMechanism::Consensus),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteStatus {
    Open,
    Closed,
    Cancelled,
}

impl VoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteStatus::Open => "open",
            VoteStatus::Closed => "closed",
            VoteStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open" => Some(VoteStatus::Open),
            "closed" => Some(VoteStatus::Closed),
            "cancelled" => Some(VoteStatus::Cancelled),
            _ => None,
        }
    }
}

/// Consensus stance attached to a ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Support,
    Acceptable,
    Block,
}

/// One voter's recorded ballot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ballot {
    pub choice: String,
    #[serde(default)]
    pub stance: Option<Stance>,
    #[serde(default)]
    pub reasoning: Option<String>,
    pub cast_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteOutcome {
    /// A single option had the strictly greatest (weighted) count.
    Decided,
    Tie,
    /// Consensus passed: no blocks and majority support.
    Passed,
    /// Consensus blocked by at least one voter, or support short of majority.
    Blocked,
    /// Fewer than half the eligible voters cast.
    NoQuorum,
}

/// A voter who blocked a consensus vote, with their stated reasoning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blocker {
    pub voter: String,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Result record produced by the single tally of a vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResult {
    pub outcome: VoteOutcome,
    pub winner: Option<String>,
    /// Per-option counts (weighted sums under the weighted mechanism).
    pub tally: BTreeMap<String, i64>,
    /// Number of `support` stances; meaningful for consensus only.
    pub support: i64,
    pub blockers: Vec<Blocker>,
    pub ballots_cast: i64,
    pub eligible: i64,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub vote_id: String,
    pub topic: String,
    pub options: Vec<String>,
    pub mechanism: VoteMechanism,
    pub proposer: String,
    pub eligible: Vec<String>,
    /// Voter weights for the weighted mechanism; absent voters count as 1.
    #[serde(default)]
    pub weights: Option<BTreeMap<String, i64>>,
    pub deadline: DateTime<Utc>,
    pub status: VoteStatus,
    pub ballots: BTreeMap<String, Ballot>,
    pub result: Option<VoteResult>,
    pub created_at: DateTime<Utc>,
}

impl Vote {
    pub fn quorum_met(&self) -> bool {
        self.ballots.len() * 2 >= self.eligible.len()
    }
}

/// Initiation request for a new vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVote {
    pub proposer: String,
    pub topic: String,
    pub options: Vec<String>,
    pub mechanism: VoteMechanism,
    pub eligible: Vec<String>,
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub weights: Option<BTreeMap<String, i64>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_requires_half_of_eligible() {
        let mut vote = Vote {
            vote_id: "v".into(),
            topic: "t".into(),
            options: vec!["yes".into(), "no".into()],
            mechanism: VoteMechanism::SimpleMajority,
            proposer: "p".into(),
            eligible: vec!["a".into(), "b".into(), "c".into()],
            weights: None,
            deadline: Utc::now(),
            status: VoteStatus::Open,
            ballots: BTreeMap::new(),
            result: None,
            created_at: Utc::now(),
        };
        assert!(!vote.quorum_met());

        vote.ballots.insert(
            "a".into(),
            Ballot {
                choice: "yes".into(),
                stance: None,
                reasoning: None,
                cast_at: Utc::now(),
            },
        );
        assert!(!vote.quorum_met());

        vote.ballots.insert(
            "b".into(),
            Ballot {
                choice: "no".into(),
                stance: None,
                reasoning: None,
                cast_at: Utc::now(),
            },
        );
        assert!(vote.quorum_met());
    }
}
