// Voting engine: initiate, cast, tally, with three tally mechanisms.
//
// Tally is idempotent: the first call closes the vote and stores the result
// record; later calls return the stored record unchanged. All vote state
// lives in one row, so cast/tally are single check-then-write transactions.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use serde_json::json;

use hive_types::{
    format_ts, new_id, now, Ballot, Blocker, NewMessage, NewVote, Stance, Vote, VoteMechanism,
    VoteOutcome, VoteResult, VoteStatus, URGENT_CHANNEL,
};

use crate::audit;
use crate::broker::MessageBroker;
use crate::db::{row_to_vote, CoordStore, VOTE_COLUMNS};
use crate::error::{CoordError, CoordResult};

pub const MIN_ELIGIBLE_VOTERS: usize = 3;
pub const MAX_WEIGHT: i64 = 3;

/// Vote initiations and results go out as urgent direct messages.
const VOTE_MESSAGE_PRIORITY: u8 = 9;

#[derive(Clone)]
pub struct VotingEngine {
    store: Arc<CoordStore>,
    broker: MessageBroker,
}

impl VotingEngine {
    pub fn new(store: Arc<CoordStore>, broker: MessageBroker) -> Self {
        Self { store, broker }
    }

    /// Open a vote and notify every eligible voter with a `vote.initiate`
    /// message on the urgent channel.
    pub async fn initiate(&self, req: NewVote) -> CoordResult<String> {
        let unique_options: HashSet<&String> = req.options.iter().collect();
        if req.options.len() < 2 || unique_options.len() != req.options.len() {
            return Err(CoordError::InvalidVote(
                "at least two unique options required".to_string(),
            ));
        }

        let mut eligible: Vec<String> = Vec::new();
        for voter in &req.eligible {
            if !eligible.contains(voter) {
                eligible.push(voter.clone());
            }
        }
        if eligible.len() < MIN_ELIGIBLE_VOTERS {
            return Err(CoordError::InsufficientVoters {
                got: eligible.len(),
                need: MIN_ELIGIBLE_VOTERS,
            });
        }

        let created = now();
        if req.deadline <= created {
            return Err(CoordError::InvalidVote(
                "deadline must be in the future".to_string(),
            ));
        }

        if let Some(weights) = &req.weights {
            if req.mechanism != VoteMechanism::Weighted {
                return Err(CoordError::InvalidVote(
                    "weights only apply to the weighted mechanism".to_string(),
                ));
            }
            for (voter, weight) in weights {
                if !eligible.contains(voter) {
                    return Err(CoordError::InvalidVote(format!(
                        "weight for non-eligible voter {voter}"
                    )));
                }
                if !(1..=MAX_WEIGHT).contains(weight) {
                    return Err(CoordError::InvalidVote(format!(
                        "weight {weight} for {voter} outside 1..={MAX_WEIGHT}"
                    )));
                }
            }
        }

        let vote_id = new_id();
        let row_id = vote_id.clone();
        let topic = req.topic.clone();
        let proposer = req.proposer.clone();
        let options_json = serde_json::to_string(&req.options)?;
        let eligible_json = serde_json::to_string(&eligible)?;
        let weights_json = req
            .weights
            .as_ref()
            .map(|w| serde_json::to_string(w))
            .transpose()?;
        let deadline_s = format_ts(&req.deadline);
        let created_s = format_ts(&created);
        let mechanism = req.mechanism.as_str();

        self.store
            .with_write(move |tx| {
                tx.execute(
                    "INSERT INTO votes (
                        vote_id, topic, options, mechanism, proposer, eligible,
                        weights, deadline, status, ballots, result, created_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'open', '{}', NULL, ?9)",
                    params![
                        row_id,
                        topic,
                        options_json,
                        mechanism,
                        proposer,
                        eligible_json,
                        weights_json,
                        deadline_s,
                        created_s,
                    ],
                )?;
                audit::append(
                    tx,
                    &proposer,
                    "vote.initiate",
                    &format!("{row_id}: {topic}"),
                )?;
                Ok(())
            })
            .await?;

        for voter in &eligible {
            self.broker
                .submit(
                    NewMessage::direct(
                        req.proposer.clone(),
                        voter.clone(),
                        hive_types::MessageKind::VoteInitiate,
                        json!({
                            "vote_id": vote_id,
                            "topic": req.topic,
                            "options": req.options,
                            "mechanism": req.mechanism,
                            "deadline": format_ts(&req.deadline),
                        }),
                    )
                    .with_channel(URGENT_CHANNEL)
                    .with_priority(VOTE_MESSAGE_PRIORITY),
                )
                .await?;
        }

        tracing::info!(vote_id = %vote_id, voters = eligible.len(), "vote initiated");
        Ok(vote_id)
    }

    /// Record one voter's ballot. Refused once the vote is closed, past its
    /// deadline, for non-eligible voters, unknown options, or a repeat vote.
    pub async fn cast(
        &self,
        voter: &str,
        vote_id: &str,
        choice: &str,
        stance: Option<Stance>,
        reasoning: Option<String>,
    ) -> CoordResult<()> {
        let voter = voter.to_string();
        let vote_id = vote_id.to_string();
        let choice = choice.to_string();
        self.store
            .with_write(move |tx| {
                let mut vote = fetch_vote(tx, &vote_id)?
                    .ok_or_else(|| CoordError::NotFound(vote_id.clone()))?;

                if vote.status != VoteStatus::Open {
                    return Err(CoordError::VoteClosed(vote_id.clone()));
                }
                if now() >= vote.deadline {
                    return Err(CoordError::VoteClosed(vote_id.clone()));
                }
                if !vote.eligible.contains(&voter) {
                    return Err(CoordError::NotEligible(voter.clone()));
                }
                if !vote.options.contains(&choice) {
                    return Err(CoordError::InvalidVote(format!("unknown option {choice}")));
                }
                if vote.ballots.contains_key(&voter) {
                    return Err(CoordError::AlreadyVoted(voter.clone()));
                }
                if vote.mechanism == VoteMechanism::Consensus && stance.is_none() {
                    return Err(CoordError::InvalidVote(
                        "consensus ballots carry a stance".to_string(),
                    ));
                }

                vote.ballots.insert(
                    voter.clone(),
                    Ballot {
                        choice: choice.clone(),
                        stance,
                        reasoning: reasoning.clone(),
                        cast_at: now(),
                    },
                );
                tx.execute(
                    "UPDATE votes SET ballots = ?2 WHERE vote_id = ?1",
                    params![vote_id, serde_json::to_string(&vote.ballots)?],
                )?;
                audit::append(tx, &voter, "vote.cast", &format!("{vote_id}: {choice}"))?;
                Ok(())
            })
            .await
    }

    /// Close the vote and compute its result, or return the stored result if
    /// it is already closed. An open vote past its deadline closes with
    /// whatever ballots were cast.
    pub async fn tally(&self, vote_id: &str) -> CoordResult<VoteResult> {
        let id = vote_id.to_string();
        let (result, newly_closed, vote) = self
            .store
            .with_write(move |tx| {
                let vote =
                    fetch_vote(tx, &id)?.ok_or_else(|| CoordError::NotFound(id.clone()))?;
                match vote.status {
                    VoteStatus::Closed => {
                        let stored = vote.result.clone().ok_or_else(|| {
                            CoordError::InvalidVote(format!("vote {id} closed without a result"))
                        })?;
                        return Ok((stored, false, vote));
                    }
                    VoteStatus::Cancelled => return Err(CoordError::VoteClosed(id.clone())),
                    VoteStatus::Open => {}
                }

                let result = compute_result(&vote);
                tx.execute(
                    "UPDATE votes SET status = 'closed', result = ?2 WHERE vote_id = ?1",
                    params![id, serde_json::to_string(&result)?],
                )?;
                audit::append(
                    tx,
                    &vote.proposer,
                    "vote.tally",
                    &format!("{id}: {:?}", result.outcome),
                )?;
                Ok((result, true, vote))
            })
            .await?;

        if newly_closed {
            let payload = json!({
                "vote_id": vote.vote_id,
                "topic": vote.topic,
                "result": serde_json::to_value(&result)?,
            });
            for voter in &vote.eligible {
                self.broker
                    .submit(
                        NewMessage::direct(
                            vote.proposer.clone(),
                            voter.clone(),
                            hive_types::MessageKind::VoteResult,
                            payload.clone(),
                        )
                        .with_channel(URGENT_CHANNEL)
                        .with_priority(VOTE_MESSAGE_PRIORITY),
                    )
                    .await?;
            }
            tracing::info!(vote_id = %vote.vote_id, outcome = ?result.outcome, "vote closed");
        }
        Ok(result)
    }

    pub async fn status(&self, vote_id: &str) -> CoordResult<Vote> {
        let vote_id = vote_id.to_string();
        self.store
            .read(move |conn| {
                fetch_vote(conn, &vote_id)?.ok_or_else(|| CoordError::NotFound(vote_id.clone()))
            })
            .await
    }

    /// Withdraw an open vote without producing a result.
    pub async fn cancel(&self, actor: &str, vote_id: &str) -> CoordResult<()> {
        let actor = actor.to_string();
        let vote_id = vote_id.to_string();
        self.store
            .with_write(move |tx| {
                let vote = fetch_vote(tx, &vote_id)?
                    .ok_or_else(|| CoordError::NotFound(vote_id.clone()))?;
                if vote.status != VoteStatus::Open {
                    return Err(CoordError::VoteClosed(vote_id.clone()));
                }
                tx.execute(
                    "UPDATE votes SET status = 'cancelled' WHERE vote_id = ?1",
                    params![vote_id],
                )?;
                audit::append(tx, &actor, "vote.cancel", &vote_id)?;
                Ok(())
            })
            .await
    }
}

fn fetch_vote(conn: &rusqlite::Connection, vote_id: &str) -> CoordResult<Option<Vote>> {
    let sql = format!("SELECT {VOTE_COLUMNS} FROM votes WHERE vote_id = ?1");
    Ok(conn
        .query_row(&sql, params![vote_id], row_to_vote)
        .optional()?)
}

fn compute_result(vote: &Vote) -> VoteResult {
    let ballots_cast = vote.ballots.len() as i64;
    let eligible = vote.eligible.len() as i64;

    let mut tally: BTreeMap<String, i64> = vote.options.iter().map(|o| (o.clone(), 0)).collect();
    for (voter, ballot) in &vote.ballots {
        let weight = match vote.mechanism {
            VoteMechanism::Weighted => vote
                .weights
                .as_ref()
                .and_then(|w| w.get(voter))
                .copied()
                .unwrap_or(1),
            _ => 1,
        };
        *tally.entry(ballot.choice.clone()).or_insert(0) += weight;
    }

    let support = vote
        .ballots
        .values()
        .filter(|b| b.stance == Some(Stance::Support))
        .count() as i64;
    let blockers: Vec<Blocker> = vote
        .ballots
        .iter()
        .filter(|(_, b)| b.stance == Some(Stance::Block))
        .map(|(voter, b)| Blocker {
            voter: voter.clone(),
            reasoning: b.reasoning.clone(),
        })
        .collect();

    let (outcome, winner) = if ballots_cast * 2 < eligible {
        (VoteOutcome::NoQuorum, None)
    } else {
        match vote.mechanism {
            VoteMechanism::SimpleMajority | VoteMechanism::Weighted => {
                let max = tally.values().copied().max().unwrap_or(0);
                let winners: Vec<&String> = tally
                    .iter()
                    .filter(|(_, count)| **count == max)
                    .map(|(option, _)| option)
                    .collect();
                if winners.len() == 1 {
                    (VoteOutcome::Decided, Some(winners[0].clone()))
                } else {
                    (VoteOutcome::Tie, None)
                }
            }
            VoteMechanism::Consensus => {
                // Passed needs no blocks and support from at least half the
                // ballots cast, rounded up.
                let needed = (ballots_cast + 1) / 2;
                if blockers.is_empty() && support >= needed {
                    (VoteOutcome::Passed, None)
                } else {
                    (VoteOutcome::Blocked, None)
                }
            }
        }
    };

    VoteResult {
        outcome,
        winner,
        tally,
        support,
        blockers,
        ballots_cast,
        eligible,
        decided_at: now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_guard::RateLimiter;
    use hive_types::MessageKind;
    use tempfile::TempDir;

    async fn setup() -> (VotingEngine, MessageBroker, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(CoordStore::open(temp.path()).await.unwrap());
        let broker = MessageBroker::new(store.clone(), Arc::new(RateLimiter::default()));
        (VotingEngine::new(store, broker.clone()), broker, temp)
    }

    fn proposal(options: &[&str], mechanism: VoteMechanism, voters: &[&str]) -> NewVote {
        NewVote {
            proposer: "lead".to_string(),
            topic: "adopt the plan".to_string(),
            options: options.iter().map(|s| s.to_string()).collect(),
            mechanism,
            eligible: voters.iter().map(|s| s.to_string()).collect(),
            deadline: now() + chrono::Duration::hours(1),
            weights: None,
        }
    }

    #[tokio::test]
    async fn initiate_validates_options_and_voters() {
        let (voting, _broker, _temp) = setup().await;

        let result = voting
            .initiate(proposal(&["yes"], VoteMechanism::SimpleMajority, &["a", "b", "c"]))
            .await;
        assert!(matches!(result, Err(CoordError::InvalidVote(_))));

        let result = voting
            .initiate(proposal(&["yes", "no"], VoteMechanism::SimpleMajority, &["a", "b"]))
            .await;
        assert!(matches!(
            result,
            Err(CoordError::InsufficientVoters { got: 2, need: 3 })
        ));
    }

    #[tokio::test]
    async fn initiate_notifies_every_voter_on_urgent() {
        let (voting, broker, _temp) = setup().await;
        let vote_id = voting
            .initiate(proposal(&["yes", "no"], VoteMechanism::SimpleMajority, &["a", "b", "c"]))
            .await
            .unwrap();

        for voter in ["a", "b", "c"] {
            let inbox = broker.peek(voter, &[URGENT_CHANNEL], 10).await.unwrap();
            assert_eq!(inbox.len(), 1, "voter {voter}");
            assert_eq!(inbox[0].kind, MessageKind::VoteInitiate);
            assert_eq!(inbox[0].priority, 9);
            assert_eq!(inbox[0].payload["vote_id"], vote_id.as_str());
        }
    }

    #[tokio::test]
    async fn simple_majority_decides_and_tally_is_idempotent() {
        let (voting, _broker, _temp) = setup().await;
        let id = voting
            .initiate(proposal(&["yes", "no"], VoteMechanism::SimpleMajority, &["a", "b", "c"]))
            .await
            .unwrap();

        voting.cast("a", &id, "yes", None, None).await.unwrap();
        voting.cast("b", &id, "yes", None, None).await.unwrap();
        voting.cast("c", &id, "no", None, None).await.unwrap();

        let first = voting.tally(&id).await.unwrap();
        assert_eq!(first.outcome, VoteOutcome::Decided);
        assert_eq!(first.winner.as_deref(), Some("yes"));
        assert_eq!(first.tally["yes"], 2);

        // Casting after close is refused; re-tally returns the stored record.
        assert!(matches!(
            voting.cast("c", &id, "no", None, None).await,
            Err(CoordError::VoteClosed(_))
        ));
        let second = voting.tally(&id).await.unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn tie_and_no_quorum_outcomes() {
        let (voting, _broker, _temp) = setup().await;

        let id = voting
            .initiate(proposal(&["yes", "no"], VoteMechanism::SimpleMajority, &["a", "b", "c", "d"]))
            .await
            .unwrap();
        voting.cast("a", &id, "yes", None, None).await.unwrap();
        voting.cast("b", &id, "no", None, None).await.unwrap();
        let result = voting.tally(&id).await.unwrap();
        assert_eq!(result.outcome, VoteOutcome::Tie);

        let id = voting
            .initiate(proposal(&["yes", "no"], VoteMechanism::SimpleMajority, &["a", "b", "c"]))
            .await
            .unwrap();
        voting.cast("a", &id, "yes", None, None).await.unwrap();
        let result = voting.tally(&id).await.unwrap();
        assert_eq!(result.outcome, VoteOutcome::NoQuorum, "1 of 3 cast");
    }

    #[tokio::test]
    async fn weighted_tally_uses_caller_weights() {
        let (voting, _broker, _temp) = setup().await;
        let mut req = proposal(&["yes", "no"], VoteMechanism::Weighted, &["a", "b", "c"]);
        req.weights = Some(BTreeMap::from([("a".to_string(), 3)]));
        let id = voting.initiate(req).await.unwrap();

        voting.cast("a", &id, "yes", None, None).await.unwrap();
        voting.cast("b", &id, "no", None, None).await.unwrap();
        voting.cast("c", &id, "no", None, None).await.unwrap();

        let result = voting.tally(&id).await.unwrap();
        assert_eq!(result.outcome, VoteOutcome::Decided);
        assert_eq!(result.winner.as_deref(), Some("yes"), "a's weight of 3 beats two 1s");
        assert_eq!(result.tally["yes"], 3);
        assert_eq!(result.tally["no"], 2);
    }

    #[tokio::test]
    async fn weight_cap_is_enforced() {
        let (voting, _broker, _temp) = setup().await;
        let mut req = proposal(&["yes", "no"], VoteMechanism::Weighted, &["a", "b", "c"]);
        req.weights = Some(BTreeMap::from([("a".to_string(), 4)]));
        assert!(matches!(
            voting.initiate(req).await,
            Err(CoordError::InvalidVote(_))
        ));
    }

    #[tokio::test]
    async fn consensus_block_wins_over_support() {
        let (voting, _broker, _temp) = setup().await;
        let id = voting
            .initiate(proposal(&["adopt", "defer"], VoteMechanism::Consensus, &["a", "b", "c"]))
            .await
            .unwrap();

        voting
            .cast("a", &id, "adopt", Some(Stance::Support), None)
            .await
            .unwrap();
        voting
            .cast("b", &id, "adopt", Some(Stance::Support), None)
            .await
            .unwrap();
        voting
            .cast(
                "c",
                &id,
                "defer",
                Some(Stance::Block),
                Some("migration unfinished".to_string()),
            )
            .await
            .unwrap();

        let result = voting.tally(&id).await.unwrap();
        assert_eq!(result.outcome, VoteOutcome::Blocked);
        assert_eq!(result.blockers.len(), 1);
        assert_eq!(result.blockers[0].voter, "c");
        assert_eq!(
            result.blockers[0].reasoning.as_deref(),
            Some("migration unfinished")
        );
    }

    #[tokio::test]
    async fn consensus_passes_with_majority_support_and_no_blocks() {
        let (voting, _broker, _temp) = setup().await;
        let id = voting
            .initiate(proposal(&["adopt", "defer"], VoteMechanism::Consensus, &["a", "b", "c"]))
            .await
            .unwrap();

        voting
            .cast("a", &id, "adopt", Some(Stance::Support), None)
            .await
            .unwrap();
        voting
            .cast("b", &id, "adopt", Some(Stance::Acceptable), None)
            .await
            .unwrap();
        voting
            .cast("c", &id, "adopt", Some(Stance::Support), None)
            .await
            .unwrap();

        let result = voting.tally(&id).await.unwrap();
        assert_eq!(result.outcome, VoteOutcome::Passed);
        assert_eq!(result.support, 2);
    }

    #[tokio::test]
    async fn double_vote_and_outsiders_are_refused() {
        let (voting, _broker, _temp) = setup().await;
        let id = voting
            .initiate(proposal(&["yes", "no"], VoteMechanism::SimpleMajority, &["a", "b", "c"]))
            .await
            .unwrap();

        voting.cast("a", &id, "yes", None, None).await.unwrap();
        assert!(matches!(
            voting.cast("a", &id, "no", None, None).await,
            Err(CoordError::AlreadyVoted(_))
        ));
        assert!(matches!(
            voting.cast("intruder", &id, "yes", None, None).await,
            Err(CoordError::NotEligible(_))
        ));
        assert!(matches!(
            voting.cast("b", &id, "maybe", None, None).await,
            Err(CoordError::InvalidVote(_))
        ));
    }

    #[tokio::test]
    async fn deadline_refuses_late_ballots_but_allows_tally() {
        let (voting, _broker, _temp) = setup().await;
        let mut req = proposal(&["yes", "no"], VoteMechanism::SimpleMajority, &["a", "b", "c"]);
        req.deadline = now() + chrono::Duration::milliseconds(40);
        let id = voting.initiate(req).await.unwrap();

        voting.cast("a", &id, "yes", None, None).await.unwrap();
        voting.cast("b", &id, "yes", None, None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;

        assert!(matches!(
            voting.cast("c", &id, "no", None, None).await,
            Err(CoordError::VoteClosed(_))
        ));

        // Explicit tally of an open, deadline-past vote closes it with the
        // ballots present.
        let result = voting.tally(&id).await.unwrap();
        assert_eq!(result.outcome, VoteOutcome::Decided);
        assert_eq!(result.ballots_cast, 2);
    }

    #[tokio::test]
    async fn result_messages_reach_every_voter() {
        let (voting, broker, _temp) = setup().await;
        let id = voting
            .initiate(proposal(&["yes", "no"], VoteMechanism::SimpleMajority, &["a", "b", "c"]))
            .await
            .unwrap();
        voting.cast("a", &id, "yes", None, None).await.unwrap();
        voting.cast("b", &id, "yes", None, None).await.unwrap();
        voting.tally(&id).await.unwrap();

        let inbox = broker.peek("c", &[URGENT_CHANNEL], 10).await.unwrap();
        let kinds: Vec<_> = inbox.iter().map(|m| m.kind.clone()).collect();
        assert!(kinds.contains(&MessageKind::VoteInitiate));
        assert!(kinds.contains(&MessageKind::VoteResult));
    }
}
