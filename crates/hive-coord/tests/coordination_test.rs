// End-to-end scenarios across the broker, board, voting, registry, and
// maintenance, driven through one Coordinator the way an agent process
// embeds the core.

use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use hive_coord::{CoordError, Coordinator};
use hive_types::{
    AgentState, MessageKind, MessageStatus, NewMessage, NewTask, NewVote, TaskOutcome, TaskStatus,
    VoteMechanism, VoteOutcome, GENERAL_CHANNEL,
};

async fn open_coordinator() -> (Coordinator, TempDir) {
    let temp = TempDir::new().unwrap();
    let coordinator = Coordinator::open(temp.path()).await.unwrap();
    (coordinator, temp)
}

#[tokio::test]
async fn context_query_round_trip_with_responder_loop() {
    let (coordinator, _temp) = open_coordinator().await;
    coordinator
        .registry
        .heartbeat("a1", AgentState::Active, None)
        .await
        .unwrap();
    coordinator
        .registry
        .heartbeat("cm", AgentState::Active, None)
        .await
        .unwrap();

    // Context-manager loop: peek, claim, reply, until aborted.
    let responder = {
        let broker = coordinator.broker.clone();
        tokio::spawn(async move {
            loop {
                let inbox = broker.peek("cm", &[GENERAL_CHANNEL], 5).await.unwrap();
                for message in inbox {
                    if broker.claim("cm", &message.id).await.unwrap() {
                        broker
                            .reply(&message, json!({"context": {"framework": "React 18"}}))
                            .await
                            .unwrap();
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    let answer = coordinator
        .broker
        .ask(
            "a1",
            "cm",
            MessageKind::ContextQuery,
            json!({"query": "ui"}),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    responder.abort();

    assert_eq!(answer, json!({"context": {"framework": "React 18"}}));

    let stats = coordinator.store().stats().await.unwrap();
    assert_eq!(stats.dead_letters, 0);

    let kinds: Vec<String> = coordinator
        .audit
        .tail(50)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    for expected in ["message.submit", "message.claim", "message.complete"] {
        assert!(kinds.iter().any(|k| k == expected), "missing {expected}");
    }
}

#[tokio::test]
async fn concurrent_claims_resolve_to_exactly_one_winner() {
    let (coordinator, _temp) = open_coordinator().await;
    let id = coordinator
        .broker
        .submit(NewMessage::direct(
            "dispatcher",
            "w",
            MessageKind::from("job.run"),
            json!({"n": 1}),
        ))
        .await
        .unwrap();

    let b1 = coordinator.broker.clone();
    let b2 = coordinator.broker.clone();
    let b3 = coordinator.broker.clone();
    let (id1, id2, id3) = (id.clone(), id.clone(), id.clone());
    let (r1, r2, r3) = tokio::join!(
        tokio::spawn(async move { b1.claim("w", &id1).await.unwrap() }),
        tokio::spawn(async move { b2.claim("w", &id2).await.unwrap() }),
        tokio::spawn(async move { b3.claim("w", &id3).await.unwrap() }),
    );
    let wins = [r1.unwrap(), r2.unwrap(), r3.unwrap()]
        .iter()
        .filter(|w| **w)
        .count();
    assert_eq!(wins, 1, "exactly one concurrent claim succeeds");

    let message = coordinator.broker.get(&id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Processing);
    assert_eq!(message.delivery_count, 1);
}

#[tokio::test]
async fn submit_peek_claim_complete_drains_exactly_once() {
    let (coordinator, _temp) = open_coordinator().await;
    let id = coordinator
        .broker
        .submit(NewMessage::direct(
            "a",
            "b",
            MessageKind::from("note"),
            json!({"text": "hi"}),
        ))
        .await
        .unwrap();

    assert_eq!(
        coordinator
            .broker
            .peek("b", &[GENERAL_CHANNEL], 10)
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(coordinator.broker.claim("b", &id).await.unwrap());
    coordinator.broker.complete(&id, None).await.unwrap();

    assert!(coordinator
        .broker
        .peek("b", &[GENERAL_CHANNEL], 10)
        .await
        .unwrap()
        .is_empty());
    assert!(!coordinator.broker.claim("b", &id).await.unwrap());
}

#[tokio::test]
async fn task_dependencies_gate_claims_until_done() {
    let (coordinator, _temp) = open_coordinator().await;
    let board = &coordinator.board;

    let t1 = board
        .create("lead", NewTask::new("build schema", "write the tables"))
        .await
        .unwrap();
    let t2 = board
        .create(
            "lead",
            NewTask::new("wire queries", "queries over the schema")
                .with_depends_on(vec![t1.clone()]),
        )
        .await
        .unwrap();

    let available = board.available(None).await.unwrap();
    assert_eq!(
        available.iter().map(|t| t.task_id.as_str()).collect::<Vec<_>>(),
        vec![t1.as_str()]
    );

    match board.claim("b", &t2).await {
        Err(CoordError::DependenciesUnmet(unmet)) => assert_eq!(unmet, vec![t1.clone()]),
        other => panic!("expected DependenciesUnmet, got {other:?}"),
    }

    board.claim("a", &t1).await.unwrap();
    board.update("a", &t1, TaskStatus::InProgress).await.unwrap();
    board
        .complete(
            "a",
            &t1,
            TaskOutcome::Success {
                result: "ok".to_string(),
            },
        )
        .await
        .unwrap();

    let available = board.available(None).await.unwrap();
    assert_eq!(
        available.iter().map(|t| t.task_id.as_str()).collect::<Vec<_>>(),
        vec![t2.as_str()]
    );
    let claimed = board.claim("b", &t2).await.unwrap();
    assert_eq!(claimed.assignee.as_deref(), Some("b"));
}

#[tokio::test]
async fn vote_requires_three_voters_and_quorum() {
    let (coordinator, _temp) = open_coordinator().await;

    let too_few = coordinator
        .voting
        .initiate(NewVote {
            proposer: "lead".to_string(),
            topic: "X".to_string(),
            options: vec!["yes".to_string(), "no".to_string()],
            mechanism: VoteMechanism::SimpleMajority,
            eligible: vec!["a".to_string(), "b".to_string()],
            deadline: hive_types::now() + chrono::Duration::hours(1),
            weights: None,
        })
        .await;
    assert!(matches!(
        too_few,
        Err(CoordError::InsufficientVoters { got: 2, need: 3 })
    ));

    let vote_id = coordinator
        .voting
        .initiate(NewVote {
            proposer: "lead".to_string(),
            topic: "X".to_string(),
            options: vec!["yes".to_string(), "no".to_string()],
            mechanism: VoteMechanism::SimpleMajority,
            eligible: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            deadline: hive_types::now() + chrono::Duration::hours(1),
            weights: None,
        })
        .await
        .unwrap();

    coordinator
        .voting
        .cast("a", &vote_id, "yes", None, None)
        .await
        .unwrap();
    let result = coordinator.voting.tally(&vote_id).await.unwrap();
    assert_eq!(result.outcome, VoteOutcome::NoQuorum, "only 1 of 3 cast");
}

#[tokio::test]
async fn broadcast_delivery_tracking_across_claims() {
    let (coordinator, _temp) = open_coordinator().await;
    for agent in ["a", "b", "c"] {
        coordinator
            .registry
            .heartbeat(agent, AgentState::Active, None)
            .await
            .unwrap();
    }

    let id = coordinator
        .broker
        .submit(NewMessage::broadcast(
            "a",
            GENERAL_CHANNEL,
            MessageKind::from("announce"),
            json!({"release": "1.0"}),
        ))
        .await
        .unwrap();

    let status = coordinator.broadcasts.status(&id).await.unwrap();
    assert_eq!((status.delivered, status.acknowledged, status.skipped), (3, 0, 0));

    assert!(coordinator.broker.claim("a", &id).await.unwrap());
    let status = coordinator.broadcasts.status(&id).await.unwrap();
    assert_eq!((status.delivered, status.acknowledged, status.skipped), (2, 1, 0));

    assert!(!coordinator.broker.claim("a", &id).await.unwrap());

    coordinator.broker.dismiss("b", &id).await.unwrap();
    let status = coordinator.broadcasts.status(&id).await.unwrap();
    assert_eq!((status.delivered, status.acknowledged, status.skipped), (1, 1, 1));
    assert_eq!(
        coordinator.broadcasts.pending_recipients(&id).await.unwrap(),
        vec!["c".to_string()]
    );
}

#[tokio::test]
async fn expired_messages_vanish_after_the_sweep() {
    let (coordinator, _temp) = open_coordinator().await;
    coordinator
        .registry
        .heartbeat("w", AgentState::Active, None)
        .await
        .unwrap();

    coordinator
        .broker
        .submit(
            NewMessage::direct("a", "w", MessageKind::from("ping"), json!({})).with_ttl_secs(0),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    coordinator.maintenance.run_once().await.unwrap();

    assert!(coordinator
        .broker
        .peek("w", &[GENERAL_CHANNEL], 10)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(coordinator.store().stats().await.unwrap().messages, 0);
}

#[tokio::test]
async fn heartbeat_and_subscribe_are_idempotent() {
    let (coordinator, _temp) = open_coordinator().await;

    for _ in 0..3 {
        coordinator
            .registry
            .heartbeat("w", AgentState::Active, Some("t-1"))
            .await
            .unwrap();
        coordinator.registry.subscribe("w", "builds").await.unwrap();
    }

    let roster = coordinator.registry.roster().await.unwrap();
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].record.heartbeat_count, 3);
    assert_eq!(
        coordinator.registry.channels("w").await.unwrap(),
        vec!["general".to_string(), "builds".to_string()]
    );
}

#[tokio::test]
async fn audit_orders_consistently_with_commits() {
    let (coordinator, _temp) = open_coordinator().await;

    let id = coordinator
        .broker
        .submit(NewMessage::direct("a", "b", MessageKind::from("step"), json!({})))
        .await
        .unwrap();
    coordinator.broker.claim("b", &id).await.unwrap();
    coordinator.broker.complete(&id, None).await.unwrap();

    let events = coordinator.audit.since(0, 50).await.unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    let submit_pos = kinds.iter().position(|k| *k == "message.submit").unwrap();
    let claim_pos = kinds.iter().position(|k| *k == "message.claim").unwrap();
    let complete_pos = kinds.iter().position(|k| *k == "message.complete").unwrap();
    assert!(submit_pos < claim_pos && claim_pos < complete_pos);

    // Sequence numbers are strictly increasing: append-only.
    let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);
}
