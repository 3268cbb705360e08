//! Client-facing command contract: idempotent resubmission, commit
//! notification, and bounded failure once the leader is gone.


use std::time::Duration;

use concord::command::{Command, RaftId};
use concord::consensus::engine::CommitIndexModification;
use concord::consensus::state::Role;
use concord::error::ConsensusError;
use test_harness::{TestCluster, ELECTION_TIMEOUT_MAX};

const LONG_WAIT: Duration = Duration::from_secs(10);

fn update(key: &str, delta: i64) -> Command {
    Command::UpdateValue {
        key: key.to_string(),
        delta,
    }
}

/// Submitting the same command twice must not itself produce a timeout:
/// both calls resolve to the one committed entry's outcome.
#[tokio::test]
async fn command_sent_twice_does_not_time_out() {
    let cluster = TestCluster::new(3);
    let leader_id = cluster
        .wait_for_leader(LONG_WAIT)
        .await
        .expect("leader should be elected");
    let leader = cluster.handle(leader_id);

    let id = RaftId::new();
    let first = {
        let leader = leader.clone();
        tokio::spawn(async move { leader.submit_with_id(update("test", 322), id).await })
    };
    let second = leader.submit_with_id(update("test", 322), id).await;

    let first = tokio::time::timeout(LONG_WAIT, first)
        .await
        .expect("first submission timed out")
        .expect("task panicked");

    let first = first.expect("first submission failed");
    let second = second.expect("second submission failed");
    assert_eq!(first.index, second.index);
    assert_eq!(first.value, second.value);

    // The delta applied once: a zero-delta probe reads back 322, not 644.
    let probe = leader.submit(update("test", 0)).await.unwrap();
    assert_eq!(probe.value, serde_json::json!(322));

    // A follower observes the commit as well.
    let follower_id = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .expect("should have a follower");
    let last_index = leader.last_entry_index();
    tokio::time::timeout(
        LONG_WAIT,
        cluster
            .handle(follower_id)
            .wait_for_commit_index_change(CommitIndexModification::GreaterOrEqual, last_index),
    )
    .await
    .expect("follower did not commit in time")
    .unwrap();

    cluster.shutdown().await;
}

/// Every submitter is notified when its command commits, and a follower
/// watcher on the final index fires.
#[tokio::test]
async fn committed_commands_notify_their_submitters() {
    const COMMAND_COUNT: usize = 10;

    let cluster = TestCluster::new(3);
    let leader_id = cluster
        .wait_for_leader(LONG_WAIT)
        .await
        .expect("leader should be elected");
    let leader = cluster.handle(leader_id);

    let mut submissions = Vec::new();
    for i in 0..COMMAND_COUNT {
        let leader = leader.clone();
        submissions.push(tokio::spawn(async move {
            leader.submit(update("test", i as i64)).await
        }));
    }

    for task in submissions {
        let outcome = tokio::time::timeout(LONG_WAIT, task)
            .await
            .expect("submission did not resolve in time")
            .expect("task panicked");
        outcome.expect("submission failed");
    }

    let follower_id = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .unwrap();
    let last_index = leader.last_entry_index();
    tokio::time::timeout(
        LONG_WAIT,
        cluster
            .handle(follower_id)
            .wait_for_commit_index_change(CommitIndexModification::GreaterOrEqual, last_index),
    )
    .await
    .expect("follower did not commit in time")
    .unwrap();

    cluster.shutdown().await;
}

/// After the leader is cut off from all peers, a submission resolves with
/// NotLeading or Timeout within a bound proportional to the election
/// timeout; it never hangs.
#[tokio::test]
async fn submission_fails_in_bounded_time_after_leader_disconnect() {
    let cluster = TestCluster::new(3);
    let leader_id = cluster
        .wait_for_leader(LONG_WAIT)
        .await
        .expect("leader should be elected");
    let leader = cluster.handle(leader_id);

    for i in 0..3 {
        cluster
            .submit_to(leader_id, "test", i)
            .await
            .expect("command should commit");
    }

    cluster.isolate(leader_id);

    // Bound: operation deadline (10x election timeout) plus slack.
    let bound = ELECTION_TIMEOUT_MAX * 10 + Duration::from_secs(2);
    let started = tokio::time::Instant::now();
    let outcome = tokio::time::timeout(bound, leader.submit(update("test", 99)))
        .await
        .expect("submission hung past the failure bound");
    let err = outcome.expect_err("isolated leader must not commit");
    assert!(
        matches!(
            err,
            ConsensusError::NotLeading { .. } | ConsensusError::Timeout
        ),
        "unexpected error: {err}"
    );
    assert!(started.elapsed() <= bound);

    // The rest of the cluster moved on without the old leader.
    let new_leader = cluster
        .wait_for_new_leader(leader_id, LONG_WAIT)
        .await
        .expect("remaining nodes should elect a leader");
    assert_ne!(new_leader, leader_id);

    cluster.shutdown().await;
}

/// A duplicate retry arriving after the commit is answered from the
/// retained outcome instead of appending again.
#[tokio::test]
async fn late_duplicate_is_answered_from_retention() {
    let cluster = TestCluster::new(3);
    let leader_id = cluster
        .wait_for_leader(LONG_WAIT)
        .await
        .expect("leader should be elected");
    let leader = cluster.handle(leader_id);

    let id = RaftId::new();
    let first = leader
        .submit_with_id(update("late", 7), id)
        .await
        .expect("submission failed");

    tokio::time::sleep(Duration::from_millis(100)).await;

    let retry = leader
        .submit_with_id(update("late", 7), id)
        .await
        .expect("retry failed");
    assert_eq!(first, retry);
    assert_eq!(leader.last_entry_index(), first.index);

    cluster.shutdown().await;
}

/// Submitting against a follower fails immediately with NotLeading and a
/// hint pointing at the real leader.
#[tokio::test]
async fn follower_rejects_submission_with_leader_hint() {
    let cluster = TestCluster::new(3);
    let leader_id = cluster
        .wait_for_leader(LONG_WAIT)
        .await
        .expect("leader should be elected");

    // Give heartbeats a moment to propagate the leader hint.
    let follower_id = cluster
        .active_node_ids()
        .into_iter()
        .find(|&id| id != leader_id)
        .unwrap();
    let learned = cluster
        .wait_until(
            |c| c.handle(follower_id).status().leader_hint == Some(leader_id),
            LONG_WAIT,
        )
        .await;
    assert!(learned, "follower never learned the leader");
    assert_eq!(
        cluster.handle(follower_id).role_and_term().0,
        Role::Follower
    );

    let err = cluster
        .submit_to(follower_id, "test", 1)
        .await
        .expect_err("follower must not accept submissions");
    match err {
        ConsensusError::NotLeading { leader_hint } => {
            assert_eq!(leader_hint, Some(leader_id));
        }
        other => panic!("expected NotLeading, got {other}"),
    }

    cluster.shutdown().await;
}
