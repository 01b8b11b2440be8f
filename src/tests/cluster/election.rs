use catalog::MemberRole;
use store::log::raft::RaftId;

use super::utils::{init_test_node, offline_peer};

#[tokio::test]
async fn single_voter_becomes_leader_at_term_one() {
    let mut node = init_test_node(1).await;
    node.elect_leader().await;
    assert_eq!(node.cluster.term, 1);
    assert_eq!(node.cluster.leader_id(), Some(1));

    // Bootstrap wrote this node into the replicated membership.
    let members = node.core.fsm.read().list_members().len();
    assert_eq!(members, 1);
}

#[tokio::test]
async fn votes_are_counted_per_voter_majority() {
    let mut node = init_test_node(1).await;
    node.cluster.peers.push(offline_peer(2, MemberRole::Voter));
    node.cluster.peers.push(offline_peer(3, MemberRole::Voter));
    node.cluster
        .peers
        .push(offline_peer(4, MemberRole::NonVoter));

    // Three voters total: one granted vote plus our own is a majority; a
    // non-voter's grant never counts.
    assert!(!node.cluster.count_vote(4));
    assert!(node.cluster.count_vote(2));
}

#[tokio::test]
async fn vote_is_granted_once_per_term() {
    let mut node = init_test_node(1).await;
    node.cluster.peers.push(offline_peer(2, MemberRole::Voter));
    node.cluster.peers.push(offline_peer(3, MemberRole::Voter));
    node.cluster.term = 3;

    assert!(node.cluster.can_grant_vote(2));
    node.cluster.vote_for(2).await.unwrap();

    // Same candidate may retry, another may not.
    assert!(node.cluster.can_grant_vote(2));
    assert!(!node.cluster.can_grant_vote(3));

    // The promise survives in the durable hard state.
    let hard_state = node.core.store.get_hard_state().unwrap();
    assert_eq!(hard_state.voted_for, Some(2));
    assert_eq!(hard_state.current_term, 3);
}

#[tokio::test]
async fn log_completeness_rule_gates_votes() {
    let mut node = init_test_node(1).await;
    node.cluster.last_log = RaftId::new(3, 10);

    // Higher last term wins.
    assert!(node.cluster.log_is_behind_or_eq(4, 1));
    // Same term: longer log wins.
    assert!(node.cluster.log_is_behind_or_eq(3, 10));
    assert!(node.cluster.log_is_behind_or_eq(3, 11));
    assert!(!node.cluster.log_is_behind_or_eq(3, 9));
    assert!(!node.cluster.log_is_behind_or_eq(2, 99));
}

#[tokio::test]
async fn quorum_loss_blocks_elections() {
    let mut node = init_test_node(1).await;
    node.cluster.peers.push(offline_peer(2, MemberRole::Voter));
    node.cluster.peers.push(offline_peer(3, MemberRole::Voter));

    // Both peers are offline: 1 of 3 voters reachable is no quorum.
    assert!(!node.cluster.has_election_quorum());
    node.cluster.request_votes(true).await.unwrap();
    assert!(!node.cluster.is_leading());
    assert_eq!(node.cluster.term, 0);
}

#[tokio::test]
async fn leader_steps_down_without_majority() {
    let mut node = init_test_node(1).await;
    node.elect_leader().await;

    node.cluster.peers.push(offline_peer(2, MemberRole::Voter));
    node.cluster.peers.push(offline_peer(3, MemberRole::Voter));

    node.cluster.check_leader_quorum().await.unwrap();
    assert!(!node.cluster.is_leading());
}

#[tokio::test]
async fn stale_terms_are_rejected() {
    let mut node = init_test_node(1).await;
    node.elect_leader().await;
    let term = node.cluster.term;

    // A response from a higher term forces a step-down.
    node.cluster.step_down(term + 2).await.unwrap();
    assert!(!node.cluster.is_leading());
    assert_eq!(node.cluster.term, term + 2);
}
