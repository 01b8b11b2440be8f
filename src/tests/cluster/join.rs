use crate::cluster::rpc::command::{Command, CommandResponse};
use catalog::{ClusterMember, JoinToken, MemberRole, MemberState};
use tokio::sync::oneshot;

use super::utils::init_test_node;

fn joiner(node_id: u64) -> ClusterMember {
    ClusterMember {
        node_id,
        raft_address: format!("127.0.0.1:{}", 19_000 + node_id),
        peer_id: vec![node_id as u8],
        role: MemberRole::Voter,
        state: MemberState::Joining,
        joined_at: 0,
    }
}

async fn issue_token(node: &mut super::utils::TestNode, ttl_secs: Option<i64>) -> String {
    let (tx, rx) = oneshot::channel();
    node.cluster
        .handle_command(Command::CreateJoinToken { ttl_secs }, tx)
        .await
        .unwrap();
    match rx.await.unwrap() {
        CommandResponse::JoinToken { token } => token,
        other => panic!("unexpected response: {:?}", other),
    }
}

async fn redeem(
    node: &mut super::utils::TestNode,
    token: &str,
    member: ClusterMember,
) -> CommandResponse {
    let (tx, rx) = oneshot::channel();
    node.cluster
        .handle_command(
            Command::Join {
                token: token.to_string(),
                member,
            },
            tx,
        )
        .await
        .unwrap();
    rx.await.unwrap()
}

#[tokio::test]
async fn join_token_is_single_use() {
    let mut node = init_test_node(1).await;
    node.elect_leader().await;

    let external = issue_token(&mut node, None).await;
    let token = JoinToken::decode_external(&external).unwrap();
    assert!(!token.is_expired(store::chrono::Utc::now().timestamp()));

    // First redemption succeeds and admits the joiner.
    match redeem(&mut node, &token.token, joiner(2)).await {
        CommandResponse::JoinAccepted { node_id, leader_id } => {
            assert_eq!(node_id, 2);
            assert_eq!(leader_id, 1);
        }
        other => panic!("unexpected response: {:?}", other),
    }
    assert!(node.core.fsm.read().member(2).is_some());
    assert!(node.cluster.is_known_peer(2));

    // Second redemption of the same token is rejected.
    assert!(matches!(
        redeem(&mut node, &token.token, joiner(3)).await,
        CommandResponse::TokenUsed
    ));
    assert!(node.core.fsm.read().member(3).is_none());
}

#[tokio::test]
async fn expired_tokens_are_rejected() {
    let mut node = init_test_node(1).await;
    node.elect_leader().await;

    let external = issue_token(&mut node, Some(0)).await;
    let token = JoinToken::decode_external(&external).unwrap();

    let members_before = node.core.fsm.read().list_members().len();
    assert!(matches!(
        redeem(&mut node, &token.token, joiner(2)).await,
        CommandResponse::TokenExpired
    ));
    assert_eq!(node.core.fsm.read().list_members().len(), members_before);
}

#[tokio::test]
async fn unknown_tokens_are_rejected() {
    let mut node = init_test_node(1).await;
    node.elect_leader().await;

    assert!(matches!(
        redeem(&mut node, "deadbeef", joiner(2)).await,
        CommandResponse::TokenUnknown
    ));
}

#[tokio::test]
async fn join_token_external_form_is_opaque() {
    let mut node = init_test_node(1).await;
    node.elect_leader().await;

    let external = issue_token(&mut node, None).await;
    // base64url, no padding, decodable by a prospective joiner.
    assert!(!external.contains('='));
    let decoded = JoinToken::decode_external(&external).unwrap();
    assert_eq!(decoded.leader_address, node.cluster.addr.to_string());
}

#[tokio::test]
async fn removing_below_the_voter_floor_is_refused() {
    let mut node = init_test_node(1).await;
    node.elect_leader().await;

    let external = issue_token(&mut node, None).await;
    let token = JoinToken::decode_external(&external).unwrap();
    redeem(&mut node, &token.token, joiner(2)).await;

    // Two voters: removing one would leave a single voter.
    let (tx, rx) = oneshot::channel();
    node.cluster
        .handle_command(
            Command::RemoveMember {
                node_id: 2,
                force: false,
            },
            tx,
        )
        .await
        .unwrap();
    assert!(matches!(
        rx.await.unwrap(),
        CommandResponse::QuorumViolation
    ));
    assert!(node.core.fsm.read().member(2).is_some());
}

#[tokio::test]
async fn one_configuration_change_at_a_time() {
    let mut node = init_test_node(1).await;
    node.elect_leader().await;

    // Fake an uncommitted configuration change.
    node.cluster.config_change = Some(u64::MAX);

    let external = issue_token(&mut node, None).await;
    let token = JoinToken::decode_external(&external).unwrap();
    assert!(matches!(
        redeem(&mut node, &token.token, joiner(2)).await,
        CommandResponse::ConfigChangeInFlight
    ));
}
