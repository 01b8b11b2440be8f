use crate::cluster::rpc::command::{Command, CommandResponse};
use crate::cluster::PendingSnapshot;
use catalog::fsm;
use tokio::sync::oneshot;

use super::utils::init_test_node;

async fn fill_config(node: &mut super::utils::TestNode, count: usize) {
    for seq in 0..count {
        let (tx, rx) = oneshot::channel();
        node.cluster
            .handle_command(
                Command::Propose {
                    command: fsm::Command::ConfigSet {
                        key: format!("key-{:03}", seq),
                        value: format!("value-{}", seq).into_bytes(),
                    },
                },
                tx,
            )
            .await
            .unwrap();
        assert!(matches!(
            rx.await.unwrap(),
            CommandResponse::Applied { .. }
        ));
    }
}

#[tokio::test]
async fn snapshot_compacts_the_log() {
    let mut node = init_test_node(1).await;
    node.cluster.config.trailing_logs = 2;
    node.elect_leader().await;
    fill_config(&mut node, 10).await;

    let applied = node.core.store.get_applied_index();
    let last_included = node.cluster.take_snapshot().await.unwrap().unwrap();
    assert_eq!(last_included.index, applied);
    assert_eq!(node.cluster.last_snapshot, last_included);

    // Entries up to `last_included - trailing_logs` are gone, the tail
    // stays for lagging followers.
    let first = node.core.store.get_first_log_index().unwrap().unwrap();
    assert_eq!(first, applied - 2 + 1);

    // Taking another snapshot without new applies is a no-op.
    assert!(node.cluster.take_snapshot().await.unwrap().is_none());
}

#[tokio::test]
async fn snapshot_restore_round_trips() {
    let mut source = init_test_node(1).await;
    source.cluster.bootstrap = false;
    source.elect_leader().await;
    fill_config(&mut source, 25).await;

    let last_included = source.cluster.take_snapshot().await.unwrap().unwrap();
    let meta = source.core.store.snapshots.latest().unwrap().unwrap();
    let payload = source.core.store.snapshots.read_payload(&meta).unwrap();

    // A fresh node installs the stream and ends up byte-identical.
    let target = init_test_node(2).await;
    target
        .core
        .restore_snapshot(PendingSnapshot {
            last_included,
            configuration: meta.configuration.clone(),
            buffer: payload,
        })
        .await
        .unwrap();

    assert_eq!(
        target.core.store.get_applied_index(),
        last_included.index
    );
    assert_eq!(
        target.core.fsm.read().snapshot().unwrap(),
        source.core.fsm.read().snapshot().unwrap()
    );

    // The durable tables were rebuilt too: a reload sees the same state.
    let reloaded = fsm::Fsm::load(&target.core.store.db).unwrap();
    assert_eq!(
        reloaded.snapshot().unwrap(),
        source.core.fsm.read().snapshot().unwrap()
    );

    // The restored node retains the snapshot for later followers.
    assert_eq!(
        target.core.store.snapshots.latest().unwrap().unwrap().size,
        meta.size
    );
}

#[tokio::test]
async fn snapshot_threshold_triggers_compaction_cycle() {
    let mut node = init_test_node(1).await;
    node.cluster.config.snapshot_threshold = 5;
    node.cluster.config.snapshot_interval = u64::MAX;
    node.cluster.config.trailing_logs = 0;
    node.elect_leader().await;
    fill_config(&mut node, 8).await;

    node.cluster.maybe_snapshot().await.unwrap();
    assert!(node.cluster.last_snapshot.index > 0);
    assert_eq!(
        node.cluster.last_snapshot.index,
        node.core.store.get_applied_index()
    );
}
