//! Multi-node join/leave over the real gRPC transport, exercising
//! membership changes, metadata refresh on rejoin, graceful no-ops for
//! unknown ids, and how `Cluster()` reports a peer that has stopped
//! answering.

use cete::config::NodeConfig;
use cete::server::RaftServer;
use cete::types::JoinRequest;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;

fn config(node_id: u64, data_dir: &std::path::Path, grpc_port: u16, bootstrap: bool) -> NodeConfig {
    NodeConfig {
        node_id,
        data_dir: data_dir.to_path_buf(),
        bind_addr: format!("127.0.0.1:{}", grpc_port),
        grpc_addr: format!("127.0.0.1:{}", grpc_port),
        http_addr: format!("127.0.0.1:{}", grpc_port + 1000),
        bootstrap,
    }
}

async fn wait_until_leader(server: &RaftServer) {
    for _ in 0..200 {
        if server.state().await == cete::NodeStateTag::Leader {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    panic!("node never became leader");
}

#[tokio::test]
async fn join_then_leave_updates_membership_and_metadata_together() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let a = RaftServer::start(config(1, dir_a.path(), 18401, true)).await.unwrap();
    wait_until_leader(&a).await;

    let _b = RaftServer::start(config(2, dir_b.path(), 18402, false)).await.unwrap();

    assert!(!a.exists(2).await.unwrap());
    let outcome = a
        .join(JoinRequest {
            node_id: 2,
            bind_addr: "127.0.0.1:18402".into(),
            grpc_addr: "127.0.0.1:18402".into(),
            http_addr: "127.0.0.1:19402".into(),
        })
        .await
        .unwrap();
    assert_eq!(outcome, cete::types::JoinOutcome::Added);
    assert!(a.exists(2).await.unwrap());

    let again = a
        .join(JoinRequest {
            node_id: 2,
            bind_addr: "127.0.0.1:18402".into(),
            grpc_addr: "127.0.0.1:18402".into(),
            http_addr: "127.0.0.1:19402".into(),
        })
        .await
        .unwrap();
    assert_eq!(again, cete::types::JoinOutcome::AlreadyExists);

    a.leave(2).await.unwrap();
    assert!(!a.exists(2).await.unwrap());
}

#[tokio::test]
async fn rejoin_with_changed_addresses_refreshes_metadata() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let a = RaftServer::start(config(1, dir_a.path(), 18411, true)).await.unwrap();
    wait_until_leader(&a).await;
    let _b = RaftServer::start(config(2, dir_b.path(), 18412, false)).await.unwrap();

    a.join(JoinRequest {
        node_id: 2,
        bind_addr: "127.0.0.1:18412".into(),
        grpc_addr: "127.0.0.1:18412".into(),
        http_addr: "127.0.0.1:19412".into(),
    })
    .await
    .unwrap();

    // Same node id, new advertised http_addr: this is a no-op for
    // membership (still a voter) but must still update the stored
    // metadata.
    let outcome = a
        .join(JoinRequest {
            node_id: 2,
            bind_addr: "127.0.0.1:18412".into(),
            grpc_addr: "127.0.0.1:18412".into(),
            http_addr: "127.0.0.1:29412".into(),
        })
        .await
        .unwrap();
    assert_eq!(outcome, cete::types::JoinOutcome::AlreadyExists);

    let members = a.cluster().await.unwrap();
    let b_info = members.iter().find(|m| m.grpc_addr == "127.0.0.1:18412").unwrap();
    assert_eq!(b_info.http_addr, "127.0.0.1:29412");
}

#[tokio::test]
async fn leave_of_unknown_id_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let a = RaftServer::start(config(1, dir.path(), 18421, true)).await.unwrap();
    wait_until_leader(&a).await;

    assert!(!a.exists(99).await.unwrap());
    a.leave(99).await.unwrap();
    assert!(!a.exists(99).await.unwrap());
}

#[tokio::test]
async fn cluster_reports_an_unreachable_peer_as_shutdown() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let a = RaftServer::start(config(1, dir_a.path(), 18431, true)).await.unwrap();
    wait_until_leader(&a).await;

    let mut b = RaftServer::start(config(2, dir_b.path(), 18432, false)).await.unwrap();
    a.join(JoinRequest {
        node_id: 2,
        bind_addr: "127.0.0.1:18432".into(),
        grpc_addr: "127.0.0.1:18432".into(),
        http_addr: "127.0.0.1:19432".into(),
    })
    .await
    .unwrap();

    b.stop().await.unwrap();

    let members = a.cluster().await.unwrap();
    assert_eq!(members.len(), 2);
    let b_info = members.iter().find(|m| m.grpc_addr == "127.0.0.1:18432").unwrap();
    assert_eq!(b_info.state, cete::NodeStateTag::Shutdown);
    assert_eq!(b_info.http_addr, "127.0.0.1:19432");
}
