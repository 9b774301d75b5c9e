// tests/integration/cluster_test.rs

//! Membership, stats and election RPCs over real connections.

use super::test_helpers::{connect, spawn_node, wait_for};
use prismd::core::cluster::NodeRole;
use prismd::core::protocol::{RpcRequest, RpcResponse};
use std::time::Duration;

const RPC_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_master_serves_stats_and_current_master() {
    let (handle, _dir) = spawn_node(NodeRole::Master, None).await;
    let mut client = connect(&handle.address).await;

    match client.call(RpcRequest::GetNodeStats, RPC_DEADLINE).await.unwrap() {
        RpcResponse::NodeStats(stats) => {
            assert!(stats.is_master);
            assert_eq!(stats.node_address, handle.address);
            assert_eq!(stats.current_master_address, handle.address);
            assert_eq!(stats.current_term, 0);
            assert!(!stats.election_in_progress);
            assert_eq!(stats.known_nodes_count, 0);
        }
        other => panic!("unexpected reply: {}", other.kind()),
    }

    match client
        .call(RpcRequest::GetCurrentMaster, RPC_DEADLINE)
        .await
        .unwrap()
    {
        RpcResponse::CurrentMaster {
            master_address,
            term,
            is_master_known,
        } => {
            assert!(is_master_known);
            assert_eq!(master_address, handle.address);
            assert_eq!(term, 0);
        }
        other => panic!("unexpected reply: {}", other.kind()),
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_register_worker_is_idempotent() {
    let (handle, _dir) = spawn_node(NodeRole::Master, None).await;
    let mut client = connect(&handle.address).await;

    let register = RpcRequest::RegisterWorker {
        worker_address: "127.0.0.1:59999".to_string(),
    };
    match client.call(register.clone(), RPC_DEADLINE).await.unwrap() {
        RpcResponse::WorkerRegistered { success, message } => {
            assert!(success, "{message}");
        }
        other => panic!("unexpected reply: {}", other.kind()),
    }
    match client.call(register, RPC_DEADLINE).await.unwrap() {
        RpcResponse::WorkerRegistered { success, message } => {
            assert!(!success);
            assert!(message.contains("already registered"));
        }
        other => panic!("unexpected reply: {}", other.kind()),
    }

    assert!(handle.state.registry.contains("127.0.0.1:59999"));
    handle.shutdown().await;
}

#[tokio::test]
async fn test_register_node_and_get_all_nodes() {
    let (handle, _dir) = spawn_node(NodeRole::Master, None).await;
    let mut client = connect(&handle.address).await;

    match client
        .call(
            RpcRequest::RegisterNode {
                node_id: "n1".to_string(),
                address: "127.0.0.1".to_string(),
                port: 59998,
            },
            RPC_DEADLINE,
        )
        .await
        .unwrap()
    {
        RpcResponse::NodeRegistered {
            success,
            current_leader,
            nodes,
        } => {
            assert!(success);
            assert_eq!(current_leader, handle.address);
            assert!(nodes.contains(&"127.0.0.1:59998".to_string()));
        }
        other => panic!("unexpected reply: {}", other.kind()),
    }

    match client.call(RpcRequest::GetAllNodes, RPC_DEADLINE).await.unwrap() {
        RpcResponse::AllNodes { nodes } => {
            let ids: Vec<String> = nodes.into_iter().map(|n| n.node_id).collect();
            assert!(ids.contains(&handle.address));
            assert!(ids.contains(&"127.0.0.1:59998".to_string()));
        }
        other => panic!("unexpected reply: {}", other.kind()),
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_update_node_list_merges_peers_and_master() {
    let (handle, _dir) = spawn_node(NodeRole::Worker, Some("127.0.0.1:9".to_string())).await;
    let mut client = connect(&handle.address).await;

    match client
        .call(
            RpcRequest::UpdateNodeList {
                node_addresses: vec![
                    "127.0.0.1:59990".to_string(),
                    handle.address.clone(),
                ],
                master_address: "127.0.0.1:59991".to_string(),
            },
            RPC_DEADLINE,
        )
        .await
        .unwrap()
    {
        RpcResponse::NodeListUpdated { success } => assert!(success),
        other => panic!("unexpected reply: {}", other.kind()),
    }

    assert!(handle.state.registry.contains("127.0.0.1:59990"));
    assert!(!handle.state.registry.contains(&handle.address));
    assert_eq!(
        handle.state.current_leader().as_deref(),
        Some("127.0.0.1:59991")
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn test_two_candidates_one_grant_per_term() {
    let (handle, _dir) = spawn_node(NodeRole::Master, None).await;
    let mut client = connect(&handle.address).await;

    let vote = |candidate: &str| RpcRequest::RequestVote {
        term: 1,
        candidate_id: candidate.to_string(),
        score: -1.0,
    };

    match client.call(vote("127.0.0.1:59901"), RPC_DEADLINE).await.unwrap() {
        RpcResponse::Vote {
            term, vote_granted, ..
        } => {
            assert_eq!(term, 1);
            assert!(vote_granted);
        }
        other => panic!("unexpected reply: {}", other.kind()),
    }
    match client.call(vote("127.0.0.1:59902"), RPC_DEADLINE).await.unwrap() {
        RpcResponse::Vote {
            term, vote_granted, ..
        } => {
            assert_eq!(term, 1);
            assert!(!vote_granted);
        }
        other => panic!("unexpected reply: {}", other.kind()),
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_announcement_updates_worker_and_is_idempotent() {
    let (handle, _dir) = spawn_node(NodeRole::Worker, Some("127.0.0.1:9".to_string())).await;

    for _ in 0..2 {
        let mut client = connect(&handle.address).await;
        match client
            .call(
                RpcRequest::AnnounceMaster {
                    master_address: "127.0.0.1:59997".to_string(),
                    backup_master_address: String::new(),
                    node_id_of_master: "m1".to_string(),
                    term: 7,
                },
                RPC_DEADLINE,
            )
            .await
            .unwrap()
        {
            RpcResponse::Announce { status, .. } => assert!(status.contains("Acknowledged")),
            other => panic!("unexpected reply: {}", other.kind()),
        }
        assert_eq!(handle.state.current_term(), 7);
        assert_eq!(
            handle.state.current_leader().as_deref(),
            Some("127.0.0.1:59997")
        );
        assert_eq!(handle.state.current_role(), NodeRole::Worker);
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn test_backup_promotes_itself_after_master_loss() {
    let (master, _master_dir) = spawn_node(NodeRole::Master, None).await;
    let (backup, _backup_dir) =
        spawn_node(NodeRole::BackupMaster, Some(master.address.clone())).await;

    // Let the backup see a healthy master at least once.
    let backup_state = backup.state.clone();
    assert!(
        wait_for(Duration::from_secs(5), || {
            backup_state.current_leader().as_deref() == Some(master.address.as_str())
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(1500)).await;

    master.shutdown().await;

    // Within the backup failure window plus a couple of probe cycles the
    // backup bumps the term and takes over.
    let backup_state = backup.state.clone();
    let promoted = wait_for(Duration::from_secs(10), || {
        backup_state.is_master() && backup_state.current_term() == 1
    })
    .await;
    assert!(promoted, "backup never promoted itself");

    let mut client = connect(&backup.address).await;
    match client
        .call(RpcRequest::GetCurrentMaster, RPC_DEADLINE)
        .await
        .unwrap()
    {
        RpcResponse::CurrentMaster {
            master_address,
            term,
            is_master_known,
        } => {
            assert!(is_master_known);
            assert_eq!(master_address, backup.address);
            assert_eq!(term, 1);
        }
        other => panic!("unexpected reply: {}", other.kind()),
    }

    backup.shutdown().await;
}
