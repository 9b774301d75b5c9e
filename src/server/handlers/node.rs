// src/server/handlers/node.rs

//! Handlers for the Node surface: membership, election and stats. Always
//! live, regardless of role.

use crate::core::cluster::NodeRole;
use crate::core::cluster::announcer;
use crate::core::protocol::{NodeInfo, NodeStats, RpcResponse};
use crate::core::score::{ResourceScore, collect_host_telemetry};
use crate::core::state::ServerState;
use std::sync::Arc;
use tracing::{debug, info};

pub async fn get_node_stats(state: &Arc<ServerState>) -> RpcResponse {
    let shards_dir = state.config.shards_dir.clone();
    let master_data_dir = state.config.master_data_dir.clone();
    let telemetry =
        tokio::task::spawn_blocking(move || collect_host_telemetry(&shards_dir, &master_data_dir))
            .await
            .unwrap_or_default();

    let (is_master, leader, term) = {
        let el = state.election.lock();
        (
            el.role == NodeRole::Master,
            el.leader_address.clone(),
            el.current_term,
        )
    };

    RpcResponse::NodeStats(NodeStats {
        node_id: state.node_id.clone(),
        node_address: state.address.clone(),
        is_master,
        current_master_address: leader.unwrap_or_default(),
        cpu_utilization: telemetry.cpu_utilization,
        memory_utilization: telemetry.memory_utilization,
        shards_disk_free_mb: telemetry.shards_disk_free_mb,
        shards_disk_total_mb: telemetry.shards_disk_total_mb,
        master_data_disk_free_mb: telemetry.master_data_disk_free_mb,
        master_data_disk_total_mb: telemetry.master_data_disk_total_mb,
        active_tasks: state.active_tasks(),
        known_nodes_count: state.registry.len() as u32,
        election_in_progress: state.election_in_progress(),
        current_term: term,
    })
}

pub fn get_current_master(state: &Arc<ServerState>) -> RpcResponse {
    let el = state.election.lock();
    RpcResponse::CurrentMaster {
        master_address: el.leader_address.clone().unwrap_or_default(),
        term: el.current_term,
        is_master_known: el.leader_address.is_some(),
    }
}

pub fn register_node(
    state: &Arc<ServerState>,
    node_id: &str,
    address: &str,
    port: u16,
) -> RpcResponse {
    let addr = format!("{address}:{port}");
    info!(
        "[{}] RegisterNode from {} at {}",
        state.address, node_id, addr
    );
    if state.registry.add(&addr) && state.is_master() {
        let state = state.clone();
        tokio::spawn(async move {
            announcer::broadcast_node_list(&state).await;
        });
    }
    RpcResponse::NodeRegistered {
        success: true,
        current_leader: state.current_leader().unwrap_or_default(),
        nodes: state.registry.addrs(),
    }
}

pub fn update_node_list(
    state: &Arc<ServerState>,
    node_addresses: Vec<String>,
    master_address: &str,
) -> RpcResponse {
    debug!(
        "[{}] UpdateNodeList with {} nodes (master {})",
        state.address,
        node_addresses.len(),
        master_address
    );
    for addr in &node_addresses {
        state.registry.add(addr);
    }
    if !master_address.is_empty() && master_address != state.address {
        let changed = {
            let mut el = state.election.lock();
            let changed = el.leader_address.as_deref() != Some(master_address);
            if changed {
                info!(
                    "[{}] Updating master address from {:?} to {}",
                    state.address, el.leader_address, master_address
                );
                el.leader_address = Some(master_address.to_string());
            }
            changed
        };
        if changed {
            state.registry.add(master_address);
            state.registry.set_leader(Some(master_address));
        }
    }
    RpcResponse::NodeListUpdated { success: true }
}

pub fn get_all_nodes(state: &Arc<ServerState>) -> RpcResponse {
    let mut addrs = state.registry.addrs();
    addrs.push(state.address.clone());
    addrs.sort();

    let nodes = addrs
        .into_iter()
        .map(|addr| {
            let (host, port) = match addr.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), port.parse().unwrap_or(0)),
                None => (addr.clone(), 0),
            };
            NodeInfo {
                node_id: addr,
                address: host,
                port,
            }
        })
        .collect();
    RpcResponse::AllNodes { nodes }
}

pub fn report_resource_score(
    state: &Arc<ServerState>,
    worker_address: String,
    score: ResourceScore,
) -> RpcResponse {
    if !state.is_master() {
        info!(
            "[{}] Received score report from {} but not master",
            state.address, worker_address
        );
        return RpcResponse::ScoreReported {
            success: false,
            message: "Not master".to_string(),
        };
    }
    debug!(
        "[{}] Resource score from {}: {:.3}",
        state.address, worker_address, score.score
    );
    state.node_scores.insert(worker_address, score);
    RpcResponse::ScoreReported {
        success: true,
        message: String::new(),
    }
}
