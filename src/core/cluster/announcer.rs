// src/core/cluster/announcer.rs

//! Leader-side broadcasts: periodic authority announcements and node-list
//! propagation.

use crate::core::state::ServerState;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, info, warn};

/// Periodically announces this node's authority while it is leader. Runs for
/// the life of the process; ticks are no-ops on followers.
pub async fn run(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut tick = time::interval(state.config.announce_interval);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("[{}] Announcer shutting down", state.address);
                return;
            }
            _ = tick.tick() => {
                if state.election.lock().is_leader() {
                    broadcast_announcement(&state).await;
                }
            }
        }
    }
}

/// Sends a MasterAnnouncement to every known peer in parallel. Peers that
/// fail the send are dropped from the registry for this round; discovery or
/// registration may re-add them.
pub async fn broadcast_announcement(state: &Arc<ServerState>) {
    let (term, backup) = {
        let el = state.election.lock();
        (el.current_term, el.backup_address.clone().unwrap_or_default())
    };
    let handles = state.registry.handles();
    if handles.is_empty() {
        return;
    }
    debug!(
        "[{}] Announcing self as master (term {}) to {} nodes",
        state.address,
        term,
        handles.len()
    );

    let sends = handles.iter().map(|peer| {
        let master = state.address.clone();
        let backup = backup.clone();
        let node_id = state.node_id.clone();
        async move {
            match peer.announce_master(master, backup, node_id, term).await {
                Ok(_) => None,
                Err(e) => {
                    warn!(
                        "[{}] MasterAnnouncement to {} failed: {}",
                        state.address, peer.addr, e
                    );
                    Some(peer.addr.clone())
                }
            }
        }
    });

    for failed in join_all(sends).await.into_iter().flatten() {
        state.registry.remove(&failed);
    }
}

/// Broadcasts the full node list to every known peer. Called by the master
/// whenever registration grows the peer set.
pub async fn broadcast_node_list(state: &Arc<ServerState>) {
    if !state.is_master() {
        debug!("[{}] Not master, skipping node list broadcast", state.address);
        return;
    }

    let mut all_nodes = state.registry.addrs();
    all_nodes.push(state.address.clone());
    all_nodes.sort();
    info!(
        "[{}] Broadcasting node list ({} nodes)",
        state.address,
        all_nodes.len()
    );

    let handles = state.registry.handles();
    let sends = handles.iter().map(|peer| {
        let nodes = all_nodes.clone();
        let master = state.address.clone();
        async move {
            if let Err(e) = peer.update_node_list(nodes, master).await {
                warn!(
                    "[{}] Failed to send node list to {}: {}",
                    state.address, peer.addr, e
                );
            }
        }
    });
    join_all(sends).await;
}
