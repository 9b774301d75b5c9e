// src/core/cluster/monitor.rs

//! Background health routines.
//!
//! - `run_health_monitor`: follower/backup side leader watching, with the
//!   fast backup-promotion path and the worker election path.
//! - `run_cluster_sweep`: master side liveness sweep over all known nodes.
//! - `run_score_refresh` / `run_score_reporting`: keep the local score fresh
//!   and, on workers, report it to the master.

use crate::core::cluster::{NodeRole, NodeState, election};
use crate::core::protocol::RpcRequest;
use crate::core::cluster::client::expect_node_stats;
use crate::core::state::ServerState;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, info, warn};

/// Deadline for the master's per-node sweep probe.
const SWEEP_PROBE_DEADLINE: Duration = Duration::from_secs(3);

/// Maximum random jitter added to each sweep interval.
const SWEEP_JITTER: Duration = Duration::from_secs(2);

/// Attempts and spacing for master registration.
const REGISTER_ATTEMPTS: u32 = 5;
const REGISTER_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Watches the current leader and drives failover when it goes quiet.
pub async fn run_health_monitor(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut tick = time::interval(state.config.health_check_interval);
    let mut no_leader_since: Option<Instant> = None;
    let mut no_leader_cycles: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("[{}] Health monitor shutting down", state.address);
                return;
            }
            _ = tick.tick() => {}
        }

        let (role, leader, election_timeout) = {
            let el = state.election.lock();
            (el.role, el.leader_address.clone(), el.election_timeout)
        };
        if role == NodeRole::Master {
            no_leader_since = None;
            no_leader_cycles = 0;
            continue;
        }

        let Some(leader_addr) = leader.filter(|addr| *addr != state.address) else {
            let since = *no_leader_since.get_or_insert_with(Instant::now);
            no_leader_cycles += 1;
            debug!(
                "[{}] No master known for {:.1}s",
                state.address,
                since.elapsed().as_secs_f64()
            );

            // Every third no-leader cycle, retry discovery even without a
            // fresh failure.
            if no_leader_cycles % 3 == 0 && election::active_discovery(&state).await {
                let registrar = state.clone();
                tokio::spawn(async move { retry_register_with_master(registrar).await });
                no_leader_since = None;
                no_leader_cycles = 0;
                continue;
            }

            if role == NodeRole::BackupMaster
                && since.elapsed() > state.config.backup_failure_window
            {
                info!(
                    "[{}] As backup master, promoting self after master loss",
                    state.address
                );
                election::promote_backup(&state).await;
                no_leader_since = None;
                no_leader_cycles = 0;
            } else if role == NodeRole::Worker
                && since.elapsed() > election_timeout
                && !state.election_in_progress()
            {
                info!(
                    "[{}] No master detected for {:.1}s (> {:.1}s), starting election path",
                    state.address,
                    since.elapsed().as_secs_f64(),
                    election_timeout.as_secs_f64()
                );
                election::schedule_pre_election_delay(&state);
                no_leader_since = None;
                no_leader_cycles = 0;
            }
            continue;
        };

        no_leader_since = None;
        no_leader_cycles = 0;

        state.registry.add(&leader_addr);
        let probe = match state.registry.get(&leader_addr) {
            Some(peer) => peer.get_node_stats().await,
            None => continue,
        };

        match probe {
            Ok(_) => {
                debug!("[{}] Master {} is healthy", state.address, leader_addr);
                state.election.lock().record_leader_contact();
            }
            Err(e) => {
                let (elapsed, window) = {
                    let el = state.election.lock();
                    let window = if el.role == NodeRole::BackupMaster {
                        state.config.backup_failure_window
                    } else {
                        el.election_timeout
                    };
                    (el.last_heartbeat.elapsed(), window)
                };
                warn!(
                    "[{}] Master {} unreachable ({}); {:.1}s since last heartbeat",
                    state.address,
                    leader_addr,
                    e,
                    elapsed.as_secs_f64()
                );
                if elapsed <= window {
                    continue;
                }

                info!(
                    "[{}] Master {} failure detected after {:.1}s",
                    state.address,
                    leader_addr,
                    elapsed.as_secs_f64()
                );
                state.registry.remove(&leader_addr);
                state.election.lock().leader_address = None;
                state.registry.set_leader(None);

                if role == NodeRole::BackupMaster {
                    election::promote_backup(&state).await;
                } else if !election::active_discovery(&state).await {
                    election::schedule_pre_election_delay(&state);
                }
                no_leader_since = None;
                no_leader_cycles = 0;
            }
        }
    }
}

/// Master-side liveness sweep: every interval (plus jitter), probe each known
/// node and evict the unreachable ones.
pub async fn run_cluster_sweep(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    loop {
        let jitter = Duration::from_secs_f64(
            rand::thread_rng().gen_range(0.0..SWEEP_JITTER.as_secs_f64()),
        );
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("[{}] Cluster sweep shutting down", state.address);
                return;
            }
            _ = time::sleep(state.config.sweep_interval + jitter) => {}
        }

        if !state.election.lock().is_leader() {
            continue;
        }

        for addr in state.registry.addrs() {
            let Some(peer) = state.registry.get(&addr) else {
                continue;
            };
            let probe = peer
                .call(RpcRequest::GetNodeStats, SWEEP_PROBE_DEADLINE)
                .await
                .and_then(expect_node_stats);
            match probe {
                Ok(_) => debug!("[{}] Node {} is healthy", state.address, addr),
                Err(e) => {
                    warn!(
                        "[{}] Health check failed for {}: {}. Evicting.",
                        state.address, addr, e
                    );
                    state.registry.remove(&addr);
                    state.node_scores.remove(&addr);
                }
            }
        }
    }
}

/// Keeps the cached resource score fresh.
pub async fn run_score_refresh(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut tick = time::interval(state.config.score_update_interval);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = tick.tick() => {
                let score = state.scorer.snapshot(true).await;
                debug!("[{}] Updated score: {:.3}", state.address, score.score);
            }
        }
    }
}

/// Worker-side loop reporting the local score to the current master. Skipped
/// while this node is campaigning or has no master.
pub async fn run_score_reporting(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut tick = time::interval(state.config.score_update_interval);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return,
            _ = tick.tick() => {}
        }

        let (role, leader, candidate) = {
            let el = state.election.lock();
            (
                el.role,
                el.leader_address.clone(),
                el.state == NodeState::Candidate,
            )
        };
        if role != NodeRole::Worker || candidate || state.pre_election_delay.lock().is_some() {
            continue;
        }
        let Some(leader) = leader.filter(|addr| *addr != state.address) else {
            continue;
        };
        let Some(peer) = state.registry.get(&leader) else {
            continue;
        };

        let score = state.scorer.snapshot(false).await;
        match peer.report_resource_score(state.address.clone(), score).await {
            Ok(true) => debug!("[{}] Reported score to master {}", state.address, leader),
            Ok(false) => debug!(
                "[{}] Master {} declined score report",
                state.address, leader
            ),
            Err(e) => debug!(
                "[{}] Failed to report score to master {}: {}",
                state.address, leader, e
            ),
        }
    }
}

/// Registers this node with the current master, retrying a bounded number of
/// times. "Already registered" counts as success. On success the node list is
/// pulled so late joiners learn the whole cluster.
pub async fn retry_register_with_master(state: Arc<ServerState>) {
    for attempt in 1..=REGISTER_ATTEMPTS {
        let Some(leader) = state.current_leader().filter(|addr| *addr != state.address) else {
            return;
        };
        if state.is_master() {
            return;
        }
        state.registry.add(&leader);
        let Some(peer) = state.registry.get(&leader) else {
            return;
        };

        match peer.register_worker(state.address.clone()).await {
            Ok((true, _)) => {
                info!("[{}] Registered with master {}", state.address, leader);
                pull_node_list(&state).await;
                return;
            }
            Ok((false, message)) if message.contains("already registered") => {
                debug!("[{}] Already registered with master {}", state.address, leader);
                pull_node_list(&state).await;
                return;
            }
            Ok((false, message)) => {
                warn!(
                    "[{}] Master {} rejected registration: {}",
                    state.address, leader, message
                );
            }
            Err(e) => {
                warn!(
                    "[{}] Registration attempt {}/{} with {} failed: {}",
                    state.address, attempt, REGISTER_ATTEMPTS, leader, e
                );
            }
        }
        time::sleep(REGISTER_RETRY_DELAY).await;
    }
}

/// Pulls the master's full node list and merges it into the registry.
async fn pull_node_list(state: &Arc<ServerState>) {
    let Some(leader) = state.current_leader() else {
        return;
    };
    let Some(peer) = state.registry.get(&leader) else {
        return;
    };
    match peer.get_all_nodes().await {
        Ok(nodes) => {
            for node in nodes {
                state.registry.add(&format!("{}:{}", node.address, node.port));
            }
        }
        Err(e) => debug!(
            "[{}] Failed to get node list from master: {}",
            state.address, e
        ),
    }
}
