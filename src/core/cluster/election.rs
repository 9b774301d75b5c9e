// src/core/cluster/election.rs

//! The follower/candidate/leader state machine.
//!
//! Elections are score-weighted: a node that sees a better-scoring peer
//! yields before campaigning, votes go to strictly better-scoring candidates,
//! and near-equal scores fall back to a strict lexicographic address
//! tie-break so two simultaneous candidates always resolve the same way.

use crate::core::cluster::{NodeRole, NodeState, announcer, monitor};
use crate::core::protocol::RpcResponse;
use crate::core::state::ServerState;
use futures::future::join_all;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Two scores within this distance count as tied.
const SCORE_EPSILON: f64 = 1e-3;

/// Aggregate deadline for active master discovery.
const DISCOVERY_DEADLINE: Duration = Duration::from_secs(5);

/// Election attempts beyond this trigger the deterministic deadlock breaker.
const MAX_ELECTION_ATTEMPTS: u32 = 3;

/// Handles an incoming vote request on any node.
pub async fn handle_vote_request(
    state: &Arc<ServerState>,
    term: u64,
    candidate_id: &str,
    candidate_score: f64,
) -> RpcResponse {
    // Score is consulted at vote time, from cache when fresh.
    let my_score = state.scorer.snapshot(false).await.score;

    let mut el = state.election.lock();
    info!(
        "[{}] Received VoteRequest from {} with term {} and score {:.3}",
        state.address, candidate_id, term, candidate_score
    );

    if term < el.current_term {
        info!(
            "[{}] Rejecting vote: candidate term {} < our term {}",
            state.address, term, el.current_term
        );
        return vote_reply(state, &el, false, my_score);
    }

    if term > el.current_term {
        el.adopt_term(term);
        el.state = NodeState::Follower;
        el.leader_address = None;
        el.last_heartbeat = Instant::now();
    }

    let mut granted = false;
    if el.voted_for.is_none() || el.voted_for.as_deref() == Some(candidate_id) {
        if candidate_score < my_score {
            granted = true;
        } else if (candidate_score - my_score).abs() < SCORE_EPSILON {
            // Strict tie-break: only the lexicographically smaller address wins.
            granted = candidate_id < state.address.as_str();
        }
    }

    if granted {
        info!(
            "[{}] Granting vote to {} in term {}",
            state.address, candidate_id, el.current_term
        );
        el.voted_for = Some(candidate_id.to_string());
        el.last_heartbeat = Instant::now();
    } else {
        info!(
            "[{}] Rejecting vote for {} in term {} (voted_for: {:?})",
            state.address, candidate_id, el.current_term, el.voted_for
        );
    }

    vote_reply(state, &el, granted, my_score)
}

fn vote_reply(
    state: &Arc<ServerState>,
    el: &crate::core::cluster::ElectionState,
    vote_granted: bool,
    voter_score: f64,
) -> RpcResponse {
    RpcResponse::Vote {
        term: el.current_term,
        vote_granted,
        voter_id: state.address.clone(),
        voter_score,
        current_master_address: el.leader_address.clone().unwrap_or_default(),
        has_master: el.leader_address.is_some(),
    }
}

/// Handles an incoming master announcement on any node.
pub async fn handle_announcement(
    state: &Arc<ServerState>,
    master_address: &str,
    backup_master_address: &str,
    term: u64,
) -> RpcResponse {
    info!(
        "[{}] Received MasterAnnouncement: master {}, backup '{}', term {}",
        state.address, master_address, backup_master_address, term
    );

    // Authority talk pre-empts any election activity on this node.
    state.cancel_election_activity();

    let announced_backup =
        (!backup_master_address.is_empty()).then(|| backup_master_address.to_string());

    let (new_role, drain_buffer, leader_changed) = {
        let mut el = state.election.lock();

        if el.role == NodeRole::Master && master_address != state.address {
            if term < el.current_term {
                info!(
                    "[{}] Rejecting announcement with lower term {} < {}",
                    state.address, term, el.current_term
                );
                return announce_reply(state, "Rejected due to lower term");
            }
            if term == el.current_term {
                if master_address < state.address.as_str() {
                    info!(
                        "[{}] Stepping down as master, tie-break lost to {}",
                        state.address, master_address
                    );
                } else {
                    info!(
                        "[{}] Rejecting announcement, tie-break won against {}",
                        state.address, master_address
                    );
                    return announce_reply(state, "Rejected due to tie-breaker");
                }
            }
        }

        let leader_changed = el.leader_address.as_deref() != Some(master_address);
        el.leader_address = Some(master_address.to_string());
        el.backup_address = announced_backup.clone();

        let new_role = if state.address == master_address {
            NodeRole::Master
        } else if announced_backup.as_deref() == Some(state.address.as_str()) {
            NodeRole::BackupMaster
        } else if announced_backup.is_none() && el.role == NodeRole::BackupMaster {
            // A master that has not designated a backup leaves a configured
            // backup standing by.
            NodeRole::BackupMaster
        } else {
            NodeRole::Worker
        };
        let was_worker_side = new_role != NodeRole::Master;
        el.role = new_role;

        let mut drain_buffer = false;
        if term > el.current_term {
            el.adopt_term(term);
            el.state = NodeState::Follower;
            el.record_leader_contact();
            drain_buffer = was_worker_side;
        } else if term == el.current_term && was_worker_side {
            el.state = NodeState::Follower;
            el.record_leader_contact();
            drain_buffer = new_role == NodeRole::Worker;
        }

        (new_role, drain_buffer, leader_changed)
    };

    match new_role {
        NodeRole::Master => info!("[{}] I am now the MASTER.", state.address),
        NodeRole::BackupMaster => info!("[{}] I am now the BACKUP MASTER.", state.address),
        NodeRole::Worker => info!("[{}] I am a WORKER.", state.address),
    }

    state.registry.add(master_address);
    state.registry.set_local_master(new_role == NodeRole::Master);
    if new_role == NodeRole::Master {
        state.registry.set_leader(None);
    } else {
        state.registry.set_leader(Some(master_address));
    }

    if drain_buffer {
        let state = state.clone();
        tokio::spawn(async move {
            crate::core::pipeline::worker::drain_unreported(state).await;
        });
    }
    if leader_changed && new_role != NodeRole::Master {
        let state = state.clone();
        tokio::spawn(async move {
            monitor::retry_register_with_master(state).await;
        });
    }

    announce_reply(state, &format!("Acknowledged by {}", state.node_id))
}

fn announce_reply(state: &Arc<ServerState>, status: &str) -> RpcResponse {
    RpcResponse::Announce {
        status: status.to_string(),
        node_id: state.node_id.clone(),
    }
}

/// Schedules a randomized pre-election delay; when it elapses undisturbed the
/// node campaigns. Cancelled by any valid announcement.
pub fn schedule_pre_election_delay(state: &Arc<ServerState>) {
    let token = CancellationToken::new();
    {
        let mut slot = state.pre_election_delay.lock();
        if let Some(existing) = slot.take() {
            existing.cancel();
        }
        *slot = Some(token.clone());
    }

    let base = state.config.election_base_timeout.as_secs_f64();
    let delay = Duration::from_secs_f64(rand::thread_rng().gen_range(base..base * 1.5));
    info!(
        "[{}] Starting pre-election delay of {:.2}s",
        state.address,
        delay.as_secs_f64()
    );

    let state = state.clone();
    tokio::spawn(async move {
        let fired = tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        };
        let _ = state.pre_election_delay.lock().take();

        if !fired {
            info!("[{}] Pre-election delay cancelled", state.address);
            // Cancellation usually means fresh authority arrived; if not,
            // look for a master the polite way before giving up.
            if state.current_leader().is_none() {
                active_discovery(&state).await;
            }
            return;
        }

        {
            let el = state.election.lock();
            if el.state != NodeState::Follower || el.leader_address.is_some() {
                info!(
                    "[{}] Aborting election - cluster state changed during delay",
                    state.address
                );
                return;
            }
        }

        // Deterministic deadlock breaker: repeated fruitless rounds resolve
        // by address priority among reachable nodes.
        let attempts = state.election.lock().election_attempts;
        if attempts > MAX_ELECTION_ATTEMPTS {
            warn!(
                "[{}] Potential election deadlock after {} attempts",
                state.address, attempts
            );
            if active_discovery(&state).await {
                return;
            }
            let mut addrs = state.registry.addrs();
            addrs.push(state.address.clone());
            addrs.sort();
            for addr in addrs {
                if addr == state.address {
                    info!(
                        "[{}] Forcing election resolution - becoming master by address priority",
                        state.address
                    );
                    let score = state.scorer.snapshot(false).await.score;
                    become_leader(&state, vec![(state.address.clone(), score)]).await;
                    return;
                }
                if state.registry.is_reachable(&addr).await {
                    info!(
                        "[{}] Node {} has address priority and is alive",
                        state.address, addr
                    );
                    break;
                }
            }
        }

        start_election(&state).await;
    });
}

/// Runs one election round. Returns when the node is leader, follower, or the
/// round was cancelled.
pub async fn start_election(state: &Arc<ServerState>) {
    if state.election.lock().is_leader() {
        return;
    }
    let token = CancellationToken::new();
    *state.election_task.lock() = Some(token.clone());
    run_election(state, &token).await;
    let _ = state.election_task.lock().take();
}

async fn run_election(state: &Arc<ServerState>, cancel: &CancellationToken) {
    let my_score = state.scorer.snapshot(false).await.score;

    // Yield to better-scoring peers before campaigning.
    let handles = state.registry.handles();
    let probes = join_all(handles.iter().map(|peer| peer.get_node_stats())).await;
    let better = probes
        .iter()
        .filter_map(|reply| reply.as_ref().ok())
        .filter(|stats| stats.cpu_utilization < my_score)
        .count();
    if better > 0 {
        let delay = Duration::from_secs_f64(rand::thread_rng().gen_range(8.0..12.0));
        info!(
            "[{}] Found {} better-scoring nodes, delaying election by {:.2}s",
            state.address,
            better,
            delay.as_secs_f64()
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[{}] Election cancelled during pre-election backoff", state.address);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        let el = state.election.lock();
        if el.state != NodeState::Follower || el.leader_address.is_some() {
            info!("[{}] Election already resolved elsewhere, aborting", state.address);
            return;
        }
    }
    if cancel.is_cancelled() {
        return;
    }

    // Become candidate.
    let term = {
        let mut el = state.election.lock();
        el.state = NodeState::Candidate;
        el.current_term += 1;
        el.voted_for = Some(state.address.clone());
        el.leader_address = None;
        el.current_term
    };
    state.registry.set_leader(None);
    info!("[{}] Starting election for term {}", state.address, term);

    let peers = state.registry.handles();
    if peers.is_empty() {
        info!(
            "[{}] No other nodes to request votes from, becoming leader",
            state.address
        );
        become_leader(state, vec![(state.address.clone(), my_score)]).await;
        return;
    }

    let candidate_id = state.address.clone();
    let replies = join_all(peers.iter().map(|peer| {
        let candidate_id = candidate_id.clone();
        async move { peer.request_vote(term, candidate_id, my_score).await }
    }))
    .await;

    let mut votes = 1usize; // own vote
    let mut vote_scores = vec![(state.address.clone(), my_score)];
    let mut discovered_master: Option<String> = None;

    for reply in replies.into_iter().filter_map(|reply| reply.ok()) {
        if state.election.lock().state != NodeState::Candidate {
            return;
        }
        if reply.term > term {
            info!(
                "[{}] Voter {} has higher term {}, reverting to follower",
                state.address, reply.voter_id, reply.term
            );
            let mut el = state.election.lock();
            el.adopt_term(reply.term);
            el.state = NodeState::Follower;
            el.last_heartbeat = Instant::now();
            return;
        }
        if let Some(master) = &reply.current_master_address {
            discovered_master = Some(master.clone());
        }
        if reply.vote_granted {
            votes += 1;
            vote_scores.push((reply.voter_id.clone(), reply.voter_score));
        }
    }

    let total_nodes = state.registry.len() + 1;
    if votes * 2 > total_nodes {
        info!(
            "[{}] Won election with {}/{} votes",
            state.address, votes, total_nodes
        );
        become_leader(state, vote_scores).await;
        return;
    }

    info!(
        "[{}] Lost election with {}/{} votes",
        state.address, votes, total_nodes
    );
    {
        let mut el = state.election.lock();
        el.state = NodeState::Follower;
        el.reset_election_timer(state.config.election_base_timeout);
    }

    if let Some(master) = discovered_master {
        info!(
            "[{}] Discovered master {} from vote responses",
            state.address, master
        );
        {
            let mut el = state.election.lock();
            el.leader_address = Some(master.clone());
            el.record_leader_contact();
        }
        state.registry.add(&master);
        state.registry.set_leader(Some(&master));
    } else {
        active_discovery(state).await;
    }
}

/// Installs this node as leader for its current term and designates a backup
/// from the best-scoring responders.
pub async fn become_leader(state: &Arc<ServerState>, mut vote_scores: Vec<(String, f64)>) {
    vote_scores.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    let backup = vote_scores
        .iter()
        .map(|(addr, _)| addr)
        .find(|addr| **addr != state.address)
        .cloned();

    let term = {
        let mut el = state.election.lock();
        el.role = NodeRole::Master;
        el.state = NodeState::Leader;
        el.leader_address = Some(state.address.clone());
        el.voted_for = Some(state.address.clone());
        el.backup_address = backup.clone();
        el.election_attempts = 0;
        el.current_term
    };
    info!(
        "[{}] Becoming master for term {} (backup: {:?})",
        state.address, term, backup
    );

    state.registry.set_local_master(true);
    state.registry.set_leader(None);
    announcer::broadcast_announcement(state).await;
}

/// Unilateral fast-promotion of a backup master: bump the term by one and
/// announce. Peers accept because the term is higher than any they have seen.
pub async fn promote_backup(state: &Arc<ServerState>) {
    let term = {
        let mut el = state.election.lock();
        el.current_term += 1;
        el.role = NodeRole::Master;
        el.state = NodeState::Leader;
        el.leader_address = Some(state.address.clone());
        el.voted_for = Some(state.address.clone());
        el.backup_address = None;
        el.current_term
    };
    info!(
        "[{}] Promoting self from backup to master (term {})",
        state.address, term
    );
    state.registry.set_local_master(true);
    state.registry.set_leader(None);

    // Replacement backup: fresh probe of every reachable peer, best reported
    // CPU utilization wins. Unreachable peers simply drop out.
    let handles = state.registry.handles();
    let probed = join_all(handles.iter().map(|peer| async move {
        peer.get_node_stats()
            .await
            .ok()
            .map(|stats| (peer.addr.clone(), stats.cpu_utilization))
    }))
    .await;
    let mut scored: Vec<(String, f64)> = probed.into_iter().flatten().collect();
    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    let backup = scored.first().map(|(addr, _)| addr.clone());
    info!("[{}] Selected new backup master: {:?}", state.address, backup);
    state.election.lock().backup_address = backup;

    announcer::broadcast_announcement(state).await;
}

/// Probes every known peer for its stats and adopts the highest-term claimed
/// master, if any. Returns whether a master was adopted.
pub async fn active_discovery(state: &Arc<ServerState>) -> bool {
    let handles = state.registry.handles();
    if handles.is_empty() {
        return false;
    }
    info!("[{}] Starting active master discovery", state.address);

    let probes = join_all(handles.iter().map(|peer| peer.get_node_stats()));
    let replies = tokio::time::timeout(DISCOVERY_DEADLINE, probes)
        .await
        .unwrap_or_default();

    let current_term = state.current_term();
    let mut best: Option<(String, u64)> = None;
    for stats in replies.into_iter().filter_map(|reply| reply.ok()) {
        if stats.is_master
            && stats.current_term >= current_term
            && best
                .as_ref()
                .is_none_or(|(_, best_term)| stats.current_term > *best_term)
        {
            best = Some((stats.node_address.clone(), stats.current_term));
        }
    }

    let Some((master, term)) = best else {
        return false;
    };
    info!(
        "[{}] Discovered master at {} with term {}",
        state.address, master, term
    );
    {
        let mut el = state.election.lock();
        el.adopt_term(term);
        el.state = NodeState::Follower;
        el.leader_address = Some(master.clone());
        el.record_leader_contact();
    }
    state.registry.add(&master);
    state.registry.set_leader(Some(&master));
    true
}
