// src/core/state.rs

//! The globally shared state for one node process.

use crate::config::Config;
use crate::core::cluster::registry::PeerRegistry;
use crate::core::cluster::{ElectionState, NodeRole, NodeState};
use crate::core::errors::PrismError;
use crate::core::media::MediaTool;
use crate::core::pipeline::job::{ShardStatus, VideoJob};
use crate::core::score::{ResourceScore, ResourceScorer};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared context threaded through every handler and background routine.
///
/// Mutable pieces are guarded individually; none of the guards is ever held
/// across an await point.
pub struct ServerState {
    pub config: Config,
    /// Stable random identity for this process.
    pub node_id: String,
    /// The `host:port` address announced to peers.
    pub address: String,
    pub media: MediaTool,
    pub scorer: ResourceScorer,
    pub registry: PeerRegistry,
    pub election: Mutex<ElectionState>,
    /// Master-side job map, keyed by video id.
    pub jobs: DashMap<String, Arc<Mutex<VideoJob>>>,
    /// Latest resource score reported by each worker (master side).
    pub node_scores: DashMap<String, ResourceScore>,
    /// Worker-side statuses that could not be delivered to a master, keyed by
    /// (video_id, shard_id). Drained on master change.
    pub unreported_shards: Mutex<HashMap<(String, String), ShardStatus>>,
    /// Cancels a pending pre-election delay.
    pub pre_election_delay: Mutex<Option<CancellationToken>>,
    /// Cancels an in-flight election round.
    pub election_task: Mutex<Option<CancellationToken>>,
    /// Shards currently being transcoded on this node.
    pub processing_shards: AtomicUsize,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl ServerState {
    /// Builds the shared state, creates the data directories, and seeds the
    /// peer registry from configuration.
    pub fn initialize(config: Config) -> Result<Arc<Self>, PrismError> {
        std::fs::create_dir_all(&config.shards_dir)?;
        std::fs::create_dir_all(&config.master_data_dir)?;
        std::fs::create_dir_all(config.master_data_dir.join("retrieved_shards"))?;

        let mut id_bytes = [0u8; 20];
        getrandom::fill(&mut id_bytes).map_err(|e| PrismError::Internal(e.to_string()))?;
        let node_id = hex::encode(id_bytes);

        let address = config.address();
        info!(
            "[{}] Initializing as {} (node id {})",
            address, config.role, node_id
        );

        let registry = PeerRegistry::new(address.clone());
        for node in &config.nodes {
            registry.add(node);
        }

        let mut election = ElectionState::new(config.role, config.election_base_timeout);
        if config.role == NodeRole::Master {
            // A configured master leads term 0 until discovery says otherwise.
            election.state = NodeState::Leader;
            election.leader_address = Some(address.clone());
            election.voted_for = Some(address.clone());
        } else {
            election.leader_address = config.master.clone();
        }

        let scorer = ResourceScorer::new(
            address.clone(),
            config.shards_dir.clone(),
            config.score_update_interval,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(Self {
            media: MediaTool::new(config.media_tool.clone()),
            scorer,
            registry,
            election: Mutex::new(election),
            jobs: DashMap::new(),
            node_scores: DashMap::new(),
            unreported_shards: Mutex::new(HashMap::new()),
            pre_election_delay: Mutex::new(None),
            election_task: Mutex::new(None),
            processing_shards: AtomicUsize::new(0),
            shutdown_tx,
            node_id,
            address,
            config,
        });

        if state.config.role == NodeRole::Master {
            state.registry.set_local_master(true);
        } else if let Some(master) = state.config.master.clone() {
            state.registry.add(&master);
            state.registry.set_leader(Some(&master));
        }

        Ok(state)
    }

    pub fn current_role(&self) -> NodeRole {
        self.election.lock().role
    }

    pub fn is_master(&self) -> bool {
        self.election.lock().role == NodeRole::Master
    }

    pub fn current_leader(&self) -> Option<String> {
        self.election.lock().leader_address.clone()
    }

    pub fn current_term(&self) -> u64 {
        self.election.lock().current_term
    }

    /// True while this node is campaigning, running an election round, or
    /// waiting out a pre-election delay.
    pub fn election_in_progress(&self) -> bool {
        self.election.lock().state == NodeState::Candidate
            || self.pre_election_delay.lock().is_some()
            || self.election_task.lock().is_some()
    }

    /// Cancels any pending pre-election delay and any in-flight election.
    pub fn cancel_election_activity(&self) {
        if let Some(token) = self.pre_election_delay.lock().take() {
            token.cancel();
        }
        if let Some(token) = self.election_task.lock().take() {
            token.cancel();
        }
    }

    /// Shards being transcoded plus jobs still moving through the pipeline.
    pub fn active_tasks(&self) -> u32 {
        let active_jobs = self
            .jobs
            .iter()
            .filter(|entry| !entry.value().lock().status.is_terminal())
            .count();
        (self.processing_shards.load(Ordering::Relaxed) + active_jobs) as u32
    }
}
