// src/core/cluster/registry.rs

//! The set of known peers and their reusable transport channels.
//!
//! One channel per peer address, shared by up to three logical stubs
//! (Node / Worker / Master). The registry is the single source of truth for
//! membership and tears channels down when peers are evicted.

use crate::core::cluster::client::{
    ANNOUNCE_DEADLINE, CONTROL_DEADLINE, RpcClient, SHARD_DEADLINE, STATS_DEADLINE, VOTE_DEADLINE,
    VoteReply, expect_node_stats, expect_vote, unexpected,
};
use crate::core::errors::PrismError;
use crate::core::protocol::{
    DistributeShardRequest, NodeInfo, NodeStats, RpcRequest, RpcResponse,
};
use crate::core::score::ResourceScore;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A single known peer: its address, the reusable connection, and which
/// logical stubs are currently open against it.
#[derive(Debug)]
pub struct PeerHandle {
    pub addr: String,
    conn: Mutex<Option<RpcClient>>,
    /// Set while the local node is master: this peer can receive shards.
    worker_surface: AtomicBool,
    /// Set while this peer is our current leader.
    master_surface: AtomicBool,
}

impl PeerHandle {
    fn new(addr: String, worker_surface: bool) -> Self {
        Self {
            addr,
            conn: Mutex::new(None),
            worker_surface: AtomicBool::new(worker_surface),
            master_surface: AtomicBool::new(false),
        }
    }

    pub fn has_worker_surface(&self) -> bool {
        self.worker_surface.load(Ordering::Relaxed)
    }

    pub fn has_master_surface(&self) -> bool {
        self.master_surface.load(Ordering::Relaxed)
    }

    /// Sends a request over the shared channel, reconnecting first if no open
    /// channel exists. The channel is shared by all stubs for this peer, so
    /// waiting for it is also bounded by the deadline. A failed call drops
    /// the channel so the next call gets a fresh one.
    pub async fn call(
        &self,
        request: RpcRequest,
        deadline: Duration,
    ) -> Result<RpcResponse, PrismError> {
        let mut conn = tokio::time::timeout(deadline, self.conn.lock())
            .await
            .map_err(|_| PrismError::DeadlineExceeded)?;
        if conn.is_none() {
            debug!("Opening channel to {}", self.addr);
            *conn = Some(RpcClient::connect(&self.addr).await?);
        }
        let client = conn.as_mut().expect("channel was just established");
        match client.call(request, deadline).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                conn.take();
                Err(e)
            }
        }
    }

    // --- Node surface ---

    pub async fn get_node_stats(&self) -> Result<NodeStats, PrismError> {
        expect_node_stats(self.call(RpcRequest::GetNodeStats, STATS_DEADLINE).await?)
    }

    pub async fn request_vote(
        &self,
        term: u64,
        candidate_id: String,
        score: f64,
    ) -> Result<VoteReply, PrismError> {
        expect_vote(
            self.call(
                RpcRequest::RequestVote {
                    term,
                    candidate_id,
                    score,
                },
                VOTE_DEADLINE,
            )
            .await?,
        )
    }

    pub async fn announce_master(
        &self,
        master_address: String,
        backup_master_address: String,
        node_id_of_master: String,
        term: u64,
    ) -> Result<String, PrismError> {
        match self
            .call(
                RpcRequest::AnnounceMaster {
                    master_address,
                    backup_master_address,
                    node_id_of_master,
                    term,
                },
                ANNOUNCE_DEADLINE,
            )
            .await?
        {
            RpcResponse::Announce { status, .. } => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_current_master(&self) -> Result<(Option<String>, u64), PrismError> {
        match self.call(RpcRequest::GetCurrentMaster, STATS_DEADLINE).await? {
            RpcResponse::CurrentMaster {
                master_address,
                term,
                is_master_known,
            } => Ok((is_master_known.then_some(master_address), term)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn register_node(
        &self,
        node_id: String,
        address: String,
        port: u16,
    ) -> Result<(Option<String>, Vec<String>), PrismError> {
        match self
            .call(
                RpcRequest::RegisterNode {
                    node_id,
                    address,
                    port,
                },
                CONTROL_DEADLINE,
            )
            .await?
        {
            RpcResponse::NodeRegistered {
                current_leader,
                nodes,
                ..
            } => Ok((
                (!current_leader.is_empty()).then_some(current_leader),
                nodes,
            )),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn update_node_list(
        &self,
        node_addresses: Vec<String>,
        master_address: String,
    ) -> Result<bool, PrismError> {
        match self
            .call(
                RpcRequest::UpdateNodeList {
                    node_addresses,
                    master_address,
                },
                CONTROL_DEADLINE,
            )
            .await?
        {
            RpcResponse::NodeListUpdated { success } => Ok(success),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_all_nodes(&self) -> Result<Vec<NodeInfo>, PrismError> {
        match self.call(RpcRequest::GetAllNodes, CONTROL_DEADLINE).await? {
            RpcResponse::AllNodes { nodes } => Ok(nodes),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn report_resource_score(
        &self,
        worker_address: String,
        score: ResourceScore,
    ) -> Result<bool, PrismError> {
        match self
            .call(
                RpcRequest::ReportResourceScore {
                    worker_address,
                    score,
                },
                CONTROL_DEADLINE,
            )
            .await?
        {
            RpcResponse::ScoreReported { success, .. } => Ok(success),
            other => Err(unexpected(&other)),
        }
    }

    // --- Master surface ---

    pub async fn register_worker(&self, worker_address: String) -> Result<(bool, String), PrismError> {
        match self
            .call(RpcRequest::RegisterWorker { worker_address }, CONTROL_DEADLINE)
            .await?
        {
            RpcResponse::WorkerRegistered { success, message } => Ok((success, message)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn report_shard_status(
        &self,
        video_id: String,
        shard_id: String,
        worker_address: String,
        status: String,
    ) -> Result<(bool, String), PrismError> {
        match self
            .call(
                RpcRequest::ReportWorkerShardStatus {
                    video_id,
                    shard_id,
                    worker_address,
                    status,
                },
                CONTROL_DEADLINE,
            )
            .await?
        {
            RpcResponse::ShardStatusReported { success, message } => Ok((success, message)),
            other => Err(unexpected(&other)),
        }
    }

    // --- Worker surface ---

    pub async fn distribute_shard(
        &self,
        request: DistributeShardRequest,
    ) -> Result<(bool, String), PrismError> {
        match self
            .call(RpcRequest::ProcessShard(request), SHARD_DEADLINE)
            .await?
        {
            RpcResponse::ShardAccepted {
                success, message, ..
            } => Ok((success, message)),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn request_shard(&self, shard_id: String) -> Result<(bool, Vec<u8>, String), PrismError> {
        match self
            .call(RpcRequest::RequestShard { shard_id }, SHARD_DEADLINE)
            .await?
        {
            RpcResponse::Shard {
                success,
                shard_data,
                message,
                ..
            } => Ok((success, shard_data, message)),
            other => Err(unexpected(&other)),
        }
    }
}

/// Maintains the set of known peer addresses. Never contains the local
/// address.
pub struct PeerRegistry {
    local_addr: String,
    /// Mirrors whether the local node currently serves as master; newly added
    /// peers get a worker stub iff this is set.
    local_is_master: AtomicBool,
    peers: DashMap<String, Arc<PeerHandle>>,
}

impl PeerRegistry {
    pub fn new(local_addr: String) -> Self {
        Self {
            local_addr,
            local_is_master: AtomicBool::new(false),
            peers: DashMap::new(),
        }
    }

    /// Adds a peer. Idempotent; the local address is never added. Returns
    /// true when the peer was new.
    pub fn add(&self, addr: &str) -> bool {
        if addr == self.local_addr || addr.is_empty() {
            return false;
        }
        if self.peers.contains_key(addr) {
            return false;
        }
        info!("Adding node {} to known nodes", addr);
        let handle = Arc::new(PeerHandle::new(
            addr.to_string(),
            self.local_is_master.load(Ordering::Relaxed),
        ));
        self.peers.insert(addr.to_string(), handle).is_none()
    }

    /// Removes a peer and drops its channel. Idempotent.
    pub fn remove(&self, addr: &str) {
        if self.peers.remove(addr).is_some() {
            info!("Removed node {} from known nodes", addr);
        }
    }

    pub fn get(&self, addr: &str) -> Option<Arc<PeerHandle>> {
        self.peers.get(addr).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.peers.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn addrs(&self) -> Vec<String> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn handles(&self) -> Vec<Arc<PeerHandle>> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Peers currently holding a Worker stub, i.e. candidates for shard
    /// placement.
    pub fn worker_addrs(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .peers
            .iter()
            .filter(|entry| entry.value().has_worker_surface())
            .map(|entry| entry.key().clone())
            .collect();
        addrs.sort();
        addrs
    }

    /// Flips the local master flag and opens/closes Worker stubs accordingly.
    pub fn set_local_master(&self, is_master: bool) {
        self.local_is_master.store(is_master, Ordering::Relaxed);
        for entry in self.peers.iter() {
            entry
                .value()
                .worker_surface
                .store(is_master, Ordering::Relaxed);
        }
    }

    /// Marks which peer (if any) holds our Master stub.
    pub fn set_leader(&self, leader: Option<&str>) {
        for entry in self.peers.iter() {
            entry
                .value()
                .master_surface
                .store(Some(entry.key().as_str()) == leader, Ordering::Relaxed);
        }
    }

    /// Connectivity probe over the peer's channel.
    pub async fn is_reachable(&self, addr: &str) -> bool {
        match self.get(addr) {
            Some(peer) => peer.get_node_stats().await.is_ok(),
            None => false,
        }
    }
}
