// src/server/handlers/mod.rs

//! Request handlers for the three RPC surfaces. Every caught failure becomes
//! a structured reply; handlers never tear down the server.

use crate::core::cluster::election;
use crate::core::pipeline;
use crate::core::protocol::{RpcRequest, RpcResponse};
use crate::core::state::ServerState;
use std::sync::Arc;

pub mod master;
pub mod node;

/// Dispatches a single-frame request. Streamed requests (upload, retrieve)
/// are handled at the connection level; their frames only land here when they
/// arrive out of sequence.
pub async fn dispatch(state: &Arc<ServerState>, request: RpcRequest) -> RpcResponse {
    match request {
        // --- Node surface ---
        RpcRequest::AnnounceMaster {
            master_address,
            backup_master_address,
            term,
            ..
        } => election::handle_announcement(state, &master_address, &backup_master_address, term).await,
        RpcRequest::RequestVote {
            term,
            candidate_id,
            score,
        } => election::handle_vote_request(state, term, &candidate_id, score).await,
        RpcRequest::GetNodeStats => node::get_node_stats(state).await,
        RpcRequest::GetCurrentMaster => node::get_current_master(state),
        RpcRequest::RegisterNode {
            node_id,
            address,
            port,
        } => node::register_node(state, &node_id, &address, port),
        RpcRequest::UpdateNodeList {
            node_addresses,
            master_address,
        } => node::update_node_list(state, node_addresses, &master_address),
        RpcRequest::GetAllNodes => node::get_all_nodes(state),
        RpcRequest::ReportResourceScore {
            worker_address,
            score,
        } => node::report_resource_score(state, worker_address, score),

        // --- Master surface ---
        RpcRequest::GetVideoStatus { video_id } => master::get_video_status(state, &video_id),
        RpcRequest::ReportWorkerShardStatus {
            video_id,
            shard_id,
            worker_address,
            status,
        } => master::report_worker_shard_status(state, &video_id, &shard_id, &worker_address, &status),
        RpcRequest::RegisterWorker { worker_address } => {
            master::register_worker(state, worker_address)
        }

        // --- Worker surface ---
        RpcRequest::ProcessShard(request) => pipeline::worker::accept_shard(state, request).await,
        RpcRequest::RequestShard { shard_id } => {
            pipeline::worker::serve_shard(state, &shard_id).await
        }

        // Stream frames outside an active stream.
        RpcRequest::UploadVideoChunk(_) | RpcRequest::UploadVideoEnd | RpcRequest::RetrieveVideo { .. } => {
            RpcResponse::Error {
                message: "Stream frame outside of an active stream".to_string(),
            }
        }
    }
}
