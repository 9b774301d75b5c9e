// src/core/protocol.rs

//! The wire protocol shared by all three RPC surfaces.
//!
//! Every connection carries length-delimited frames (1 GiB cap, large enough
//! for whole-shard payloads) whose bodies are bincode-encoded `RpcRequest` /
//! `RpcResponse` values. Streams (upload, retrieve) are sequences of frames on
//! one connection terminated by an explicit end-of-stream frame.

use crate::core::errors::PrismError;
use crate::core::score::ResourceScore;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Payload size for upload and retrieval stream chunks.
pub const STREAM_CHUNK_SIZE: usize = 1024 * 1024;

/// Maximum frame size in either direction; sized for whole-shard transfers.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024 * 1024;

fn wire_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

/// One message of a streamed upload. The first frame carries the full job
/// metadata; subsequent frames carry only data.
#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, Default)]
pub struct UploadVideoChunk {
    pub video_id: String,
    pub data_chunk: Vec<u8>,
    pub target_width: u32,
    pub target_height: u32,
    pub upscale_width: u32,
    pub upscale_height: u32,
    pub output_format: String,
    pub original_filename: String,
    pub is_first_chunk: bool,
}

/// A shard handed to a worker for processing.
#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone)]
pub struct DistributeShardRequest {
    pub video_id: String,
    pub shard_id: String,
    pub shard_data: Vec<u8>,
    pub shard_index: u32,
    pub total_shards: u32,
    pub target_width: u32,
    pub target_height: u32,
    pub original_filename: String,
}

/// Node statistics served by every peer, master or not.
#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone, Default)]
pub struct NodeStats {
    pub node_id: String,
    pub node_address: String,
    pub is_master: bool,
    pub current_master_address: String,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub shards_disk_free_mb: u64,
    pub shards_disk_total_mb: u64,
    pub master_data_disk_free_mb: u64,
    pub master_data_disk_total_mb: u64,
    pub active_tasks: u32,
    pub known_nodes_count: u32,
    pub election_in_progress: bool,
    pub current_term: u64,
}

#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone)]
pub struct NodeInfo {
    pub node_id: String,
    pub address: String,
    pub port: u16,
}

/// Requests across all three surfaces. Which variants a node honors at any
/// moment depends on its current role; mismatches get structured rejections.
#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone)]
pub enum RpcRequest {
    // --- Node surface (always live) ---
    AnnounceMaster {
        master_address: String,
        backup_master_address: String,
        node_id_of_master: String,
        term: u64,
    },
    RequestVote {
        term: u64,
        candidate_id: String,
        score: f64,
    },
    GetNodeStats,
    GetCurrentMaster,
    RegisterNode {
        node_id: String,
        address: String,
        port: u16,
    },
    UpdateNodeList {
        node_addresses: Vec<String>,
        master_address: String,
    },
    GetAllNodes,
    ReportResourceScore {
        worker_address: String,
        score: ResourceScore,
    },

    // --- Master surface ---
    UploadVideoChunk(UploadVideoChunk),
    UploadVideoEnd,
    GetVideoStatus {
        video_id: String,
    },
    RetrieveVideo {
        video_id: String,
    },
    ReportWorkerShardStatus {
        video_id: String,
        shard_id: String,
        worker_address: String,
        status: String,
    },
    RegisterWorker {
        worker_address: String,
    },

    // --- Worker surface ---
    ProcessShard(DistributeShardRequest),
    RequestShard {
        shard_id: String,
    },
}

/// Replies, one variant per request shape plus the streamed retrieval frames.
#[derive(Serialize, Deserialize, bincode::Encode, bincode::Decode, Debug, Clone)]
pub enum RpcResponse {
    Announce {
        status: String,
        node_id: String,
    },
    Vote {
        term: u64,
        vote_granted: bool,
        voter_id: String,
        voter_score: f64,
        current_master_address: String,
        has_master: bool,
    },
    NodeStats(NodeStats),
    CurrentMaster {
        master_address: String,
        term: u64,
        is_master_known: bool,
    },
    NodeRegistered {
        success: bool,
        current_leader: String,
        nodes: Vec<String>,
    },
    NodeListUpdated {
        success: bool,
    },
    AllNodes {
        nodes: Vec<NodeInfo>,
    },
    ScoreReported {
        success: bool,
        message: String,
    },
    Upload {
        video_id: String,
        success: bool,
        message: String,
    },
    VideoStatus {
        video_id: String,
        status: String,
        message: String,
    },
    RetrieveVideoChunk {
        video_id: String,
        data_chunk: Vec<u8>,
    },
    RetrieveVideoEnd {
        video_id: String,
    },
    ShardStatusReported {
        success: bool,
        message: String,
    },
    WorkerRegistered {
        success: bool,
        message: String,
    },
    ShardAccepted {
        shard_id: String,
        success: bool,
        message: String,
    },
    Shard {
        shard_id: String,
        success: bool,
        shard_data: Vec<u8>,
        message: String,
    },
    /// Structured failure for requests that have no richer reply shape.
    Error {
        message: String,
    },
}

impl RpcResponse {
    /// Variant name for diagnostics. Debug-formatting a whole response can
    /// drag megabytes of shard payload into a log line.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcResponse::Announce { .. } => "Announce",
            RpcResponse::Vote { .. } => "Vote",
            RpcResponse::NodeStats(_) => "NodeStats",
            RpcResponse::CurrentMaster { .. } => "CurrentMaster",
            RpcResponse::NodeRegistered { .. } => "NodeRegistered",
            RpcResponse::NodeListUpdated { .. } => "NodeListUpdated",
            RpcResponse::AllNodes { .. } => "AllNodes",
            RpcResponse::ScoreReported { .. } => "ScoreReported",
            RpcResponse::Upload { .. } => "Upload",
            RpcResponse::VideoStatus { .. } => "VideoStatus",
            RpcResponse::RetrieveVideoChunk { .. } => "RetrieveVideoChunk",
            RpcResponse::RetrieveVideoEnd { .. } => "RetrieveVideoEnd",
            RpcResponse::ShardStatusReported { .. } => "ShardStatusReported",
            RpcResponse::WorkerRegistered { .. } => "WorkerRegistered",
            RpcResponse::ShardAccepted { .. } => "ShardAccepted",
            RpcResponse::Shard { .. } => "Shard",
            RpcResponse::Error { .. } => "Error",
        }
    }
}

/// Length-delimited bincode codec, generic over the send/receive directions
/// so the same type serves both ends of a connection.
#[derive(Debug)]
pub struct WireCodec<Out, In> {
    inner: LengthDelimitedCodec,
    _direction: PhantomData<fn(Out) -> In>,
}

/// Server side: sends responses, receives requests.
pub type ServerCodec = WireCodec<RpcResponse, RpcRequest>;
/// Client side: sends requests, receives responses.
pub type ClientCodec = WireCodec<RpcRequest, RpcResponse>;

impl<Out, In> WireCodec<Out, In> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _direction: PhantomData,
        }
    }
}

impl<Out, In> Default for WireCodec<Out, In> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Out: bincode::Encode, In> Encoder<Out> for WireCodec<Out, In> {
    type Error = PrismError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::encode_to_vec(item, wire_config())?;
        self.inner
            .encode(Bytes::from(payload), dst)
            .map_err(PrismError::from)
    }
}

impl<Out, In: bincode::Decode<()>> Decoder for WireCodec<Out, In> {
    type Item = In;
    type Error = PrismError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        let (item, _) = bincode::decode_from_slice(&frame, wire_config())?;
        Ok(Some(item))
    }
}
