// src/core/cluster/client.rs

//! Internal asynchronous RPC client used by a node to talk to its peers.

use crate::core::errors::PrismError;
use crate::core::protocol::{ClientCodec, NodeStats, RpcRequest, RpcResponse, UploadVideoChunk};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-operation deadlines.
pub const STATS_DEADLINE: Duration = Duration::from_secs(2);
pub const VOTE_DEADLINE: Duration = Duration::from_secs(5);
pub const ANNOUNCE_DEADLINE: Duration = Duration::from_secs(5);
pub const CONTROL_DEADLINE: Duration = Duration::from_secs(5);
pub const SHARD_DEADLINE: Duration = Duration::from_secs(30);

/// A framed connection to one peer. Connections are owned by the peer
/// registry and reused across calls.
#[derive(Debug)]
pub struct RpcClient {
    framed: Framed<TcpStream, ClientCodec>,
}

impl RpcClient {
    /// Connects to `addr` with a bounded connect timeout.
    pub async fn connect(addr: &str) -> Result<Self, PrismError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PrismError::DeadlineExceeded)??;
        Ok(Self {
            framed: Framed::new(stream, ClientCodec::new()),
        })
    }

    /// Sends one request and waits for one reply, all under `deadline`.
    pub async fn call(
        &mut self,
        request: RpcRequest,
        deadline: Duration,
    ) -> Result<RpcResponse, PrismError> {
        tokio::time::timeout(deadline, async {
            self.framed.send(request).await?;
            match self.framed.next().await {
                Some(reply) => reply,
                None => Err(PrismError::ConnectionClosed),
            }
        })
        .await
        .map_err(|_| PrismError::DeadlineExceeded)?
    }

    /// Streams an upload: every chunk frame, then the end-of-stream marker,
    /// then one reply. The reply only arrives after the master has segmented
    /// the file, so callers should size `deadline` generously.
    pub async fn upload_video(
        &mut self,
        chunks: Vec<UploadVideoChunk>,
        deadline: Duration,
    ) -> Result<(String, bool, String), PrismError> {
        tokio::time::timeout(deadline, async {
            for chunk in chunks {
                self.framed.send(RpcRequest::UploadVideoChunk(chunk)).await?;
            }
            self.framed.send(RpcRequest::UploadVideoEnd).await?;
            match self.framed.next().await {
                Some(reply) => match reply? {
                    RpcResponse::Upload {
                        video_id,
                        success,
                        message,
                    } => Ok((video_id, success, message)),
                    other => Err(unexpected(&other)),
                },
                None => Err(PrismError::ConnectionClosed),
            }
        })
        .await
        .map_err(|_| PrismError::DeadlineExceeded)?
    }

    /// Drains a retrieval stream into one buffer.
    pub async fn retrieve_video(
        &mut self,
        video_id: &str,
        deadline: Duration,
    ) -> Result<Vec<u8>, PrismError> {
        tokio::time::timeout(deadline, async {
            self.framed
                .send(RpcRequest::RetrieveVideo {
                    video_id: video_id.to_string(),
                })
                .await?;
            let mut data = Vec::new();
            loop {
                match self.framed.next().await {
                    Some(reply) => match reply? {
                        RpcResponse::RetrieveVideoChunk { data_chunk, .. } => {
                            data.extend_from_slice(&data_chunk);
                        }
                        RpcResponse::RetrieveVideoEnd { .. } => return Ok(data),
                        RpcResponse::Error { message } => {
                            return Err(PrismError::Internal(message));
                        }
                        other => return Err(unexpected(&other)),
                    },
                    None => return Err(PrismError::ConnectionClosed),
                }
            }
        })
        .await
        .map_err(|_| PrismError::DeadlineExceeded)?
    }
}

/// Maps a reply of the wrong shape (including structured `Error` replies) to
/// a client-side error.
pub fn unexpected(reply: &RpcResponse) -> PrismError {
    if let RpcResponse::Error { message } = reply {
        return PrismError::Internal(message.clone());
    }
    PrismError::UnexpectedReply(reply.kind().to_string())
}

/// Reply-shape helpers shared by the typed peer methods.
pub fn expect_node_stats(reply: RpcResponse) -> Result<NodeStats, PrismError> {
    match reply {
        RpcResponse::NodeStats(stats) => Ok(stats),
        other => Err(unexpected(&other)),
    }
}

/// A vote reply, flattened out of the wire enum.
#[derive(Debug, Clone)]
pub struct VoteReply {
    pub term: u64,
    pub vote_granted: bool,
    pub voter_id: String,
    pub voter_score: f64,
    pub current_master_address: Option<String>,
}

pub fn expect_vote(reply: RpcResponse) -> Result<VoteReply, PrismError> {
    match reply {
        RpcResponse::Vote {
            term,
            vote_granted,
            voter_id,
            voter_score,
            current_master_address,
            has_master,
        } => Ok(VoteReply {
            term,
            vote_granted,
            voter_id,
            voter_score,
            current_master_address: has_master.then_some(current_master_address),
        }),
        other => Err(unexpected(&other)),
    }
}
