// src/server/handlers/master.rs

//! Handlers for the Master surface: upload ingest, status, retrieval,
//! worker registration and shard status reports. All of them reject when the
//! local node is not the effective master.

use crate::core::cluster::announcer;
use crate::core::errors::PrismError;
use crate::core::media::Container;
use crate::core::pipeline;
use crate::core::pipeline::job::{VideoJob, VideoStatus};
use crate::core::protocol::{
    RpcRequest, RpcResponse, STREAM_CHUNK_SIZE, ServerCodec, UploadVideoChunk,
};
use crate::core::state::ServerState;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

/// Ingests a streamed upload: the metadata-bearing first chunk has already
/// been read by the connection loop, the rest of the stream is consumed here.
/// The reply is produced after segmentation so it can carry its outcome.
pub async fn handle_upload(
    state: &Arc<ServerState>,
    first: UploadVideoChunk,
    framed: &mut Framed<TcpStream, ServerCodec>,
) -> RpcResponse {
    if !state.is_master() {
        return RpcResponse::Upload {
            video_id: first.video_id,
            success: false,
            message: "This node is not the master.".to_string(),
        };
    }
    if !first.is_first_chunk {
        return RpcResponse::Upload {
            video_id: first.video_id,
            success: false,
            message: "First chunk in an upload stream must set is_first_chunk.".to_string(),
        };
    }

    let video_id = if first.video_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        first.video_id.clone()
    };
    info!(
        "[{}] Receiving upload for video {} ({}x{} -> {}x{}, {})",
        state.address,
        video_id,
        first.upscale_width,
        first.upscale_height,
        first.target_width,
        first.target_height,
        first.output_format
    );

    let container = Container::from_ext(&first.output_format);
    let original_filename = if first.original_filename.is_empty() {
        format!("{video_id}.{container}")
    } else {
        first.original_filename.clone()
    };
    let job = VideoJob::new(
        video_id.clone(),
        container,
        first.target_width,
        first.target_height,
        first.upscale_width,
        first.upscale_height,
        original_filename,
    );
    state
        .jobs
        .insert(video_id.clone(), Arc::new(Mutex::new(job)));

    let temp_path = state
        .config
        .master_data_dir
        .join(format!("{video_id}_original.tmp"));

    if let Err(e) = receive_stream(state, &temp_path, &first, framed).await {
        error!(
            "[{}] Upload stream failed for video {}: {}",
            state.address, video_id, e
        );
        let _ = tokio::fs::remove_file(&temp_path).await;
        let message = format!("Upload stream processing failed: {e}");
        if let Some(job_arc) = state.jobs.get(&video_id).map(|entry| entry.value().clone()) {
            let mut job = job_arc.lock();
            job.status = VideoStatus::UploadFailed;
            job.message = message.clone();
        }
        return RpcResponse::Upload {
            video_id,
            success: false,
            message,
        };
    }
    info!(
        "[{}] Finished receiving all chunks for video {}",
        state.address, video_id
    );

    match pipeline::master::segment_video(state, &video_id).await {
        Ok(shard_files) => {
            if let Some(job_arc) = state.jobs.get(&video_id).map(|entry| entry.value().clone()) {
                let mut job = job_arc.lock();
                job.status = VideoStatus::Segmented;
                job.total_shards = shard_files.len();
            }
            tokio::spawn(pipeline::master::distribute_shards(
                state.clone(),
                video_id.clone(),
                shard_files,
            ));
            RpcResponse::Upload {
                video_id,
                success: true,
                message: "Video uploaded and segmentation started.".to_string(),
            }
        }
        Err(e) => {
            let message = format!("Segmentation failed: {e}");
            error!("[{}] {} (video {})", state.address, message, video_id);
            if let Some(job_arc) = state.jobs.get(&video_id).map(|entry| entry.value().clone()) {
                let mut job = job_arc.lock();
                job.status = VideoStatus::FailedSegmentation;
                job.message = message.clone();
            }
            RpcResponse::Upload {
                video_id,
                success: false,
                message,
            }
        }
    }
}

async fn receive_stream(
    state: &Arc<ServerState>,
    temp_path: &std::path::Path,
    first: &UploadVideoChunk,
    framed: &mut Framed<TcpStream, ServerCodec>,
) -> Result<(), PrismError> {
    let mut file = tokio::fs::File::create(temp_path).await?;
    file.write_all(&first.data_chunk).await?;
    loop {
        match framed.next().await {
            Some(frame) => match frame? {
                RpcRequest::UploadVideoChunk(chunk) => {
                    if chunk.is_first_chunk {
                        warn!(
                            "[{}] Unexpected first-chunk marker mid-stream; keeping the data",
                            state.address
                        );
                    }
                    file.write_all(&chunk.data_chunk).await?;
                }
                RpcRequest::UploadVideoEnd => break,
                _ => {
                    return Err(PrismError::InvalidRequest(
                        "Unexpected request inside an upload stream".to_string(),
                    ));
                }
            },
            None => return Err(PrismError::ConnectionClosed),
        }
    }
    file.flush().await?;
    Ok(())
}

pub fn get_video_status(state: &Arc<ServerState>, video_id: &str) -> RpcResponse {
    if !state.is_master() {
        return RpcResponse::VideoStatus {
            video_id: video_id.to_string(),
            status: "not_master".to_string(),
            message: "This node is not the master and does not track video status.".to_string(),
        };
    }
    match state.jobs.get(video_id) {
        Some(entry) => {
            let job = entry.value().lock();
            RpcResponse::VideoStatus {
                video_id: video_id.to_string(),
                status: job.status.to_string(),
                message: job.status_message(),
            }
        }
        None => RpcResponse::VideoStatus {
            video_id: video_id.to_string(),
            status: "not_found".to_string(),
            message: "Video not found.".to_string(),
        },
    }
}

/// Streams the completed output file back in fixed-size chunks.
pub async fn handle_retrieve(
    state: &Arc<ServerState>,
    framed: &mut Framed<TcpStream, ServerCodec>,
    video_id: &str,
) -> Result<(), PrismError> {
    if !state.is_master() {
        framed
            .send(RpcResponse::Error {
                message: "This node is not the master.".to_string(),
            })
            .await?;
        return Ok(());
    }
    let Some(job_arc) = state.jobs.get(video_id).map(|entry| entry.value().clone()) else {
        framed
            .send(RpcResponse::Error {
                message: "Video not found.".to_string(),
            })
            .await?;
        return Ok(());
    };
    let (status, path) = {
        let job = job_arc.lock();
        (job.status, job.processed_path.clone())
    };
    if status != VideoStatus::Completed {
        framed
            .send(RpcResponse::Error {
                message: format!("Video processing status: {status}. Not yet completed."),
            })
            .await?;
        return Ok(());
    }
    let Some(path) = path.filter(|path| path.exists()) else {
        framed
            .send(RpcResponse::Error {
                message: "Processed video file not found on master.".to_string(),
            })
            .await?;
        return Ok(());
    };

    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            framed
                .send(RpcResponse::Error {
                    message: format!("Failed to open processed video file: {e}"),
                })
                .await?;
            return Ok(());
        }
    };

    info!(
        "[{}] Streaming processed video {} from {}",
        state.address,
        video_id,
        path.display()
    );
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        framed
            .send(RpcResponse::RetrieveVideoChunk {
                video_id: video_id.to_string(),
                data_chunk: buf[..n].to_vec(),
            })
            .await?;
    }
    framed
        .send(RpcResponse::RetrieveVideoEnd {
            video_id: video_id.to_string(),
        })
        .await?;
    info!(
        "[{}] Finished streaming processed video {}",
        state.address, video_id
    );
    Ok(())
}

pub fn report_worker_shard_status(
    state: &Arc<ServerState>,
    video_id: &str,
    shard_id: &str,
    worker_address: &str,
    status: &str,
) -> RpcResponse {
    if !state.is_master() {
        return RpcResponse::ShardStatusReported {
            success: false,
            message: "This node is not the master.".to_string(),
        };
    }
    let (success, message) =
        pipeline::master::handle_shard_report(state, video_id, shard_id, worker_address, status);
    RpcResponse::ShardStatusReported { success, message }
}

pub fn register_worker(state: &Arc<ServerState>, worker_address: String) -> RpcResponse {
    if !state.is_master() {
        return RpcResponse::WorkerRegistered {
            success: false,
            message: "This node is not the master.".to_string(),
        };
    }
    if worker_address == state.address || state.registry.contains(&worker_address) {
        return RpcResponse::WorkerRegistered {
            success: false,
            message: format!("{worker_address} was already registered"),
        };
    }
    info!("[{}] RegisterWorker: adding {}", state.address, worker_address);
    state.registry.add(&worker_address);
    let state = state.clone();
    let message = format!("{worker_address} registered");
    tokio::spawn(async move {
        announcer::broadcast_node_list(&state).await;
    });
    RpcResponse::WorkerRegistered {
        success: true,
        message,
    }
}
