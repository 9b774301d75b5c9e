// src/core/pipeline/worker.rs

//! Worker side of the shard pipeline: accept shards, transcode them in the
//! background, serve the processed bytes back, and buffer status reports that
//! could not reach a master.

use crate::core::cluster::NodeRole;
use crate::core::media::Container;
use crate::core::pipeline::job::ShardStatus;
use crate::core::protocol::{DistributeShardRequest, RpcResponse};
use crate::core::state::ServerState;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{error, info, warn};

/// Container implied by a shard id's file extension.
fn container_of(shard_id: &str) -> Container {
    Container::from_ext(shard_id.rsplit('.').next().unwrap_or_default())
}

/// Accepts a shard for processing. The reply is only an acceptance; the
/// processing outcome arrives later via `ReportWorkerShardStatus`.
pub async fn accept_shard(
    state: &Arc<ServerState>,
    request: DistributeShardRequest,
) -> RpcResponse {
    info!(
        "[{}] Received ProcessShard for {} ({} bytes)",
        state.address,
        request.shard_id,
        request.shard_data.len()
    );
    if state.current_role() != NodeRole::Worker {
        return RpcResponse::ShardAccepted {
            shard_id: request.shard_id,
            success: false,
            message: "Not a worker".to_string(),
        };
    }

    let input_path = state
        .config
        .shards_dir
        .join(format!("{}_input.tmp", request.shard_id));
    if let Err(e) = tokio::fs::write(&input_path, &request.shard_data).await {
        return RpcResponse::ShardAccepted {
            shard_id: request.shard_id,
            success: false,
            message: format!("Failed to store shard: {e}"),
        };
    }

    let shard_id = request.shard_id.clone();
    let state = state.clone();
    tokio::spawn(async move {
        process_shard(state, request, input_path).await;
    });

    RpcResponse::ShardAccepted {
        shard_id,
        success: true,
        message: "Accepted for processing".to_string(),
    }
}

async fn process_shard(
    state: Arc<ServerState>,
    request: DistributeShardRequest,
    input_path: PathBuf,
) {
    state.processing_shards.fetch_add(1, Ordering::Relaxed);
    let container = container_of(&request.shard_id);
    let output_path = state
        .config
        .shards_dir
        .join(format!("{}_processed.{}", request.shard_id, container));
    info!(
        "[{}] Processing {}: {} -> {} [{}]",
        state.address,
        request.shard_id,
        input_path.display(),
        output_path.display(),
        container
    );

    let result = state
        .media
        .transcode(
            &input_path,
            &output_path,
            request.target_width,
            request.target_height,
            container,
        )
        .await;
    state.processing_shards.fetch_sub(1, Ordering::Relaxed);

    match result {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&input_path).await;
            info!(
                "[{}] Shard {} processed -> {}",
                state.address,
                request.shard_id,
                output_path.display()
            );
            report_shard_status(
                &state,
                &request.video_id,
                &request.shard_id,
                ShardStatus::ProcessedSuccessfully,
            )
            .await;
        }
        Err(e) => {
            error!(
                "[{}] Processing failed for shard {}: {}",
                state.address, request.shard_id, e
            );
            report_shard_status(
                &state,
                &request.video_id,
                &request.shard_id,
                ShardStatus::FailedProcessing,
            )
            .await;
        }
    }
}

/// Serves a processed shard's bytes and deletes the file after a successful
/// read.
pub async fn serve_shard(state: &Arc<ServerState>, shard_id: &str) -> RpcResponse {
    let container = container_of(shard_id);
    let path = state
        .config
        .shards_dir
        .join(format!("{shard_id}_processed.{container}"));

    match tokio::fs::read(&path).await {
        Ok(data) => {
            let _ = tokio::fs::remove_file(&path).await;
            info!(
                "[{}] Served processed shard {} ({} bytes)",
                state.address,
                shard_id,
                data.len()
            );
            RpcResponse::Shard {
                shard_id: shard_id.to_string(),
                success: true,
                shard_data: data,
                message: "OK".to_string(),
            }
        }
        Err(_) => {
            error!(
                "[{}] Processed shard file not found: {}",
                state.address,
                path.display()
            );
            RpcResponse::Shard {
                shard_id: shard_id.to_string(),
                success: false,
                shard_data: Vec::new(),
                message: "Processed shard file not found.".to_string(),
            }
        }
    }
}

/// Reports one shard status to the current master, buffering the entry when
/// no master is reachable or the master rejects the report.
pub async fn report_shard_status(
    state: &Arc<ServerState>,
    video_id: &str,
    shard_id: &str,
    status: ShardStatus,
) {
    let Some(leader) = state.current_leader().filter(|addr| *addr != state.address) else {
        warn!(
            "[{}] No master available to report shard {}; buffering",
            state.address, shard_id
        );
        buffer_unreported(state, video_id, shard_id, status);
        return;
    };
    state.registry.add(&leader);
    let Some(peer) = state.registry.get(&leader) else {
        buffer_unreported(state, video_id, shard_id, status);
        return;
    };

    match peer
        .report_shard_status(
            video_id.to_string(),
            shard_id.to_string(),
            state.address.clone(),
            status.to_string(),
        )
        .await
    {
        Ok((true, _)) => {
            state
                .unreported_shards
                .lock()
                .remove(&(video_id.to_string(), shard_id.to_string()));
            info!(
                "[{}] Reported status '{}' for shard {} to master {}",
                state.address, status, shard_id, leader
            );
        }
        Ok((false, message)) => {
            warn!(
                "[{}] Master {} rejected status report for shard {}: {}. Buffering.",
                state.address, leader, shard_id, message
            );
            buffer_unreported(state, video_id, shard_id, status);
        }
        Err(e) => {
            warn!(
                "[{}] Failed to report shard {} to master {}: {}. Buffering.",
                state.address, shard_id, leader, e
            );
            buffer_unreported(state, video_id, shard_id, status);
        }
    }
}

fn buffer_unreported(state: &Arc<ServerState>, video_id: &str, shard_id: &str, status: ShardStatus) {
    state
        .unreported_shards
        .lock()
        .insert((video_id.to_string(), shard_id.to_string()), status);
}

/// Re-attempts every buffered status report against the current master.
/// Successful entries are removed by `report_shard_status`.
pub async fn drain_unreported(state: Arc<ServerState>) {
    let entries: Vec<(String, String, ShardStatus)> = state
        .unreported_shards
        .lock()
        .iter()
        .map(|((video_id, shard_id), status)| (video_id.clone(), shard_id.clone(), *status))
        .collect();
    if entries.is_empty() {
        return;
    }
    info!(
        "[{}] Attempting to report {} unreported shards to the new master",
        state.address,
        entries.len()
    );
    for (video_id, shard_id, status) in entries {
        report_shard_status(&state, &video_id, &shard_id, status).await;
    }
}
