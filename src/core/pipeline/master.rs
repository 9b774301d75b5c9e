// src/core/pipeline/master.rs

//! Master side of the shard pipeline: segmentation, round-robin distribution
//! with per-shard retry, retrieval of processed shards, and concatenation.

use crate::core::errors::PrismError;
use crate::core::pipeline::job::{ShardState, ShardStatus, VideoJob, VideoStatus};
use crate::core::protocol::DistributeShardRequest;
use crate::core::state::ServerState;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Segments the uploaded original into fixed-duration shards and returns the
/// produced files in index order.
pub async fn segment_video(
    state: &Arc<ServerState>,
    video_id: &str,
) -> Result<Vec<PathBuf>, PrismError> {
    let job_arc = state
        .jobs
        .get(video_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| PrismError::UnknownVideo(video_id.to_string()))?;
    let (container, upscale_width, upscale_height) = {
        let job = job_arc.lock();
        (job.container, job.upscale_width, job.upscale_height)
    };

    let input = state
        .config
        .master_data_dir
        .join(format!("{video_id}_original.tmp"));
    let pattern = state
        .config
        .master_data_dir
        .join(format!("{video_id}_shard_%04d.{container}"));

    info!("[{}] Starting segmentation for video {}", state.address, video_id);
    state
        .media
        .segment(
            &input,
            &pattern,
            upscale_width,
            upscale_height,
            container,
            state.config.segment_duration_secs,
        )
        .await?;

    let prefix = format!("{video_id}_shard_");
    let suffix = format!(".{container}");
    let mut shards = Vec::new();
    let mut dir = tokio::fs::read_dir(&state.config.master_data_dir).await?;
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&prefix) && name.ends_with(&suffix) {
            shards.push(entry.path());
        }
    }
    shards.sort();
    if shards.is_empty() {
        return Err(PrismError::MediaTool(
            "No video segments were created".to_string(),
        ));
    }
    info!(
        "[{}] Segmented video {} into {} shards",
        state.address,
        video_id,
        shards.len()
    );
    Ok(shards)
}

/// Distributes shards to workers in index order with a rotating starting
/// worker. Workers that fail an RPC are evicted for the round; shards nobody
/// accepts are re-queued until the queue drains or no workers remain.
pub async fn distribute_shards(
    state: Arc<ServerState>,
    video_id: String,
    shard_files: Vec<PathBuf>,
) {
    let Some(job_arc) = state.jobs.get(&video_id).map(|entry| entry.value().clone()) else {
        return;
    };
    let (target_width, target_height, original_filename) = {
        let job = job_arc.lock();
        (
            job.target_width,
            job.target_height,
            job.original_filename.clone(),
        )
    };

    let total_shards = shard_files.len();
    let mut available = state.registry.worker_addrs();
    let had_workers = !available.is_empty();
    info!(
        "[{}] Starting distribution of {} shards for video {} across {} workers",
        state.address,
        total_shards,
        video_id,
        available.len()
    );

    let mut queue: VecDeque<(usize, PathBuf)> = shard_files.into_iter().enumerate().collect();
    let mut worker_index = 0usize;
    let mut dropped_failures = 0usize;

    'shards: while let Some((index, path)) = queue.pop_front() {
        if available.is_empty() {
            queue.push_front((index, path));
            break;
        }
        let shard_id = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        // Rotation order for this shard, starting after the last placement.
        let rotation: Vec<String> = (0..available.len())
            .map(|i| available[(worker_index + i) % available.len()].clone())
            .collect();
        let mut placed = false;

        for worker_addr in rotation {
            // May have been evicted earlier in this sweep.
            if !available.contains(&worker_addr) {
                continue;
            }
            let Some(peer) = state.registry.get(&worker_addr) else {
                available.retain(|addr| *addr != worker_addr);
                continue;
            };

            let shard_data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    error!(
                        "[{}] Failed to read shard file {}: {}",
                        state.address,
                        path.display(),
                        e
                    );
                    job_arc.lock().shards.insert(
                        shard_id.clone(),
                        ShardState {
                            status: ShardStatus::FailedDistribution,
                            worker_address: worker_addr.clone(),
                            index: index as i64,
                            message: format!("Failed to read shard file: {e}"),
                        },
                    );
                    let _ = tokio::fs::remove_file(&path).await;
                    dropped_failures += 1;
                    placed = true;
                    break;
                }
            };

            let request = DistributeShardRequest {
                video_id: video_id.clone(),
                shard_id: shard_id.clone(),
                shard_data,
                shard_index: index as u32,
                total_shards: total_shards as u32,
                target_width,
                target_height,
                original_filename: original_filename.clone(),
            };

            info!(
                "[{}] Sending shard {} to worker {}",
                state.address, shard_id, worker_addr
            );
            match peer.distribute_shard(request).await {
                Ok((true, _)) => {
                    job_arc.lock().shards.insert(
                        shard_id.clone(),
                        ShardState {
                            status: ShardStatus::SentToWorker,
                            worker_address: worker_addr.clone(),
                            index: index as i64,
                            message: String::new(),
                        },
                    );
                    let _ = tokio::fs::remove_file(&path).await;
                    if let Some(pos) = available.iter().position(|addr| *addr == worker_addr) {
                        worker_index = (pos + 1) % available.len();
                    }
                    placed = true;
                    break;
                }
                Ok((false, message)) => {
                    warn!(
                        "[{}] Worker {} rejected shard {}: {}. Trying next worker.",
                        state.address, worker_addr, shard_id, message
                    );
                }
                Err(e) => {
                    warn!(
                        "[{}] RPC to worker {} failed for shard {}: {}. Evicting worker for this round.",
                        state.address, worker_addr, shard_id, e
                    );
                    available.retain(|addr| *addr != worker_addr);
                    if available.is_empty() {
                        break;
                    }
                }
            }
        }

        if !placed {
            if available.is_empty() {
                queue.push_front((index, path));
                break 'shards;
            }
            warn!(
                "[{}] No worker accepted shard {} this sweep; re-queueing",
                state.address, shard_id
            );
            queue.push_back((index, path));
        }
    }

    let undistributed = queue.len() + dropped_failures;
    {
        let mut job = job_arc.lock();
        if undistributed == 0 {
            job.status = VideoStatus::ShardsDistributed;
            info!(
                "[{}] Finished distributing all shards for video {}",
                state.address, video_id
            );
        } else {
            job.status = VideoStatus::PartialDistributionFailed;
            job.message = if !had_workers {
                "No workers available.".to_string()
            } else {
                format!("Failed to distribute {undistributed} out of {total_shards} shards.")
            };
            error!(
                "[{}] Partial distribution failure for video {}: {}",
                state.address, video_id, job.message
            );
        }
    }
    for (_, path) in queue {
        let _ = tokio::fs::remove_file(&path).await;
    }
}

/// Applies a worker's status report and schedules retrieval for successfully
/// processed shards. Returns the structured reply fields.
pub fn handle_shard_report(
    state: &Arc<ServerState>,
    video_id: &str,
    shard_id: &str,
    worker_address: &str,
    status_str: &str,
) -> (bool, String) {
    let Ok(status) = status_str.parse::<ShardStatus>() else {
        return (false, format!("Unknown shard status '{status_str}'"));
    };
    let Some(job_arc) = state.jobs.get(video_id).map(|entry| entry.value().clone()) else {
        warn!(
            "[{}] Status report for unknown video ID: {}",
            state.address, video_id
        );
        return (false, format!("Unknown video ID: {video_id}"));
    };

    info!(
        "[{}] Shard {} of video {} reported '{}' by {}",
        state.address, shard_id, video_id, status, worker_address
    );
    job_arc
        .lock()
        .apply_worker_report(shard_id, worker_address, status);

    if status == ShardStatus::ProcessedSuccessfully {
        let state = state.clone();
        let video_id = video_id.to_string();
        let shard_id = shard_id.to_string();
        let worker_address = worker_address.to_string();
        tokio::spawn(async move {
            retrieve_shard(state, video_id, shard_id, worker_address).await;
        });
    }
    (true, "Status updated.".to_string())
}

/// Pulls one processed shard back from the worker that reported it.
pub async fn retrieve_shard(
    state: Arc<ServerState>,
    video_id: String,
    shard_id: String,
    worker_address: String,
) {
    info!(
        "[{}] Requesting processed shard {} for video {} from {}",
        state.address, shard_id, video_id, worker_address
    );
    let Some(job_arc) = state.jobs.get(&video_id).map(|entry| entry.value().clone()) else {
        return;
    };
    let Some(peer) = state.registry.get(&worker_address) else {
        error!(
            "[{}] No worker stub for {}; cannot retrieve shard {}",
            state.address, worker_address, shard_id
        );
        mark_shard(
            &job_arc,
            &shard_id,
            ShardStatus::RetrievalFailed,
            "No worker stub available for retrieval.",
        );
        return;
    };

    match peer.request_shard(shard_id.clone()).await {
        Ok((true, data, _)) => {
            let start_concat = {
                let mut job = job_arc.lock();
                if job.record_retrieved(&shard_id, data) {
                    info!(
                        "[{}] Video {}: retrieved {}/{} shards",
                        state.address,
                        video_id,
                        job.retrieved_shards.len(),
                        job.total_shards
                    );
                    job.all_shards_retrieved() && job.try_begin_concatenation()
                } else {
                    warn!(
                        "[{}] Retrieved shard {} for video {} that was never tracked; dropping",
                        state.address, shard_id, video_id
                    );
                    false
                }
            };
            if start_concat {
                info!(
                    "[{}] All shards retrieved for video {}. Starting concatenation.",
                    state.address, video_id
                );
                tokio::spawn(concatenate(state.clone(), video_id.clone()));
            }
        }
        Ok((false, _, message)) => {
            error!(
                "[{}] Worker {} failed to provide shard {}: {}",
                state.address, worker_address, shard_id, message
            );
            mark_shard(&job_arc, &shard_id, ShardStatus::RetrievalFailed, &message);
        }
        Err(e) => {
            error!(
                "[{}] RPC failed retrieving shard {} from {}: {}",
                state.address, shard_id, worker_address, e
            );
            mark_shard(
                &job_arc,
                &shard_id,
                ShardStatus::RetrievalRpcFailed,
                &e.to_string(),
            );
        }
    }
}

fn mark_shard(job_arc: &Arc<Mutex<VideoJob>>, shard_id: &str, status: ShardStatus, message: &str) {
    let mut job = job_arc.lock();
    if let Some(shard) = job.shards.get_mut(shard_id) {
        shard.status = status;
        shard.message = message.to_string();
    }
}

/// Writes the retrieved shards to a scratch directory in index order and
/// concatenates them with stream copy into the final output.
pub async fn concatenate(state: Arc<ServerState>, video_id: String) {
    info!(
        "[{}] Starting concatenation for video {}",
        state.address, video_id
    );
    let Some(job_arc) = state.jobs.get(&video_id).map(|entry| entry.value().clone()) else {
        error!("Cannot concatenate shards; video {video_id} not found");
        return;
    };
    let (mut entries, container) = {
        let job = job_arc.lock();
        let entries: Vec<(String, i64, Vec<u8>)> = job
            .retrieved_shards
            .iter()
            .map(|(shard_id, shard)| (shard_id.clone(), shard.index, shard.data.clone()))
            .collect();
        (entries, job.container)
    };
    entries.sort_by_key(|(_, index, _)| *index);

    let tmp_dir = state
        .config
        .master_data_dir
        .join(format!(".concat_{video_id}"));
    let output = state
        .config
        .master_data_dir
        .join(format!("{video_id}_processed.{container}"));

    let result = write_and_concat(&state, &tmp_dir, &output, entries).await;
    // Scratch space goes away no matter how concatenation ended.
    let _ = tokio::fs::remove_dir_all(&tmp_dir).await;

    let mut job = job_arc.lock();
    match result {
        Ok(()) => {
            info!(
                "[{}] Concatenation succeeded: {}",
                state.address,
                output.display()
            );
            job.status = VideoStatus::Completed;
            job.processed_path = Some(output);
        }
        Err(e) => {
            error!(
                "[{}] Concatenation failed for video {}: {}",
                state.address, video_id, e
            );
            job.status = VideoStatus::ConcatenationFailed;
            job.message = e.to_string();
        }
    }
}

async fn write_and_concat(
    state: &Arc<ServerState>,
    tmp_dir: &Path,
    output: &Path,
    entries: Vec<(String, i64, Vec<u8>)>,
) -> Result<(), PrismError> {
    tokio::fs::create_dir_all(tmp_dir).await?;
    let mut file_list = String::new();
    for (shard_id, _, data) in &entries {
        let shard_path = tmp_dir.join(shard_id);
        tokio::fs::write(&shard_path, data).await?;
        file_list.push_str(&format!("file '{}'\n", shard_path.display()));
    }
    let list_path = tmp_dir.join("file_list.txt");
    tokio::fs::write(&list_path, file_list).await?;
    state.media.concat(&list_path, output).await
}
