// src/core/pipeline/job.rs

//! Per-video and per-shard bookkeeping kept by the master.

use crate::core::media::Container;
use std::collections::HashMap;
use std::path::PathBuf;
use strum_macros::{Display, EnumString};

/// Overall lifecycle of one video job.
///
/// `segmenting -> segmented -> shards_distributed -> concatenating ->
/// completed`, with terminal failure states along the way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum VideoStatus {
    Segmenting,
    Segmented,
    ShardsDistributed,
    PartialDistributionFailed,
    Concatenating,
    Completed,
    FailedSegmentation,
    ConcatenationFailed,
    UploadFailed,
}

impl VideoStatus {
    /// True for states a job can never leave.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VideoStatus::Completed
                | VideoStatus::PartialDistributionFailed
                | VideoStatus::FailedSegmentation
                | VideoStatus::ConcatenationFailed
                | VideoStatus::UploadFailed
        )
    }
}

/// Lifecycle of one shard as seen by the master. Terminal states are
/// `retrieved` or any failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ShardStatus {
    SentToWorker,
    ProcessedSuccessfully,
    Retrieved,
    FailedDistribution,
    FailedProcessing,
    RetrievalFailed,
    RetrievalRpcFailed,
    FailedSending,
    RpcFailed,
}

impl ShardStatus {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ShardStatus::FailedDistribution
                | ShardStatus::FailedProcessing
                | ShardStatus::RetrievalFailed
                | ShardStatus::RetrievalRpcFailed
                | ShardStatus::FailedSending
                | ShardStatus::RpcFailed
        )
    }

    /// States that a later worker report may overwrite wholesale: the master
    /// recorded a delivery failure, but the worker may in fact have the shard.
    pub fn is_overwritable_failure(self) -> bool {
        matches!(
            self,
            ShardStatus::FailedDistribution | ShardStatus::FailedSending | ShardStatus::RpcFailed
        )
    }
}

/// One shard's tracking entry.
#[derive(Debug, Clone)]
pub struct ShardState {
    pub status: ShardStatus,
    pub worker_address: String,
    /// Position within the video; -1 for shards reported by a worker that
    /// the master never recorded distributing.
    pub index: i64,
    pub message: String,
}

/// A processed shard's bytes, held in memory until concatenation.
#[derive(Debug, Clone)]
pub struct RetrievedShard {
    pub data: Vec<u8>,
    pub index: i64,
}

/// Everything the master tracks for one uploaded video. Lives only in process
/// memory; a master change drops it.
#[derive(Debug)]
pub struct VideoJob {
    pub video_id: String,
    pub container: Container,
    pub target_width: u32,
    pub target_height: u32,
    pub upscale_width: u32,
    pub upscale_height: u32,
    pub original_filename: String,
    pub total_shards: usize,
    pub shards: HashMap<String, ShardState>,
    pub retrieved_shards: HashMap<String, RetrievedShard>,
    pub status: VideoStatus,
    pub message: String,
    pub processed_path: Option<PathBuf>,
    concat_started: bool,
}

impl VideoJob {
    pub fn new(
        video_id: String,
        container: Container,
        target_width: u32,
        target_height: u32,
        upscale_width: u32,
        upscale_height: u32,
        original_filename: String,
    ) -> Self {
        Self {
            video_id,
            container,
            target_width,
            target_height,
            // An absent upscale request means "scale straight to target".
            upscale_width: if upscale_width == 0 { target_width } else { upscale_width },
            upscale_height: if upscale_height == 0 { target_height } else { upscale_height },
            original_filename,
            total_shards: 0,
            shards: HashMap::new(),
            retrieved_shards: HashMap::new(),
            status: VideoStatus::Segmenting,
            message: String::new(),
            processed_path: None,
            concat_started: false,
        }
    }

    /// Applies a worker-reported status. Earlier delivery failures are
    /// overwritten wholesale (keeping the original index); unknown shard ids
    /// are tolerated and recorded with index -1.
    pub fn apply_worker_report(&mut self, shard_id: &str, worker_address: &str, status: ShardStatus) {
        match self.shards.get_mut(shard_id) {
            Some(shard) if shard.status.is_overwritable_failure() => {
                let index = shard.index;
                *shard = ShardState {
                    status,
                    worker_address: worker_address.to_string(),
                    index,
                    message: String::new(),
                };
            }
            Some(shard) => {
                shard.status = status;
                shard.worker_address = worker_address.to_string();
            }
            None => {
                self.shards.insert(
                    shard_id.to_string(),
                    ShardState {
                        status,
                        worker_address: worker_address.to_string(),
                        index: -1,
                        message: String::new(),
                    },
                );
            }
        }
    }

    /// Stores retrieved shard bytes and marks the shard `retrieved`. Returns
    /// false when the shard was never tracked.
    pub fn record_retrieved(&mut self, shard_id: &str, data: Vec<u8>) -> bool {
        let Some(shard) = self.shards.get_mut(shard_id) else {
            return false;
        };
        shard.status = ShardStatus::Retrieved;
        let index = shard.index;
        self.retrieved_shards
            .insert(shard_id.to_string(), RetrievedShard { data, index });
        true
    }

    pub fn all_shards_retrieved(&self) -> bool {
        self.total_shards > 0 && self.retrieved_shards.len() == self.total_shards
    }

    /// Claims the one-shot right to start concatenation. The first caller
    /// flips the job into `concatenating`; later callers get false.
    pub fn try_begin_concatenation(&mut self) -> bool {
        if self.concat_started {
            return false;
        }
        self.concat_started = true;
        self.status = VideoStatus::Concatenating;
        true
    }

    /// (processed-or-retrieved, retrieved, failed) shard counts.
    pub fn shard_counts(&self) -> (usize, usize, usize) {
        let mut processed = 0;
        let mut retrieved = 0;
        let mut failed = 0;
        for shard in self.shards.values() {
            match shard.status {
                ShardStatus::ProcessedSuccessfully => processed += 1,
                ShardStatus::Retrieved => {
                    processed += 1;
                    retrieved += 1;
                }
                status if status.is_failure() => failed += 1,
                _ => {}
            }
        }
        (processed, retrieved, failed)
    }

    /// The status message served to clients, augmented with shard counts once
    /// segmentation has produced something to count.
    pub fn status_message(&self) -> String {
        match self.status {
            VideoStatus::Segmented
            | VideoStatus::ShardsDistributed
            | VideoStatus::PartialDistributionFailed
            | VideoStatus::Concatenating
            | VideoStatus::ConcatenationFailed => {
                let (processed, retrieved, failed) = self.shard_counts();
                format!(
                    "Status: {}. Total shards: {}. Successfully processed/retrieved: {}. \
                     Retrieved by master: {}. Failed: {}. Details: {}",
                    self.status, self.total_shards, processed, retrieved, failed, self.message
                )
            }
            _ => self.message.clone(),
        }
    }
}
